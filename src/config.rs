//! Configuration Module - Store Tuning Parameters
//!
//! Collects the size limits and defaults this crate needs into one
//! validated struct rather than scattered constants.

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;
const GB: u64 = 1024 * MB;

/// Page size in bytes. Not configurable, but kept
/// here so every size computation reads `StoreConfig::PAGE_SIZE` instead
/// of a bare literal.
pub const PAGE_SIZE: u64 = 4096;

/// Size of the Genesis record in bytes.
pub const GENESIS_SIZE: u64 = 256;

/// Maximum generation table entries.
pub const GEN_MAX: usize = 4096;

/// Maximum concurrent transactions.
pub const TXN_MAX: usize = 16;

/// Maximum dirty-page entries per transaction.
pub const DIRTY_MAX: usize = 256;

/// Maximum dirty-page bytes expressed in pages (bounds a single
/// `mark_dirty` call, not the whole dirty list).
pub const DIRTY_MAX_PAGES: u64 = 256;

/// Maximum concurrent snapshots.
pub const SNAPSHOT_MAX: usize = 8;

/// Maximum COW pages tracked per snapshot.
pub const SNAPSHOT_COW_MAX: usize = 1024;

/// Maximum vector clock dimension.
pub const VCLOCK_MAX: usize = 64;

/// Maximum registered semantic types.
pub const TYPE_MAX: usize = 64;

/// Maximum invariants per semantic type.
pub const INVARIANTS_PER_TYPE_MAX: usize = 32;

/// Maximum path length, including NUL terminator.
pub const PATH_MAX: usize = 256;

/// Genesis magic: `"SERAPHAT"` as 64-bit LE.
pub const GENESIS_MAGIC: u64 = 0x5345_5241_5048_4154;

/// Snapshot header magic.
pub const SNAPSHOT_MAGIC: u64 = 0x5345_5241_5053_4E50;

/// Checkpoint magic.
pub const CHECKPOINT_MAGIC: u64 = 0x5345_5241_5043_4B48;

/// Current on-disk format version.
pub const FORMAT_VERSION: u32 = 1;

/// Configuration for opening or creating a store region.
///
/// # Examples
///
/// ```
/// use seraphat::config::StoreConfig;
///
/// let config = StoreConfig::default();
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Region size used when creating a new backing file.
    ///
    /// Default: 64 MiB.
    pub region_size: u64,

    /// Hard ceiling on region size, whether created or opened.
    ///
    /// Default: 4 GiB.
    pub max_region_size: u64,

    /// Maximum concurrent transactions.
    ///
    /// Default: 16.
    pub max_transactions: usize,

    /// Maximum dirty-page entries per transaction.
    ///
    /// Default: 256.
    pub max_dirty_entries: usize,

    /// Maximum concurrent snapshots.
    ///
    /// Default: 8.
    pub max_snapshots: usize,

    /// Maximum COW pages tracked per snapshot.
    ///
    /// Default: 1024.
    pub max_snapshot_cow_pages: usize,

    /// Whether the allocator coalesces adjacent free-list neighbors.
    /// Enabled by default; see DESIGN.md's Open Question record.
    ///
    /// Default: true.
    pub coalesce_free_list: bool,

    /// Enable verbose structured logging of store events.
    ///
    /// Default: false.
    pub verbose: bool,

    /// Emit logged events as JSON instead of human-readable text.
    ///
    /// Default: false.
    pub json_logging: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            region_size: 64 * MB,
            max_region_size: 4 * GB,
            max_transactions: TXN_MAX,
            max_dirty_entries: DIRTY_MAX,
            max_snapshots: SNAPSHOT_MAX,
            max_snapshot_cow_pages: SNAPSHOT_COW_MAX,
            coalesce_free_list: true,
            verbose: false,
            json_logging: false,
        }
    }
}

impl StoreConfig {
    /// Check that all values are self-consistent and within the hard
    /// limits above.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.region_size < GENESIS_SIZE {
            return Err(ConfigError::InvalidRegionSize(
                "region_size must be larger than the Genesis record".into(),
            ));
        }
        if self.region_size > self.max_region_size {
            return Err(ConfigError::InvalidRegionSize(
                "region_size cannot exceed max_region_size".into(),
            ));
        }
        if self.max_region_size > 4 * GB {
            return Err(ConfigError::InvalidRegionSize(
                "max_region_size cannot exceed the 4 GiB hard limit".into(),
            ));
        }
        if self.max_transactions == 0 || self.max_transactions > TXN_MAX {
            return Err(ConfigError::InvalidPoolLimit(format!(
                "max_transactions must be in 1..={TXN_MAX}"
            )));
        }
        if self.max_dirty_entries == 0 || self.max_dirty_entries > DIRTY_MAX {
            return Err(ConfigError::InvalidPoolLimit(format!(
                "max_dirty_entries must be in 1..={DIRTY_MAX}"
            )));
        }
        if self.max_snapshots == 0 || self.max_snapshots > SNAPSHOT_MAX {
            return Err(ConfigError::InvalidPoolLimit(format!(
                "max_snapshots must be in 1..={SNAPSHOT_MAX}"
            )));
        }
        if self.max_snapshot_cow_pages == 0 || self.max_snapshot_cow_pages > SNAPSHOT_COW_MAX {
            return Err(ConfigError::InvalidPoolLimit(format!(
                "max_snapshot_cow_pages must be in 1..={SNAPSHOT_COW_MAX}"
            )));
        }
        Ok(())
    }

    /// Build configuration from environment variables, overriding
    /// defaults, with an `SLS_` prefix.
    ///
    /// - `SLS_REGION_SIZE` (bytes)
    /// - `SLS_MAX_TRANSACTIONS`
    /// - `SLS_MAX_SNAPSHOTS`
    /// - `SLS_VERBOSE` (`1` or `true`)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("SLS_REGION_SIZE") {
            if let Ok(size) = val.parse::<u64>() {
                config.region_size = size;
            }
        }
        if let Ok(val) = std::env::var("SLS_MAX_TRANSACTIONS") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_transactions = n;
            }
        }
        if let Ok(val) = std::env::var("SLS_MAX_SNAPSHOTS") {
            if let Ok(n) = val.parse::<usize>() {
                config.max_snapshots = n;
            }
        }
        if let Ok(val) = std::env::var("SLS_VERBOSE") {
            config.verbose = val == "1" || val.eq_ignore_ascii_case("true");
        }

        config
    }
}

/// Configuration validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid region size: {0}")]
    InvalidRegionSize(String),

    #[error("invalid pool limit: {0}")]
    InvalidPoolLimit(String),
}

/// Round `n` up to the nearest multiple of `align` (`align` must be a
/// power of two).
pub fn align_up(n: u64, align: u64) -> u64 {
    (n + align - 1) & !(align - 1)
}

/// The inclusive range of `PAGE_SIZE`-aligned page indices spanned by
/// `[offset, offset+size)`. A zero-size range still spans the one page
/// containing `offset`.
pub fn page_range(offset: u64, size: u64) -> std::ops::RangeInclusive<u64> {
    let first_page = offset / PAGE_SIZE;
    let last_page = (offset + size.max(1) - 1) / PAGE_SIZE;
    first_page..=last_page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_region_smaller_than_genesis() {
        let config = StoreConfig {
            region_size: 16,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_pool_limits_over_hard_cap() {
        let config = StoreConfig {
            max_transactions: TXN_MAX + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn align_up_rounds_correctly() {
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(9, 8), 16);
        assert_eq!(align_up(4097, PAGE_SIZE), 8192);
    }
}
