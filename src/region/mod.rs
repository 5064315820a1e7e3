//! Region Manager (component A)
//!
//! A `Region` owns the single backing file that is this store's entire
//! addressable universe: every allocation, transaction, snapshot, and
//! checkpoint lives somewhere inside it, reached only from the Genesis
//! record at offset 0. Its open/create/destroy shape is adapted from an
//! anonymous heap region to a file-backed one.

pub mod genesis;
pub mod mapping;

use crate::error::{Result, SlsError};
use crate::layout::{read_u64, write_u64, VOID_OFFSET};
use mapping::FileMapping;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

pub use genesis::GenesisSnapshot;

/// An open single-level store region.
pub struct Region {
    path: PathBuf,
    mapping: FileMapping,
    /// Per-region logical clock, advanced on every committing event
    /// (transaction commit, snapshot activation). Deliberately not a
    /// process-wide global: two regions opened in the same process
    /// must not observe each other's causal history.
    logical_clock: AtomicU64,
}

impl Region {
    /// Create a new region backed by a fresh file of `size` bytes.
    pub fn create(path: &Path, size: u64) -> Result<Self> {
        if size < genesis::FIRST_BUMP_OFFSET {
            return Err(SlsError::Invalid(format!(
                "region size {size} is smaller than the minimum {}",
                genesis::FIRST_BUMP_OFFSET
            )));
        }

        let mut mapping = FileMapping::create(path, size)?;
        genesis::initialize(mapping.as_mut_slice())?;
        mapping.sync()?;

        Ok(Self {
            path: path.to_path_buf(),
            mapping,
            logical_clock: AtomicU64::new(0),
        })
    }

    /// Open an existing region, validating its Genesis record.
    pub fn open(path: &Path) -> Result<Self> {
        let mapping = FileMapping::open(path)?;
        genesis::validate(mapping.as_slice())?;
        let epoch = read_u64(mapping.as_slice(), genesis::OFF_CURRENT_EPOCH)?;

        Ok(Self {
            path: path.to_path_buf(),
            mapping,
            logical_clock: AtomicU64::new(epoch),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.mapping.as_slice()
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.mapping.as_mut_slice()
    }

    /// Flush the whole region to disk.
    pub fn sync(&self) -> Result<()> {
        self.mapping.sync()
    }

    /// Flush only the byte range `[offset, offset+len)`.
    pub fn sync_range(&self, offset: u64, len: u64) -> Result<()> {
        self.mapping.sync_range(offset, len)
    }

    /// Advance and return this region's logical clock. Used to stamp
    /// transaction commits and snapshot vector-clock entries.
    pub fn tick(&self) -> u64 {
        self.logical_clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn logical_time(&self) -> u64 {
        self.logical_clock.load(Ordering::SeqCst)
    }

    /// Translate a persisted offset into a raw pointer+length into this
    /// region's mapped bytes. Returns `None` for the void sentinel.
    pub fn offset_to_slice(&self, offset: u64, len: u64) -> Result<Option<&[u8]>> {
        if offset == VOID_OFFSET {
            return Ok(None);
        }
        let start = offset as usize;
        let end = start
            .checked_add(len as usize)
            .ok_or_else(|| SlsError::Invalid("offset_to_slice overflow".into()))?;
        self.mapping
            .as_slice()
            .get(start..end)
            .map(Some)
            .ok_or_else(|| SlsError::Invalid(format!("offset {offset:#x} out of range")))
    }

    pub fn offset_to_slice_mut(&mut self, offset: u64, len: u64) -> Result<Option<&mut [u8]>> {
        if offset == VOID_OFFSET {
            return Ok(None);
        }
        let start = offset as usize;
        let end = start
            .checked_add(len as usize)
            .ok_or_else(|| SlsError::Invalid("offset_to_slice_mut overflow".into()))?;
        self.mapping
            .as_mut_slice()
            .get_mut(start..end)
            .map(Some)
            .ok_or_else(|| SlsError::Invalid(format!("offset {offset:#x} out of range")))
    }

    // -- Genesis field accessors -------------------------------------

    pub fn root_generation(&self) -> Result<u64> {
        read_u64(self.as_bytes(), genesis::OFF_ROOT_GENERATION)
    }

    pub fn set_root_generation(&mut self, value: u64) -> Result<()> {
        write_u64(self.as_bytes_mut(), genesis::OFF_ROOT_GENERATION, value)
    }

    pub fn app_root(&self) -> Result<u64> {
        read_u64(self.as_bytes(), genesis::OFF_APP_ROOT)
    }

    pub fn set_app_root(&mut self, value: u64) -> Result<()> {
        write_u64(self.as_bytes_mut(), genesis::OFF_APP_ROOT, value)
    }

    pub fn free_list_head(&self) -> Result<u64> {
        read_u64(self.as_bytes(), genesis::OFF_FREE_LIST_HEAD)
    }

    pub fn set_free_list_head(&mut self, value: u64) -> Result<()> {
        write_u64(self.as_bytes_mut(), genesis::OFF_FREE_LIST_HEAD, value)
    }

    pub fn gen_table_offset(&self) -> Result<u64> {
        read_u64(self.as_bytes(), genesis::OFF_GEN_TABLE)
    }

    pub fn next_alloc_offset(&self) -> Result<u64> {
        read_u64(self.as_bytes(), genesis::OFF_NEXT_ALLOC)
    }

    pub fn set_next_alloc_offset(&mut self, value: u64) -> Result<()> {
        write_u64(self.as_bytes_mut(), genesis::OFF_NEXT_ALLOC, value)
    }

    pub fn snapshot_index_offset(&self) -> Result<u64> {
        read_u64(self.as_bytes(), genesis::OFF_SNAPSHOT_INDEX)
    }

    pub fn total_allocated(&self) -> Result<u64> {
        read_u64(self.as_bytes(), genesis::OFF_TOTAL_ALLOCATED)
    }

    pub fn add_total_allocated(&mut self, delta: u64) -> Result<()> {
        let cur = self.total_allocated()?;
        write_u64(
            self.as_bytes_mut(),
            genesis::OFF_TOTAL_ALLOCATED,
            cur + delta,
        )
    }

    pub fn total_freed(&self) -> Result<u64> {
        read_u64(self.as_bytes(), genesis::OFF_TOTAL_FREED)
    }

    pub fn add_total_freed(&mut self, delta: u64) -> Result<()> {
        let cur = self.total_freed()?;
        write_u64(self.as_bytes_mut(), genesis::OFF_TOTAL_FREED, cur + delta)
    }

    pub fn commit_count(&self) -> Result<u64> {
        read_u64(self.as_bytes(), genesis::OFF_COMMIT_COUNT)
    }

    pub fn abort_count(&self) -> Result<u64> {
        read_u64(self.as_bytes(), genesis::OFF_ABORT_COUNT)
    }

    pub fn current_epoch(&self) -> Result<u64> {
        read_u64(self.as_bytes(), genesis::OFF_CURRENT_EPOCH)
    }

    /// Record a successful commit: bump epoch, root generation, and
    /// commit_count, advance the logical clock, and stamp
    /// `modified_at`/`last_commit_at`. Bumping the root generation here
    /// is what invalidates any capability a concurrently-active
    /// transaction observed before this commit.
    pub fn record_commit(&mut self) -> Result<u64> {
        let epoch = self.tick();
        let buf = self.as_bytes_mut();
        write_u64(buf, genesis::OFF_CURRENT_EPOCH, epoch)?;
        let root_gen = read_u64(buf, genesis::OFF_ROOT_GENERATION)?;
        write_u64(buf, genesis::OFF_ROOT_GENERATION, root_gen + 1)?;
        let commits = read_u64(buf, genesis::OFF_COMMIT_COUNT)?;
        write_u64(buf, genesis::OFF_COMMIT_COUNT, commits + 1)?;
        write_u64(buf, genesis::OFF_MODIFIED_AT, epoch)?;
        write_u64(buf, genesis::OFF_LAST_COMMIT_AT, epoch)?;
        Ok(epoch)
    }

    pub fn record_abort(&mut self) -> Result<()> {
        let buf = self.as_bytes_mut();
        let aborts = read_u64(buf, genesis::OFF_ABORT_COUNT)?;
        write_u64(buf, genesis::OFF_ABORT_COUNT, aborts + 1)
    }

    /// Capture every Genesis field for later restore (used by the
    /// snapshot engine's COW-preserve-on-activate step).
    pub fn capture_genesis(&self) -> Result<GenesisSnapshot> {
        genesis::capture(self.as_bytes())
    }

    pub fn restore_genesis(&mut self, snap: &GenesisSnapshot) -> Result<()> {
        genesis::restore(self.as_bytes_mut(), snap)
    }

    /// Restore only the content fields of a captured Genesis (root
    /// pointer, timestamps, counters) — leaves the live allocator
    /// bookkeeping (`free_list_head`, `next_alloc_offset`, totals)
    /// untouched. See [`genesis::restore_content`].
    pub fn restore_genesis_content(&mut self, snap: &GenesisSnapshot) -> Result<()> {
        genesis::restore_content(self.as_bytes_mut(), snap)
    }

    /// Remove the backing file. The region must not be used afterward.
    pub fn destroy(self) -> Result<()> {
        std::fs::remove_file(&self.path)
            .map_err(|e| SlsError::IoError(format!("removing {}: {e}", self.path.display())))
    }
}
