//! Genesis Record Layout
//!
//! The 256-byte record at offset 0. Field offsets are fixed constants;
//! nothing here is `#[repr(C)]`. Every field is read/written through
//! `crate::layout`'s little-endian accessors directly against the
//! mapped region bytes.

use crate::config::{GENESIS_MAGIC, GENESIS_SIZE, GEN_MAX, PAGE_SIZE, SNAPSHOT_MAX};
use crate::error::{Result, SlsError};
use crate::layout::*;

pub const OFF_MAGIC: u64 = 0;
pub const OFF_VERSION: u64 = 8;
pub const OFF_ROOT_GENERATION: u64 = 16;
pub const OFF_APP_ROOT: u64 = 24;
pub const OFF_FREE_LIST_HEAD: u64 = 32;
pub const OFF_GEN_TABLE: u64 = 40;
pub const OFF_NEXT_ALLOC: u64 = 48;
pub const OFF_SNAPSHOT_INDEX: u64 = 56;
pub const OFF_TOTAL_ALLOCATED: u64 = 64;
pub const OFF_TOTAL_FREED: u64 = 72;
pub const OFF_CREATED_AT: u64 = 80;
pub const OFF_MODIFIED_AT: u64 = 88;
pub const OFF_LAST_COMMIT_AT: u64 = 96;
pub const OFF_COMMIT_COUNT: u64 = 104;
pub const OFF_ABORT_COUNT: u64 = 112;
pub const OFF_CURRENT_EPOCH: u64 = 120;

/// Generation table: `entry_count`, `next_generation`, then `GEN_MAX`
/// packed `u64` counters.
pub const GEN_TABLE_ENTRY_COUNT_OFF: u64 = 0;
pub const GEN_TABLE_NEXT_GEN_OFF: u64 = 8;
pub const GEN_TABLE_ENTRIES_OFF: u64 = 16;
pub const GEN_TABLE_SIZE: u64 = GEN_TABLE_ENTRIES_OFF + (GEN_MAX as u64) * 8;

/// Snapshot index: `count`, then up to `SNAPSHOT_MAX` fixed-size rows
/// of `{id: u64, record_offset: u64, state: u8, _pad: [u8; 7]}`.
pub const SNAPSHOT_INDEX_ENTRY_SIZE: u64 = 24;
pub const SNAPSHOT_INDEX_COUNT_OFF: u64 = 0;
pub const SNAPSHOT_INDEX_ENTRIES_OFF: u64 = 8;
pub const SNAPSHOT_INDEX_SIZE: u64 =
    SNAPSHOT_INDEX_ENTRIES_OFF + (SNAPSHOT_MAX as u64) * SNAPSHOT_INDEX_ENTRY_SIZE;

pub const GEN_TABLE_OFFSET: u64 = GENESIS_SIZE;
pub const SNAPSHOT_INDEX_OFFSET: u64 = GEN_TABLE_OFFSET + GEN_TABLE_SIZE;
pub const FIRST_BUMP_OFFSET: u64 = {
    let raw = SNAPSHOT_INDEX_OFFSET + SNAPSHOT_INDEX_SIZE;
    // round up to 8-byte alignment at const-eval time
    (raw + 7) & !7
};

/// An in-memory copy of every Genesis field, used as the "frozen copy"
/// a committed snapshot carries and restores from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenesisSnapshot {
    pub root_generation: u64,
    pub app_root: u64,
    pub free_list_head: u64,
    pub gen_table_offset: u64,
    pub next_alloc_offset: u64,
    pub snapshot_index_offset: u64,
    pub total_allocated: u64,
    pub total_freed: u64,
    pub created_at: u64,
    pub modified_at: u64,
    pub last_commit_at: u64,
    pub commit_count: u64,
    pub abort_count: u64,
    pub current_epoch: u64,
}

pub fn magic(buf: &[u8]) -> Result<u64> {
    read_u64(buf, OFF_MAGIC)
}

pub fn version(buf: &[u8]) -> Result<u32> {
    read_u32(buf, OFF_VERSION)
}

/// Validate the Genesis record of an opened region: magic, version, and
/// that every stored offset lies within the mapped bytes.
pub fn validate(buf: &[u8]) -> Result<()> {
    let magic_val = magic(buf)?;
    if magic_val != GENESIS_MAGIC {
        return Err(SlsError::BadFormat(format!(
            "magic mismatch: expected {GENESIS_MAGIC:#x}, found {magic_val:#x}"
        )));
    }
    let ver = version(buf)?;
    if ver != crate::config::FORMAT_VERSION {
        return Err(SlsError::BadFormat(format!(
            "unsupported format version {ver}"
        )));
    }

    let size = buf.len() as u64;
    for off in [
        OFF_APP_ROOT,
        OFF_FREE_LIST_HEAD,
        OFF_GEN_TABLE,
        OFF_NEXT_ALLOC,
        OFF_SNAPSHOT_INDEX,
    ] {
        let value = read_u64(buf, off)?;
        if value != VOID_OFFSET && (value < GENESIS_SIZE || value >= size) {
            return Err(SlsError::BadFormat(format!(
                "genesis field at {off:#x} holds out-of-range offset {value:#x}"
            )));
        }
    }

    let next_alloc = read_u64(buf, OFF_NEXT_ALLOC)?;
    if next_alloc < FIRST_BUMP_OFFSET {
        return Err(SlsError::BadFormat(
            "next_alloc_offset precedes the auxiliary tables".into(),
        ));
    }
    if next_alloc > size {
        return Err(SlsError::Truncated {
            next_alloc,
            mapped: size,
        });
    }

    Ok(())
}

/// Initialize a freshly created region's Genesis, generation table, and
/// snapshot index.
pub fn initialize(buf: &mut [u8]) -> Result<()> {
    if (buf.len() as u64) < FIRST_BUMP_OFFSET {
        return Err(SlsError::BadFormat(
            "region too small to hold Genesis and auxiliary tables".into(),
        ));
    }

    write_u64(buf, OFF_MAGIC, GENESIS_MAGIC)?;
    write_u32(buf, OFF_VERSION, crate::config::FORMAT_VERSION)?;
    write_u64(buf, OFF_ROOT_GENERATION, 0)?;
    write_u64(buf, OFF_APP_ROOT, VOID_OFFSET)?;
    write_u64(buf, OFF_FREE_LIST_HEAD, VOID_OFFSET)?;
    write_u64(buf, OFF_GEN_TABLE, GEN_TABLE_OFFSET)?;
    write_u64(buf, OFF_NEXT_ALLOC, FIRST_BUMP_OFFSET)?;
    write_u64(buf, OFF_SNAPSHOT_INDEX, SNAPSHOT_INDEX_OFFSET)?;
    write_u64(buf, OFF_TOTAL_ALLOCATED, 0)?;
    write_u64(buf, OFF_TOTAL_FREED, 0)?;
    let now = 0u64;
    write_u64(buf, OFF_CREATED_AT, now)?;
    write_u64(buf, OFF_MODIFIED_AT, now)?;
    write_u64(buf, OFF_LAST_COMMIT_AT, now)?;
    write_u64(buf, OFF_COMMIT_COUNT, 0)?;
    write_u64(buf, OFF_ABORT_COUNT, 0)?;
    write_u64(buf, OFF_CURRENT_EPOCH, 0)?;

    write_u64(buf, GEN_TABLE_OFFSET + GEN_TABLE_ENTRY_COUNT_OFF, 0)?;
    write_u64(buf, GEN_TABLE_OFFSET + GEN_TABLE_NEXT_GEN_OFF, 0)?;

    write_u64(buf, SNAPSHOT_INDEX_OFFSET + SNAPSHOT_INDEX_COUNT_OFF, 0)?;

    Ok(())
}

pub fn capture(buf: &[u8]) -> Result<GenesisSnapshot> {
    Ok(GenesisSnapshot {
        root_generation: read_u64(buf, OFF_ROOT_GENERATION)?,
        app_root: read_u64(buf, OFF_APP_ROOT)?,
        free_list_head: read_u64(buf, OFF_FREE_LIST_HEAD)?,
        gen_table_offset: read_u64(buf, OFF_GEN_TABLE)?,
        next_alloc_offset: read_u64(buf, OFF_NEXT_ALLOC)?,
        snapshot_index_offset: read_u64(buf, OFF_SNAPSHOT_INDEX)?,
        total_allocated: read_u64(buf, OFF_TOTAL_ALLOCATED)?,
        total_freed: read_u64(buf, OFF_TOTAL_FREED)?,
        created_at: read_u64(buf, OFF_CREATED_AT)?,
        modified_at: read_u64(buf, OFF_MODIFIED_AT)?,
        last_commit_at: read_u64(buf, OFF_LAST_COMMIT_AT)?,
        commit_count: read_u64(buf, OFF_COMMIT_COUNT)?,
        abort_count: read_u64(buf, OFF_ABORT_COUNT)?,
        current_epoch: read_u64(buf, OFF_CURRENT_EPOCH)?,
    })
}

/// Write a previously captured snapshot of Genesis back verbatim,
/// including the allocator bookkeeping fields. Magic/version are left
/// untouched. This is a full, faithful round-trip of every captured
/// field — callers restoring live store content from a snapshot should
/// use [`restore_content`] instead, since rolling `next_alloc_offset`/
/// `free_list_head` backward here would let a later bump allocation
/// land on space the allocator has genuinely handed out since the
/// snapshot was captured (its own COW copies and on-disk record
/// included).
pub fn restore(buf: &mut [u8], snap: &GenesisSnapshot) -> Result<()> {
    write_u64(buf, OFF_ROOT_GENERATION, snap.root_generation)?;
    write_u64(buf, OFF_APP_ROOT, snap.app_root)?;
    write_u64(buf, OFF_FREE_LIST_HEAD, snap.free_list_head)?;
    write_u64(buf, OFF_GEN_TABLE, snap.gen_table_offset)?;
    write_u64(buf, OFF_NEXT_ALLOC, snap.next_alloc_offset)?;
    write_u64(buf, OFF_SNAPSHOT_INDEX, snap.snapshot_index_offset)?;
    write_u64(buf, OFF_TOTAL_ALLOCATED, snap.total_allocated)?;
    write_u64(buf, OFF_TOTAL_FREED, snap.total_freed)?;
    write_u64(buf, OFF_CREATED_AT, snap.created_at)?;
    write_u64(buf, OFF_MODIFIED_AT, snap.modified_at)?;
    write_u64(buf, OFF_LAST_COMMIT_AT, snap.last_commit_at)?;
    write_u64(buf, OFF_COMMIT_COUNT, snap.commit_count)?;
    write_u64(buf, OFF_ABORT_COUNT, snap.abort_count)?;
    write_u64(buf, OFF_CURRENT_EPOCH, snap.current_epoch)?;
    Ok(())
}

/// Write a captured Genesis snapshot's *content* fields back —
/// `root_generation`, `app_root`, and the timestamp/counter fields —
/// without touching `free_list_head`, `next_alloc_offset`,
/// `gen_table_offset`, `snapshot_index_offset`, `total_allocated`, or
/// `total_freed`. The allocator's bump pointer and free list only ever
/// move forward as real `alloc`/`free` calls happen; a snapshot restore
/// rewinds what the store's root points at, not how much of the region
/// the allocator has handed out since, since a live allocator handle
/// may have serviced allocations (including this snapshot's own COW
/// copies and record) that restoring those fields backward would leave
/// unreachable by the free list yet still vulnerable to reuse.
pub fn restore_content(buf: &mut [u8], snap: &GenesisSnapshot) -> Result<()> {
    write_u64(buf, OFF_ROOT_GENERATION, snap.root_generation)?;
    write_u64(buf, OFF_APP_ROOT, snap.app_root)?;
    write_u64(buf, OFF_CREATED_AT, snap.created_at)?;
    write_u64(buf, OFF_MODIFIED_AT, snap.modified_at)?;
    write_u64(buf, OFF_LAST_COMMIT_AT, snap.last_commit_at)?;
    write_u64(buf, OFF_COMMIT_COUNT, snap.commit_count)?;
    write_u64(buf, OFF_ABORT_COUNT, snap.abort_count)?;
    write_u64(buf, OFF_CURRENT_EPOCH, snap.current_epoch)?;
    Ok(())
}

/// Sanity constant used only by tests: the page size this layout
/// assumes `alloc_pages` rounds to.
pub const _PAGE_SIZE_CHECK: u64 = PAGE_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_then_validate_roundtrips() {
        let mut buf = vec![0u8; FIRST_BUMP_OFFSET as usize + 4096];
        initialize(&mut buf).unwrap();
        validate(&buf).unwrap();
        assert_eq!(magic(&buf).unwrap(), GENESIS_MAGIC);
    }

    #[test]
    fn validate_rejects_bad_magic() {
        let mut buf = vec![0u8; FIRST_BUMP_OFFSET as usize + 4096];
        initialize(&mut buf).unwrap();
        write_u64(&mut buf, OFF_MAGIC, 0xBAD).unwrap();
        assert!(validate(&buf).is_err());
    }

    #[test]
    fn validate_rejects_truncation() {
        let mut buf = vec![0u8; FIRST_BUMP_OFFSET as usize + 4096];
        initialize(&mut buf).unwrap();
        write_u64(&mut buf, OFF_NEXT_ALLOC, buf.len() as u64 + 1000).unwrap();
        assert!(matches!(validate(&buf), Err(SlsError::Truncated { .. })));
    }

    #[test]
    fn capture_restore_roundtrips() {
        let mut buf = vec![0u8; FIRST_BUMP_OFFSET as usize + 4096];
        initialize(&mut buf).unwrap();
        write_u64(&mut buf, OFF_COMMIT_COUNT, 7).unwrap();
        let snap = capture(&buf).unwrap();
        write_u64(&mut buf, OFF_COMMIT_COUNT, 99).unwrap();
        restore(&mut buf, &snap).unwrap();
        assert_eq!(read_u64(&buf, OFF_COMMIT_COUNT).unwrap(), 7);
    }
}
