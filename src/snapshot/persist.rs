//! On-disk persistence for committed snapshots.
//!
//! A committed snapshot's full state (vector clock, frozen Genesis,
//! COW entry table, description) is written into allocator-managed
//! space as one variable-length record, and a fixed-size row in the
//! Genesis-pointed snapshot index table is updated to carry its id,
//! record offset, and state. The index table is the on-disk ground
//! truth spec.md §6 describes ("reachable ... via an in-region
//! snapshot index table"); `SnapshotTable`'s `IndexMap` is this
//! crate's in-memory cache of it, rebuilt from here on `open`.

use crate::alloc::{Allocator, TypedPtr};
use crate::config::{align_up, FORMAT_VERSION, SNAPSHOT_MAGIC, SNAPSHOT_MAX, VCLOCK_MAX};
use crate::error::{Result, SlsError};
use crate::layout::{read_u64, write_u64, write_u8};
use crate::region::{genesis, GenesisSnapshot, Region};

use super::vclock::VectorClock;
use super::{CowEntry, Snapshot, SnapshotState};

const MAGIC_OFF: u64 = 0;
const VERSION_OFF: u64 = 8;
const ID_OFF: u64 = 16;
const STATE_OFF: u64 = 24;
const LOGICAL_TS_OFF: u64 = 32;
const EPOCH_OFF: u64 = 40;
const ROOT_GEN_OFF: u64 = 48;
const WALL_CLOCK_OFF: u64 = 56;
const VCLOCK_DIM_OFF: u64 = 64;
const VCLOCK_SELF_OFF: u64 = 72;
const INCLUDED_PAGE_COUNT_OFF: u64 = 80;
const GENESIS_FROZEN_OFF: u64 = 88;
const GENESIS_FROZEN_FIELDS: u64 = 14;
const GENESIS_FROZEN_SIZE: u64 = GENESIS_FROZEN_FIELDS * 8;
const COW_COUNT_OFF: u64 = GENESIS_FROZEN_OFF + GENESIS_FROZEN_SIZE;
const DESC_LEN_OFF: u64 = COW_COUNT_OFF + 8;
const HEADER_FIXED_SIZE: u64 = DESC_LEN_OFF + 8;

const COW_ENTRY_SIZE: u64 = 40;
const DESC_CAP: usize = 256;

fn state_code(state: SnapshotState) -> u64 {
    match state {
        SnapshotState::Void => 0,
        SnapshotState::Preparing => 1,
        SnapshotState::Active => 2,
        SnapshotState::Committed => 3,
        SnapshotState::Restoring => 4,
        SnapshotState::Failed => 5,
    }
}

fn state_from_code(code: u64) -> Result<SnapshotState> {
    Ok(match code {
        0 => SnapshotState::Void,
        1 => SnapshotState::Preparing,
        2 => SnapshotState::Active,
        3 => SnapshotState::Committed,
        4 => SnapshotState::Restoring,
        5 => SnapshotState::Failed,
        other => return Err(SlsError::BadFormat(format!("bad snapshot state code {other}"))),
    })
}

/// Exact byte count a snapshot with this shape will occupy, unrounded.
pub fn record_size(vclock_dim: usize, cow_count: usize, desc_len: usize) -> u64 {
    HEADER_FIXED_SIZE
        + (vclock_dim as u64) * 8
        + (cow_count as u64) * COW_ENTRY_SIZE
        + desc_len.min(DESC_CAP) as u64
}

fn write_genesis_frozen(buf: &mut [u8], base: u64, g: &GenesisSnapshot) -> Result<()> {
    let fields = [
        g.root_generation,
        g.app_root,
        g.free_list_head,
        g.gen_table_offset,
        g.next_alloc_offset,
        g.snapshot_index_offset,
        g.total_allocated,
        g.total_freed,
        g.created_at,
        g.modified_at,
        g.last_commit_at,
        g.commit_count,
        g.abort_count,
        g.current_epoch,
    ];
    for (i, v) in fields.iter().enumerate() {
        write_u64(buf, base + (i as u64) * 8, *v)?;
    }
    Ok(())
}

fn read_genesis_frozen(buf: &[u8], base: u64) -> Result<GenesisSnapshot> {
    let mut f = [0u64; GENESIS_FROZEN_FIELDS as usize];
    for (i, slot) in f.iter_mut().enumerate() {
        *slot = read_u64(buf, base + (i as u64) * 8)?;
    }
    Ok(GenesisSnapshot {
        root_generation: f[0],
        app_root: f[1],
        free_list_head: f[2],
        gen_table_offset: f[3],
        next_alloc_offset: f[4],
        snapshot_index_offset: f[5],
        total_allocated: f[6],
        total_freed: f[7],
        created_at: f[8],
        modified_at: f[9],
        last_commit_at: f[10],
        commit_count: f[11],
        abort_count: f[12],
        current_epoch: f[13],
    })
}

/// Allocate space for `snap`, write its full state into it, and
/// return the allocation (its `offset` is the record's location;
/// callers own freeing it at the allocator's rounded size, not the
/// unrounded [`record_size`]).
pub fn persist(alloc: &mut Allocator, snap: &Snapshot) -> Result<(TypedPtr, u64)> {
    let desc_bytes = snap.description.as_bytes();
    let desc_len = desc_bytes.len().min(DESC_CAP);
    let size = record_size(snap.vclock.counters.len(), snap.cow.len(), desc_len);
    let rounded = align_up(size, 8);

    let ptr = alloc.alloc(size)?;
    if ptr.is_void() {
        return Err(SlsError::OutOfSpace {
            requested: size,
            available: 0,
        });
    }

    let base = ptr.offset;
    let buf = alloc
        .region_mut()
        .offset_to_slice_mut(base, rounded)?
        .ok_or_else(|| SlsError::Invalid("persist: void record offset".into()))?;

    write_u64(buf, MAGIC_OFF, SNAPSHOT_MAGIC)?;
    write_u64(buf, VERSION_OFF, FORMAT_VERSION as u64)?;
    write_u64(buf, ID_OFF, snap.id)?;
    write_u64(buf, STATE_OFF, state_code(snap.state))?;
    write_u64(buf, LOGICAL_TS_OFF, snap.logical_timestamp)?;
    write_u64(buf, EPOCH_OFF, snap.epoch_at_capture)?;
    write_u64(buf, ROOT_GEN_OFF, snap.root_generation_at_capture)?;
    let wall_secs = snap
        .wall_clock
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    write_u64(buf, WALL_CLOCK_OFF, wall_secs)?;
    write_u64(buf, VCLOCK_DIM_OFF, snap.vclock.counters.len() as u64)?;
    write_u64(buf, VCLOCK_SELF_OFF, snap.vclock.self_index as u64)?;
    write_u64(buf, INCLUDED_PAGE_COUNT_OFF, snap.included_page_count() as u64)?;
    write_genesis_frozen(buf, GENESIS_FROZEN_OFF, &snap.genesis_frozen)?;
    write_u64(buf, COW_COUNT_OFF, snap.cow.len() as u64)?;
    write_u64(buf, DESC_LEN_OFF, desc_len as u64)?;

    let mut off = HEADER_FIXED_SIZE;
    for c in &snap.vclock.counters {
        write_u64(buf, off, *c)?;
        off += 8;
    }
    for entry in &snap.cow {
        write_u64(buf, off, entry.page_offset)?;
        write_u64(buf, off + 8, entry.copy_offset)?;
        write_u64(buf, off + 16, entry.mod_time)?;
        write_u64(buf, off + 24, entry.page_count as u64)?;
        write_u64(buf, off + 32, entry.flags as u64)?;
        off += COW_ENTRY_SIZE;
    }
    let desc_start = off as usize;
    buf[desc_start..desc_start + desc_len].copy_from_slice(&desc_bytes[..desc_len]);

    Ok((ptr, rounded))
}

/// Everything about a snapshot except `included_pages`: not persisted,
/// since only an `Active` snapshot (never written to disk) still needs
/// it to decide what to COW next.
pub struct Loaded {
    pub id: u64,
    pub state: SnapshotState,
    pub logical_timestamp: u64,
    pub wall_clock: std::time::SystemTime,
    pub epoch_at_capture: u64,
    pub root_generation_at_capture: u64,
    pub vclock: VectorClock,
    pub genesis_frozen: GenesisSnapshot,
    pub cow: Vec<CowEntry>,
    pub description: String,
}

pub fn load(buf: &[u8], record_offset: u64) -> Result<Loaded> {
    let magic = read_u64(buf, record_offset + MAGIC_OFF)?;
    if magic != SNAPSHOT_MAGIC {
        return Err(SlsError::BadFormat(format!(
            "snapshot record at {record_offset:#x}: bad magic {magic:#x}"
        )));
    }
    let version = read_u64(buf, record_offset + VERSION_OFF)?;
    if version != FORMAT_VERSION as u64 {
        return Err(SlsError::BadFormat(format!(
            "snapshot record at {record_offset:#x}: unsupported version {version}"
        )));
    }

    let id = read_u64(buf, record_offset + ID_OFF)?;
    let state = state_from_code(read_u64(buf, record_offset + STATE_OFF)?)?;
    let logical_timestamp = read_u64(buf, record_offset + LOGICAL_TS_OFF)?;
    let epoch_at_capture = read_u64(buf, record_offset + EPOCH_OFF)?;
    let root_generation_at_capture = read_u64(buf, record_offset + ROOT_GEN_OFF)?;
    let wall_secs = read_u64(buf, record_offset + WALL_CLOCK_OFF)?;
    let vclock_dim = read_u64(buf, record_offset + VCLOCK_DIM_OFF)? as usize;
    let vclock_self = read_u64(buf, record_offset + VCLOCK_SELF_OFF)? as usize;
    let genesis_frozen = read_genesis_frozen(buf, record_offset + GENESIS_FROZEN_OFF)?;
    let cow_count = read_u64(buf, record_offset + COW_COUNT_OFF)? as usize;
    let desc_len = read_u64(buf, record_offset + DESC_LEN_OFF)? as usize;

    if vclock_dim == 0 || vclock_dim > VCLOCK_MAX {
        return Err(SlsError::BadFormat(format!(
            "snapshot record at {record_offset:#x}: bad vclock dimension {vclock_dim}"
        )));
    }

    let mut off = record_offset + HEADER_FIXED_SIZE;
    let mut counters = Vec::with_capacity(vclock_dim);
    for _ in 0..vclock_dim {
        counters.push(read_u64(buf, off)?);
        off += 8;
    }
    let vclock = VectorClock::from_counters(counters, vclock_self)?;

    let mut cow = Vec::with_capacity(cow_count);
    for _ in 0..cow_count {
        let page_offset = read_u64(buf, off)?;
        let copy_offset = read_u64(buf, off + 8)?;
        let mod_time = read_u64(buf, off + 16)?;
        let page_count = read_u64(buf, off + 24)? as u32;
        let flags = read_u64(buf, off + 32)? as u8;
        cow.push(CowEntry {
            page_offset,
            copy_offset,
            mod_time,
            page_count,
            flags,
        });
        off += COW_ENTRY_SIZE;
    }

    let desc_start = off as usize;
    let desc_bytes = buf
        .get(desc_start..desc_start + desc_len)
        .ok_or_else(|| SlsError::Invalid("snapshot record: description out of range".into()))?;
    let description = String::from_utf8_lossy(desc_bytes).into_owned();

    Ok(Loaded {
        id,
        state,
        logical_timestamp,
        wall_clock: std::time::UNIX_EPOCH + std::time::Duration::from_secs(wall_secs),
        epoch_at_capture,
        root_generation_at_capture,
        vclock,
        genesis_frozen,
        cow,
        description,
    })
}

fn row_offset(slot: usize) -> u64 {
    genesis::SNAPSHOT_INDEX_OFFSET
        + genesis::SNAPSHOT_INDEX_ENTRIES_OFF
        + (slot as u64) * genesis::SNAPSHOT_INDEX_ENTRY_SIZE
}

/// Write `{id, record_offset, state}` into the row already holding
/// `id`, or the first free (`id == 0`) row if none does.
pub fn index_upsert(region: &mut Region, id: u64, record_offset: u64, state: SnapshotState) -> Result<()> {
    let buf = region.as_bytes_mut();
    let mut target = None;
    for slot in 0..SNAPSHOT_MAX {
        let existing_id = read_u64(buf, row_offset(slot))?;
        if existing_id == id {
            target = Some((slot, false));
            break;
        }
        if existing_id == 0 && target.is_none() {
            target = Some((slot, true));
        }
    }
    let (slot, is_new) = target.ok_or_else(|| SlsError::Exhausted {
        resource: "snapshot index rows".into(),
        limit: SNAPSHOT_MAX,
    })?;

    let row = row_offset(slot);
    write_u64(buf, row, id)?;
    write_u64(buf, row + 8, record_offset)?;
    write_u8(buf, row + 16, state_code(state) as u8)?;

    if is_new {
        let count_off = genesis::SNAPSHOT_INDEX_OFFSET + genesis::SNAPSHOT_INDEX_COUNT_OFF;
        let count = read_u64(buf, count_off)?;
        write_u64(buf, count_off, count + 1)?;
    }
    Ok(())
}

/// Clear the row holding `id`, if any, and record one fewer occupied
/// row.
pub fn index_remove(region: &mut Region, id: u64) -> Result<()> {
    let buf = region.as_bytes_mut();
    for slot in 0..SNAPSHOT_MAX {
        let row = row_offset(slot);
        if read_u64(buf, row)? == id {
            write_u64(buf, row, 0)?;
            write_u64(buf, row + 8, 0)?;
            write_u8(buf, row + 16, 0)?;
            let count_off = genesis::SNAPSHOT_INDEX_OFFSET + genesis::SNAPSHOT_INDEX_COUNT_OFF;
            let count = read_u64(buf, count_off)?;
            write_u64(buf, count_off, count.saturating_sub(1))?;
            return Ok(());
        }
    }
    Ok(())
}

/// Every `{id, record_offset}` row currently populated in the index,
/// in row order.
pub fn index_entries(region: &Region) -> Result<Vec<(u64, u64)>> {
    let buf = region.as_bytes();
    let mut out = Vec::new();
    for slot in 0..SNAPSHOT_MAX {
        let row = row_offset(slot);
        let id = read_u64(buf, row)?;
        if id != 0 {
            out.push((id, read_u64(buf, row + 8)?));
        }
    }
    Ok(out)
}
