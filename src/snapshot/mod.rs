//! Snapshot Engine (component D)
//!
//! Freezes an internally consistent, causally-timestamped view of the
//! region. Consistency under ongoing mutation is preserved by copying
//! pages into COW storage before they are overwritten: a lifecycle
//! state-machine enum (`Preparing -> Active -> Committed`, with
//! `Failed`/`Restoring` reachable from errors) wraps a table of
//! `{old, new}` address pairs generalized from a relocation map to a
//! preserve-the-original map.

pub mod vclock;

mod persist;

use crate::alloc::Allocator;
use crate::config::{PAGE_SIZE, SNAPSHOT_COW_MAX, SNAPSHOT_MAX};
use crate::error::{Result, SlsError};
use crate::region::{genesis, GenesisSnapshot, Region};
use crate::txn::TxnPool;
use indexmap::IndexMap;
use std::collections::BTreeSet;
pub use vclock::{CausalOrder, VectorClock};

/// Lifecycle state of a snapshot record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    Void,
    Preparing,
    Active,
    Committed,
    Restoring,
    Failed,
}

/// Per-page COW preservation flags.
pub mod cow_flags {
    pub const VALID: u8 = 0b01;
    pub const DIRTY: u8 = 0b10;
}

/// A single page preserved for a snapshot: `page_offset` is where the
/// live data lives, `copy_offset` is where the frozen original was
/// copied in allocator-managed space.
#[derive(Debug, Clone, Copy)]
pub struct CowEntry {
    pub page_offset: u64,
    pub copy_offset: u64,
    pub mod_time: u64,
    pub page_count: u32,
    pub flags: u8,
}

/// A causally-timestamped, point-in-time view of the region.
pub struct Snapshot {
    pub id: u64,
    pub state: SnapshotState,
    pub logical_timestamp: u64,
    pub wall_clock: std::time::SystemTime,
    pub epoch_at_capture: u64,
    pub root_generation_at_capture: u64,
    pub vclock: VectorClock,
    included_pages: BTreeSet<u64>,
    cow: Vec<CowEntry>,
    pub genesis_frozen: GenesisSnapshot,
    pub description: String,
    /// Where and how large this snapshot's on-disk record is, once
    /// `commit` has written one. `None` until then, and for anything
    /// reconstructed in memory only (nothing reaches this state today
    /// except between `begin` and `commit`).
    record: Option<(u64, u64)>,
}

impl Snapshot {
    pub fn included_page_count(&self) -> usize {
        self.included_pages.len()
    }

    pub fn cow_page_count(&self) -> usize {
        self.cow.len()
    }

    fn has_cow(&self, page_offset: u64) -> bool {
        self.cow.iter().any(|e| e.page_offset == page_offset)
    }

    fn cow_entry(&self, page_offset: u64) -> Option<&CowEntry> {
        self.cow.iter().find(|e| e.page_offset == page_offset)
    }
}

/// Bounded table of up to `SNAPSHOT_MAX` live snapshots, keyed by id in
/// an `IndexMap` so lookup is O(1) while iteration still walks
/// registration order.
pub struct SnapshotTable {
    snapshots: IndexMap<u64, Snapshot>,
    capacity: usize,
    next_id: u64,
    /// The region's live causal clock, folded forward on every
    /// snapshot commit and restore.
    live_vclock: VectorClock,
}

impl SnapshotTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            snapshots: IndexMap::new(),
            capacity: capacity.min(SNAPSHOT_MAX),
            next_id: 1,
            live_vclock: VectorClock::new(1, 0).expect("1-node clock is always valid"),
        }
    }

    pub fn live_vclock(&self) -> &VectorClock {
        &self.live_vclock
    }

    fn slot_mut(&mut self, id: u64) -> Result<&mut Snapshot> {
        self.snapshots
            .get_mut(&id)
            .ok_or_else(|| SlsError::NotFound(format!("snapshot {id}")))
    }

    /// Begin capturing a new snapshot. `vclock` defaults to a fresh
    /// clock derived from the live one if omitted.
    pub fn begin(
        &mut self,
        region: &Region,
        vclock: Option<VectorClock>,
        description: impl Into<String>,
    ) -> Result<u64> {
        if self.snapshots.len() >= self.capacity {
            return Err(SlsError::Exhausted {
                resource: "snapshots".into(),
                limit: self.capacity,
            });
        }

        let id = self.next_id;
        self.next_id += 1;

        let vclock = vclock.unwrap_or_else(|| self.live_vclock.clone());

        self.snapshots.insert(
            id,
            Snapshot {
                id,
                state: SnapshotState::Preparing,
                logical_timestamp: region.logical_time(),
                wall_clock: std::time::SystemTime::now(),
                epoch_at_capture: region.current_epoch()?,
                root_generation_at_capture: region.root_generation()?,
                vclock,
                included_pages: BTreeSet::new(),
                cow: Vec::new(),
                genesis_frozen: region.capture_genesis()?,
                description: description.into(),
                record: None,
            },
        );

        Ok(id)
    }

    /// Include the pages covering `[ptr, ptr+size)`. Only valid while
    /// `Preparing`. Writes between `begin` and `activate` are not
    /// COW-protected even for included pages: protection starts only
    /// once the snapshot is `Active`.
    pub fn include(&mut self, id: u64, ptr: u64, size: u64) -> Result<()> {
        let snap = self.slot_mut(id)?;
        if snap.state != SnapshotState::Preparing {
            return Err(SlsError::Invalid(format!(
                "include: snapshot {id} is not Preparing"
            )));
        }
        for page in crate::config::page_range(ptr, size) {
            snap.included_pages.insert(page * PAGE_SIZE);
        }
        Ok(())
    }

    /// Include every page of the region.
    pub fn include_all(&mut self, id: u64, region_len: u64) -> Result<()> {
        self.include(id, 0, region_len)
    }

    /// `Preparing -> Active`. After this call no more pages may be
    /// added.
    pub fn activate(&mut self, id: u64) -> Result<()> {
        let snap = self.slot_mut(id)?;
        if snap.state != SnapshotState::Preparing {
            return Err(SlsError::Invalid(format!(
                "activate: snapshot {id} is not Preparing"
            )));
        }
        snap.state = SnapshotState::Active;
        Ok(())
    }

    /// Whether any `Active` snapshot covers `page_offset` and has not
    /// yet preserved it: the set a mutator must `cow_page` before
    /// overwriting that page.
    pub fn snapshots_needing_cow(&self, page_offset: u64) -> Vec<u64> {
        self.snapshots
            .values()
            .filter(|s| {
                s.state == SnapshotState::Active
                    && s.included_pages.contains(&page_offset)
                    && !s.has_cow(page_offset)
            })
            .map(|s| s.id)
            .collect()
    }

    /// Preserve `page_offset`'s current bytes into COW storage for
    /// snapshot `id`. Idempotent per `(snapshot, page)`.
    pub fn cow_page(&mut self, alloc: &mut Allocator, id: u64, page_offset: u64) -> Result<()> {
        if self.slot_mut(id)?.has_cow(page_offset) {
            return Ok(());
        }
        if self.slot_mut(id)?.cow.len() >= SNAPSHOT_COW_MAX {
            return Err(SlsError::Exhausted {
                resource: "snapshot COW pages".into(),
                limit: SNAPSHOT_COW_MAX,
            });
        }

        let original: Vec<u8> = alloc
            .region()
            .as_bytes()
            .get(page_offset as usize..(page_offset + PAGE_SIZE) as usize)
            .ok_or_else(|| SlsError::Invalid(format!("cow_page: page {page_offset:#x} out of range")))?
            .to_vec();

        let copy_ptr = alloc.alloc_pages(PAGE_SIZE)?;
        if copy_ptr.is_void() {
            return Err(SlsError::OutOfSpace {
                requested: PAGE_SIZE,
                available: 0,
            });
        }
        let dest = alloc
            .region_mut()
            .offset_to_slice_mut(copy_ptr.offset, PAGE_SIZE)?
            .ok_or_else(|| SlsError::Invalid("cow_page: void copy destination".into()))?;
        dest.copy_from_slice(&original);

        let mod_time = alloc.region().logical_time();
        self.slot_mut(id)?.cow.push(CowEntry {
            page_offset,
            copy_offset: copy_ptr.offset,
            mod_time,
            page_count: 1,
            flags: cow_flags::VALID | cow_flags::DIRTY,
        });
        Ok(())
    }

    /// Flush COW storage, move `Preparing`/`Active -> Committed`, and
    /// freeze the snapshot's full state into allocator-managed space so
    /// it is reachable from the Genesis-pointed snapshot index after a
    /// reopen (spec.md §3, §6). Bumps the local component of the live
    /// vector clock to establish happens-after with subsequent
    /// transactions.
    pub fn commit(&mut self, alloc: &mut Allocator, id: u64) -> Result<()> {
        {
            let snap = self.slot_mut(id)?;
            if !matches!(snap.state, SnapshotState::Preparing | SnapshotState::Active) {
                return Err(SlsError::Invalid(format!(
                    "commit: snapshot {id} cannot commit from its current state"
                )));
            }
        }
        for entry in &self.slot_mut(id)?.cow {
            alloc.region().sync_range(entry.copy_offset, PAGE_SIZE)?;
        }
        self.live_vclock.tick();
        self.slot_mut(id)?.state = SnapshotState::Committed;

        let snap = self.get(id)?;
        let (ptr, rounded) = persist::persist(alloc, snap)?;
        alloc.region().sync_range(ptr.offset, rounded)?;
        persist::index_upsert(alloc.region_mut(), id, ptr.offset, SnapshotState::Committed)?;
        alloc
            .region()
            .sync_range(genesis::SNAPSHOT_INDEX_OFFSET, genesis::SNAPSHOT_INDEX_SIZE)?;
        self.slot_mut(id)?.record = Some((ptr.offset, rounded));
        Ok(())
    }

    /// Abort from `Preparing` or `Active`, freeing any COW copies
    /// already made.
    pub fn abort(&mut self, alloc: &mut Allocator, id: u64) -> Result<()> {
        {
            let snap = self.slot_mut(id)?;
            if !matches!(snap.state, SnapshotState::Preparing | SnapshotState::Active) {
                return Err(SlsError::Invalid(format!(
                    "abort: snapshot {id} cannot abort from its current state"
                )));
            }
        }
        let cow = std::mem::take(&mut self.slot_mut(id)?.cow);
        for entry in &cow {
            alloc.free(entry.copy_offset, PAGE_SIZE)?;
        }
        self.slot_mut(id)?.state = SnapshotState::Failed;
        Ok(())
    }

    /// Read a page as it stood when `id` transitioned to `Active`:
    /// from COW storage if preserved, otherwise from the live region
    /// (unmodified since activation).
    pub fn read_page(&self, region: &Region, id: u64, page_offset: u64) -> Result<Vec<u8>> {
        let snap = self.get(id)?;
        if let Some(entry) = snap.cow_entry(page_offset) {
            return Ok(region
                .as_bytes()
                .get(entry.copy_offset as usize..(entry.copy_offset + PAGE_SIZE) as usize)
                .ok_or_else(|| SlsError::Invalid("read_page: copy offset out of range".into()))?
                .to_vec());
        }
        Ok(region
            .as_bytes()
            .get(page_offset as usize..(page_offset + PAGE_SIZE) as usize)
            .ok_or_else(|| SlsError::Invalid("read_page: page offset out of range".into()))?
            .to_vec())
    }

    /// Restore a `Committed` snapshot: abort every active transaction,
    /// write Genesis's *content* fields back from the frozen copy
    /// (root pointer, timestamps, counters — never the allocator's
    /// `free_list_head`/`next_alloc_offset`, which only ever advance),
    /// write every COW page's original bytes back, bump root
    /// generation to invalidate outstanding capabilities, and fold the
    /// snapshot's causal history into the live clock.
    pub fn restore(&mut self, region: &mut Region, txns: &mut TxnPool, id: u64) -> Result<()> {
        if self.slot_mut(id)?.state != SnapshotState::Committed {
            return Err(SlsError::Invalid(format!(
                "restore: snapshot {id} is not Committed"
            )));
        }
        self.slot_mut(id)?.state = SnapshotState::Restoring;

        let result = (|| -> Result<()> {
            txns.abort_all(region)?;
            region.restore_genesis_content(&self.get(id)?.genesis_frozen)?;
            for entry in &self.get(id)?.cow {
                let bytes = region
                    .as_bytes()
                    .get(entry.copy_offset as usize..(entry.copy_offset + PAGE_SIZE) as usize)
                    .ok_or_else(|| SlsError::Invalid("restore: copy offset out of range".into()))?
                    .to_vec();
                let dest = region
                    .offset_to_slice_mut(entry.page_offset, PAGE_SIZE)?
                    .ok_or_else(|| SlsError::Invalid("restore: page offset out of range".into()))?;
                dest.copy_from_slice(&bytes);
            }
            let bumped = region.root_generation()? + 1;
            region.set_root_generation(bumped)?;
            region.sync()
        })();

        match result {
            Ok(()) => {
                let snap_vclock = self.get(id)?.vclock.clone();
                self.live_vclock = self.live_vclock.merge_max(&snap_vclock);
                self.live_vclock.tick();
                self.slot_mut(id)?.state = SnapshotState::Committed;
                Ok(())
            }
            Err(e) => {
                self.slot_mut(id)?.state = SnapshotState::Failed;
                Err(e)
            }
        }
    }

    /// Committed snapshot ids ordered by capture time, oldest first.
    pub fn list(&self) -> Vec<u64> {
        let mut committed: Vec<&Snapshot> = self
            .snapshots
            .values()
            .filter(|s| s.state == SnapshotState::Committed)
            .collect();
        committed.sort_by_key(|s| s.logical_timestamp);
        committed.iter().map(|s| s.id).collect()
    }

    pub fn get(&self, id: u64) -> Result<&Snapshot> {
        self.snapshots
            .get(&id)
            .ok_or_else(|| SlsError::NotFound(format!("snapshot {id}")))
    }

    /// Delete a `Committed` snapshot, freeing its COW storage and its
    /// on-disk record, and clearing its snapshot index row. Callers
    /// are responsible for ensuring no dependent operation still needs
    /// it; the engine itself tracks no external dependents.
    pub fn delete(&mut self, alloc: &mut Allocator, id: u64) -> Result<()> {
        if self.slot_mut(id)?.state != SnapshotState::Committed {
            return Err(SlsError::Invalid(format!(
                "delete: snapshot {id} is not Committed"
            )));
        }
        for entry in &self.get(id)?.cow {
            alloc.free(entry.copy_offset, PAGE_SIZE)?;
        }
        if let Some((offset, size)) = self.get(id)?.record {
            alloc.free(offset, size)?;
        }
        persist::index_remove(alloc.region_mut(), id)?;
        self.snapshots.shift_remove(&id);
        Ok(())
    }

    /// Rebuild the table from the on-disk snapshot index: every row
    /// still populated after a reopen names a `Committed` snapshot's
    /// record, which is read back in full except for `included_pages`
    /// (only an `Active` snapshot needs it, and an `Active` snapshot is
    /// never written to disk). The live vector clock restarts at its
    /// default dimension regardless of what reloaded snapshots carry;
    /// causal comparisons between those snapshots use their own stored
    /// clocks and are unaffected.
    pub fn open(region: &Region, capacity: usize) -> Result<Self> {
        let mut table = Self::new(capacity);
        let mut max_id = 0;
        for (_id, record_offset) in persist::index_entries(region)? {
            let loaded = persist::load(region.as_bytes(), record_offset)?;
            let size = persist::record_size(
                loaded.vclock.counters.len(),
                loaded.cow.len(),
                loaded.description.len(),
            );
            let rounded = crate::config::align_up(size, 8);
            max_id = max_id.max(loaded.id);
            table.snapshots.insert(
                loaded.id,
                Snapshot {
                    id: loaded.id,
                    state: loaded.state,
                    logical_timestamp: loaded.logical_timestamp,
                    wall_clock: loaded.wall_clock,
                    epoch_at_capture: loaded.epoch_at_capture,
                    root_generation_at_capture: loaded.root_generation_at_capture,
                    vclock: loaded.vclock,
                    included_pages: BTreeSet::new(),
                    cow: loaded.cow,
                    genesis_frozen: loaded.genesis_frozen,
                    description: loaded.description,
                    record: Some((record_offset, rounded)),
                },
            );
        }
        table.next_id = max_id + 1;
        Ok(table)
    }

    pub fn compare(&self, a: u64, b: u64) -> Result<CausalOrder> {
        let sa = self.get(a)?;
        let sb = self.get(b)?;
        Ok(VectorClock::compare(&sa.vclock, &sb.vclock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Allocator;
    use tempfile::NamedTempFile;

    fn open_region() -> (Region, std::path::PathBuf) {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        drop(tmp);
        (Region::create(&path, 1 << 20).unwrap(), path)
    }

    #[test]
    fn cow_preserves_original_across_overwrite() {
        let (mut region, path) = open_region();
        {
            let mut alloc = Allocator::new(&mut region, false);
            let slice = alloc.region_mut().offset_to_slice_mut(8192, 4).unwrap().unwrap();
            slice.copy_from_slice(&[1, 2, 3, 4]);
        }

        let mut table = SnapshotTable::new(SNAPSHOT_MAX);
        let snap = table.begin(&region, None, "test").unwrap();
        table.include(snap, 8192, 4).unwrap();
        table.activate(snap).unwrap();

        {
            let mut alloc = Allocator::new(&mut region, false);
            table.cow_page(&mut alloc, snap, 8192).unwrap();
            let slice = alloc.region_mut().offset_to_slice_mut(8192, 4).unwrap().unwrap();
            slice.copy_from_slice(&[0xFF, 0xFF, 0xFF, 0xFF]);
        }

        let page = table.read_page(&region, snap, 8192).unwrap();
        assert_eq!(&page[0..4], &[1, 2, 3, 4]);
        assert_eq!(&region.as_bytes()[8192..8196], &[0xFF, 0xFF, 0xFF, 0xFF]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn cow_page_is_idempotent() {
        let (mut region, path) = open_region();
        let mut table = SnapshotTable::new(SNAPSHOT_MAX);
        let snap = table.begin(&region, None, "test").unwrap();
        table.include(snap, 8192, 4).unwrap();
        table.activate(snap).unwrap();

        let mut alloc = Allocator::new(&mut region, false);
        table.cow_page(&mut alloc, snap, 8192).unwrap();
        let count_after_first = table.get(snap).unwrap().cow_page_count();
        table.cow_page(&mut alloc, snap, 8192).unwrap();
        assert_eq!(table.get(snap).unwrap().cow_page_count(), count_after_first);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn restore_writes_preserved_bytes_back_and_bumps_generation() {
        let (mut region, path) = open_region();
        {
            let mut alloc = Allocator::new(&mut region, false);
            let slice = alloc.region_mut().offset_to_slice_mut(8192, 4).unwrap().unwrap();
            slice.copy_from_slice(&[1, 2, 3, 4]);
        }

        let mut table = SnapshotTable::new(SNAPSHOT_MAX);
        let snap = table.begin(&region, None, "test").unwrap();
        table.include(snap, 8192, 4).unwrap();
        table.activate(snap).unwrap();
        {
            let mut alloc = Allocator::new(&mut region, false);
            table.cow_page(&mut alloc, snap, 8192).unwrap();
            table.commit(&mut alloc, snap).unwrap();
        }

        region.as_bytes_mut()[8192..8196].copy_from_slice(&[0xFF; 4]);
        let gen_before = region.root_generation().unwrap();

        let mut txns = TxnPool::new(crate::config::TXN_MAX);
        table.restore(&mut region, &mut txns, snap).unwrap();

        assert_eq!(&region.as_bytes()[8192..8196], &[1, 2, 3, 4]);
        assert!(region.root_generation().unwrap() > gen_before);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn list_orders_committed_snapshots_oldest_first() {
        let (mut region, path) = open_region();
        let mut table = SnapshotTable::new(SNAPSHOT_MAX);
        let a = table.begin(&region, None, "a").unwrap();
        table.activate(a).unwrap();
        {
            let mut alloc = Allocator::new(&mut region, false);
            table.commit(&mut alloc, a).unwrap();
        }
        let b = table.begin(&region, None, "b").unwrap();
        table.activate(b).unwrap();
        {
            let mut alloc = Allocator::new(&mut region, false);
            table.commit(&mut alloc, b).unwrap();
        }

        assert_eq!(table.list(), vec![a, b]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn committed_snapshot_survives_table_reopen() {
        let (mut region, path) = open_region();
        {
            let slice = region.as_bytes_mut();
            slice[8192..8196].copy_from_slice(&[9, 9, 9, 9]);
        }

        let mut table = SnapshotTable::new(SNAPSHOT_MAX);
        let snap = table
            .begin(&region, Some(VectorClock::from_counters(vec![5, 2], 0).unwrap()), "reopen-me")
            .unwrap();
        table.include(snap, 8192, 4).unwrap();
        table.activate(snap).unwrap();
        {
            let mut alloc = Allocator::new(&mut region, false);
            table.cow_page(&mut alloc, snap, 8192).unwrap();
            table.commit(&mut alloc, snap).unwrap();
        }

        let reopened = SnapshotTable::open(&region, SNAPSHOT_MAX).unwrap();
        assert_eq!(reopened.list(), vec![snap]);
        let restored = reopened.get(snap).unwrap();
        assert_eq!(restored.description, "reopen-me");
        assert_eq!(restored.vclock.counters, vec![5, 2]);
        assert_eq!(restored.cow_page_count(), 1);

        let page = reopened.read_page(&region, snap, 8192).unwrap();
        assert_eq!(&page[0..4], &[9, 9, 9, 9]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn compare_matches_vclock_semantics() {
        let (region, path) = open_region();
        let mut table = SnapshotTable::new(SNAPSHOT_MAX);
        let a = table
            .begin(&region, Some(VectorClock::from_counters(vec![3, 0, 0], 0).unwrap()), "a")
            .unwrap();
        let b = table
            .begin(&region, Some(VectorClock::from_counters(vec![3, 1, 0], 1).unwrap()), "b")
            .unwrap();
        assert_eq!(table.compare(a, b).unwrap(), CausalOrder::Before);
        std::fs::remove_file(&path).ok();
    }
}
