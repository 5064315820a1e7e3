//! Single-level persistent store substrate for an experimental OS kernel.
//!
//! A store is one memory-mapped file whose first bytes are a Genesis
//! record naming every other structure inside it: a generation table,
//! a snapshot index, and, beyond those, an ever-growing bump-or-
//! free-list heap. Everything reachable from a process talking to this
//! crate is reachable by walking offsets from that one record.
//!
//! The crate is organized the way a generational garbage collector is:
//! a region manager at the bottom, an allocator above it, then the
//! engines that give the substrate its transactional and semantic
//! guarantees (transactions, snapshots, checkpoints), with [`Store`]
//! as the façade wiring them together against one open region.

pub mod alloc;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod layout;
pub mod logging;
pub mod region;
pub mod snapshot;
pub mod stats;
pub mod tri;
pub mod txn;

use alloc::{Allocator, TypedPtr};
use checkpoint::{CheckpointEngine, EntryReport};
use config::StoreConfig;
use error::{Result, SlsError};
use logging::{StoreEvent, StoreLogger, StoreLoggerConfig};
use region::Region;
use snapshot::{CausalOrder, SnapshotTable, VectorClock};
use stats::StoreStats;
use std::path::Path;
use std::time::Instant;
use tri::Tri;
use txn::{TxnPool, TxnState};

/// An open single-level store: one region plus its transaction,
/// snapshot, and checkpoint engines, and the ambient logging/stats
/// wired around them.
pub struct Store {
    region: Region,
    txns: TxnPool,
    snapshots: SnapshotTable,
    checkpoints: CheckpointEngine,
    config: StoreConfig,
    logger: StoreLogger,
    stats: StoreStats,
}

impl Store {
    /// Create a fresh store backed by a new file at `path`.
    pub fn create(path: &Path, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let region = Region::create(path, config.region_size)?;
        let logger = StoreLogger::new(StoreLoggerConfig {
            console: config.verbose,
            json: config.json_logging,
            ..Default::default()
        });
        logger.log(StoreEvent::RegionCreated {
            path: path.display().to_string(),
            size: config.region_size,
        });

        Ok(Self {
            region,
            txns: TxnPool::new(config.max_transactions),
            snapshots: SnapshotTable::new(config.max_snapshots),
            checkpoints: CheckpointEngine::new(),
            logger,
            stats: StoreStats::new(),
            config,
        })
    }

    /// Open an existing store, validating its Genesis record.
    pub fn open(path: &Path, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let region = Region::open(path)?;
        let logger = StoreLogger::new(StoreLoggerConfig {
            console: config.verbose,
            json: config.json_logging,
            ..Default::default()
        });
        logger.log(StoreEvent::RegionOpened {
            path: path.display().to_string(),
            size: region.len(),
        });
        let snapshots = SnapshotTable::open(&region, config.max_snapshots)?;

        Ok(Self {
            region,
            txns: TxnPool::new(config.max_transactions),
            snapshots,
            checkpoints: CheckpointEngine::new(),
            logger,
            stats: StoreStats::new(),
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn logger(&self) -> &StoreLogger {
        &self.logger
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    fn allocator(&mut self) -> Allocator<'_> {
        Allocator::new(&mut self.region, self.config.coalesce_free_list)
    }

    // -- Allocation ----------------------------------------------------

    pub fn alloc(&mut self, n: u64) -> Result<TypedPtr> {
        let result = self.allocator().alloc(n);
        if let Ok(ptr) = &result {
            if ptr.is_void() && n > 0 {
                self.logger.log(StoreEvent::AllocationFailure {
                    requested: n,
                    available: 0,
                });
            } else {
                self.stats.record_alloc(n);
            }
        }
        result
    }

    pub fn calloc(&mut self, n: u64) -> Result<TypedPtr> {
        let result = self.allocator().calloc(n);
        if let Ok(ptr) = &result {
            if !ptr.is_void() || n == 0 {
                self.stats.record_alloc(n);
            }
        }
        result
    }

    pub fn alloc_pages(&mut self, n: u64) -> Result<TypedPtr> {
        let result = self.allocator().alloc_pages(n);
        if let Ok(ptr) = &result {
            if !ptr.is_void() || n == 0 {
                self.stats.record_alloc(n);
            }
        }
        result
    }

    pub fn free(&mut self, offset: u64, size: u64) -> Result<()> {
        self.allocator().free(offset, size)?;
        self.stats.record_free(size);
        Ok(())
    }

    pub fn check_ptr(&self, ptr: &TypedPtr) -> Result<Tri> {
        if ptr.is_void() {
            return Ok(Tri::Void);
        }
        if ptr.offset >= self.region.len() {
            return Ok(Tri::False);
        }
        let table_base = self.region.gen_table_offset()?;
        alloc::generation::check_generation(
            self.region.as_bytes(),
            table_base,
            ptr.alloc_id,
            ptr.generation,
        )
    }

    pub fn set_root(&mut self, offset: u64) -> Result<()> {
        self.allocator().set_root(offset)
    }

    /// Invalidate every outstanding capability for `alloc_id`. Returns
    /// the freshly bumped generation.
    pub fn revoke(&mut self, alloc_id: u64) -> Result<u64> {
        self.allocator().revoke(alloc_id)
    }

    pub fn root(&self) -> Result<u64> {
        self.region.app_root()
    }

    // -- Transactions ----------------------------------------------------

    pub fn begin_txn(&mut self) -> Result<u64> {
        let id = self.txns.begin(&self.region)?;
        self.logger.log(StoreEvent::TxnBegin {
            id,
            root_generation: self.region.root_generation()?,
        });
        Ok(id)
    }

    /// Stage `[offset, offset+size)` for rollback, running any
    /// snapshot COW hooks for pages in that range first so concurrent
    /// snapshots observe the pre-write bytes.
    pub fn mark_dirty(&mut self, txn: u64, offset: u64, size: u64) -> Result<()> {
        self.cow_range(offset, size)?;
        self.txns.mark_dirty(&self.region, txn, offset, size)
    }

    pub fn write(&mut self, txn: u64, offset: u64, data: &[u8]) -> Result<()> {
        self.txns.write(txn, offset, data)
    }

    fn cow_range(&mut self, offset: u64, size: u64) -> Result<()> {
        for page in config::page_range(offset, size) {
            let page_offset = page * config::PAGE_SIZE;
            let needing = self.snapshots.snapshots_needing_cow(page_offset);
            if needing.is_empty() {
                continue;
            }
            let mut alloc = Allocator::new(&mut self.region, self.config.coalesce_free_list);
            for snap_id in needing {
                self.snapshots.cow_page(&mut alloc, snap_id, page_offset)?;
            }
        }
        Ok(())
    }

    pub fn commit_txn(&mut self, txn: u64) -> Result<u64> {
        let start = Instant::now();
        match self.txns.commit(&mut self.region, txn) {
            Ok(epoch) => {
                self.stats.record_commit(start.elapsed());
                self.logger.log(StoreEvent::TxnCommit { id: txn, epoch });
                Ok(epoch)
            }
            Err(SlsError::Conflict { started, observed }) => {
                self.stats.record_conflict();
                self.logger.log(StoreEvent::TxnConflict {
                    id: txn,
                    started,
                    observed,
                });
                Err(SlsError::Conflict { started, observed })
            }
            Err(e) => Err(e),
        }
    }

    pub fn abort_txn(&mut self, txn: u64) -> Result<()> {
        let dirty_entries = self.txns.dirty_len(txn).unwrap_or(0);
        self.txns.abort(&mut self.region, txn)?;
        self.stats.record_abort();
        self.logger.log(StoreEvent::TxnAbort {
            id: txn,
            dirty_entries,
        });
        Ok(())
    }

    pub fn txn_state(&self, txn: u64) -> Result<TxnState> {
        self.txns.state(txn)
    }

    // -- Snapshots ----------------------------------------------------

    pub fn begin_snapshot(&mut self, description: impl Into<String>) -> Result<u64> {
        let vclock = Some(self.snapshots.live_vclock().clone());
        let id = self.snapshots.begin(&self.region, vclock, description)?;
        self.logger.log(StoreEvent::SnapshotBegin { id });
        Ok(id)
    }

    pub fn include_snapshot(&mut self, id: u64, ptr: u64, size: u64) -> Result<()> {
        self.snapshots.include(id, ptr, size)
    }

    pub fn include_snapshot_all(&mut self, id: u64) -> Result<()> {
        let len = self.region.len();
        self.snapshots.include_all(id, len)
    }

    pub fn activate_snapshot(&mut self, id: u64) -> Result<()> {
        self.snapshots.activate(id)?;
        let pages = self.snapshots.get(id)?.included_page_count();
        self.logger.log(StoreEvent::SnapshotActivated { id, pages });
        Ok(())
    }

    pub fn commit_snapshot(&mut self, id: u64) -> Result<()> {
        let start = Instant::now();
        let mut alloc = Allocator::new(&mut self.region, self.config.coalesce_free_list);
        self.snapshots.commit(&mut alloc, id)?;
        self.stats.record_snapshot_commit(start.elapsed());
        let cow_pages = self.snapshots.get(id)?.cow_page_count();
        self.logger
            .log(StoreEvent::SnapshotCommitted { id, cow_pages });
        Ok(())
    }

    pub fn abort_snapshot(&mut self, id: u64) -> Result<()> {
        let mut alloc = Allocator::new(&mut self.region, self.config.coalesce_free_list);
        self.snapshots.abort(&mut alloc, id)?;
        self.logger.log(StoreEvent::SnapshotAborted { id });
        Ok(())
    }

    pub fn read_snapshot_page(&self, id: u64, page_offset: u64) -> Result<Vec<u8>> {
        self.snapshots.read_page(&self.region, id, page_offset)
    }

    pub fn restore_snapshot(&mut self, id: u64) -> Result<()> {
        let start = Instant::now();
        self.snapshots
            .restore(&mut self.region, &mut self.txns, id)?;
        self.stats.record_restore(start.elapsed());
        self.logger.log(StoreEvent::SnapshotRestored { id });
        Ok(())
    }

    pub fn list_snapshots(&self) -> Vec<u64> {
        self.snapshots.list()
    }

    pub fn delete_snapshot(&mut self, id: u64) -> Result<()> {
        let mut alloc = Allocator::new(&mut self.region, self.config.coalesce_free_list);
        self.snapshots.delete(&mut alloc, id)
    }

    pub fn compare_snapshots(&self, a: u64, b: u64) -> Result<CausalOrder> {
        self.snapshots.compare(a, b)
    }

    pub fn live_vclock(&self) -> &VectorClock {
        self.snapshots.live_vclock()
    }

    // -- Checkpoints ----------------------------------------------------

    pub fn checkpoints_mut(&mut self) -> &mut CheckpointEngine {
        &mut self.checkpoints
    }

    pub fn create_checkpoint(&mut self, name: impl Into<String>) -> usize {
        self.checkpoints.create(name, &self.region)
    }

    pub fn add_checkpoint_entry(
        &mut self,
        checkpoint: usize,
        type_id: u64,
        entry_ptr: u64,
        alloc_size: u64,
    ) -> Result<()> {
        self.checkpoints
            .add_entry(checkpoint, &self.region, type_id, entry_ptr, alloc_size)
    }

    pub fn validate_checkpoint(&mut self, checkpoint: usize) -> Result<Vec<EntryReport>> {
        let reports = self.checkpoints.validate(checkpoint, &self.region)?;
        self.stats.record_checkpoint_validated();
        let failures = reports.iter().filter(|r| !r.is_ok()).count();
        let name = self
            .checkpoints
            .checkpoints()
            .get(checkpoint)
            .map(|c| c.name.clone())
            .unwrap_or_default();
        self.logger.log(StoreEvent::CheckpointValidated {
            name,
            entries: reports.len(),
            failures,
        });
        Ok(reports)
    }

    pub fn recover_checkpoint(&mut self, checkpoint: usize) -> Result<Vec<EntryReport>> {
        let reports = self.checkpoints.recover(checkpoint, &mut self.region)?;
        let remaining_failures = reports.iter().filter(|r| !r.is_ok()).count();
        let recovered = reports.len().saturating_sub(remaining_failures);
        let name = self
            .checkpoints
            .checkpoints()
            .get(checkpoint)
            .map(|c| c.name.clone())
            .unwrap_or_default();
        self.logger.log(StoreEvent::CheckpointRecovered {
            name,
            recovered,
            remaining_failures,
        });
        Ok(reports)
    }

    // -- Lifecycle ----------------------------------------------------

    pub fn sync(&self) -> Result<()> {
        let start = Instant::now();
        self.region.sync()?;
        self.stats.record_sync(start.elapsed());
        self.logger.log(StoreEvent::RegionSynced {
            bytes: self.region.len(),
        });
        Ok(())
    }

    pub fn region(&self) -> &Region {
        &self.region
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn temp_path() -> std::path::PathBuf {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_path_buf();
        drop(tmp);
        path
    }

    #[test]
    fn create_open_alloc_roundtrip() {
        let path = temp_path();
        {
            let mut store = Store::create(&path, StoreConfig::default()).unwrap();
            let ptr = store.alloc(64).unwrap();
            store.set_root(ptr.offset).unwrap();
            store.sync().unwrap();
        }

        let store = Store::open(&path, StoreConfig::default()).unwrap();
        assert_ne!(store.root().unwrap(), layout::VOID_OFFSET);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn uncommitted_write_is_invisible_after_reopen() {
        let path = temp_path();
        {
            let mut store = Store::create(&path, StoreConfig::default()).unwrap();
            let ptr = store.alloc(8).unwrap();
            store.set_root(ptr.offset).unwrap();
            let txn = store.begin_txn().unwrap();
            store.mark_dirty(txn, ptr.offset, 8).unwrap();
            store.commit_txn(txn).unwrap();
            store.sync().unwrap();

            let txn2 = store.begin_txn().unwrap();
            store.mark_dirty(txn2, ptr.offset, 8).unwrap();
            store.write(txn2, ptr.offset, &[9; 8]).unwrap();
            // Dropped without commit or sync: simulated crash.
        }

        let store = Store::open(&path, StoreConfig::default()).unwrap();
        let root = store.root().unwrap();
        assert_eq!(&store.region().as_bytes()[root as usize..root as usize + 8], &[0u8; 8]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn snapshot_cow_triggers_through_mark_dirty() {
        let path = temp_path();
        let mut store = Store::create(&path, StoreConfig::default()).unwrap();
        let ptr = store.alloc(8).unwrap();
        {
            let txn = store.begin_txn().unwrap();
            store.mark_dirty(txn, ptr.offset, 8).unwrap();
            store.write(txn, ptr.offset, &[1; 8]).unwrap();
            store.commit_txn(txn).unwrap();
        }

        let snap = store.begin_snapshot("before-change").unwrap();
        store.include_snapshot(snap, ptr.offset, 8).unwrap();
        store.activate_snapshot(snap).unwrap();

        let page_offset = (ptr.offset / config::PAGE_SIZE) * config::PAGE_SIZE;
        let txn = store.begin_txn().unwrap();
        store.mark_dirty(txn, ptr.offset, 8).unwrap();
        store.write(txn, ptr.offset, &[2; 8]).unwrap();
        store.commit_txn(txn).unwrap();

        let page = store.read_snapshot_page(snap, page_offset).unwrap();
        let local = (ptr.offset - page_offset) as usize;
        assert_eq!(&page[local..local + 8], &[1; 8]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn checkpoint_create_validate_recover_flow() {
        let path = temp_path();
        let mut store = Store::create(&path, StoreConfig::default()).unwrap();
        let ptr = store.calloc(8).unwrap();
        {
            let txn = store.begin_txn().unwrap();
            store.mark_dirty(txn, ptr.offset, 8).unwrap();
            store
                .write(txn, ptr.offset, &300i64.to_le_bytes())
                .unwrap();
            store.commit_txn(txn).unwrap();
        }

        let type_id = store
            .checkpoints_mut()
            .registry_mut()
            .register_type("Counter", 8)
            .unwrap();
        store
            .checkpoints_mut()
            .registry_mut()
            .add_invariant(
                type_id,
                checkpoint::invariant::Invariant::new(
                    checkpoint::invariant::InvariantKind::Range { min: 0, max: 100 },
                    0,
                    8,
                    "bounded counter",
                    true,
                ),
            )
            .unwrap();

        let cp = store.create_checkpoint("after-write");
        store
            .add_checkpoint_entry(cp, type_id, ptr.offset, 8)
            .unwrap();

        let reports = store.validate_checkpoint(cp).unwrap();
        assert!(!reports[0].is_ok());

        let recovered = store.recover_checkpoint(cp).unwrap();
        assert!(recovered[0].failures.is_empty());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn committed_snapshot_is_listable_after_store_reopen() {
        let path = temp_path();
        let snap = {
            let mut store = Store::create(&path, StoreConfig::default()).unwrap();
            let ptr = store.alloc(8).unwrap();
            let txn = store.begin_txn().unwrap();
            store.mark_dirty(txn, ptr.offset, 8).unwrap();
            store.write(txn, ptr.offset, &[7; 8]).unwrap();
            store.commit_txn(txn).unwrap();

            let snap = store.begin_snapshot("frozen-at-create").unwrap();
            store.include_snapshot(snap, ptr.offset, 8).unwrap();
            store.activate_snapshot(snap).unwrap();
            store.commit_snapshot(snap).unwrap();
            store.sync().unwrap();
            snap
        };

        let store = Store::open(&path, StoreConfig::default()).unwrap();
        assert_eq!(store.list_snapshots(), vec![snap]);
        std::fs::remove_file(&path).ok();
    }
}
