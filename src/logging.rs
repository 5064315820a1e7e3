//! Store Logging - Structured Event Tracing
//!
//! A small typed event enum, a level-filtered logger that can print
//! human-readable lines or JSON, and an in-memory ring of recent
//! events for post-mortem inspection. Events here describe region,
//! transaction, and snapshot lifecycle.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Minimum severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

/// A store lifecycle event.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    RegionOpened { path: String, size: u64 },
    RegionCreated { path: String, size: u64 },
    RegionSynced { bytes: u64 },

    TxnBegin { id: u64, root_generation: u64 },
    TxnCommit { id: u64, epoch: u64 },
    TxnAbort { id: u64, dirty_entries: usize },
    TxnConflict { id: u64, started: u64, observed: u64 },

    SnapshotBegin { id: u64 },
    SnapshotActivated { id: u64, pages: usize },
    SnapshotCommitted { id: u64, cow_pages: usize },
    SnapshotRestored { id: u64 },
    SnapshotAborted { id: u64 },

    CheckpointValidated {
        name: String,
        entries: usize,
        failures: usize,
    },
    CheckpointRecovered {
        name: String,
        recovered: usize,
        remaining_failures: usize,
    },

    AllocationFailure { requested: u64, available: u64 },
}

impl StoreEvent {
    fn level(&self) -> LogLevel {
        use StoreEvent::*;
        match self {
            AllocationFailure { .. } | TxnConflict { .. } => LogLevel::Warn,
            RegionOpened { .. }
            | RegionCreated { .. }
            | TxnCommit { .. }
            | TxnAbort { .. }
            | SnapshotCommitted { .. }
            | SnapshotRestored { .. }
            | CheckpointValidated { .. }
            | CheckpointRecovered { .. } => LogLevel::Info,
            TxnBegin { .. } | SnapshotBegin { .. } | SnapshotActivated { .. }
            | SnapshotAborted { .. } => LogLevel::Debug,
            RegionSynced { .. } => LogLevel::Trace,
        }
    }

    fn to_json(&self) -> serde_json::Value {
        use StoreEvent::*;
        match self {
            RegionOpened { path, size } => {
                serde_json::json!({"event": "region_opened", "path": path, "size": size})
            }
            RegionCreated { path, size } => {
                serde_json::json!({"event": "region_created", "path": path, "size": size})
            }
            RegionSynced { bytes } => serde_json::json!({"event": "region_synced", "bytes": bytes}),
            TxnBegin { id, root_generation } => {
                serde_json::json!({"event": "txn_begin", "id": id, "root_generation": root_generation})
            }
            TxnCommit { id, epoch } => {
                serde_json::json!({"event": "txn_commit", "id": id, "epoch": epoch})
            }
            TxnAbort { id, dirty_entries } => {
                serde_json::json!({"event": "txn_abort", "id": id, "dirty_entries": dirty_entries})
            }
            TxnConflict {
                id,
                started,
                observed,
            } => {
                serde_json::json!({"event": "txn_conflict", "id": id, "started": started, "observed": observed})
            }
            SnapshotBegin { id } => serde_json::json!({"event": "snapshot_begin", "id": id}),
            SnapshotActivated { id, pages } => {
                serde_json::json!({"event": "snapshot_activated", "id": id, "pages": pages})
            }
            SnapshotCommitted { id, cow_pages } => {
                serde_json::json!({"event": "snapshot_committed", "id": id, "cow_pages": cow_pages})
            }
            SnapshotRestored { id } => serde_json::json!({"event": "snapshot_restored", "id": id}),
            SnapshotAborted { id } => serde_json::json!({"event": "snapshot_aborted", "id": id}),
            CheckpointValidated {
                name,
                entries,
                failures,
            } => {
                serde_json::json!({"event": "checkpoint_validated", "name": name, "entries": entries, "failures": failures})
            }
            CheckpointRecovered {
                name,
                recovered,
                remaining_failures,
            } => {
                serde_json::json!({"event": "checkpoint_recovered", "name": name, "recovered": recovered, "remaining_failures": remaining_failures})
            }
            AllocationFailure {
                requested,
                available,
            } => {
                serde_json::json!({"event": "allocation_failure", "requested": requested, "available": available})
            }
        }
    }

    fn to_human(&self) -> String {
        use StoreEvent::*;
        match self {
            RegionOpened { path, size } => format!("region opened: {path} ({size} bytes)"),
            RegionCreated { path, size } => format!("region created: {path} ({size} bytes)"),
            RegionSynced { bytes } => format!("region synced: {bytes} bytes"),
            TxnBegin { id, root_generation } => {
                format!("txn {id} begin at root generation {root_generation}")
            }
            TxnCommit { id, epoch } => format!("txn {id} committed, epoch now {epoch}"),
            TxnAbort { id, dirty_entries } => {
                format!("txn {id} aborted, restored {dirty_entries} dirty entries")
            }
            TxnConflict {
                id,
                started,
                observed,
            } => format!("txn {id} conflict: started at gen {started}, observed {observed}"),
            SnapshotBegin { id } => format!("snapshot {id} begin"),
            SnapshotActivated { id, pages } => {
                format!("snapshot {id} activated with {pages} included pages")
            }
            SnapshotCommitted { id, cow_pages } => {
                format!("snapshot {id} committed with {cow_pages} COW pages")
            }
            SnapshotRestored { id } => format!("snapshot {id} restored"),
            SnapshotAborted { id } => format!("snapshot {id} aborted"),
            CheckpointValidated {
                name,
                entries,
                failures,
            } => format!("checkpoint '{name}' validated: {entries} entries, {failures} failures"),
            CheckpointRecovered {
                name,
                recovered,
                remaining_failures,
            } => format!(
                "checkpoint '{name}' recovery: {recovered} repaired, {remaining_failures} remaining"
            ),
            AllocationFailure {
                requested,
                available,
            } => format!("allocation failure: requested {requested}, available {available}"),
        }
    }
}

/// Logger configuration.
#[derive(Debug, Clone)]
pub struct StoreLoggerConfig {
    pub level: LogLevel,
    pub console: bool,
    pub json: bool,
    /// Maximum events retained in the in-memory ring.
    pub ring_capacity: usize,
}

impl Default for StoreLoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            console: false,
            json: false,
            ring_capacity: 256,
        }
    }
}

/// Centralized logger for store lifecycle events.
pub struct StoreLogger {
    config: StoreLoggerConfig,
    ring: Mutex<Vec<(Instant, StoreEvent)>>,
    enabled: AtomicBool,
}

impl StoreLogger {
    pub fn new(config: StoreLoggerConfig) -> Self {
        Self {
            config,
            ring: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Relaxed);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Record and (optionally) print an event.
    pub fn log(&self, event: StoreEvent) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        if event.level() > self.config.level {
            return;
        }

        log::log!(
            match event.level() {
                LogLevel::Error => log::Level::Error,
                LogLevel::Warn => log::Level::Warn,
                LogLevel::Info => log::Level::Info,
                LogLevel::Debug => log::Level::Debug,
                LogLevel::Trace => log::Level::Trace,
            },
            "{}",
            event.to_human()
        );

        if self.config.console {
            let now = chrono::Local::now();
            if self.config.json {
                if let Ok(s) = serde_json::to_string(&event.to_json()) {
                    println!("[{}] {}", now.format("%Y-%m-%d %H:%M:%S%.3f"), s);
                }
            } else {
                println!(
                    "[{}] {}",
                    now.format("%Y-%m-%d %H:%M:%S%.3f"),
                    event.to_human()
                );
            }
        }

        let mut ring = self.ring.lock();
        ring.push((Instant::now(), event));
        let cap = self.config.ring_capacity;
        if ring.len() > cap {
            let excess = ring.len() - cap;
            ring.drain(0..excess);
        }
    }

    /// Snapshot of recently recorded events (oldest first), for tests
    /// and post-mortem inspection.
    pub fn recent(&self) -> Vec<StoreEvent> {
        self.ring.lock().iter().map(|(_, e)| e.clone()).collect()
    }
}

impl Default for StoreLogger {
    fn default() -> Self {
        Self::new(StoreLoggerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_filtering_drops_below_threshold() {
        let logger = StoreLogger::new(StoreLoggerConfig {
            level: LogLevel::Warn,
            ..Default::default()
        });
        logger.log(StoreEvent::TxnBegin {
            id: 1,
            root_generation: 0,
        });
        assert!(logger.recent().is_empty());

        logger.log(StoreEvent::TxnConflict {
            id: 1,
            started: 0,
            observed: 1,
        });
        assert_eq!(logger.recent().len(), 1);
    }

    #[test]
    fn ring_buffer_caps_capacity() {
        let logger = StoreLogger::new(StoreLoggerConfig {
            level: LogLevel::Trace,
            ring_capacity: 3,
            ..Default::default()
        });
        for i in 0..10u64 {
            logger.log(StoreEvent::RegionSynced { bytes: i });
        }
        assert_eq!(logger.recent().len(), 3);
    }
}
