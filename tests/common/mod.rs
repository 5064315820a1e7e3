//! Shared fixtures for the end-to-end scenario tests in this directory.

use seraphat::config::StoreConfig;
use seraphat::Store;
use std::path::{Path, PathBuf};

pub const ONE_MIB: u64 = 1 << 20;

/// A store backed by a file under a fresh temp directory, removed on
/// drop. Each test gets its own isolated file.
pub struct StoreFixture {
    pub path: PathBuf,
    _dir: tempfile::TempDir,
}

impl StoreFixture {
    pub fn region_path(size_hint: &str) -> (PathBuf, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("create temp dir for store fixture");
        let path = dir.path().join(format!("{size_hint}.sls"));
        (path, dir)
    }

    /// Create a new store of `region_size` bytes at a fresh path.
    pub fn create(region_size: u64) -> (Store, Self) {
        let (path, dir) = Self::region_path("store");
        let config = StoreConfig {
            region_size,
            ..Default::default()
        };
        let store = Store::create(&path, config).expect("create store");
        (store, Self { path, _dir: dir })
    }

    /// Reopen the store backing this fixture's file.
    pub fn reopen(&self) -> Store {
        Store::open(&self.path, StoreConfig::default()).expect("reopen store")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write `data` inside its own committed transaction.
pub fn commit_write(store: &mut Store, offset: u64, data: &[u8]) {
    let txn = store.begin_txn().expect("begin txn");
    store
        .mark_dirty(txn, offset, data.len() as u64)
        .expect("mark dirty");
    store.write(txn, offset, data).expect("write");
    store.commit_txn(txn).expect("commit txn");
}
