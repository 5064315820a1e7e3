//! Scenario 3: a snapshot sees the bytes as of its activation even
//! after the live region is overwritten, and restoring it writes those
//! bytes back.

mod common;

use common::{commit_write, StoreFixture};

#[test]
fn snapshot_isolates_reads_and_restore_undoes_later_writes() {
    let (mut store, _fixture) = StoreFixture::create(common::ONE_MIB);

    commit_write(&mut store, 8192, &[0x01, 0x02, 0x03, 0x04]);

    let snap = store.begin_snapshot("before-overwrite").expect("begin snapshot");
    store.include_snapshot(snap, 8192, 4).expect("include page");
    store.activate_snapshot(snap).expect("activate");

    commit_write(&mut store, 8192, &[0xFF, 0xFF, 0xFF, 0xFF]);

    let page = store
        .read_snapshot_page(snap, 8192)
        .expect("read snapshot page");
    assert_eq!(&page[0..4], &[0x01, 0x02, 0x03, 0x04]);
    assert_eq!(&store.region().as_bytes()[8192..8196], &[0xFF; 4]);

    store.commit_snapshot(snap).expect("commit snapshot");
    store.restore_snapshot(snap).expect("restore snapshot");

    assert_eq!(
        &store.region().as_bytes()[8192..8196],
        &[0x01, 0x02, 0x03, 0x04]
    );
}
