//! Scenario 5: a cyclic next-pointer chain fails validation and
//! recovers by clearing the entry's own link.

mod common;

use common::StoreFixture;
use seraphat::checkpoint::invariant::{Invariant, InvariantKind};

#[test]
fn three_node_cycle_is_detected_then_recovered() {
    let (mut store, _fixture) = StoreFixture::create(common::ONE_MIB);

    // Each node is 8 bytes: its own next-pointer offset.
    let a = store.calloc(8).expect("alloc A");
    let b = store.calloc(8).expect("alloc B");
    let c = store.calloc(8).expect("alloc C");

    for (node, next) in [(a, b), (b, c), (c, a)] {
        let txn = store.begin_txn().unwrap();
        store.mark_dirty(txn, node.offset, 8).unwrap();
        store
            .write(txn, node.offset, &next.offset.to_le_bytes())
            .unwrap();
        store.commit_txn(txn).unwrap();
    }

    let type_id = store
        .checkpoints_mut()
        .registry_mut()
        .register_type("Node", 8)
        .unwrap();
    store
        .checkpoints_mut()
        .registry_mut()
        .add_invariant(
            type_id,
            Invariant::new(InvariantKind::NoCycle { next_offset: 0 }, 0, 8, "acyclic", true),
        )
        .unwrap();

    let cp = store.create_checkpoint("node-cycle");
    store.add_checkpoint_entry(cp, type_id, a.offset, 8).unwrap();

    let reports = store.validate_checkpoint(cp).unwrap();
    assert!(!reports[0].is_ok());

    let recovered = store.recover_checkpoint(cp).unwrap();
    assert!(recovered[0].failures.is_empty());
}
