//! Scenario 2: revoking an allocation's generation invalidates every
//! capability minted against the prior generation, and only that one.

mod common;

use common::StoreFixture;
use seraphat::tri::Tri;

#[test]
fn revoke_invalidates_the_old_generation_and_validates_the_new_one() {
    let (mut store, _fixture) = StoreFixture::create(common::ONE_MIB);

    let ptr = store.alloc(32).expect("alloc");
    assert_eq!(store.check_ptr(&ptr).unwrap(), Tri::True);

    let new_generation = store.revoke(ptr.alloc_id).expect("revoke");
    assert_eq!(new_generation, ptr.generation + 1);

    assert_eq!(store.check_ptr(&ptr).unwrap(), Tri::False);

    let bumped = seraphat::alloc::TypedPtr {
        generation: new_generation,
        ..ptr
    };
    assert_eq!(store.check_ptr(&bumped).unwrap(), Tri::True);
}
