//! End-to-end KV-store conservation and cache-reuse checks, exercised
//! through the public crate API rather than the module's own inline tests.

use blis::kv::{KvStore, SingleTierStore};
use blis::request::{Request, SloClass};
use blis::Tick;

fn req(id: u64, input: usize) -> Request {
    Request::new(id, Tick(0), (0..input as u32).collect(), vec![0], SloClass::Standard, 0, 0)
}

#[test]
fn repeated_allocate_release_cycles_never_leak_blocks() {
    let mut store = SingleTierStore::new(16, 4);
    for round in 0..50u64 {
        let r = req(round, 32); // 8 blocks
        let outcome = store.allocate_kv_blocks(&r, 0, 32, &[]);
        assert!(outcome.success);
        store.release_kv_blocks(round);
    }
    store.assert_conservation();
    assert_eq!(store.used_blocks(), 0);
}

#[test]
fn cache_hit_reuses_shared_prefix_blocks() {
    let mut store = SingleTierStore::new(16, 4);
    let r1 = req(1, 16);
    store.allocate_kv_blocks(&r1, 0, 16, &[]);

    let r2 = req(2, 16);
    let cached = store.get_cached_blocks(&r2.input_tokens);
    assert_eq!(cached.len(), 4, "identical prompt should match all four blocks");

    let outcome = store.allocate_kv_blocks(&r2, 0, 16, &cached);
    assert!(outcome.success);
    assert_eq!(outcome.cache_hits, 4);
    // cached blocks are shared, not duplicated.
    assert_eq!(store.used_blocks(), 4);
}

#[test]
fn allocation_that_cannot_fit_rolls_back_cleanly() {
    let mut store = SingleTierStore::new(2, 4); // 8-token total capacity
    let r1 = req(1, 8);
    assert!(store.allocate_kv_blocks(&r1, 0, 8, &[]).success);

    let r2 = req(2, 4);
    let outcome = store.allocate_kv_blocks(&r2, 0, 4, &[]);
    assert!(!outcome.success);
    // r1's allocation must be untouched by r2's failed attempt.
    store.assert_conservation();
    assert_eq!(store.used_blocks(), 2);
}
