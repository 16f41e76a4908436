//! どこで: storage 一掃テスト / 何を: fast/slow の原像一致と fallback・hash 方式 skip / なぜ: 二系統が食い違うと reverse diff が壊れるため

use alloy_primitives::{B256, U256};
use evm_state::deletion::{delete_storage, fast_delete_storage, slow_delete_storage};
use evm_state::hooks::BalanceChangeReason;
use evm_state::statedb::StateError;
use evm_triedb::memory::MemoryDatabase;
use evm_triedb::{hash_address, SnapshotTree, TrieScheme};

mod common;
use common::{addr, slot, wei, TestEnv};

fn seeded_storage_env() -> (TestEnv, B256, B256) {
    let env = TestEnv::new();
    let root = env.seed(|state| {
        state.add_balance(addr(1), wei(9), BalanceChangeReason::Transfer);
        state.set_state(addr(1), slot(1), U256::from(11u64));
        state.set_state(addr(1), slot(2), U256::from(22u64));
        state.set_state(addr(1), slot(3), U256::from(33u64));
    });
    let mut state = env.open(root);
    let storage_root = state.get_storage_root(addr(1));
    (env, root, storage_root)
}

#[test]
fn fast_and_slow_paths_agree_on_slot_preimages() {
    let (env, root, storage_root) = seeded_storage_env();
    let a = addr(1);
    let addr_hash = hash_address(a);

    let (fast_slots, fast_nodes) =
        fast_delete_storage(&*env.snaps, root, addr_hash, storage_root).expect("fast path");
    let (slow_slots, slow_nodes) = slow_delete_storage::<MemoryDatabase>(
        &env.db,
        root,
        None,
        a,
        addr_hash,
        storage_root,
    )
    .expect("slow path");

    assert_eq!(fast_slots.len(), 3);
    assert_eq!(fast_slots, slow_slots);

    // fast path は stack trie が合成した node を全て削除印にする
    let (updates, deletes) = fast_nodes.size();
    assert_eq!((updates, deletes), (0, 3));
    // slow path の削除印は中間 node 由来。leaf しか返さない backend では空になる
    assert!(slow_nodes.is_empty());
    assert_eq!(slow_nodes.owner(), addr_hash);
}

#[test]
fn fast_path_detects_snapshot_mismatch() {
    let (env, root, _) = seeded_storage_env();
    let bogus_root = B256::repeat_byte(0x13);

    let err = fast_delete_storage(&*env.snaps, root, hash_address(addr(1)), bogus_root)
        .expect_err("mismatch must fail the fast path");
    assert!(matches!(err, StateError::SnapshotRootMismatch { .. }));
}

#[test]
fn policy_falls_back_to_trie_walk() {
    let (env, root, storage_root) = seeded_storage_env();
    let a = addr(1);
    let addr_hash = hash_address(a);

    // snapshot 側に無い root を渡すと fast path が落ち、slow path が拾う
    let unknown = B256::repeat_byte(0x42);
    let snaps: &dyn SnapshotTree = &*env.snaps;
    let (slots, _) = delete_storage::<MemoryDatabase>(
        &env.db,
        Some(snaps),
        unknown,
        None,
        a,
        addr_hash,
        storage_root,
    )
    .expect("fallback path");
    assert_eq!(slots.len(), 3);

    // snapshot 無しでも同じ結果になる
    let (no_snap_slots, _) = delete_storage::<MemoryDatabase>(
        &env.db,
        None,
        root,
        None,
        a,
        addr_hash,
        storage_root,
    )
    .expect("slow-only path");
    assert_eq!(no_snap_slots, slots);
}

#[test]
fn destructed_storage_is_wiped_at_commit() {
    let (env, root, _) = seeded_storage_env();
    let a = addr(1);

    let mut state = env.open(root);
    state.self_destruct(a);
    let new_root = state.commit(1, true).expect("commit");

    let mut reopened = env.open(new_root);
    assert!(!reopened.exist(a));
    for k in [slot(1), slot(2), slot(3)] {
        assert_eq!(reopened.get_state(a, k), U256::ZERO);
    }

    // reverse diff には旧 slot の原像と削除印が揃う
    let updates = env.db.committed_updates();
    let record = updates.last().expect("commit record");
    let origins = record.origin.storages_origin.get(&a).expect("slot origins");
    assert_eq!(origins.len(), 3);
    let set = record.nodes.set(&hash_address(a)).expect("storage node set");
    assert_eq!(set.size(), (0, 3));
}

#[test]
fn created_and_killed_in_same_block_leaves_null_origin() {
    let env = TestEnv::new();
    let root = env.seed(|state| {
        state.add_balance(addr(9), wei(1), BalanceChangeReason::Transfer);
    });
    let mut state = env.open(root);
    let a = addr(2);

    // 同一 block 内で生成して破壊し、さらに作り直す
    state.add_balance(a, wei(5), BalanceChangeReason::Transfer);
    state.finalise(true);
    state.self_destruct(a);
    state.finalise(true);
    state.create_account(a);
    state.add_balance(a, wei(3), BalanceChangeReason::Transfer);
    let new_root = state.commit(1, true).expect("commit");

    let updates = env.db.committed_updates();
    let record = updates.last().expect("commit record");
    // 旧 incarnation が disk に無いので origin は null
    assert_eq!(record.origin.accounts_origin.get(&a), Some(&None));

    let mut reopened = env.open(new_root);
    assert_eq!(reopened.get_balance(a), wei(3));
}

#[test]
fn hash_scheme_skips_storage_deletion() {
    let db = MemoryDatabase::with_scheme(TrieScheme::Hash);
    let env = TestEnv {
        db,
        snaps: std::sync::Arc::new(evm_triedb::memory::MemorySnapshotTree::new(
            alloy_trie::EMPTY_ROOT_HASH,
        )),
    };
    let root = env.seed(|state| {
        state.add_balance(addr(1), wei(9), BalanceChangeReason::Transfer);
        state.set_state(addr(1), slot(1), U256::from(11u64));
    });

    let mut state = env.open(root);
    state.self_destruct(addr(1));
    let new_root = state.commit(1, true).expect("commit");

    // account は trie から消えるが、storage 一掃と原像採取は行われない
    let mut reopened = env.open(new_root);
    assert!(!reopened.exist(addr(1)));
    let updates = env.db.committed_updates();
    let record = updates.last().expect("commit record");
    assert_eq!(record.origin.accounts_origin.get(&addr(1)), None);
    assert!(record.origin.storages_origin.get(&addr(1)).is_none());
}
