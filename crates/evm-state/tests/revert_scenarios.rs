//! どこで: revert 系テスト / 何を: snapshot/revert の往復同値性 / なぜ: 任意深度 revert の保証が core の要のため

use alloy_primitives::{Bytes, B256, U256};
use alloy_trie::EMPTY_ROOT_HASH;
use evm_state::hooks::BalanceChangeReason;
use evm_state::statedb::LogRecord;

mod common;
use common::{addr, slot, wei, TestEnv};

#[test]
fn balance_revert_restores_prior_value() {
    let env = TestEnv::new();
    let mut state = env.open(EMPTY_ROOT_HASH);
    let a = addr(0xaa);

    state.add_balance(a, wei(100), BalanceChangeReason::Transfer);
    let id = state.snapshot();
    state.add_balance(a, wei(50), BalanceChangeReason::Transfer);
    assert_eq!(state.get_balance(a), wei(150));

    state.revert_to_snapshot(id);
    assert_eq!(state.get_balance(a), wei(100));
}

#[test]
fn revert_round_trip_covers_all_mutation_kinds() {
    let env = TestEnv::new();
    let root = env.seed(|state| {
        state.create_account(addr(1));
        state.add_balance(addr(1), wei(10), BalanceChangeReason::Transfer);
        state.set_state(addr(1), slot(1), U256::from(7u64));
    });
    let mut state = env.open(root);
    let a = addr(1);

    state.set_nonce(a, 3);
    state.set_state(a, slot(1), U256::from(9u64));
    let id = state.snapshot();

    state.add_balance(a, wei(5), BalanceChangeReason::Transfer);
    state.set_nonce(a, 4);
    state.set_code(a, Bytes::from_static(&[0x60, 0x00]));
    state.set_state(a, slot(1), U256::from(11u64));
    state.set_state(a, slot(2), U256::from(12u64));
    state.set_transient_state(a, slot(3), U256::from(13u64));
    state.add_refund(44);
    state.add_preimage(B256::repeat_byte(0x77), b"preimage");
    state.add_address_to_access_list(addr(9));
    state.add_slot_to_access_list(addr(9), slot(9));
    state.add_log(LogRecord {
        address: a,
        ..LogRecord::default()
    });

    state.revert_to_snapshot(id);

    assert_eq!(state.get_balance(a), wei(10));
    assert_eq!(state.get_nonce(a), 3);
    assert!(state.get_code(a).is_empty());
    assert_eq!(state.get_state(a, slot(1)), U256::from(9u64));
    assert_eq!(state.get_state(a, slot(2)), U256::ZERO);
    assert_eq!(state.get_transient_state(a, slot(3)), U256::ZERO);
    assert_eq!(state.get_refund(), 0);
    assert!(state.preimages().get(&B256::repeat_byte(0x77)).is_none());
    assert!(!state.address_in_access_list(addr(9)));
    assert_eq!(state.slot_in_access_list(addr(9), slot(9)), (false, false));
    assert!(state.logs().is_empty());
    // 確定済みの値は revert の影響を受けない
    assert_eq!(state.get_committed_state(a, slot(1)), U256::from(7u64));
}

#[test]
fn nested_revert_is_equivalent_to_stepwise_revert() {
    let build = |state: &mut common::TestState| {
        state.add_balance(addr(1), wei(1), BalanceChangeReason::Transfer);
        let s1 = state.snapshot();
        state.add_balance(addr(1), wei(2), BalanceChangeReason::Transfer);
        state.set_state(addr(2), slot(1), U256::from(5u64));
        let s2 = state.snapshot();
        state.add_balance(addr(2), wei(4), BalanceChangeReason::Transfer);
        state.set_state(addr(1), slot(2), U256::from(6u64));
        (s1, s2)
    };

    let env_a = TestEnv::new();
    let mut direct = env_a.open(EMPTY_ROOT_HASH);
    let (s1, _) = build(&mut direct);
    direct.revert_to_snapshot(s1);

    let env_b = TestEnv::new();
    let mut stepwise = env_b.open(EMPTY_ROOT_HASH);
    let (s1, s2) = build(&mut stepwise);
    stepwise.revert_to_snapshot(s2);
    stepwise.revert_to_snapshot(s1);

    for a in [addr(1), addr(2)] {
        assert_eq!(direct.get_balance(a), stepwise.get_balance(a));
        for k in [slot(1), slot(2)] {
            assert_eq!(direct.get_state(a, k), stepwise.get_state(a, k));
        }
    }
    assert_eq!(direct.journal_length(), stepwise.journal_length());
}

#[test]
#[should_panic(expected = "revision id")]
fn revert_discards_newer_revisions() {
    let env = TestEnv::new();
    let mut state = env.open(EMPTY_ROOT_HASH);
    let s1 = state.snapshot();
    let s2 = state.snapshot();
    state.revert_to_snapshot(s1);
    // s1 への revert で s2 は捨てられている
    state.revert_to_snapshot(s2);
}

#[test]
#[should_panic(expected = "revision id")]
fn revert_to_unknown_revision_is_fatal() {
    let env = TestEnv::new();
    let mut state = env.open(EMPTY_ROOT_HASH);
    state.revert_to_snapshot(42);
}

#[test]
#[should_panic(expected = "refund counter below zero")]
fn refund_underflow_is_fatal() {
    let env = TestEnv::new();
    let mut state = env.open(EMPTY_ROOT_HASH);
    state.add_refund(10);
    state.sub_refund(20);
}

#[test]
fn self_destruct_reverts_cleanly() {
    let env = TestEnv::new();
    let root = env.seed(|state| {
        state.add_balance(addr(3), wei(55), BalanceChangeReason::Transfer);
    });
    let mut state = env.open(root);
    let a = addr(3);

    let id = state.snapshot();
    state.self_destruct(a);
    assert!(state.has_self_destructed(a));
    assert_eq!(state.get_balance(a), U256::ZERO);

    state.revert_to_snapshot(id);
    assert!(!state.has_self_destructed(a));
    assert_eq!(state.get_balance(a), wei(55));
}

#[test]
fn balance_delta_is_restored_on_revert() {
    let env = TestEnv::new();
    let mut state = env.open(EMPTY_ROOT_HASH);

    state.add_balance(addr(1), wei(30), BalanceChangeReason::Transfer);
    let delta_before = state.unexpected_balance_delta();
    let id = state.snapshot();
    state.add_balance(addr(1), wei(70), BalanceChangeReason::Transfer);
    assert_ne!(state.unexpected_balance_delta(), delta_before);

    state.revert_to_snapshot(id);
    assert_eq!(state.unexpected_balance_delta(), delta_before);
}

#[test]
#[should_panic(expected = "negative amount")]
fn expect_balance_burn_rejects_negative_amounts() {
    let env = TestEnv::new();
    let mut state = env.open(EMPTY_ROOT_HASH);
    state.expect_balance_burn(alloy_primitives::I256::MINUS_ONE);
}

#[test]
fn transient_storage_resets_at_prepare() {
    let env = TestEnv::new();
    let mut state = env.open(EMPTY_ROOT_HASH);
    let a = addr(4);

    state.set_transient_state(a, slot(1), U256::from(9u64));
    assert_eq!(state.get_transient_state(a, slot(1)), U256::from(9u64));

    state.prepare(
        evm_state::ForkRules {
            is_berlin: true,
            is_shanghai: true,
        },
        addr(1),
        addr(2),
        Some(addr(3)),
        &[addr(5)],
        &[(a, vec![slot(2)])],
    );
    assert_eq!(state.get_transient_state(a, slot(1)), U256::ZERO);
    // Berlin 構築分は journal を経由しない warm set
    assert!(state.address_in_access_list(addr(1)));
    assert!(state.address_in_access_list(addr(2)));
    assert!(state.address_in_access_list(addr(3)));
    assert!(state.address_in_access_list(addr(5)));
    assert_eq!(state.slot_in_access_list(a, slot(2)), (true, true));
}
