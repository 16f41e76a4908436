//! どこで: journal の property test / 何を: revert 往復の観測同値性 / なぜ: 個別 scenario で拾えない並びを機械生成で潰すため

use alloy_primitives::{Address, B256, U256};
use alloy_trie::EMPTY_ROOT_HASH;
use evm_state::hooks::BalanceChangeReason;
use proptest::prelude::*;

mod common;
use common::{TestEnv, TestState};

#[derive(Clone, Debug)]
enum Op {
    AddBalance(u8, u64),
    SetNonce(u8, u64),
    SetState(u8, u8, u64),
    SetTransient(u8, u8, u64),
    AddRefund(u32),
    TouchZero(u8),
    AccessAddress(u8),
    AccessSlot(u8, u8),
}

fn universe_addr(byte: u8) -> Address {
    Address::repeat_byte((byte % 3) + 1)
}

fn universe_slot(byte: u8) -> B256 {
    B256::repeat_byte((byte % 3) + 1)
}

fn apply(state: &mut TestState, op: &Op) {
    match op {
        Op::AddBalance(a, amount) => state.add_balance(
            universe_addr(*a),
            U256::from(*amount),
            BalanceChangeReason::Transfer,
        ),
        Op::SetNonce(a, nonce) => state.set_nonce(universe_addr(*a), *nonce),
        Op::SetState(a, k, value) => {
            state.set_state(universe_addr(*a), universe_slot(*k), U256::from(*value))
        }
        Op::SetTransient(a, k, value) => {
            state.set_transient_state(universe_addr(*a), universe_slot(*k), U256::from(*value))
        }
        Op::AddRefund(gas) => state.add_refund(u64::from(*gas)),
        Op::TouchZero(a) => state.add_balance(
            universe_addr(*a),
            U256::ZERO,
            BalanceChangeReason::Transfer,
        ),
        Op::AccessAddress(a) => state.add_address_to_access_list(universe_addr(*a)),
        Op::AccessSlot(a, k) => {
            state.add_slot_to_access_list(universe_addr(*a), universe_slot(*k))
        }
    }
}

/// 観測可能な面を全部すくい上げて比較する。
fn observe(state: &mut TestState) -> Vec<(Address, U256, u64, Vec<U256>, Vec<U256>)> {
    let mut out = Vec::new();
    for byte in 1u8..=3 {
        let address = Address::repeat_byte(byte);
        let balance = state.get_balance(address);
        let nonce = state.get_nonce(address);
        let mut slots = Vec::new();
        let mut transients = Vec::new();
        for k in 1u8..=3 {
            slots.push(state.get_state(address, B256::repeat_byte(k)));
            transients.push(state.get_transient_state(address, B256::repeat_byte(k)));
        }
        out.push((address, balance, nonce, slots, transients));
    }
    out
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<u8>(), 0u64..1_000_000).prop_map(|(a, v)| Op::AddBalance(a, v)),
        (any::<u8>(), 0u64..100).prop_map(|(a, v)| Op::SetNonce(a, v)),
        (any::<u8>(), any::<u8>(), 0u64..1_000).prop_map(|(a, k, v)| Op::SetState(a, k, v)),
        (any::<u8>(), any::<u8>(), 0u64..1_000).prop_map(|(a, k, v)| Op::SetTransient(a, k, v)),
        (0u32..10_000).prop_map(Op::AddRefund),
        any::<u8>().prop_map(Op::TouchZero),
        any::<u8>().prop_map(Op::AccessAddress),
        (any::<u8>(), any::<u8>()).prop_map(|(a, k)| Op::AccessSlot(a, k)),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// M; snapshot; M'; revert は M 単体と観測同値になる。
    #[test]
    fn revert_round_trip_matches_prefix(
        prefix in proptest::collection::vec(op_strategy(), 0..12),
        suffix in proptest::collection::vec(op_strategy(), 1..12),
    ) {
        let env_a = TestEnv::new();
        let mut reverted = env_a.open(EMPTY_ROOT_HASH);
        for op in &prefix {
            apply(&mut reverted, op);
        }
        let refund_before = reverted.get_refund();
        let id = reverted.snapshot();
        for op in &suffix {
            apply(&mut reverted, op);
        }
        reverted.revert_to_snapshot(id);

        let env_b = TestEnv::new();
        let mut prefix_only = env_b.open(EMPTY_ROOT_HASH);
        for op in &prefix {
            apply(&mut prefix_only, op);
        }

        prop_assert_eq!(observe(&mut reverted), observe(&mut prefix_only));
        prop_assert_eq!(reverted.get_refund(), refund_before);
        prop_assert_eq!(
            reverted.unexpected_balance_delta(),
            prefix_only.unexpected_balance_delta()
        );
    }

    /// 入れ子の snapshot は段階的に戻しても一気に戻しても同じ。
    #[test]
    fn nested_revert_matches_direct_revert(
        ops1 in proptest::collection::vec(op_strategy(), 0..8),
        ops2 in proptest::collection::vec(op_strategy(), 1..8),
        ops3 in proptest::collection::vec(op_strategy(), 1..8),
    ) {
        let env_a = TestEnv::new();
        let mut direct = env_a.open(EMPTY_ROOT_HASH);
        for op in &ops1 {
            apply(&mut direct, op);
        }
        let s1 = direct.snapshot();
        for op in &ops2 {
            apply(&mut direct, op);
        }
        direct.snapshot();
        for op in &ops3 {
            apply(&mut direct, op);
        }
        direct.revert_to_snapshot(s1);

        let env_b = TestEnv::new();
        let mut stepwise = env_b.open(EMPTY_ROOT_HASH);
        for op in &ops1 {
            apply(&mut stepwise, op);
        }
        let s1 = stepwise.snapshot();
        for op in &ops2 {
            apply(&mut stepwise, op);
        }
        let s2 = stepwise.snapshot();
        for op in &ops3 {
            apply(&mut stepwise, op);
        }
        stepwise.revert_to_snapshot(s2);
        stepwise.revert_to_snapshot(s1);

        prop_assert_eq!(observe(&mut direct), observe(&mut stepwise));
    }

    /// finalise 後に同じ mutation を同じ pre-state へ流せば root も一致する。
    #[test]
    fn identical_mutations_commit_to_identical_roots(
        ops in proptest::collection::vec(op_strategy(), 1..12),
    ) {
        let env_a = TestEnv::new();
        let mut left = env_a.open(EMPTY_ROOT_HASH);
        for op in &ops {
            apply(&mut left, op);
        }
        let root_left = left.commit(1, true).expect("commit left");

        let env_b = TestEnv::new();
        let mut right = env_b.open(EMPTY_ROOT_HASH);
        for op in &ops {
            apply(&mut right, op);
        }
        let root_right = right.commit(1, true).expect("commit right");

        prop_assert_eq!(root_left, root_right);
    }
}
