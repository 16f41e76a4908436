//! どこで: evm-state integration tests / 何を: テスト補助関数 / なぜ: 初期 state 構築と観測 hook を1箇所に集約するため

#![allow(dead_code)]

use alloy_primitives::{Address, B256, U256};
use alloy_trie::EMPTY_ROOT_HASH;
use evm_state::hooks::{BalanceChangeReason, StateHooks};
use evm_state::statedb::{LogRecord, StateDb};
use evm_triedb::memory::{MemoryDatabase, MemorySnapshotTree};
use evm_triedb::SnapshotTree;
use std::sync::{Arc, Mutex};

pub type TestState = StateDb<MemoryDatabase>;

pub struct TestEnv {
    pub db: MemoryDatabase,
    pub snaps: Arc<MemorySnapshotTree>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            db: MemoryDatabase::new(),
            snaps: Arc::new(MemorySnapshotTree::new(EMPTY_ROOT_HASH)),
        }
    }

    pub fn open(&self, root: B256) -> TestState {
        let snaps: Arc<dyn SnapshotTree> = self.snaps.clone();
        StateDb::new(root, self.db.clone(), Some(snaps)).expect("open state")
    }

    pub fn open_without_snapshot(&self, root: B256) -> TestState {
        StateDb::new(root, self.db.clone(), None).expect("open state")
    }

    /// genesis 相当の pre-state を commit して root を返す。
    pub fn seed(&self, build: impl FnOnce(&mut TestState)) -> B256 {
        let mut state = self.open(EMPTY_ROOT_HASH);
        build(&mut state);
        state.commit(0, true).expect("seed commit")
    }
}

pub fn addr(byte: u8) -> Address {
    Address::repeat_byte(byte)
}

pub fn slot(byte: u8) -> B256 {
    B256::repeat_byte(byte)
}

pub fn wei(value: u64) -> U256 {
    U256::from(value)
}

pub fn word(value: u64) -> U256 {
    U256::from(value)
}

pub fn fund(state: &mut TestState, address: Address, amount: u64) {
    state.add_balance(address, wei(amount), BalanceChangeReason::Transfer);
}

/// balance 変化と log を素通しで記録する観測 hook。
#[derive(Default)]
pub struct RecordingHooks {
    pub balance_events: Mutex<Vec<(Address, U256, U256, BalanceChangeReason)>>,
    pub logs: Mutex<Vec<LogRecord>>,
}

impl StateHooks for RecordingHooks {
    fn on_log(&self, log: &LogRecord) {
        self.logs.lock().expect("hook lock").push(log.clone());
    }

    fn on_balance_change(
        &self,
        address: Address,
        prev: U256,
        new: U256,
        reason: BalanceChangeReason,
    ) {
        self.balance_events
            .lock()
            .expect("hook lock")
            .push((address, prev, new, reason));
    }
}
