//! どこで: evm-state の入口 / 何を: block 実行用 state cache の核 / なぜ: trie と VM の間の責務を1箇所に集めるため

pub mod access_list;
pub mod deletion;
pub mod hooks;
pub mod journal;
pub mod object;
pub mod prefetch;
pub mod statedb;
pub mod transient;

pub use hooks::{BalanceChangeReason, StateHooks};
pub use statedb::{ForkRules, LogRecord, StateDb, StateError};
