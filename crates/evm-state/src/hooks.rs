//! どこで: 観測 hook / 何を: log と balance 変化の通知 / なぜ: tracer を core から切り離すため

use crate::statedb::LogRecord;
use alloy_primitives::{Address, U256};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BalanceChangeReason {
    Unspecified,
    Transfer,
    SelfDestruct,
    SelfDestructBurn,
}

/// 省略可能な観測側。state 本体は戻り値を見ない。
pub trait StateHooks: Send + Sync {
    fn on_log(&self, _log: &LogRecord) {}

    fn on_balance_change(
        &self,
        _address: Address,
        _prev: U256,
        _new: U256,
        _reason: BalanceChangeReason,
    ) {
    }
}
