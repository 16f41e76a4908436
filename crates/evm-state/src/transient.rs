//! どこで: EIP-1153 transient storage / 何を: tx 内だけ生きる (address, slot) → value / なぜ: tx 境界で確実に消すため

use alloy_primitives::{Address, B256, U256};
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default)]
pub struct TransientStorage {
    slots: BTreeMap<Address, BTreeMap<B256, U256>>,
}

impl TransientStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: Address, key: B256) -> U256 {
        self.slots
            .get(&address)
            .and_then(|slots| slots.get(&key))
            .copied()
            .unwrap_or(U256::ZERO)
    }

    pub fn set(&mut self, address: Address, key: B256, value: U256) {
        self.slots.entry(address).or_default().insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_slot_reads_zero() {
        let store = TransientStorage::new();
        assert_eq!(
            store.get(Address::repeat_byte(1), B256::repeat_byte(2)),
            U256::ZERO
        );
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut store = TransientStorage::new();
        let addr = Address::repeat_byte(1);
        let key = B256::repeat_byte(2);
        store.set(addr, key, U256::from(7u64));
        assert_eq!(store.get(addr, key), U256::from(7u64));
        store.set(addr, key, U256::ZERO);
        assert_eq!(store.get(addr, key), U256::ZERO);
    }
}
