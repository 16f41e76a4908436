//! どこで: EIP-2929/2930 access list / 何を: tx 単位の warm address / slot 集合 / なぜ: gas 計算の warm 判定を O(log n) にするため

use alloy_primitives::{Address, B256};
use std::collections::{BTreeMap, BTreeSet};

/// addresses の値は slots vec への index。slot 未登録の address は None。
#[derive(Clone, Debug, Default)]
pub struct AccessList {
    addresses: BTreeMap<Address, Option<usize>>,
    slots: Vec<BTreeSet<B256>>,
}

impl AccessList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains_address(&self, address: Address) -> bool {
        self.addresses.contains_key(&address)
    }

    /// (address が warm か, slot が warm か)
    pub fn contains(&self, address: Address, slot: B256) -> (bool, bool) {
        match self.addresses.get(&address) {
            None => (false, false),
            Some(None) => (true, false),
            Some(Some(idx)) => (true, self.slots[*idx].contains(&slot)),
        }
    }

    /// 追加したら true。journal 側はこの戻り値で undo entry を積む。
    pub fn add_address(&mut self, address: Address) -> bool {
        if self.addresses.contains_key(&address) {
            return false;
        }
        self.addresses.insert(address, None);
        true
    }

    /// (address を新規追加したか, slot を新規追加したか)
    pub fn add_slot(&mut self, address: Address, slot: B256) -> (bool, bool) {
        match self.addresses.get(&address).copied() {
            None => {
                let idx = self.slots.len();
                let mut set = BTreeSet::new();
                set.insert(slot);
                self.slots.push(set);
                self.addresses.insert(address, Some(idx));
                (true, true)
            }
            Some(None) => {
                let idx = self.slots.len();
                let mut set = BTreeSet::new();
                set.insert(slot);
                self.slots.push(set);
                self.addresses.insert(address, Some(idx));
                (false, true)
            }
            Some(Some(idx)) => {
                let added = self.slots[idx].insert(slot);
                (false, added)
            }
        }
    }

    /// journal undo 専用。直前の add_address を打ち消す。
    pub(crate) fn delete_address(&mut self, address: Address) {
        self.addresses.remove(&address);
    }

    /// journal undo 専用。追加は LIFO で巻き戻る前提なので、
    /// 空になった slot set が vec 末尾のときだけ縮める。
    pub(crate) fn delete_slot(&mut self, address: Address, slot: B256) {
        let Some(Some(idx)) = self.addresses.get(&address).copied() else {
            return;
        };
        self.slots[idx].remove(&slot);
        if self.slots[idx].is_empty() {
            self.slots.truncate(idx);
            self.addresses.insert(address, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_contains() {
        let mut list = AccessList::new();
        let addr = Address::repeat_byte(1);
        let slot = B256::repeat_byte(2);

        assert!(list.add_address(addr));
        assert!(!list.add_address(addr));
        assert_eq!(list.contains(addr, slot), (true, false));

        assert_eq!(list.add_slot(addr, slot), (false, true));
        assert_eq!(list.add_slot(addr, slot), (false, false));
        assert_eq!(list.contains(addr, slot), (true, true));
    }

    #[test]
    fn slot_add_registers_unknown_address() {
        let mut list = AccessList::new();
        let addr = Address::repeat_byte(3);
        let slot = B256::repeat_byte(4);

        assert_eq!(list.add_slot(addr, slot), (true, true));
        assert!(list.contains_address(addr));
    }

    #[test]
    fn lifo_delete_restores_previous_shape() {
        let mut list = AccessList::new();
        let addr = Address::repeat_byte(5);
        let slot_a = B256::repeat_byte(6);
        let slot_b = B256::repeat_byte(7);

        list.add_slot(addr, slot_a);
        list.add_slot(addr, slot_b);

        list.delete_slot(addr, slot_b);
        assert_eq!(list.contains(addr, slot_a), (true, true));
        assert_eq!(list.contains(addr, slot_b), (true, false));

        list.delete_slot(addr, slot_a);
        assert_eq!(list.contains(addr, slot_a), (true, false));

        list.delete_address(addr);
        assert!(!list.contains_address(addr));
    }
}
