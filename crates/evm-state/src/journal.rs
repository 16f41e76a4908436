//! どこで: tx 内の変更記録 / 何を: undo entry の LIFO log と dirty 計数 / なぜ: 任意深度の revert を正確に戻すため

use crate::statedb::StateDb;
use alloy_primitives::{address, Address, Bytes, B256, U256};
use evm_triedb::Database;
use std::collections::BTreeMap;

/// mainnet block 1714175 で touch が revert を生き延びた歴史的 address。
/// この address の touch だけは dirty 計数を二重に積み、revert 後も dirty に残す。
pub(crate) const RIPEMD_ADDRESS: Address = address!("0000000000000000000000000000000000000003");

/// 1 mutation 分の undo 情報。apply 前の状態をそのまま抱える。
#[derive(Clone, Debug)]
pub enum JournalEntry {
    CreateObject {
        address: Address,
    },
    CreateZombie {
        address: Address,
    },
    CreateContract {
        address: Address,
    },
    SelfDestruct {
        address: Address,
        prev_destructed: bool,
        prev_balance: U256,
    },
    BalanceChange {
        address: Address,
        prev: U256,
    },
    NonceChange {
        address: Address,
        prev: u64,
    },
    CodeChange {
        address: Address,
        prev_code_hash: B256,
        prev_code: Bytes,
    },
    StorageChange {
        address: Address,
        key: B256,
        prev: U256,
    },
    TransientStorageChange {
        address: Address,
        key: B256,
        prev: U256,
    },
    RefundChange {
        prev: u64,
    },
    AddLog {
        tx_hash: B256,
    },
    AddPreimage {
        hash: B256,
    },
    AccessListAddAccount {
        address: Address,
    },
    AccessListAddSlot {
        address: Address,
        slot: B256,
    },
    Touch {
        address: Address,
    },
}

impl JournalEntry {
    /// この entry が dirty 扱いにする address。
    fn dirtied(&self) -> Option<Address> {
        match self {
            JournalEntry::CreateObject { address }
            | JournalEntry::CreateZombie { address }
            | JournalEntry::SelfDestruct { address, .. }
            | JournalEntry::BalanceChange { address, .. }
            | JournalEntry::NonceChange { address, .. }
            | JournalEntry::CodeChange { address, .. }
            | JournalEntry::StorageChange { address, .. }
            | JournalEntry::Touch { address } => Some(*address),
            JournalEntry::CreateContract { .. }
            | JournalEntry::TransientStorageChange { .. }
            | JournalEntry::RefundChange { .. }
            | JournalEntry::AddLog { .. }
            | JournalEntry::AddPreimage { .. }
            | JournalEntry::AccessListAddAccount { .. }
            | JournalEntry::AccessListAddSlot { .. } => None,
        }
    }

    /// zombie 計数の対象か。dirty 全件が zombie の address は
    /// finalise の empty-account 削除から除外される。
    fn is_zombie(&self) -> bool {
        matches!(self, JournalEntry::CreateZombie { .. })
    }

    fn revert<D: Database>(self, state: &mut StateDb<D>) {
        match self {
            JournalEntry::CreateObject { address } | JournalEntry::CreateZombie { address } => {
                state.state_objects.remove(&address);
            }
            JournalEntry::CreateContract { address } => {
                if let Some(obj) = state.state_objects.get_mut(&address) {
                    obj.new_contract = false;
                }
            }
            JournalEntry::SelfDestruct {
                address,
                prev_destructed,
                prev_balance,
            } => {
                if let Some(obj) = state.state_objects.get_mut(&address) {
                    obj.self_destructed = prev_destructed;
                    obj.set_balance_raw(prev_balance);
                }
            }
            JournalEntry::BalanceChange { address, prev } => {
                if let Some(obj) = state.state_objects.get_mut(&address) {
                    obj.set_balance_raw(prev);
                }
            }
            JournalEntry::NonceChange { address, prev } => {
                if let Some(obj) = state.state_objects.get_mut(&address) {
                    obj.set_nonce_raw(prev);
                }
            }
            JournalEntry::CodeChange {
                address,
                prev_code_hash,
                prev_code,
            } => {
                if let Some(obj) = state.state_objects.get_mut(&address) {
                    obj.set_code_raw(prev_code_hash, prev_code);
                }
            }
            JournalEntry::StorageChange { address, key, prev } => {
                if let Some(obj) = state.state_objects.get_mut(&address) {
                    obj.set_state_raw(key, prev);
                }
            }
            JournalEntry::TransientStorageChange { address, key, prev } => {
                state.transient_storage.set(address, key, prev);
            }
            JournalEntry::RefundChange { prev } => {
                state.refund = prev;
            }
            JournalEntry::AddLog { tx_hash } => {
                let drop_entry = match state.logs.get_mut(&tx_hash) {
                    Some(entries) => {
                        entries.pop();
                        entries.is_empty()
                    }
                    None => false,
                };
                if drop_entry {
                    state.logs.remove(&tx_hash);
                }
                state.log_size -= 1;
            }
            JournalEntry::AddPreimage { hash } => {
                state.preimages.remove(&hash);
            }
            JournalEntry::AccessListAddAccount { address } => {
                state.access_list.delete_address(address);
            }
            JournalEntry::AccessListAddSlot { address, slot } => {
                state.access_list.delete_slot(address, slot);
            }
            JournalEntry::Touch { .. } => {}
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Journal {
    entries: Vec<JournalEntry>,
    dirties: BTreeMap<Address, usize>,
    zombie_entries: BTreeMap<Address, usize>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: JournalEntry) {
        if let Some(address) = entry.dirtied() {
            *self.dirties.entry(address).or_insert(0) += 1;
        }
        if entry.is_zombie() {
            if let Some(address) = entry.dirtied() {
                *self.zombie_entries.entry(address).or_insert(0) += 1;
            }
        }
        self.entries.push(entry);
    }

    /// entry とは独立に dirty を1つ積む。touch の ripemd 特例のみが使う。
    pub(crate) fn dirty(&mut self, address: Address) {
        *self.dirties.entry(address).or_insert(0) += 1;
    }

    pub fn length(&self) -> usize {
        self.entries.len()
    }

    /// journal を snapshot 長まで巻き戻す。undo は LIFO。
    pub(crate) fn revert<D: Database>(&mut self, state: &mut StateDb<D>, snapshot: usize) {
        while self.entries.len() > snapshot {
            let Some(entry) = self.entries.pop() else {
                break;
            };
            if let Some(address) = entry.dirtied() {
                if let Some(count) = self.dirties.get_mut(&address) {
                    *count -= 1;
                    if *count == 0 {
                        self.dirties.remove(&address);
                    }
                }
            }
            if entry.is_zombie() {
                if let Some(address) = entry.dirtied() {
                    if let Some(count) = self.zombie_entries.get_mut(&address) {
                        *count -= 1;
                        if *count == 0 {
                            self.zombie_entries.remove(&address);
                        }
                    }
                }
            }
            entry.revert(state);
        }
    }

    /// finalise が見る dirty address と計数。BTreeMap 由来で address 昇順。
    pub(crate) fn dirty_addresses(&self) -> Vec<(Address, usize)> {
        self.dirties.iter().map(|(a, c)| (*a, *c)).collect()
    }

    /// dirty 全件が zombie entry なら true。
    pub(crate) fn is_zombie_address(&self, address: Address, dirty_count: usize) -> bool {
        self.zombie_entries.get(&address) == Some(&dirty_count)
    }

    pub fn copy(&self) -> Self {
        self.clone()
    }
}
