//! どこで: account 単位の作業 copy / 何を: 3層 storage cache と storage trie handle / なぜ: tx 境界と block 境界の差分を分けて持つため

use crate::prefetch::{TrieKey, TriePrefetcher};
use alloy_primitives::{Address, Bytes, B256, U256};
use evm_triedb::{
    hash_address, hash_slot, trimmed_slot_rlp, Database, NodeSet, StateAccount, Trie, TrieError,
};
use std::collections::BTreeMap;

/// live cache の1要素。
/// dirty_storage は実行中の tx、pending_storage は finalise 済みで
/// 未 flush、origin_storage は disk 側の確定値 cache。
#[derive(Clone)]
pub struct StateObject<D: Database> {
    address: Address,
    addr_hash: B256,
    pub(crate) data: StateAccount,
    /// block 遷移前の姿。None は遷移前に存在しなかったことを表す。
    pub(crate) origin: Option<StateAccount>,
    pub(crate) trie: Option<D::Tr>,
    code: Option<Bytes>,
    origin_storage: BTreeMap<B256, U256>,
    pending_storage: BTreeMap<B256, U256>,
    dirty_storage: BTreeMap<B256, U256>,
    pub(crate) dirty_code: bool,
    pub(crate) self_destructed: bool,
    pub(crate) new_contract: bool,
}

impl<D: Database> StateObject<D> {
    pub(crate) fn new(address: Address, data: Option<StateAccount>) -> Self {
        Self {
            address,
            addr_hash: hash_address(address),
            data: data.unwrap_or_default(),
            origin: data,
            trie: None,
            code: None,
            origin_storage: BTreeMap::new(),
            pending_storage: BTreeMap::new(),
            dirty_storage: BTreeMap::new(),
            dirty_code: false,
            self_destructed: false,
            new_contract: false,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn addr_hash(&self) -> B256 {
        self.addr_hash
    }

    pub fn balance(&self) -> U256 {
        self.data.balance
    }

    pub fn nonce(&self) -> u64 {
        self.data.nonce
    }

    pub fn code_hash(&self) -> B256 {
        self.data.code_hash
    }

    pub fn storage_root(&self) -> B256 {
        self.data.storage_root
    }

    pub fn empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn mark_self_destructed(&mut self) {
        self.self_destructed = true;
    }

    // ---- journal undo が使う raw setter。journal には積まない ----

    pub(crate) fn set_balance_raw(&mut self, balance: U256) {
        self.data.balance = balance;
    }

    pub(crate) fn set_nonce_raw(&mut self, nonce: u64) {
        self.data.nonce = nonce;
    }

    pub(crate) fn set_code_raw(&mut self, code_hash: B256, code: Bytes) {
        self.data.code_hash = code_hash;
        self.code = Some(code);
    }

    pub(crate) fn set_state_raw(&mut self, key: B256, value: U256) {
        self.dirty_storage.insert(key, value);
    }

    pub(crate) fn set_code(&mut self, code_hash: B256, code: Bytes) {
        self.set_code_raw(code_hash, code);
        self.dirty_code = true;
    }

    pub(crate) fn cache_code(&mut self, code: Bytes) {
        self.code = Some(code);
    }

    pub(crate) fn code_cached(&self) -> Option<&Bytes> {
        self.code.as_ref()
    }

    pub(crate) fn dirty_slot(&self, key: B256) -> Option<U256> {
        self.dirty_storage.get(&key).copied()
    }

    pub(crate) fn cached_committed_slot(&self, key: B256) -> Option<U256> {
        if let Some(value) = self.pending_storage.get(&key) {
            return Some(*value);
        }
        self.origin_storage.get(&key).copied()
    }

    pub(crate) fn cache_committed_slot(&mut self, key: B256, value: U256) {
        self.origin_storage.insert(key, value);
    }

    /// tx 境界。dirty を pending へ畳み、origin と異なる slot を prefetch 対象として返す。
    pub(crate) fn finalise(&mut self) -> Vec<TrieKey> {
        let mut slots = Vec::with_capacity(self.dirty_storage.len());
        for (key, value) in std::mem::take(&mut self.dirty_storage) {
            if self.origin_storage.get(&key).copied().unwrap_or_default() != value {
                slots.push(TrieKey::Slot(key));
            }
            self.pending_storage.insert(key, value);
        }
        slots
    }

    /// pending を storage trie へ flush し、mutated slot を block cache
    /// (storages / storages_origin) に記録する。戻り値は (updated, deleted)。
    pub(crate) fn update_trie(
        &mut self,
        db: &D,
        state_root: B256,
        main: Option<&D::Tr>,
        prefetcher: Option<&TriePrefetcher<D>>,
        storages: &mut BTreeMap<B256, BTreeMap<B256, Vec<u8>>>,
        storages_origin: &mut BTreeMap<Address, BTreeMap<B256, Vec<u8>>>,
    ) -> Result<(usize, usize), TrieError> {
        let _ = self.finalise();
        if self.pending_storage.is_empty() {
            return Ok((0, 0));
        }
        if self.trie.is_none() {
            if let Some(prefetcher) = prefetcher {
                self.trie = prefetcher.trie(self.addr_hash, self.data.storage_root);
            }
        }
        if self.trie.is_none() {
            self.trie = Some(db.open_storage_trie(
                state_root,
                self.address,
                self.data.storage_root,
                main,
            )?);
        }
        let trie = self.trie.as_mut().expect("storage trie opened above");

        let mut updated = 0usize;
        let mut deleted = 0usize;
        for (key, value) in std::mem::take(&mut self.pending_storage) {
            let prev = self.origin_storage.get(&key).copied().unwrap_or_default();
            if prev == value {
                continue;
            }
            self.origin_storage.insert(key, value);

            let slot_hash = hash_slot(key);
            let encoded = if value.is_zero() {
                trie.delete_storage(self.address, key)?;
                deleted += 1;
                Vec::new()
            } else {
                trie.update_storage(self.address, key, value)?;
                updated += 1;
                trimmed_slot_rlp(value)
            };
            storages
                .entry(self.addr_hash)
                .or_default()
                .insert(slot_hash, encoded);
            // origin は最初の書き込みのみ記録する。block 内の後続変更は上書きしない。
            storages_origin
                .entry(self.address)
                .or_default()
                .entry(slot_hash)
                .or_insert_with(|| {
                    if prev.is_zero() {
                        Vec::new()
                    } else {
                        trimmed_slot_rlp(prev)
                    }
                });
        }
        Ok((updated, deleted))
    }

    /// update_trie のうえで storage root を account record へ反映する。
    pub(crate) fn update_root(
        &mut self,
        db: &D,
        state_root: B256,
        main: Option<&D::Tr>,
        prefetcher: Option<&TriePrefetcher<D>>,
        storages: &mut BTreeMap<B256, BTreeMap<B256, Vec<u8>>>,
        storages_origin: &mut BTreeMap<Address, BTreeMap<B256, Vec<u8>>>,
    ) -> Result<(usize, usize), TrieError> {
        let counts = self.update_trie(db, state_root, main, prefetcher, storages, storages_origin)?;
        if let Some(trie) = &self.trie {
            self.data.storage_root = trie.hash();
        }
        Ok(counts)
    }

    /// storage trie を確定する。trie を開いていなければ何も書かれていない。
    pub(crate) fn commit_storage(&mut self) -> Result<Option<NodeSet>, TrieError> {
        let Some(trie) = self.trie.as_mut() else {
            return Ok(None);
        };
        let (root, set) = trie.commit(false)?;
        self.data.storage_root = root;
        Ok(set)
    }
}
