//! どこで: テスト用 backend / 何を: 実 MPT root 計算つき in-memory store / なぜ: 契約を実体で検証するため

use crate::account::{hash_address, StateAccount};
use crate::node_set::{MergedNodeSet, NodeChange, NodeSet, StateSet};
use crate::snapshot::{SnapshotError, SnapshotReader, SnapshotTree, StorageIterator};
use crate::traits::{Database, Trie, TrieError, TrieItem, TrieScheme, TrieWalker, WriteBatch};
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_trie::{HashBuilder, Nibbles, EMPTY_ROOT_HASH};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

/// commit_update が受け取った一括更新の記録。テストが検分する。
#[derive(Clone, Debug)]
pub struct CommitRecord {
    pub root: B256,
    pub parent: B256,
    pub block: u64,
    pub nodes: MergedNodeSet,
    pub origin: StateSet,
}

#[derive(Default)]
struct StoreInner {
    fail_reads: bool,
    account_tries: BTreeMap<B256, BTreeMap<B256, StateAccount>>,
    storage_tries: BTreeMap<B256, BTreeMap<B256, U256>>,
    codes: BTreeMap<B256, Vec<u8>>,
    artifacts: BTreeMap<B256, Vec<u8>>,
    updates: Vec<CommitRecord>,
}

/// 共有 store。trie handle は open 時点の内容を clone して持ち、
/// commit で新 root の内容を store に登録する。
#[derive(Clone)]
pub struct MemoryDatabase {
    store: Arc<Mutex<StoreInner>>,
    scheme: TrieScheme,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::with_scheme(TrieScheme::Path)
    }

    pub fn with_scheme(scheme: TrieScheme) -> Self {
        let mut inner = StoreInner::default();
        inner.account_tries.insert(EMPTY_ROOT_HASH, BTreeMap::new());
        inner.storage_tries.insert(EMPTY_ROOT_HASH, BTreeMap::new());
        Self {
            store: Arc::new(Mutex::new(inner)),
            scheme,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.store.lock().expect("memory store poisoned")
    }

    /// 読み取り失敗の注入。有効な間は account / storage / code の読みが全て失敗する。
    pub fn configure_read_failpoint_for_test(&self, enabled: bool) {
        self.lock().fail_reads = enabled;
    }

    pub fn committed_updates(&self) -> Vec<CommitRecord> {
        self.lock().updates.clone()
    }

    pub fn code(&self, code_hash: B256) -> Option<Vec<u8>> {
        self.lock().codes.get(&code_hash).cloned()
    }

    pub fn artifact(&self, hash: B256) -> Option<Vec<u8>> {
        self.lock().artifacts.get(&hash).cloned()
    }

    pub fn has_account_trie(&self, root: B256) -> bool {
        self.lock().account_tries.contains_key(&root)
    }

    pub fn has_storage_trie(&self, root: B256) -> bool {
        self.lock().storage_tries.contains_key(&root)
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
enum TrieContent {
    Accounts {
        live: BTreeMap<B256, StateAccount>,
        orig: BTreeMap<B256, StateAccount>,
    },
    Slots {
        live: BTreeMap<B256, U256>,
        orig: BTreeMap<B256, U256>,
    },
}

/// leaf 粒度で node 集合を数える trie。path は hashed key の nibbles。
/// owner は account trie なら zero、storage trie なら address hash。
#[derive(Clone)]
pub struct MemoryTrie {
    store: Arc<Mutex<StoreInner>>,
    owner: B256,
    content: TrieContent,
}

/// root 計算に流す (path, leaf blob) の組。
struct KvOp {
    key: Nibbles,
    value: SmallVec<[u8; 128]>,
}

fn account_leaf_ops(leaves: &BTreeMap<B256, StateAccount>) -> Vec<KvOp> {
    leaves
        .iter()
        .map(|(hash, account)| KvOp {
            key: Nibbles::unpack(hash),
            value: SmallVec::from_vec(account.full_rlp()),
        })
        .collect()
}

fn slot_leaf_ops(leaves: &BTreeMap<B256, U256>) -> Vec<KvOp> {
    leaves
        .iter()
        .map(|(hash, value)| KvOp {
            key: Nibbles::unpack(hash),
            value: SmallVec::from_vec(alloy_rlp::encode(value)),
        })
        .collect()
}

fn root_of(ops: Vec<KvOp>) -> B256 {
    let mut builder = HashBuilder::default();
    for op in ops {
        builder.add_leaf(op.key, &op.value);
    }
    builder.root()
}

impl MemoryTrie {
    fn fail_injected(&self) -> bool {
        self.store.lock().expect("memory store poisoned").fail_reads
    }
}

impl Trie for MemoryTrie {
    fn get_account(&self, address: Address) -> Result<Option<StateAccount>, TrieError> {
        if self.fail_injected() {
            return Err(TrieError::Backend("injected read failure".to_string()));
        }
        match &self.content {
            TrieContent::Accounts { live, .. } => Ok(live.get(&hash_address(address)).copied()),
            TrieContent::Slots { .. } => Err(TrieError::NotAccountTrie),
        }
    }

    fn get_storage(&self, _address: Address, key: B256) -> Result<U256, TrieError> {
        if self.fail_injected() {
            return Err(TrieError::Backend("injected read failure".to_string()));
        }
        match &self.content {
            TrieContent::Slots { live, .. } => {
                Ok(live.get(&keccak256(key)).copied().unwrap_or(U256::ZERO))
            }
            TrieContent::Accounts { .. } => Err(TrieError::NotStorageTrie),
        }
    }

    fn update_account(&mut self, address: Address, account: &StateAccount) -> Result<(), TrieError> {
        match &mut self.content {
            TrieContent::Accounts { live, .. } => {
                live.insert(hash_address(address), *account);
                Ok(())
            }
            TrieContent::Slots { .. } => Err(TrieError::NotAccountTrie),
        }
    }

    fn update_storage(&mut self, _address: Address, key: B256, value: U256) -> Result<(), TrieError> {
        match &mut self.content {
            TrieContent::Slots { live, .. } => {
                if value.is_zero() {
                    live.remove(&keccak256(key));
                } else {
                    live.insert(keccak256(key), value);
                }
                Ok(())
            }
            TrieContent::Accounts { .. } => Err(TrieError::NotStorageTrie),
        }
    }

    fn delete_account(&mut self, address: Address) -> Result<(), TrieError> {
        match &mut self.content {
            TrieContent::Accounts { live, .. } => {
                live.remove(&hash_address(address));
                Ok(())
            }
            TrieContent::Slots { .. } => Err(TrieError::NotAccountTrie),
        }
    }

    fn delete_storage(&mut self, _address: Address, key: B256) -> Result<(), TrieError> {
        match &mut self.content {
            TrieContent::Slots { live, .. } => {
                live.remove(&keccak256(key));
                Ok(())
            }
            TrieContent::Accounts { .. } => Err(TrieError::NotStorageTrie),
        }
    }

    fn update_contract_code(
        &mut self,
        _address: Address,
        code_hash: B256,
        code: &[u8],
    ) -> Result<(), TrieError> {
        self.store
            .lock()
            .expect("memory store poisoned")
            .codes
            .insert(code_hash, code.to_vec());
        Ok(())
    }

    fn hash(&self) -> B256 {
        match &self.content {
            TrieContent::Accounts { live, .. } => root_of(account_leaf_ops(live)),
            TrieContent::Slots { live, .. } => root_of(slot_leaf_ops(live)),
        }
    }

    fn commit(&mut self, _collect_leaves: bool) -> Result<(B256, Option<NodeSet>), TrieError> {
        let root = self.hash();
        let mut store = self.store.lock().expect("memory store poisoned");
        let set = match &mut self.content {
            TrieContent::Accounts { live, orig } => {
                let mut set = NodeSet::new(B256::ZERO);
                for (hash, account) in live.iter() {
                    if orig.get(hash) != Some(account) {
                        set.add_node(
                            Nibbles::unpack(hash),
                            NodeChange::Updated(account.full_rlp()),
                        );
                    }
                }
                for hash in orig.keys() {
                    if !live.contains_key(hash) {
                        set.add_node(Nibbles::unpack(hash), NodeChange::Deleted);
                    }
                }
                store.account_tries.insert(root, live.clone());
                *orig = live.clone();
                set
            }
            TrieContent::Slots { live, orig } => {
                let mut set = NodeSet::new(self.owner);
                for (hash, value) in live.iter() {
                    if orig.get(hash) != Some(value) {
                        set.add_node(
                            Nibbles::unpack(hash),
                            NodeChange::Updated(alloy_rlp::encode(value)),
                        );
                    }
                }
                for hash in orig.keys() {
                    if !live.contains_key(hash) {
                        set.add_node(Nibbles::unpack(hash), NodeChange::Deleted);
                    }
                }
                store.storage_tries.insert(root, live.clone());
                *orig = live.clone();
                set
            }
        };
        if set.is_empty() {
            Ok((root, None))
        } else {
            Ok((root, Some(set)))
        }
    }

    fn node_iterator(&self, start: Option<B256>) -> Result<TrieWalker, TrieError> {
        if self.fail_injected() {
            return Err(TrieError::Backend("injected read failure".to_string()));
        }
        let from = start.unwrap_or(B256::ZERO);
        let items: Vec<TrieItem> = match &self.content {
            TrieContent::Accounts { live, .. } => live
                .range(from..)
                .map(|(hash, account)| TrieItem::Leaf {
                    key: *hash,
                    value: account.full_rlp(),
                })
                .collect(),
            TrieContent::Slots { live, .. } => live
                .range(from..)
                .map(|(hash, value)| TrieItem::Leaf {
                    key: *hash,
                    value: alloy_rlp::encode(value),
                })
                .collect(),
        };
        Ok(TrieWalker::new(items))
    }
}

pub struct MemoryBatch {
    store: Arc<Mutex<StoreInner>>,
    target: BatchTarget,
    staged: Vec<(B256, Vec<u8>)>,
    size: usize,
}

#[derive(Clone, Copy)]
enum BatchTarget {
    Code,
    Artifact,
}

impl WriteBatch for MemoryBatch {
    fn put(&mut self, key: B256, value: Vec<u8>) {
        self.size += value.len();
        self.staged.push((key, value));
    }

    fn value_size(&self) -> usize {
        self.size
    }

    fn write(&mut self) -> Result<(), TrieError> {
        let mut store = self.store.lock().expect("memory store poisoned");
        for (key, value) in self.staged.drain(..) {
            match self.target {
                BatchTarget::Code => store.codes.insert(key, value),
                BatchTarget::Artifact => store.artifacts.insert(key, value),
            };
        }
        self.size = 0;
        Ok(())
    }
}

impl Database for MemoryDatabase {
    type Tr = MemoryTrie;
    type Batch = MemoryBatch;

    fn open_trie(&self, root: B256) -> Result<MemoryTrie, TrieError> {
        let store = self.lock();
        let content = match store.account_tries.get(&root) {
            Some(content) => content.clone(),
            None => return Err(TrieError::MissingRoot(root)),
        };
        Ok(MemoryTrie {
            store: self.store.clone(),
            owner: B256::ZERO,
            content: TrieContent::Accounts {
                live: content.clone(),
                orig: content,
            },
        })
    }

    fn open_storage_trie(
        &self,
        _state_root: B256,
        address: Address,
        root: B256,
        _main: Option<&MemoryTrie>,
    ) -> Result<MemoryTrie, TrieError> {
        let store = self.lock();
        let content = match store.storage_tries.get(&root) {
            Some(content) => content.clone(),
            None => return Err(TrieError::MissingRoot(root)),
        };
        Ok(MemoryTrie {
            store: self.store.clone(),
            owner: hash_address(address),
            content: TrieContent::Slots {
                live: content.clone(),
                orig: content,
            },
        })
    }

    fn contract_code(&self, _address: Address, code_hash: B256) -> Result<Bytes, TrieError> {
        let store = self.lock();
        if store.fail_reads {
            return Err(TrieError::Backend("injected read failure".to_string()));
        }
        match store.codes.get(&code_hash) {
            Some(code) => Ok(Bytes::copy_from_slice(code)),
            None => Err(TrieError::Backend(format!(
                "code not found hash={code_hash}"
            ))),
        }
    }

    fn contract_code_size(&self, address: Address, code_hash: B256) -> Result<usize, TrieError> {
        Ok(self.contract_code(address, code_hash)?.len())
    }

    fn code_batch(&self) -> MemoryBatch {
        MemoryBatch {
            store: self.store.clone(),
            target: BatchTarget::Code,
            staged: Vec::new(),
            size: 0,
        }
    }

    fn artifact_batch(&self) -> MemoryBatch {
        MemoryBatch {
            store: self.store.clone(),
            target: BatchTarget::Artifact,
            staged: Vec::new(),
            size: 0,
        }
    }

    fn scheme(&self) -> TrieScheme {
        self.scheme
    }

    fn commit_update(
        &self,
        root: B256,
        parent: B256,
        block: u64,
        nodes: MergedNodeSet,
        origin: StateSet,
    ) -> Result<(), TrieError> {
        self.lock().updates.push(CommitRecord {
            root,
            parent,
            block,
            nodes,
            origin,
        });
        Ok(())
    }
}

// ---- snapshot tree ----

#[derive(Clone)]
struct SnapLayer {
    parent: B256,
    destructed: BTreeSet<B256>,
    accounts: BTreeMap<B256, Vec<u8>>,
    storages: BTreeMap<B256, BTreeMap<B256, Vec<u8>>>,
}

struct SnapInner {
    base_root: B256,
    base_accounts: BTreeMap<B256, Vec<u8>>,
    base_storages: BTreeMap<B256, BTreeMap<B256, Vec<u8>>>,
    layers: BTreeMap<B256, SnapLayer>,
}

impl SnapInner {
    /// root から base までの layer 列 (新しい順)。base に到達しなければ None。
    fn chain(&self, root: B256) -> Option<Vec<B256>> {
        let mut out = Vec::new();
        let mut cursor = root;
        loop {
            if cursor == self.base_root {
                return Some(out);
            }
            let layer = self.layers.get(&cursor)?;
            out.push(cursor);
            cursor = layer.parent;
        }
    }

    fn account_at(&self, root: B256, account_hash: B256) -> Result<Option<Vec<u8>>, SnapshotError> {
        let chain = self
            .chain(root)
            .ok_or(SnapshotError::UnknownRoot(root))?;
        for layer_root in chain {
            let layer = &self.layers[&layer_root];
            // resurrect は destructed と accounts の両方に現れるため accounts を先に引く
            if let Some(raw) = layer.accounts.get(&account_hash) {
                return Ok(Some(raw.clone()));
            }
            if layer.destructed.contains(&account_hash) {
                return Ok(None);
            }
        }
        Ok(self.base_accounts.get(&account_hash).cloned())
    }

    fn storage_at(
        &self,
        root: B256,
        account_hash: B256,
        slot_hash: B256,
    ) -> Result<Option<Vec<u8>>, SnapshotError> {
        let chain = self
            .chain(root)
            .ok_or(SnapshotError::UnknownRoot(root))?;
        for layer_root in chain {
            let layer = &self.layers[&layer_root];
            if let Some(slots) = layer.storages.get(&account_hash) {
                if let Some(raw) = slots.get(&slot_hash) {
                    if raw.is_empty() {
                        return Ok(None);
                    }
                    return Ok(Some(raw.clone()));
                }
            }
            if layer.destructed.contains(&account_hash) {
                return Ok(None);
            }
        }
        Ok(self
            .base_storages
            .get(&account_hash)
            .and_then(|slots| slots.get(&slot_hash))
            .cloned())
    }

    /// account の storage を root 時点へ flatten する。
    fn flatten_storage(
        &self,
        root: B256,
        account_hash: B256,
    ) -> Result<BTreeMap<B256, Vec<u8>>, SnapshotError> {
        let chain = self
            .chain(root)
            .ok_or(SnapshotError::UnknownRoot(root))?;
        let mut merged = self
            .base_storages
            .get(&account_hash)
            .cloned()
            .unwrap_or_default();
        // 古い layer から順に適用する
        for layer_root in chain.iter().rev() {
            let layer = &self.layers[layer_root];
            if layer.destructed.contains(&account_hash) {
                merged.clear();
            }
            if let Some(slots) = layer.storages.get(&account_hash) {
                for (slot_hash, raw) in slots {
                    if raw.is_empty() {
                        merged.remove(slot_hash);
                    } else {
                        merged.insert(*slot_hash, raw.clone());
                    }
                }
            }
        }
        Ok(merged)
    }
}

/// diff layer を積む in-memory snapshot tree。
pub struct MemorySnapshotTree {
    inner: Arc<Mutex<SnapInner>>,
}

impl MemorySnapshotTree {
    pub fn new(base_root: B256) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SnapInner {
                base_root,
                base_accounts: BTreeMap::new(),
                base_storages: BTreeMap::new(),
                layers: BTreeMap::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SnapInner> {
        self.inner.lock().expect("snapshot tree poisoned")
    }

    /// root までの diff layer 枚数。テスト用。
    pub fn layer_depth(&self, root: B256) -> Option<usize> {
        self.lock().chain(root).map(|chain| chain.len())
    }
}

struct MemorySnapshot {
    inner: Arc<Mutex<SnapInner>>,
    root: B256,
}

impl SnapshotReader for MemorySnapshot {
    fn root(&self) -> B256 {
        self.root
    }

    fn account(&self, account_hash: B256) -> Result<Option<Vec<u8>>, SnapshotError> {
        self.inner
            .lock()
            .expect("snapshot tree poisoned")
            .account_at(self.root, account_hash)
    }

    fn storage(&self, account_hash: B256, slot_hash: B256) -> Result<Option<Vec<u8>>, SnapshotError> {
        self.inner
            .lock()
            .expect("snapshot tree poisoned")
            .storage_at(self.root, account_hash, slot_hash)
    }

    fn boxed_clone(&self) -> Box<dyn SnapshotReader> {
        Box::new(MemorySnapshot {
            inner: self.inner.clone(),
            root: self.root,
        })
    }
}

struct MemoryStorageIterator {
    entries: Vec<(B256, Vec<u8>)>,
    // next() 前は -1 相当。最初の next() で 0 番目に乗る。
    cursor: Option<usize>,
}

impl StorageIterator for MemoryStorageIterator {
    fn next(&mut self) -> bool {
        let next = match self.cursor {
            None => 0,
            Some(at) => at + 1,
        };
        if next >= self.entries.len() {
            return false;
        }
        self.cursor = Some(next);
        true
    }

    fn hash(&self) -> B256 {
        self.cursor
            .and_then(|at| self.entries.get(at))
            .map(|(hash, _)| *hash)
            .unwrap_or_default()
    }

    fn slot(&self) -> Vec<u8> {
        self.cursor
            .and_then(|at| self.entries.get(at))
            .map(|(_, raw)| raw.clone())
            .unwrap_or_default()
    }

    fn error(&self) -> Option<SnapshotError> {
        None
    }

    fn release(&mut self) {
        self.entries.clear();
        self.cursor = None;
    }
}

impl SnapshotTree for MemorySnapshotTree {
    fn snapshot(&self, root: B256) -> Option<Box<dyn SnapshotReader>> {
        let inner = self.lock();
        inner.chain(root)?;
        Some(Box::new(MemorySnapshot {
            inner: self.inner.clone(),
            root,
        }))
    }

    fn storage_iterator(
        &self,
        root: B256,
        account_hash: B256,
        seek: B256,
    ) -> Result<Box<dyn StorageIterator>, SnapshotError> {
        let merged = self.lock().flatten_storage(root, account_hash)?;
        let entries = merged
            .into_iter()
            .filter(|(hash, _)| *hash >= seek)
            .collect();
        Ok(Box::new(MemoryStorageIterator {
            entries,
            cursor: None,
        }))
    }

    fn update(
        &self,
        root: B256,
        parent: B256,
        destructs: BTreeSet<B256>,
        accounts: BTreeMap<B256, Vec<u8>>,
        storages: BTreeMap<B256, BTreeMap<B256, Vec<u8>>>,
    ) -> Result<(), SnapshotError> {
        let mut inner = self.lock();
        if parent != inner.base_root && !inner.layers.contains_key(&parent) {
            return Err(SnapshotError::UnknownRoot(parent));
        }
        inner.layers.insert(
            root,
            SnapLayer {
                parent,
                destructed: destructs,
                accounts,
                storages,
            },
        );
        Ok(())
    }

    fn cap(&self, root: B256, layers: usize) -> Result<(), SnapshotError> {
        let mut inner = self.lock();
        let chain = inner
            .chain(root)
            .ok_or(SnapshotError::UnknownRoot(root))?;
        if chain.len() <= layers {
            return Ok(());
        }
        // 下端から base へ畳む。chain は新しい順なので末尾側が古い。
        let excess: Vec<B256> = chain[layers..].iter().rev().copied().collect();
        for layer_root in excess {
            let Some(layer) = inner.layers.remove(&layer_root) else {
                continue;
            };
            for account_hash in &layer.destructed {
                inner.base_accounts.remove(account_hash);
                inner.base_storages.remove(account_hash);
            }
            for (account_hash, raw) in layer.accounts {
                inner.base_accounts.insert(account_hash, raw);
            }
            for (account_hash, slots) in layer.storages {
                let merged = inner.base_storages.entry(account_hash).or_default();
                for (slot_hash, raw) in slots {
                    if raw.is_empty() {
                        merged.remove(&slot_hash);
                    } else {
                        merged.insert(slot_hash, raw);
                    }
                }
            }
            inner.base_root = layer_root;
        }
        Ok(())
    }
}
