//! どこで: block 実行の state cache / 何を: live object・journal・finalise→root→commit の段取り / なぜ: trie 書き込みを境界に集約し revert を保証するため

use crate::access_list::AccessList;
use crate::deletion;
use crate::hooks::{BalanceChangeReason, StateHooks};
use crate::journal::{Journal, JournalEntry, RIPEMD_ADDRESS};
use crate::object::StateObject;
use crate::prefetch::{TrieKey, TriePrefetcher};
use crate::transient::TransientStorage;
use alloy_primitives::{keccak256, Address, Bytes, B256, I256, U256};
use alloy_trie::{EMPTY_ROOT_HASH, KECCAK_EMPTY};
use evm_triedb::{
    decode_slim_account, decode_trimmed_slot, hash_address, hash_slot, slim_account_rlp, Database,
    MergedNodeSet, SnapshotError, SnapshotReader, SnapshotTree, StateAccount, StateSet, Trie,
    TrieError, TrieScheme, WriteBatch,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// メモリに保持する snapshot diff layer の枚数。
pub const DEFAULT_TRIES_IN_MEMORY: usize = 128;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum StateError {
    /// 読み取り失敗の memo。最初の1件のみ保持され commit で表面化する。
    Database(String),
    Trie(TrieError),
    Snapshot(SnapshotError),
    SnapshotRootMismatch {
        expected: B256,
        got: B256,
    },
    TxFiltered,
    StorageOverride,
    AlreadyCommitted,
}

impl From<TrieError> for StateError {
    fn from(err: TrieError) -> Self {
        StateError::Trie(err)
    }
}

impl From<SnapshotError> for StateError {
    fn from(err: SnapshotError) -> Self {
        StateError::Snapshot(err)
    }
}

/// EVM が吐いた log と、その tx / block 文脈。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LogRecord {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub tx_hash: B256,
    pub tx_index: usize,
    pub index: u64,
    pub block_number: u64,
    pub block_hash: B256,
}

/// access list 構築に効く fork gate。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ForkRules {
    pub is_berlin: bool,
    pub is_shanghai: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum MutationKind {
    Update,
    Deletion,
}

/// block 内で account に最終的に起きたこと。applied は trie へ flush 済みの印。
#[derive(Clone, Copy, Debug)]
struct Mutation {
    kind: MutationKind,
    applied: bool,
}

impl Mutation {
    fn is_delete(&self) -> bool {
        self.kind == MutationKind::Deletion
    }
}

#[derive(Clone, Copy, Debug)]
struct Revision {
    id: usize,
    journal_index: usize,
    unexpected_balance_delta: I256,
}

/// chain 固有の拡張 payload。balance 集計・commit 拒否 sentinel・拡張 artifact。
#[derive(Clone, Debug, Default)]
struct ChainExtra {
    unexpected_balance_delta: I256,
    tx_filter: bool,
    artifacts: BTreeMap<B256, Vec<u8>>,
}

/// block 1つ分の作業 state。
/// commit 後の instance は死んでいて、新しい root で作り直す必要がある。
pub struct StateDb<D: Database> {
    db: D,
    prefetcher: Option<TriePrefetcher<D>>,
    trie: D::Tr,
    snaps: Option<Arc<dyn SnapshotTree>>,
    snap: Option<Box<dyn SnapshotReader>>,

    /// 遷移前 root。commit 成功で新 root に置き換わる。
    original_root: B256,

    // block 内で mutate された account / slot の cache。commit で空になる。
    accounts: BTreeMap<B256, Vec<u8>>,
    storages: BTreeMap<B256, BTreeMap<B256, Vec<u8>>>,
    accounts_origin: BTreeMap<Address, Option<Vec<u8>>>,
    storages_origin: BTreeMap<Address, BTreeMap<B256, Vec<u8>>>,

    pub(crate) state_objects: BTreeMap<Address, StateObject<D>>,
    /// destruct 済み account → 遷移前の姿 (None は元々存在しなかった)。
    state_objects_destruct: BTreeMap<Address, Option<StateAccount>>,
    mutations: BTreeMap<Address, Mutation>,

    db_err: Option<StateError>,

    pub(crate) refund: u64,

    thash: B256,
    tx_index: usize,
    pub(crate) logs: BTreeMap<B256, Vec<LogRecord>>,
    pub(crate) log_size: u64,

    pub(crate) preimages: BTreeMap<B256, Vec<u8>>,

    pub(crate) access_list: AccessList,
    pub(crate) transient_storage: TransientStorage,

    journal: Journal,
    valid_revisions: Vec<Revision>,
    next_revision_id: usize,

    hooks: Option<Arc<dyn StateHooks>>,
    extra: ChainExtra,

    /// 走査順は BTreeMap により常に address 昇順。flag は呼び出し側の
    /// 前提 (同一 mutation 集合 → 同一 root) の表明として残している。
    deterministic: bool,
    /// set_storage を使った instance は commit 不可。
    storage_override: bool,
    committed: bool,

    account_updated: usize,
    account_deleted: usize,
    storage_updated: usize,
    storage_deleted: usize,
}

impl<D: Database> StateDb<D> {
    pub fn new(
        root: B256,
        db: D,
        snaps: Option<Arc<dyn SnapshotTree>>,
    ) -> Result<Self, StateError> {
        let trie = db.open_trie(root).map_err(StateError::Trie)?;
        let snap = snaps.as_ref().and_then(|tree| tree.snapshot(root));
        Ok(Self {
            db,
            prefetcher: None,
            trie,
            snaps,
            snap,
            original_root: root,
            accounts: BTreeMap::new(),
            storages: BTreeMap::new(),
            accounts_origin: BTreeMap::new(),
            storages_origin: BTreeMap::new(),
            state_objects: BTreeMap::new(),
            state_objects_destruct: BTreeMap::new(),
            mutations: BTreeMap::new(),
            db_err: None,
            refund: 0,
            thash: B256::ZERO,
            tx_index: 0,
            logs: BTreeMap::new(),
            log_size: 0,
            preimages: BTreeMap::new(),
            access_list: AccessList::new(),
            transient_storage: TransientStorage::new(),
            journal: Journal::new(),
            valid_revisions: Vec::new(),
            next_revision_id: 0,
            hooks: None,
            extra: ChainExtra::default(),
            deterministic: false,
            storage_override: false,
            committed: false,
            account_updated: 0,
            account_deleted: 0,
            storage_updated: 0,
            storage_deleted: 0,
        })
    }

    pub fn set_hooks(&mut self, hooks: Arc<dyn StateHooks>) {
        self.hooks = Some(hooks);
    }

    pub fn set_deterministic(&mut self, deterministic: bool) {
        self.deterministic = deterministic;
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    pub fn get_trie(&self) -> &D::Tr {
        &self.trie
    }

    pub fn original_root(&self) -> B256 {
        self.original_root
    }

    pub fn error(&self) -> Option<&StateError> {
        self.db_err.as_ref()
    }

    fn set_error(&mut self, err: StateError) {
        if self.db_err.is_none() {
            self.db_err = Some(err);
        }
    }

    // ---- chain 拡張 payload ----

    pub fn filter_tx(&mut self) {
        self.extra.tx_filter = true;
    }

    pub fn clear_tx_filter(&mut self) {
        self.extra.tx_filter = false;
    }

    pub fn is_tx_filtered(&self) -> bool {
        self.extra.tx_filter
    }

    pub fn unexpected_balance_delta(&self) -> I256 {
        self.extra.unexpected_balance_delta
    }

    /// 予告された burn を delta に計上する。負の量は呼び出し側の誤り。
    pub fn expect_balance_burn(&mut self, amount: I256) {
        if amount.is_negative() {
            panic!("expect_balance_burn called with negative amount {amount}");
        }
        self.extra.unexpected_balance_delta += amount;
    }

    /// commit 時に拡張 batch へ書く opaque artifact を積む。
    pub fn stage_artifact(&mut self, hash: B256, blob: Vec<u8>) {
        self.extra.artifacts.insert(hash, blob);
    }

    // ---- prefetcher ----

    pub fn start_prefetcher(&mut self, namespace: &str) {
        if let Some(prefetcher) = self.prefetcher.take() {
            prefetcher.close();
        }
        if self.snap.is_some() {
            self.prefetcher = Some(TriePrefetcher::new(
                self.db.clone(),
                self.original_root,
                namespace,
            ));
        }
    }

    pub fn stop_prefetcher(&mut self) {
        if let Some(prefetcher) = self.prefetcher.take() {
            prefetcher.close();
        }
    }

    // ---- log / preimage / refund ----

    pub fn add_log(&mut self, mut log: LogRecord) {
        self.journal.append(JournalEntry::AddLog {
            tx_hash: self.thash,
        });
        log.tx_hash = self.thash;
        log.tx_index = self.tx_index;
        log.index = self.log_size;
        if let Some(hooks) = &self.hooks {
            hooks.on_log(&log);
        }
        self.logs.entry(self.thash).or_default().push(log);
        self.log_size += 1;
    }

    /// tx_hash の log 列を block 文脈で注釈して返す。
    pub fn get_logs(&mut self, tx_hash: B256, block_number: u64, block_hash: B256) -> Vec<LogRecord> {
        if let Some(entries) = self.logs.get_mut(&tx_hash) {
            for log in entries.iter_mut() {
                log.block_number = block_number;
                log.block_hash = block_hash;
            }
            return entries.clone();
        }
        Vec::new()
    }

    pub fn logs(&self) -> Vec<LogRecord> {
        self.logs.values().flatten().cloned().collect()
    }

    pub fn add_preimage(&mut self, hash: B256, preimage: &[u8]) {
        if !self.preimages.contains_key(&hash) {
            self.journal.append(JournalEntry::AddPreimage { hash });
            self.preimages.insert(hash, preimage.to_vec());
        }
    }

    pub fn preimages(&self) -> &BTreeMap<B256, Vec<u8>> {
        &self.preimages
    }

    pub fn add_refund(&mut self, gas: u64) {
        self.journal.append(JournalEntry::RefundChange { prev: self.refund });
        self.refund += gas;
    }

    /// refund の減算。counter が負になるのは呼び出し側の誤りで、即座に落とす。
    pub fn sub_refund(&mut self, gas: u64) {
        self.journal.append(JournalEntry::RefundChange { prev: self.refund });
        if gas > self.refund {
            panic!("refund counter below zero (gas: {gas} > refund: {})", self.refund);
        }
        self.refund -= gas;
    }

    pub fn get_refund(&self) -> u64 {
        self.refund
    }

    // ---- 読み取り面 ----

    pub fn exist(&mut self, address: Address) -> bool {
        self.ensure_state_object(address)
    }

    pub fn empty(&mut self, address: Address) -> bool {
        if !self.ensure_state_object(address) {
            return true;
        }
        self.state_objects
            .get(&address)
            .map(|obj| obj.empty())
            .unwrap_or(true)
    }

    pub fn get_balance(&mut self, address: Address) -> U256 {
        if !self.ensure_state_object(address) {
            return U256::ZERO;
        }
        self.state_objects
            .get(&address)
            .map(|obj| obj.balance())
            .unwrap_or(U256::ZERO)
    }

    pub fn get_nonce(&mut self, address: Address) -> u64 {
        if !self.ensure_state_object(address) {
            return 0;
        }
        self.state_objects
            .get(&address)
            .map(|obj| obj.nonce())
            .unwrap_or(0)
    }

    pub fn get_storage_root(&mut self, address: Address) -> B256 {
        if !self.ensure_state_object(address) {
            return B256::ZERO;
        }
        self.state_objects
            .get(&address)
            .map(|obj| obj.storage_root())
            .unwrap_or(B256::ZERO)
    }

    pub fn get_code_hash(&mut self, address: Address) -> B256 {
        if !self.ensure_state_object(address) {
            return B256::ZERO;
        }
        self.state_objects
            .get(&address)
            .map(|obj| obj.code_hash())
            .unwrap_or(B256::ZERO)
    }

    pub fn get_code(&mut self, address: Address) -> Bytes {
        if !self.ensure_state_object(address) {
            return Bytes::new();
        }
        self.resolve_code(address)
    }

    pub fn get_code_size(&mut self, address: Address) -> usize {
        if !self.ensure_state_object(address) {
            return 0;
        }
        let (code_hash, cached_len) = match self.state_objects.get(&address) {
            Some(obj) => (obj.code_hash(), obj.code_cached().map(|c| c.len())),
            None => return 0,
        };
        if let Some(len) = cached_len {
            return len;
        }
        if code_hash == KECCAK_EMPTY {
            return 0;
        }
        match self.db.contract_code_size(address, code_hash) {
            Ok(size) => size,
            Err(err) => {
                self.set_error(StateError::Database(format!(
                    "code size read failed addr={} err={err:?}",
                    hex::encode(address)
                )));
                0
            }
        }
    }

    pub fn get_state(&mut self, address: Address, key: B256) -> U256 {
        if !self.ensure_state_object(address) {
            return U256::ZERO;
        }
        if let Some(value) = self
            .state_objects
            .get(&address)
            .and_then(|obj| obj.dirty_slot(key))
        {
            return value;
        }
        self.get_committed_state(address, key)
    }

    /// tx 開始時点 (同一 block の先行 tx を含む) の slot 値。
    /// live cache → destruct bypass → snapshot → storage trie の順で引く。
    pub fn get_committed_state(&mut self, address: Address, key: B256) -> U256 {
        if !self.ensure_state_object(address) {
            return U256::ZERO;
        }
        let addr_hash = match self.state_objects.get(&address) {
            Some(obj) => {
                if let Some(value) = obj.cached_committed_slot(key) {
                    return value;
                }
                obj.addr_hash()
            }
            None => return U256::ZERO,
        };
        // この block 内で destruct 済みなら旧 incarnation の disk は見ない
        if self.state_objects_destruct.contains_key(&address) {
            return U256::ZERO;
        }
        let mut value: Option<U256> = None;
        let snap_result = self
            .snap
            .as_ref()
            .map(|snap| snap.storage(addr_hash, hash_slot(key)));
        match snap_result {
            Some(Ok(Some(raw))) => match decode_trimmed_slot(&raw) {
                Some(decoded) => value = Some(decoded),
                None => self.set_error(StateError::Database(format!(
                    "snapshot slot decode failed addr={} key={key}",
                    hex::encode(address)
                ))),
            },
            Some(Ok(None)) => value = Some(U256::ZERO),
            Some(Err(_)) | None => {}
        }
        let value = match value {
            Some(value) => value,
            None => self.read_storage_from_trie(address, key),
        };
        if let Some(obj) = self.state_objects.get_mut(&address) {
            obj.cache_committed_slot(key, value);
        }
        value
    }

    pub fn has_self_destructed(&mut self, address: Address) -> bool {
        if !self.ensure_state_object(address) {
            return false;
        }
        self.state_objects
            .get(&address)
            .map(|obj| obj.self_destructed)
            .unwrap_or(false)
    }

    /// destruct set の記録。外側 None は未登録、内側 None は「遷移前に存在せず」。
    pub fn destruct_record(&self, address: Address) -> Option<Option<StateAccount>> {
        self.state_objects_destruct.get(&address).copied()
    }

    pub fn journal_length(&self) -> usize {
        self.journal.length()
    }

    fn read_storage_from_trie(&mut self, address: Address, key: B256) -> U256 {
        let (has_trie, root) = match self.state_objects.get(&address) {
            Some(obj) => (obj.trie.is_some(), obj.storage_root()),
            None => return U256::ZERO,
        };
        if !has_trie {
            match self
                .db
                .open_storage_trie(self.original_root, address, root, Some(&self.trie))
            {
                Ok(trie) => {
                    if let Some(obj) = self.state_objects.get_mut(&address) {
                        obj.trie = Some(trie);
                    }
                }
                Err(err) => {
                    self.set_error(StateError::Database(format!(
                        "storage trie open failed addr={} err={err:?}",
                        hex::encode(address)
                    )));
                    return U256::ZERO;
                }
            }
        }
        let result = match self.state_objects.get(&address).and_then(|o| o.trie.as_ref()) {
            Some(trie) => trie.get_storage(address, key),
            None => return U256::ZERO,
        };
        match result {
            Ok(value) => value,
            Err(err) => {
                self.set_error(StateError::Database(format!(
                    "storage read failed addr={} err={err:?}",
                    hex::encode(address)
                )));
                U256::ZERO
            }
        }
    }

    fn resolve_code(&mut self, address: Address) -> Bytes {
        let (code_hash, cached) = match self.state_objects.get(&address) {
            Some(obj) => (obj.code_hash(), obj.code_cached().cloned()),
            None => return Bytes::new(),
        };
        if let Some(code) = cached {
            return code;
        }
        if code_hash == KECCAK_EMPTY {
            return Bytes::new();
        }
        match self.db.contract_code(address, code_hash) {
            Ok(code) => {
                if let Some(obj) = self.state_objects.get_mut(&address) {
                    obj.cache_code(code.clone());
                }
                code
            }
            Err(err) => {
                self.set_error(StateError::Database(format!(
                    "code read failed addr={} err={err:?}",
                    hex::encode(address)
                )));
                Bytes::new()
            }
        }
    }

    // ---- live object の解決 ----

    /// 3層読み。live → destruct 判定 → snapshot → account trie。
    /// 読めたら live cache へ載せ、true を返す。
    fn ensure_state_object(&mut self, address: Address) -> bool {
        if self.state_objects.contains_key(&address) {
            return true;
        }
        if self.state_objects_destruct.contains_key(&address) {
            return false;
        }
        let mut data: Option<StateAccount> = None;
        let snap_result = self
            .snap
            .as_ref()
            .map(|snap| snap.account(hash_address(address)));
        match snap_result {
            Some(Ok(Some(raw))) => match decode_slim_account(&raw) {
                Some(account) => data = Some(account),
                None => {
                    self.set_error(StateError::Database(format!(
                        "slim account decode failed addr={}",
                        hex::encode(address)
                    )));
                    return false;
                }
            },
            Some(Ok(None)) => return false,
            Some(Err(_)) | None => {}
        }
        if data.is_none() {
            match self.trie.get_account(address) {
                Ok(Some(account)) => data = Some(account),
                Ok(None) => return false,
                Err(err) => {
                    self.set_error(StateError::Database(format!(
                        "account read failed addr={} err={err:?}",
                        hex::encode(address)
                    )));
                    return false;
                }
            }
        }
        self.state_objects
            .insert(address, StateObject::new(address, data));
        true
    }

    fn ensure_or_create(&mut self, address: Address) {
        if !self.ensure_state_object(address) {
            self.create_object(address);
        }
    }

    /// 空の object を無条件に据える。既存は黙って潰れるため、
    /// 新規 account に対してのみ呼ぶのは呼び出し側の責任。
    fn create_object(&mut self, address: Address) {
        self.journal.append(JournalEntry::CreateObject { address });
        self.state_objects
            .insert(address, StateObject::new(address, None));
    }

    pub fn create_account(&mut self, address: Address) {
        self.create_object(address);
    }

    /// zombie として空 object を据える。zombie 印だけが付いた空 account は
    /// finalise の empty 削除を免れる。
    pub fn create_zombie(&mut self, address: Address) {
        self.journal.append(JournalEntry::CreateZombie { address });
        self.state_objects
            .insert(address, StateObject::new(address, None));
    }

    /// contract 生成の印。EIP-6780 の同一 tx 内 selfdestruct 判定に使う。
    pub fn create_contract(&mut self, address: Address) {
        self.ensure_or_create(address);
        if let Some(obj) = self.state_objects.get_mut(&address) {
            if !obj.new_contract {
                obj.new_contract = true;
                self.journal.append(JournalEntry::CreateContract { address });
            }
        }
    }

    // ---- 書き込み面 ----

    pub fn add_balance(&mut self, address: Address, amount: U256, reason: BalanceChangeReason) {
        self.ensure_or_create(address);
        let Some(obj) = self.state_objects.get_mut(&address) else {
            return;
        };
        if amount.is_zero() {
            if obj.empty() {
                self.journal.append(JournalEntry::Touch { address });
                if address == RIPEMD_ADDRESS {
                    self.journal.dirty(address);
                }
            }
            return;
        }
        let prev = obj.balance();
        let new = prev.wrapping_add(amount);
        self.journal
            .append(JournalEntry::BalanceChange { address, prev });
        obj.set_balance_raw(new);
        self.extra.unexpected_balance_delta +=
            I256::try_from(amount).expect("balance delta fits in I256");
        if let Some(hooks) = &self.hooks {
            hooks.on_balance_change(address, prev, new, reason);
        }
    }

    pub fn sub_balance(&mut self, address: Address, amount: U256, reason: BalanceChangeReason) {
        self.ensure_or_create(address);
        let Some(obj) = self.state_objects.get_mut(&address) else {
            return;
        };
        if amount.is_zero() {
            return;
        }
        let prev = obj.balance();
        let new = prev.wrapping_sub(amount);
        self.journal
            .append(JournalEntry::BalanceChange { address, prev });
        obj.set_balance_raw(new);
        self.extra.unexpected_balance_delta -=
            I256::try_from(amount).expect("balance delta fits in I256");
        if let Some(hooks) = &self.hooks {
            hooks.on_balance_change(address, prev, new, reason);
        }
    }

    pub fn set_balance(&mut self, address: Address, balance: U256, reason: BalanceChangeReason) {
        self.ensure_or_create(address);
        let Some(obj) = self.state_objects.get_mut(&address) else {
            return;
        };
        let prev = obj.balance();
        self.journal
            .append(JournalEntry::BalanceChange { address, prev });
        obj.set_balance_raw(balance);
        self.extra.unexpected_balance_delta +=
            I256::try_from(balance).expect("balance delta fits in I256");
        self.extra.unexpected_balance_delta -=
            I256::try_from(prev).expect("balance delta fits in I256");
        if let Some(hooks) = &self.hooks {
            hooks.on_balance_change(address, prev, balance, reason);
        }
    }

    pub fn set_nonce(&mut self, address: Address, nonce: u64) {
        self.ensure_or_create(address);
        let Some(obj) = self.state_objects.get_mut(&address) else {
            return;
        };
        let prev = obj.nonce();
        self.journal
            .append(JournalEntry::NonceChange { address, prev });
        obj.set_nonce_raw(nonce);
    }

    pub fn set_code(&mut self, address: Address, code: Bytes) {
        self.ensure_or_create(address);
        let prev_code = self.resolve_code(address);
        let Some(obj) = self.state_objects.get_mut(&address) else {
            return;
        };
        let prev_code_hash = obj.code_hash();
        self.journal.append(JournalEntry::CodeChange {
            address,
            prev_code_hash,
            prev_code,
        });
        obj.set_code(keccak256(&code), code);
    }

    pub fn set_state(&mut self, address: Address, key: B256, value: U256) {
        self.ensure_or_create(address);
        let prev = self.get_state(address, key);
        if prev == value {
            return;
        }
        let Some(obj) = self.state_objects.get_mut(&address) else {
            return;
        };
        self.journal
            .append(JournalEntry::StorageChange { address, key, prev });
        obj.set_state_raw(key, value);
    }

    /// storage 全置換。debug 専用。
    /// 旧 incarnation を destruct 扱いにして disk 読みを遮断したうえで
    /// 新しい slot を書く。この経路を使った instance は commit を拒否する。
    pub fn set_storage(&mut self, address: Address, storage: BTreeMap<B256, U256>) {
        if self.committed {
            panic!("set_storage on a committed state");
        }
        self.storage_override = true;
        self.state_objects_destruct.entry(address).or_insert(None);
        self.ensure_or_create(address);
        for (key, value) in storage {
            self.set_state(address, key, value);
        }
    }

    /// account を selfdestruct 印にして balance を燃やす。
    /// object 自体は commit まで live に残る。
    pub fn self_destruct(&mut self, address: Address) {
        if !self.ensure_state_object(address) {
            return;
        }
        let Some(obj) = self.state_objects.get_mut(&address) else {
            return;
        };
        let prev_balance = obj.balance();
        self.journal.append(JournalEntry::SelfDestruct {
            address,
            prev_destructed: obj.self_destructed,
            prev_balance,
        });
        if !prev_balance.is_zero() {
            if let Some(hooks) = &self.hooks {
                hooks.on_balance_change(
                    address,
                    prev_balance,
                    U256::ZERO,
                    BalanceChangeReason::SelfDestruct,
                );
            }
        }
        obj.mark_self_destructed();
        obj.set_balance_raw(U256::ZERO);
        self.extra.unexpected_balance_delta -=
            I256::try_from(prev_balance).expect("balance delta fits in I256");
    }

    /// EIP-6780。同一 tx 内で生成された contract のみ破壊できる。
    pub fn self_destruct_6780(&mut self, address: Address) {
        if !self.ensure_state_object(address) {
            return;
        }
        let gated = self
            .state_objects
            .get(&address)
            .map(|obj| obj.new_contract)
            .unwrap_or(false);
        if gated {
            self.self_destruct(address);
        }
    }

    // ---- transient storage ----

    pub fn set_transient_state(&mut self, address: Address, key: B256, value: U256) {
        let prev = self.transient_storage.get(address, key);
        if prev == value {
            return;
        }
        self.journal
            .append(JournalEntry::TransientStorageChange { address, key, prev });
        self.transient_storage.set(address, key, value);
    }

    pub fn get_transient_state(&self, address: Address, key: B256) -> U256 {
        self.transient_storage.get(address, key)
    }

    // ---- access list / tx 文脈 ----

    /// tx 実行前の準備。Berlin 以降は warm set を組み直し、
    /// transient storage を必ず空にする。
    pub fn prepare(
        &mut self,
        rules: ForkRules,
        sender: Address,
        coinbase: Address,
        dst: Option<Address>,
        precompiles: &[Address],
        list: &[(Address, Vec<B256>)],
    ) {
        if rules.is_berlin {
            let mut access_list = AccessList::new();
            access_list.add_address(sender);
            if let Some(dst) = dst {
                access_list.add_address(dst);
            }
            for address in precompiles {
                access_list.add_address(*address);
            }
            for (address, keys) in list {
                access_list.add_address(*address);
                for key in keys {
                    access_list.add_slot(*address, *key);
                }
            }
            if rules.is_shanghai {
                access_list.add_address(coinbase);
            }
            self.access_list = access_list;
        }
        self.transient_storage = TransientStorage::new();
    }

    pub fn add_address_to_access_list(&mut self, address: Address) {
        if self.access_list.add_address(address) {
            self.journal
                .append(JournalEntry::AccessListAddAccount { address });
        }
    }

    pub fn add_slot_to_access_list(&mut self, address: Address, slot: B256) {
        let (addr_added, slot_added) = self.access_list.add_slot(address, slot);
        if addr_added {
            self.journal
                .append(JournalEntry::AccessListAddAccount { address });
        }
        if slot_added {
            self.journal
                .append(JournalEntry::AccessListAddSlot { address, slot });
        }
    }

    pub fn address_in_access_list(&self, address: Address) -> bool {
        self.access_list.contains_address(address)
    }

    pub fn slot_in_access_list(&self, address: Address, slot: B256) -> (bool, bool) {
        self.access_list.contains(address, slot)
    }

    pub fn set_tx_context(&mut self, tx_hash: B256, tx_index: usize) {
        self.thash = tx_hash;
        self.tx_index = tx_index;
    }

    pub fn tx_index(&self) -> usize {
        self.tx_index
    }

    // ---- snapshot / revert ----

    pub fn snapshot(&mut self) -> usize {
        let id = self.next_revision_id;
        self.next_revision_id += 1;
        self.valid_revisions.push(Revision {
            id,
            journal_index: self.journal.length(),
            unexpected_balance_delta: self.extra.unexpected_balance_delta,
        });
        id
    }

    /// 未知の revision id は呼び出し側の誤りで、即座に落とす。
    pub fn revert_to_snapshot(&mut self, id: usize) {
        let idx = self.valid_revisions.partition_point(|r| r.id < id);
        if idx == self.valid_revisions.len() || self.valid_revisions[idx].id != id {
            panic!("revision id {id} cannot be reverted");
        }
        let revision = self.valid_revisions[idx];
        self.extra.unexpected_balance_delta = revision.unexpected_balance_delta;

        let mut journal = std::mem::take(&mut self.journal);
        journal.revert(self, revision.journal_index);
        self.journal = journal;
        self.valid_revisions.truncate(idx);
    }

    // ---- finalise / intermediate root / commit ----

    /// tx 境界。dirty な object を mutation index と destruct set に畳み、
    /// journal と refund を消す。trie にはまだ何も書かない。
    pub fn finalise(&mut self, delete_empty_objects: bool) {
        enum Disposition {
            Skip,
            Delete {
                addr_hash: B256,
                origin: Option<StateAccount>,
                balance: U256,
                destructed: bool,
            },
            Update {
                addr_hash: B256,
                storage_root: B256,
                slots: Vec<TrieKey>,
            },
        }

        let mut addresses_to_prefetch: Vec<TrieKey> = Vec::new();
        for (address, dirty_count) in self.journal.dirty_addresses() {
            let is_zombie = self.journal.is_zombie_address(address, dirty_count);
            let disposition = match self.state_objects.get_mut(&address) {
                // journal にだけ残った touch 跡。live に実体が無ければ何もしない
                None => Disposition::Skip,
                Some(obj) => {
                    if obj.self_destructed || (delete_empty_objects && obj.empty() && !is_zombie) {
                        Disposition::Delete {
                            addr_hash: obj.addr_hash(),
                            origin: obj.origin,
                            balance: obj.balance(),
                            destructed: obj.self_destructed,
                        }
                    } else {
                        let slots = obj.finalise();
                        Disposition::Update {
                            addr_hash: obj.addr_hash(),
                            storage_root: obj.storage_root(),
                            slots,
                        }
                    }
                }
            };
            match disposition {
                Disposition::Skip => continue,
                Disposition::Delete {
                    addr_hash,
                    origin,
                    balance,
                    destructed,
                } => {
                    self.state_objects.remove(&address);
                    self.mark_delete(address);
                    // selfdestruct 後に届いた ether は burn される
                    if destructed && !balance.is_zero() {
                        if let Some(hooks) = &self.hooks {
                            hooks.on_balance_change(
                                address,
                                balance,
                                U256::ZERO,
                                BalanceChangeReason::SelfDestructBurn,
                            );
                        }
                    }
                    // 最初の destruct の origin だけが意味を持つ
                    self.state_objects_destruct.entry(address).or_insert(origin);
                    // 同一 block 内で resurrect され得るため、snapshotter が
                    // delete → recreate の両方を見られるよう cache を払う
                    self.accounts.remove(&addr_hash);
                    self.storages.remove(&addr_hash);
                    self.accounts_origin.remove(&address);
                    self.storages_origin.remove(&address);
                }
                Disposition::Update {
                    addr_hash,
                    storage_root,
                    slots,
                } => {
                    self.mark_update(address);
                    if !slots.is_empty() && storage_root != EMPTY_ROOT_HASH {
                        if let Some(prefetcher) = &self.prefetcher {
                            prefetcher.prefetch(addr_hash, storage_root, address, slots);
                        }
                    }
                }
            }
            addresses_to_prefetch.push(TrieKey::Account(address));
        }
        if !addresses_to_prefetch.is_empty() {
            if let Some(prefetcher) = &self.prefetcher {
                prefetcher.prefetch(
                    B256::ZERO,
                    self.original_root,
                    Address::ZERO,
                    addresses_to_prefetch,
                );
            }
        }
        self.clear_journal_and_refund();
    }

    fn clear_journal_and_refund(&mut self) {
        if self.journal.length() > 0 {
            self.journal = Journal::new();
            self.refund = 0;
        }
        // journal entry の無い snapshot も無効化する
        self.valid_revisions.clear();
    }

    fn mark_update(&mut self, address: Address) {
        let mutation = self.mutations.entry(address).or_insert(Mutation {
            kind: MutationKind::Update,
            applied: false,
        });
        mutation.kind = MutationKind::Update;
        mutation.applied = false;
    }

    fn mark_delete(&mut self, address: Address) {
        let mutation = self.mutations.entry(address).or_insert(Mutation {
            kind: MutationKind::Deletion,
            applied: false,
        });
        mutation.kind = MutationKind::Deletion;
        mutation.applied = false;
    }

    /// tx 間の中間 root。storage を先に flush してから account trie へ
    /// update → deletion の順で書き、root を返す。
    pub fn intermediate_root(&mut self, delete_empty_objects: bool) -> B256 {
        self.finalise(delete_empty_objects);

        // trie を触り始めたら prefetcher は壊れるので、この round で使い切る
        let prefetcher = self.prefetcher.take();

        // account trie より先に storage を flush する
        let pending: Vec<Address> = self
            .mutations
            .iter()
            .filter(|(_, m)| !m.applied && !m.is_delete())
            .map(|(address, _)| *address)
            .collect();
        let mut first_err: Option<StateError> = None;
        for address in pending {
            let Some(obj) = self.state_objects.get_mut(&address) else {
                continue;
            };
            match obj.update_root(
                &self.db,
                self.original_root,
                Some(&self.trie),
                prefetcher.as_ref(),
                &mut self.storages,
                &mut self.storages_origin,
            ) {
                Ok((updated, deleted)) => {
                    self.storage_updated += updated;
                    self.storage_deleted += deleted;
                }
                Err(err) => {
                    if first_err.is_none() {
                        first_err = Some(StateError::Trie(err));
                    }
                }
            }
        }
        if let Some(err) = first_err {
            self.set_error(err);
        }

        // prefetcher が同じ root の account trie を温めていれば差し替える
        if let Some(prefetcher) = &prefetcher {
            if let Some(trie) = prefetcher.trie(B256::ZERO, self.original_root) {
                self.trie = trie;
            }
        }

        // update を先、deletion を後に適用する。先に消すと共有親の
        // full-node が short-node へ縮み、隣の subtree の disk 解決を強いる。
        let pending: Vec<(Address, bool)> = self
            .mutations
            .iter()
            .filter(|(_, m)| !m.applied)
            .map(|(address, m)| (*address, m.is_delete()))
            .collect();
        for (address, _) in &pending {
            if let Some(mutation) = self.mutations.get_mut(address) {
                mutation.applied = true;
            }
        }
        let mut deleted_addresses: Vec<Address> = Vec::new();
        let mut used = 0usize;
        for (address, is_delete) in pending {
            if is_delete {
                deleted_addresses.push(address);
            } else {
                self.update_state_object(address);
                self.account_updated += 1;
            }
            used += 1;
        }
        for address in deleted_addresses {
            if let Err(err) = self.trie.delete_account(address) {
                self.set_error(StateError::Database(format!(
                    "delete account failed addr={} err={err:?}",
                    hex::encode(address)
                )));
            }
            self.account_deleted += 1;
        }
        if let Some(prefetcher) = &prefetcher {
            prefetcher.used(B256::ZERO, self.original_root, used);
        }
        if let Some(prefetcher) = prefetcher {
            prefetcher.close();
        }
        self.trie.hash()
    }

    fn update_state_object(&mut self, address: Address) {
        let Some(obj) = self.state_objects.get(&address) else {
            return;
        };
        let data = obj.data;
        let origin = obj.origin;
        let addr_hash = obj.addr_hash();
        let dirty_code = obj.dirty_code;
        let code = obj.code_cached().cloned();

        if let Err(err) = self.trie.update_account(address, &data) {
            self.set_error(StateError::Database(format!(
                "update account failed addr={} err={err:?}",
                hex::encode(address)
            )));
        }
        if dirty_code {
            if let Some(code) = code {
                if let Err(err) = self.trie.update_contract_code(address, data.code_hash, &code) {
                    self.set_error(StateError::Database(format!(
                        "update code failed addr={} err={err:?}",
                        hex::encode(address)
                    )));
                }
            }
        }
        self.accounts.insert(addr_hash, slim_account_rlp(&data));
        // origin は block 内の最初の記録だけを残す
        self.accounts_origin
            .entry(address)
            .or_insert_with(|| origin.as_ref().map(slim_account_rlp));
    }

    /// destruct set の後始末。旧 incarnation の storage を消し、
    /// reverse diff 向けの原像を積む。4通り:
    /// 存在せず destruct / 存在せず destruct 後 resurrect /
    /// 存在して destruct / 存在して destruct 後 resurrect。
    fn handle_destruction(&mut self, nodes: &mut MergedNodeSet) -> Result<(), StateError> {
        // hash 方式の backend は storage 削除自体が不要
        if self.db.scheme() == TrieScheme::Hash {
            return Ok(());
        }
        let destructs: Vec<(Address, Option<StateAccount>)> = self
            .state_objects_destruct
            .iter()
            .map(|(address, prev)| (*address, *prev))
            .collect();
        for (address, prev) in destructs {
            let addr_hash = hash_address(address);
            let Some(prev) = prev else {
                // 元々存在しない account。resurrect されていれば origin は null
                if self.accounts.contains_key(&addr_hash) {
                    self.accounts_origin.insert(address, None);
                }
                continue;
            };
            self.accounts_origin
                .insert(address, Some(slim_account_rlp(&prev)));
            if prev.storage_root == EMPTY_ROOT_HASH {
                continue;
            }
            let snaps = if self.snap.is_some() {
                self.snaps.as_deref()
            } else {
                None
            };
            let (slots, set) = deletion::delete_storage(
                &self.db,
                snaps,
                self.original_root,
                Some(&self.trie),
                address,
                addr_hash,
                prev.storage_root,
            )?;
            self.storage_deleted += slots.len();
            // resurrect が先に書いた entry ごと旧 incarnation の原像で上書きする
            let origin_slots = self.storages_origin.entry(address).or_default();
            for (slot_hash, raw) in slots {
                origin_slots.insert(slot_hash, raw);
            }
            nodes.merge(set);
        }
        Ok(())
    }

    fn convert_account_set(&self) -> BTreeSet<B256> {
        self.state_objects_destruct
            .keys()
            .map(|address| match self.state_objects.get(address) {
                Some(obj) => obj.addr_hash(),
                None => hash_address(*address),
            })
            .collect()
    }

    /// block 終端。蓄積した遷移を trie database と snapshot tree へ書き切る。
    /// 成功後の instance は不活性で、新しい root から作り直すこと。
    pub fn commit(&mut self, block: u64, delete_empty_objects: bool) -> Result<B256, StateError> {
        if self.committed {
            return Err(StateError::AlreadyCommitted);
        }
        if self.extra.tx_filter {
            return Err(StateError::TxFiltered);
        }
        if self.storage_override {
            return Err(StateError::StorageOverride);
        }
        if let Some(err) = &self.db_err {
            return Err(err.clone());
        }
        self.intermediate_root(delete_empty_objects);
        if let Some(err) = &self.db_err {
            return Err(err.clone());
        }

        // deletion を最初にまとめて処理する
        let mut merged = MergedNodeSet::new();
        self.handle_destruction(&mut merged)?;

        // code batch は逐次積んで、書き込みだけ worker に回す
        let mut code_batch = self.db.code_batch();
        let mut commit_objects: Vec<StateObject<D>> = Vec::new();
        let update_addresses: Vec<Address> = self
            .mutations
            .iter()
            .filter(|(_, m)| !m.is_delete())
            .map(|(address, _)| *address)
            .collect();
        for address in update_addresses {
            let Some(mut obj) = self.state_objects.remove(&address) else {
                continue;
            };
            if obj.dirty_code {
                if let Some(code) = obj.code_cached() {
                    code_batch.put(obj.code_hash(), code.to_vec());
                }
                obj.dirty_code = false;
            }
            commit_objects.push(obj);
        }
        let mut artifact_batch = self.db.artifact_batch();
        for (hash, blob) in std::mem::take(&mut self.extra.artifacts) {
            artifact_batch.put(hash, blob);
        }

        struct CommitAcc {
            root: B256,
            nodes: MergedNodeSet,
            err: Option<StateError>,
            account_nodes: (usize, usize),
            storage_nodes: (usize, usize),
        }

        impl CommitAcc {
            fn fail(&mut self, err: StateError) {
                if self.err.is_none() {
                    self.err = Some(err);
                }
            }
        }

        let acc = Mutex::new(CommitAcc {
            root: B256::ZERO,
            nodes: merged,
            err: None,
            account_nodes: (0, 0),
            storage_nodes: (0, 0),
        });
        {
            let acc = &acc;
            let account_trie = &mut self.trie;
            let code_batch = &mut code_batch;
            let artifact_batch = &mut artifact_batch;
            rayon::scope(|scope| {
                // account trie が最重量なので最初に出す
                scope.spawn(move |_| {
                    if acc.lock().expect("commit accumulator poisoned").err.is_some() {
                        return;
                    }
                    let result = account_trie.commit(true);
                    let mut guard = acc.lock().expect("commit accumulator poisoned");
                    match result {
                        Ok((root, set)) => {
                            guard.root = root;
                            if let Some(set) = set {
                                guard.account_nodes = set.size();
                                guard.nodes.merge(set);
                            }
                        }
                        Err(err) => guard.fail(StateError::Trie(err)),
                    }
                });
                for obj in commit_objects.iter_mut() {
                    scope.spawn(move |_| {
                        if acc.lock().expect("commit accumulator poisoned").err.is_some() {
                            return;
                        }
                        let result = obj.commit_storage();
                        let mut guard = acc.lock().expect("commit accumulator poisoned");
                        match result {
                            // destruct → resurrect では同じ owner の set が
                            // 二度来るため merge に畳む
                            Ok(Some(set)) => {
                                let (updates, deletes) = set.size();
                                guard.storage_nodes.0 += updates;
                                guard.storage_nodes.1 += deletes;
                                guard.nodes.merge(set);
                            }
                            Ok(None) => {}
                            Err(err) => guard.fail(StateError::Trie(err)),
                        }
                    });
                }
                scope.spawn(move |_| {
                    if code_batch.value_size() == 0 {
                        return;
                    }
                    if let Err(err) = code_batch.write() {
                        acc.lock()
                            .expect("commit accumulator poisoned")
                            .fail(StateError::Trie(err));
                    }
                });
                scope.spawn(move |_| {
                    if artifact_batch.value_size() == 0 {
                        return;
                    }
                    if let Err(err) = artifact_batch.write() {
                        acc.lock()
                            .expect("commit accumulator poisoned")
                            .fail(StateError::Trie(err));
                    }
                });
            });
        }
        let CommitAcc {
            root: new_root,
            nodes,
            err,
            account_nodes,
            storage_nodes,
        } = acc.into_inner().expect("commit accumulator poisoned");
        if let Some(err) = err {
            return Err(err);
        }
        debug!(
            "commit: accounts updated={} deleted={} slots updated={} deleted={} trie nodes account=({},{}) storage=({},{})",
            self.account_updated,
            self.account_deleted,
            self.storage_updated,
            self.storage_deleted,
            account_nodes.0,
            account_nodes.1,
            storage_nodes.0,
            storage_nodes.1,
        );
        self.account_updated = 0;
        self.account_deleted = 0;
        self.storage_updated = 0;
        self.storage_deleted = 0;

        // snapshot tree へ diff layer を積む。失敗は warning 止まり。
        // 正は trie database 側にある。
        if let Some(snap) = self.snap.take() {
            if let Some(snaps) = &self.snaps {
                let parent = snap.root();
                if parent != new_root {
                    let destructs = self.convert_account_set();
                    if let Err(err) = snaps.update(
                        new_root,
                        parent,
                        destructs,
                        self.accounts.clone(),
                        self.storages.clone(),
                    ) {
                        warn!("snapshot: update failed from={parent} to={new_root} err={err:?}");
                    }
                    if let Err(err) = snaps.cap(new_root, DEFAULT_TRIES_IN_MEMORY) {
                        warn!(
                            "snapshot: cap failed root={new_root} layers={DEFAULT_TRIES_IN_MEMORY} err={err:?}"
                        );
                    }
                }
            }
        }
        self.extra.unexpected_balance_delta = I256::ZERO;

        let root = if new_root == B256::ZERO {
            EMPTY_ROOT_HASH
        } else {
            new_root
        };
        let origin = if self.original_root == B256::ZERO {
            EMPTY_ROOT_HASH
        } else {
            self.original_root
        };
        if root != origin {
            let origin_set = StateSet::new(
                std::mem::take(&mut self.accounts_origin),
                std::mem::take(&mut self.storages_origin),
            );
            self.db
                .commit_update(root, origin, block, nodes, origin_set)
                .map_err(StateError::Trie)?;
            self.original_root = root;
        }
        self.accounts.clear();
        self.storages.clear();
        self.accounts_origin.clear();
        self.storages_origin.clear();
        self.mutations.clear();
        self.state_objects_destruct.clear();
        self.state_objects.clear();
        self.committed = true;
        Ok(root)
    }

    /// 共有物 (db / snapshot tree) 以外を深く複製した独立 copy。
    /// prefetcher は preload しない不活性 copy になる。
    pub fn copy(&self) -> Self {
        Self {
            db: self.db.clone(),
            prefetcher: self.prefetcher.as_ref().map(|p| p.copy()),
            trie: self.trie.clone(),
            snaps: self.snaps.clone(),
            snap: self.snap.as_ref().map(|s| s.boxed_clone()),
            original_root: self.original_root,
            accounts: self.accounts.clone(),
            storages: self.storages.clone(),
            accounts_origin: self.accounts_origin.clone(),
            storages_origin: self.storages_origin.clone(),
            state_objects: self.state_objects.clone(),
            state_objects_destruct: self.state_objects_destruct.clone(),
            mutations: self.mutations.clone(),
            db_err: self.db_err.clone(),
            refund: self.refund,
            thash: self.thash,
            tx_index: self.tx_index,
            logs: self.logs.clone(),
            log_size: self.log_size,
            preimages: self.preimages.clone(),
            access_list: self.access_list.clone(),
            transient_storage: self.transient_storage.clone(),
            journal: self.journal.copy(),
            valid_revisions: self.valid_revisions.clone(),
            next_revision_id: self.next_revision_id,
            hooks: self.hooks.clone(),
            extra: self.extra.clone(),
            deterministic: self.deterministic,
            storage_override: self.storage_override,
            committed: self.committed,
            account_updated: self.account_updated,
            account_deleted: self.account_deleted,
            storage_updated: self.storage_updated,
            storage_deleted: self.storage_deleted,
        }
    }
}
