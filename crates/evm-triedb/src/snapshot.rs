//! どこで: snapshot tree との境界 / 何を: flat lookup と diff layer 契約 / なぜ: trie walk 無しの O(1) 読みを許すため

use alloy_primitives::B256;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SnapshotError {
    UnknownRoot(B256),
    NotGenerated,
    Backend(String),
}

/// ある root に固定された読み取り view。値は slim encoding のバイト列。
pub trait SnapshotReader: Send + Sync {
    fn root(&self) -> B256;
    fn account(&self, account_hash: B256) -> Result<Option<Vec<u8>>, SnapshotError>;
    fn storage(&self, account_hash: B256, slot_hash: B256) -> Result<Option<Vec<u8>>, SnapshotError>;
    fn boxed_clone(&self) -> Box<dyn SnapshotReader>;
}

/// slot hash 昇順の storage 走査。Next が false を返したら終端。
pub trait StorageIterator {
    fn next(&mut self) -> bool;
    fn hash(&self) -> B256;
    fn slot(&self) -> Vec<u8>;
    fn error(&self) -> Option<SnapshotError>;
    fn release(&mut self);
}

/// diff layer を積む snapshot tree。handle は共有され、更新は tree 側が直列化する。
pub trait SnapshotTree: Send + Sync {
    fn snapshot(&self, root: B256) -> Option<Box<dyn SnapshotReader>>;

    fn storage_iterator(
        &self,
        root: B256,
        account_hash: B256,
        seek: B256,
    ) -> Result<Box<dyn StorageIterator>, SnapshotError>;

    /// parent の上に diff layer を1枚積む。accounts / storages は
    /// slim / trimmed-rlp encoding、空バイト列の slot 値は削除を表す。
    fn update(
        &self,
        root: B256,
        parent: B256,
        destructs: BTreeSet<B256>,
        accounts: BTreeMap<B256, Vec<u8>>,
        storages: BTreeMap<B256, BTreeMap<B256, Vec<u8>>>,
    ) -> Result<(), SnapshotError>;

    /// root から数えて layers 枚を超える diff を base へ畳む。
    fn cap(&self, root: B256, layers: usize) -> Result<(), SnapshotError>;
}
