//! どこで: core と backend の境界 / 何を: trie / database 契約 / なぜ: state cache を実装から独立させるため

use crate::account::StateAccount;
use crate::node_set::{MergedNodeSet, NodeSet, StateSet};
use alloy_primitives::{Address, Bytes, B256, U256};
use alloy_trie::Nibbles;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TrieError {
    MissingRoot(B256),
    NotStorageTrie,
    NotAccountTrie,
    Backend(String),
}

/// backend の node 配置方式。hash 方式では storage 削除を行わない。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrieScheme {
    Hash,
    Path,
}

/// node iterator が返す要素。leaf は key と leaf blob、
/// 中間 node は path と node hash。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TrieItem {
    Leaf { key: B256, value: Vec<u8> },
    Node { path: Nibbles, hash: B256 },
}

/// 具象化済みの深さ優先 walk。
pub struct TrieWalker {
    items: std::vec::IntoIter<TrieItem>,
}

impl TrieWalker {
    pub fn new(items: Vec<TrieItem>) -> Self {
        Self {
            items: items.into_iter(),
        }
    }
}

impl Iterator for TrieWalker {
    type Item = TrieItem;

    fn next(&mut self) -> Option<TrieItem> {
        self.items.next()
    }
}

/// account trie と storage trie の双方を表す契約。
/// commit 後の handle は死んでいる前提で、呼び出し側が使い回さないこと。
pub trait Trie: Clone + Send {
    fn get_account(&self, address: Address) -> Result<Option<StateAccount>, TrieError>;
    fn get_storage(&self, address: Address, key: B256) -> Result<U256, TrieError>;

    fn update_account(&mut self, address: Address, account: &StateAccount) -> Result<(), TrieError>;
    fn update_storage(&mut self, address: Address, key: B256, value: U256) -> Result<(), TrieError>;
    fn delete_account(&mut self, address: Address) -> Result<(), TrieError>;
    fn delete_storage(&mut self, address: Address, key: B256) -> Result<(), TrieError>;
    fn update_contract_code(
        &mut self,
        address: Address,
        code_hash: B256,
        code: &[u8],
    ) -> Result<(), TrieError>;

    fn hash(&self) -> B256;

    /// root を確定し dirty node 集合を返す。変更が無ければ set は None。
    fn commit(&mut self, collect_leaves: bool) -> Result<(B256, Option<NodeSet>), TrieError>;

    /// start 以降 (trie key 順) の walk。
    fn node_iterator(&self, start: Option<B256>) -> Result<TrieWalker, TrieError>;
}

/// code / 拡張 artifact 書き込み用の batch。
pub trait WriteBatch: Send {
    fn put(&mut self, key: B256, value: Vec<u8>);
    fn value_size(&self) -> usize;
    fn write(&mut self) -> Result<(), TrieError>;
}

/// trie database 一式。trie の open、code store、commit 時の一括更新を束ねる。
pub trait Database: Clone + Send + Sync + 'static {
    type Tr: Trie;
    type Batch: WriteBatch;

    fn open_trie(&self, root: B256) -> Result<Self::Tr, TrieError>;

    /// state_root はこの block の遷移前 root。main は account trie handle
    /// (prefetcher からの open など、手元に無い場合は None)。
    fn open_storage_trie(
        &self,
        state_root: B256,
        address: Address,
        root: B256,
        main: Option<&Self::Tr>,
    ) -> Result<Self::Tr, TrieError>;

    fn contract_code(&self, address: Address, code_hash: B256) -> Result<Bytes, TrieError>;
    fn contract_code_size(&self, address: Address, code_hash: B256) -> Result<usize, TrieError>;

    fn code_batch(&self) -> Self::Batch;
    fn artifact_batch(&self) -> Self::Batch;

    fn scheme(&self) -> TrieScheme;

    /// commit の最終段。dirty node 集合と reverse diff を
    /// (root, parent, block) を鍵に永続化する。
    fn commit_update(
        &self,
        root: B256,
        parent: B256,
        block: u64,
        nodes: MergedNodeSet,
        origin: StateSet,
    ) -> Result<(), TrieError>;
}
