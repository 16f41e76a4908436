//! どこで: trie commit の出力 / 何を: dirty node 集合と reverse diff / なぜ: DB 更新を1回の塊に固定するため

use alloy_primitives::{Address, B256};
use alloy_trie::Nibbles;
use std::collections::BTreeMap;

/// node path に対する変更。blob の差し替えか削除のどちらか。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeChange {
    Updated(Vec<u8>),
    Deleted,
}

impl NodeChange {
    pub fn is_deleted(&self) -> bool {
        matches!(self, NodeChange::Deleted)
    }
}

/// 1つの trie (owner) が commit で吐いた dirty node 集合。
/// owner は account trie なら zero、storage trie なら address hash。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeSet {
    owner: B256,
    nodes: BTreeMap<Nibbles, NodeChange>,
}

impl NodeSet {
    pub fn new(owner: B256) -> Self {
        Self {
            owner,
            nodes: BTreeMap::new(),
        }
    }

    pub fn owner(&self) -> B256 {
        self.owner
    }

    pub fn add_node(&mut self, path: Nibbles, change: NodeChange) {
        self.nodes.insert(path, change);
    }

    pub fn get(&self, path: &Nibbles) -> Option<&NodeChange> {
        self.nodes.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Nibbles, &NodeChange)> {
        self.nodes.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// (updates, deletes)
    pub fn size(&self) -> (usize, usize) {
        let deletes = self.nodes.values().filter(|c| c.is_deleted()).count();
        (self.nodes.len() - deletes, deletes)
    }

    fn merge_from(&mut self, other: NodeSet) {
        for (path, change) in other.nodes {
            self.nodes.insert(path, change);
        }
    }
}

/// 複数 trie 分の NodeSet を owner 毎にまとめたもの。
/// 同一 block 内の destruct → resurrect では同じ owner の set が二度来る。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MergedNodeSet {
    sets: BTreeMap<B256, NodeSet>,
}

impl MergedNodeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, other: NodeSet) {
        match self.sets.get_mut(&other.owner) {
            Some(existing) => existing.merge_from(other),
            None => {
                self.sets.insert(other.owner, other);
            }
        }
    }

    pub fn set(&self, owner: &B256) -> Option<&NodeSet> {
        self.sets.get(owner)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&B256, &NodeSet)> {
        self.sets.iter()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}

/// state 遷移の逆向き差分。mutated account / slot の遷移前イメージ。
/// accounts_origin の None は「遷移前は存在しなかった」、
/// storages_origin の空バイト列は「遷移前はゼロだった」を表す。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StateSet {
    pub accounts_origin: BTreeMap<Address, Option<Vec<u8>>>,
    pub storages_origin: BTreeMap<Address, BTreeMap<B256, Vec<u8>>>,
}

impl StateSet {
    pub fn new(
        accounts_origin: BTreeMap<Address, Option<Vec<u8>>>,
        storages_origin: BTreeMap<Address, BTreeMap<B256, Vec<u8>>>,
    ) -> Self {
        Self {
            accounts_origin,
            storages_origin,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.accounts_origin.is_empty() && self.storages_origin.is_empty()
    }
}
