//! どこで: destruct 後の storage 一掃 / 何を: snapshot 走査の fast path と trie walk の slow path / なぜ: どちらの経路でも同じ slot 原像を出すため

use crate::statedb::StateError;
use alloy_primitives::{Address, B256};
use alloy_trie::{HashBuilder, Nibbles};
use evm_triedb::{Database, NodeChange, NodeSet, SnapshotTree, Trie, TrieItem};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// snapshot iterator から slot を吸い上げ、stack root を合成して
/// account record の storage root と突き合わせる。不一致は snapshot 破損。
pub fn fast_delete_storage(
    snaps: &dyn SnapshotTree,
    state_root: B256,
    addr_hash: B256,
    root: B256,
) -> Result<(BTreeMap<B256, Vec<u8>>, NodeSet), StateError> {
    let mut iter = snaps.storage_iterator(state_root, addr_hash, B256::ZERO)?;
    let mut nodes = NodeSet::new(addr_hash);
    let mut slots: BTreeMap<B256, Vec<u8>> = BTreeMap::new();
    let mut stack = HashBuilder::default();
    while iter.next() {
        // Slot() の後にも iterator error が立ち得る
        if let Some(err) = iter.error() {
            return Err(StateError::Snapshot(err));
        }
        let slot_hash = iter.hash();
        let raw = iter.slot();
        stack.add_leaf(Nibbles::unpack(slot_hash), &raw);
        nodes.add_node(Nibbles::unpack(slot_hash), NodeChange::Deleted);
        slots.insert(slot_hash, raw);
    }
    if let Some(err) = iter.error() {
        return Err(StateError::Snapshot(err));
    }
    iter.release();
    let synthesised = stack.root();
    if synthesised != root {
        return Err(StateError::SnapshotRootMismatch {
            expected: root,
            got: synthesised,
        });
    }
    Ok((slots, nodes))
}

/// storage trie を直接 walk する。leaf は原像へ、node は削除印へ。
pub fn slow_delete_storage<D: Database>(
    db: &D,
    state_root: B256,
    main: Option<&D::Tr>,
    address: Address,
    addr_hash: B256,
    root: B256,
) -> Result<(BTreeMap<B256, Vec<u8>>, NodeSet), StateError> {
    let trie = db
        .open_storage_trie(state_root, address, root, main)
        .map_err(StateError::Trie)?;
    let walker = trie.node_iterator(None).map_err(StateError::Trie)?;
    let mut nodes = NodeSet::new(addr_hash);
    let mut slots: BTreeMap<B256, Vec<u8>> = BTreeMap::new();
    for item in walker {
        match item {
            TrieItem::Leaf { key, value } => {
                slots.insert(key, value);
            }
            TrieItem::Node { path, hash } => {
                if hash != B256::ZERO {
                    nodes.add_node(path, NodeChange::Deleted);
                }
            }
        }
    }
    Ok((slots, nodes))
}

/// snapshot が付いていれば fast path、失敗・未生成なら slow path。
pub fn delete_storage<D: Database>(
    db: &D,
    snaps: Option<&dyn SnapshotTree>,
    state_root: B256,
    main: Option<&D::Tr>,
    address: Address,
    addr_hash: B256,
    root: B256,
) -> Result<(BTreeMap<B256, Vec<u8>>, NodeSet), StateError> {
    if let Some(snaps) = snaps {
        match fast_delete_storage(snaps, state_root, addr_hash, root) {
            Ok(out) => {
                debug!("storage wipe: snapshot path slots={}", out.0.len());
                return Ok(out);
            }
            Err(err) => {
                warn!("storage wipe: snapshot path failed, walking trie err={err:?}");
            }
        }
    }
    let out = slow_delete_storage(db, state_root, main, address, addr_hash, root)?;
    debug!("storage wipe: trie walk slots={}", out.0.len());
    Ok(out)
}
