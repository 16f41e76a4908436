//! どこで: storage境界クレート / 何を: trie・snapshotの契約とin-memory実装 / なぜ: coreを backend 実装から切り離すため

pub mod account;
pub mod memory;
pub mod node_set;
pub mod snapshot;
pub mod traits;

pub use account::{
    decode_slim_account, decode_trimmed_slot, hash_address, hash_slot, slim_account_rlp,
    trimmed_slot_rlp, StateAccount,
};
pub use node_set::{MergedNodeSet, NodeChange, NodeSet, StateSet};
pub use snapshot::{SnapshotError, SnapshotReader, SnapshotTree, StorageIterator};
pub use traits::{Database, Trie, TrieError, TrieItem, TrieScheme, TrieWalker, WriteBatch};
