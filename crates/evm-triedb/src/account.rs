//! どこで: アカウント表現 / 何を: trie record と slim encoding / なぜ: cache・snapshot の正準形を凍結するため

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_rlp::{Decodable, RlpDecodable, RlpEncodable};
use alloy_trie::{TrieAccount, EMPTY_ROOT_HASH, KECCAK_EMPTY};

/// アカウントの完全形。trie に書く時は [`TrieAccount`] に写してから RLP 化する。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StateAccount {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: B256,
    pub code_hash: B256,
}

impl StateAccount {
    pub fn new_empty() -> Self {
        Self {
            nonce: 0,
            balance: U256::ZERO,
            storage_root: EMPTY_ROOT_HASH,
            code_hash: KECCAK_EMPTY,
        }
    }

    /// EIP-161 の empty 判定。storage は関与しない。
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && self.code_hash == KECCAK_EMPTY
    }

    pub fn has_empty_storage(&self) -> bool {
        self.storage_root == EMPTY_ROOT_HASH
    }

    pub fn to_trie_account(&self) -> TrieAccount {
        TrieAccount {
            nonce: self.nonce,
            balance: self.balance,
            storage_root: self.storage_root,
            code_hash: self.code_hash,
        }
    }

    /// account trie の leaf value。
    pub fn full_rlp(&self) -> Vec<u8> {
        alloy_rlp::encode(self.to_trie_account())
    }
}

impl Default for StateAccount {
    fn default() -> Self {
        Self::new_empty()
    }
}

/// slim wire 形式。空 storage_root / 空 code_hash は空バイト列に落とす。
#[derive(RlpEncodable, RlpDecodable)]
struct SlimAccountWire {
    nonce: u64,
    balance: U256,
    storage_root: Bytes,
    code_hash: Bytes,
}

pub fn slim_account_rlp(account: &StateAccount) -> Vec<u8> {
    let storage_root = if account.storage_root == EMPTY_ROOT_HASH {
        Bytes::new()
    } else {
        Bytes::copy_from_slice(account.storage_root.as_slice())
    };
    let code_hash = if account.code_hash == KECCAK_EMPTY {
        Bytes::new()
    } else {
        Bytes::copy_from_slice(account.code_hash.as_slice())
    };
    alloy_rlp::encode(SlimAccountWire {
        nonce: account.nonce,
        balance: account.balance,
        storage_root,
        code_hash,
    })
}

/// slim バイト列から完全形へ戻す。省略フィールドは正準定数で補う。
pub fn decode_slim_account(raw: &[u8]) -> Option<StateAccount> {
    let mut slice = raw;
    let wire = SlimAccountWire::decode(&mut slice).ok()?;
    let storage_root = match wire.storage_root.len() {
        0 => EMPTY_ROOT_HASH,
        32 => B256::from_slice(&wire.storage_root),
        _ => return None,
    };
    let code_hash = match wire.code_hash.len() {
        0 => KECCAK_EMPTY,
        32 => B256::from_slice(&wire.code_hash),
        _ => return None,
    };
    Some(StateAccount {
        nonce: wire.nonce,
        balance: wire.balance,
        storage_root,
        code_hash,
    })
}

/// storage slot の leaf value。先頭ゼロを落とした big-endian の RLP。
pub fn trimmed_slot_rlp(value: U256) -> Vec<u8> {
    alloy_rlp::encode(value)
}

pub fn decode_trimmed_slot(raw: &[u8]) -> Option<U256> {
    let mut slice = raw;
    U256::decode(&mut slice).ok()
}

/// address の trie key。
pub fn hash_address(address: Address) -> B256 {
    keccak256(address.as_slice())
}

/// slot key の trie key。
pub fn hash_slot(slot: B256) -> B256 {
    keccak256(slot.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slim_rlp_elides_empty_defaults() {
        let empty = StateAccount::new_empty();
        let slim = slim_account_rlp(&empty);
        let full = empty.full_rlp();
        assert!(slim.len() < full.len());

        let decoded = decode_slim_account(&slim).expect("decode slim");
        assert_eq!(decoded, empty);
        assert_eq!(decoded.storage_root, EMPTY_ROOT_HASH);
        assert_eq!(decoded.code_hash, KECCAK_EMPTY);
    }

    #[test]
    fn slim_rlp_keeps_nondefault_fields() {
        let account = StateAccount {
            nonce: 9,
            balance: U256::from(1_000_000u64),
            storage_root: B256::repeat_byte(0x5a),
            code_hash: B256::repeat_byte(0xc3),
        };
        let decoded = decode_slim_account(&slim_account_rlp(&account)).expect("decode slim");
        assert_eq!(decoded, account);
    }

    #[test]
    fn trimmed_slot_drops_leading_zeroes() {
        let value = U256::from(0xffu64);
        let raw = trimmed_slot_rlp(value);
        assert_eq!(raw, vec![0x81, 0xff]);
        assert_eq!(decode_trimmed_slot(&raw), Some(value));
    }
}
