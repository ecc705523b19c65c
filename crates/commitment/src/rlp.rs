//! RLP node construction for the hashed trie: leaves, extensions and branches.
use alloy_rlp::{BufMut, EMPTY_STRING_CODE, Encodable, Header};
use reth_trie::TrieAccount;
use revm_primitives::{B256, keccak256};
use smallvec::SmallVec;

use crate::{hp::to_encoded_path, nibble_set::NibbleSet};

/// How a child node is referenced from its parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NodeRef {
    /// RLP encoding shorter than 32 bytes, embedded verbatim.
    Inline(SmallVec<[u8; 32]>),
    Digest(B256),
}

impl NodeRef {
    /// Builds the reference for an RLP-encoded node.
    pub(crate) fn from_rlp(rlp: &[u8]) -> Self {
        if rlp.len() < 32 {
            Self::Inline(SmallVec::from_slice(rlp))
        } else {
            Self::Digest(keccak256(rlp))
        }
    }

    /// Hash of the referenced node, hashing inline encodings on demand.
    pub(crate) fn digest(&self) -> B256 {
        match self {
            Self::Inline(bytes) => keccak256(bytes),
            Self::Digest(digest) => *digest,
        }
    }

    #[inline]
    pub(crate) fn length(&self) -> usize {
        match self {
            Self::Inline(bytes) => bytes.len(),
            Self::Digest(_) => 1 + 32,
        }
    }

    #[inline]
    pub(crate) fn encode(&self, out: &mut dyn BufMut) {
        match self {
            // if the reference is an RLP-encoded byte slice, copy it directly
            Self::Inline(bytes) => out.put_slice(bytes),
            // if the reference is a digest, RLP-encode it with its fixed known length
            Self::Digest(digest) => {
                out.put_u8(EMPTY_STRING_CODE + 32);
                out.put_slice(digest.as_slice());
            }
        }
    }
}

/// Encodes a leaf node `[hp(key, leaf), value]` where `value` is an already RLP-encoded item
/// which gets wrapped once more as a byte string.
fn leaf_rlp(key: &[u8], value_rlp: &[u8], out: &mut Vec<u8>) {
    let path = to_encoded_path(key, true);
    let payload_length = path.as_slice().length() + value_rlp.length();
    Header { list: true, payload_length }.encode(out);
    path.as_slice().encode(out);
    value_rlp.encode(out);
}

/// Reference to a storage leaf holding the raw big-endian `value` at hashed path `key`.
pub(crate) fn storage_leaf_ref(key: &[u8], value: &[u8]) -> NodeRef {
    let mut value_rlp = Vec::with_capacity(value.len() + 1);
    value.encode(&mut value_rlp);
    let mut out = Vec::with_capacity(key.len() / 2 + value_rlp.len() + 8);
    leaf_rlp(key, &value_rlp, &mut out);
    NodeRef::from_rlp(&out)
}

/// Hash of an account leaf at hashed path `key`.
pub(crate) fn account_leaf_hash(key: &[u8], account: &TrieAccount) -> B256 {
    let mut account_rlp = Vec::with_capacity(account.length());
    account.encode(&mut account_rlp);
    let mut out = Vec::with_capacity(key.len() / 2 + account_rlp.len() + 8);
    leaf_rlp(key, &account_rlp, &mut out);
    keccak256(&out)
}

/// Hash of an extension node `[hp(key, ext), child]`.
pub(crate) fn extension_hash(key: &[u8], child: B256) -> B256 {
    let path = to_encoded_path(key, false);
    let child = NodeRef::Digest(child);
    let payload_length = path.as_slice().length() + child.length();
    let mut out = Vec::with_capacity(payload_length + 3);
    Header { list: true, payload_length }.encode(&mut out);
    path.as_slice().encode(&mut out);
    child.encode(&mut out);
    keccak256(&out)
}

/// Hash of a branch node from its present children, given in ascending nibble order.
///
/// The value slot is always empty.
pub(crate) fn branch_hash(present: NibbleSet, children: &[NodeRef]) -> B256 {
    debug_assert_eq!(present.len(), children.len());
    let payload_length = 17 - children.len() + children.iter().map(NodeRef::length).sum::<usize>();
    let mut out = Vec::with_capacity(payload_length + 3);
    Header { list: true, payload_length }.encode(&mut out);
    let mut children = children.iter();
    for nibble in 0..16u8 {
        match present.contains(nibble).then(|| children.next()).flatten() {
            Some(child) => child.encode(&mut out),
            None => out.put_u8(EMPTY_STRING_CODE),
        }
    }
    out.put_u8(EMPTY_STRING_CODE);
    keccak256(&out)
}
