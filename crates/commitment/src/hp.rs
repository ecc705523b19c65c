//! Hex-prefix (HP) helpers and nibble utilities for hashed key paths.
use core::{cmp, iter};
use revm_primitives::keccak256;
use smallvec::SmallVec;

/// Nibble path of a full hashed key: 64 nibbles for an account, 128 for a storage slot.
pub type Nibbles = SmallVec<[u8; 128]>;

/// Nibbles of a single keccak digest.
pub(crate) type HashNibbles = SmallVec<[u8; 64]>;

/// Number of nibbles in a hashed account key; storage subtries start below this depth.
pub const ACCOUNT_DEPTH: usize = 64;
/// Number of nibbles in a hashed storage key.
pub const STORAGE_DEPTH: usize = 128;

// hex-prefix flags, stored in the high nibble of the first byte
const HP_FLAG_ODD: u8 = 0x10;
const HP_FLAG_LEAF: u8 = 0x20;

/// Returns the length of the common prefix (in nibbles) between two nibble slices.
#[inline]
pub(crate) fn lcp(a: &[u8], b: &[u8]) -> usize {
    for (i, (a, b)) in iter::zip(a, b).enumerate() {
        if a != b {
            return i;
        }
    }
    cmp::min(a.len(), b.len())
}

/// Converts a byte slice into a vector of nibbles.
#[inline]
pub(crate) fn to_nibs(slice: &[u8]) -> Nibbles {
    let mut result = SmallVec::with_capacity(2 * slice.len());
    for byte in slice {
        result.push(byte >> 4);
        result.push(byte & 0x0f);
    }
    result
}

/// Hashes `plain` with keccak256 and returns the digest nibbles starting at nibble `offset`.
#[inline]
pub(crate) fn hash_key(plain: &[u8], offset: usize) -> HashNibbles {
    let digest = keccak256(plain);
    let mut nibs = HashNibbles::new();
    for (i, byte) in digest.iter().enumerate() {
        if 2 * i + 1 >= offset {
            if 2 * i >= offset {
                nibs.push(byte >> 4);
            }
            nibs.push(byte & 0x0f);
        }
    }
    nibs
}

/// Computes the hashed nibble path of a plain key.
///
/// The first `account_key_len` bytes are the account part and hash to the first 64 nibbles.
/// Any remaining bytes are a storage location which hashes to another 64 nibbles.
pub fn hashed_key(plain_key: &[u8], account_key_len: usize) -> Nibbles {
    let split = cmp::min(plain_key.len(), account_key_len);
    let mut nibs = Nibbles::new();
    nibs.extend_from_slice(&hash_key(&plain_key[..split], 0));
    if plain_key.len() > account_key_len {
        nibs.extend_from_slice(&hash_key(&plain_key[account_key_len..], 0));
    }
    nibs
}

/// Encodes nibbles into the standard hex-prefix format.
///
/// Branch prefixes in the delta map use the non-leaf form.
#[inline]
pub fn to_encoded_path(nibs: &[u8], is_leaf: bool) -> Vec<u8> {
    let is_odd = nibs.len() % 2 != 0;
    let mut encoded = Vec::with_capacity(nibs.len() / 2 + 1);

    let mut prefix = if is_leaf { HP_FLAG_LEAF } else { 0x00 };
    let pairs = if is_odd {
        prefix |= HP_FLAG_ODD;
        encoded.push(prefix | nibs[0]);
        &nibs[1..]
    } else {
        encoded.push(prefix);
        nibs
    };
    for pair in pairs.chunks_exact(2) {
        encoded.push((pair[0] << 4) | pair[1]);
    }

    encoded
}
