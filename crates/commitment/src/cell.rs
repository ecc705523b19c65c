use bytes::{Buf, BufMut};
use reth_trie::{EMPTY_ROOT_HASH, TrieAccount};
use revm_primitives::{B256, KECCAK_EMPTY, U256};
use smallvec::SmallVec;

use crate::{
    branch::{
        AccountKey, CellPayload, Extension, MAX_ACCOUNT_KEY_LEN, MAX_EXTENSION_LEN,
        MAX_STORAGE_KEY_LEN, StorageKey,
    },
    error::CommitmentError,
    hp::{ACCOUNT_DEPTH, Nibbles, STORAGE_DEPTH, hash_key},
    lookup::Account,
    rlp::{NodeRef, account_leaf_hash, extension_hash, storage_leaf_ref},
};

/// Storage slot value, raw big-endian bytes.
pub type StorageValue = SmallVec<[u8; 32]>;

const FLAG_DELETE: u8 = 1;

/// Occupant of one trie position in the working grid.
///
/// Only the structural part (identity, path compression, hash) survives [`Cell::encode`]; the
/// value payload is reloaded from the state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    /// Cached hash of the subtree below this cell.
    pub(crate) h: Option<B256>,
    pub(crate) apk: AccountKey,
    pub(crate) spk: StorageKey,
    /// Nibbles from just below this cell down to the next stored boundary.
    pub(crate) down_hashed_key: Nibbles,
    /// Compressed path above the branch this cell points to.
    pub(crate) extension: Extension,
    pub(crate) delete: bool,

    pub nonce: u64,
    pub balance: U256,
    pub code_hash: B256,
    pub storage: StorageValue,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            h: None,
            apk: AccountKey::new(),
            spk: StorageKey::new(),
            down_hashed_key: Nibbles::new(),
            extension: Extension::new(),
            delete: false,
            nonce: 0,
            balance: U256::ZERO,
            code_hash: KECCAK_EMPTY,
            storage: StorageValue::new(),
        }
    }
}

impl Cell {
    /// Size of the fixed structural encoding.
    pub const ENCODED_LEN: usize = 1
        + (1 + 32)
        + (1 + MAX_ACCOUNT_KEY_LEN)
        + (1 + MAX_STORAGE_KEY_LEN)
        + (1 + STORAGE_DEPTH)
        + (1 + MAX_EXTENSION_LEN);

    pub fn hash(&self) -> Option<B256> {
        self.h
    }

    pub fn account_plain_key(&self) -> &[u8] {
        &self.apk
    }

    pub fn storage_plain_key(&self) -> &[u8] {
        &self.spk
    }

    pub fn down_hashed_key(&self) -> &[u8] {
        &self.down_hashed_key
    }

    pub fn extension(&self) -> &[u8] {
        &self.extension
    }

    pub fn is_deleted(&self) -> bool {
        self.delete
    }

    /// Whether the cell holds nothing that refers to a subtree.
    pub fn is_empty(&self) -> bool {
        self.h.is_none() && self.down_hashed_key.is_empty()
    }

    /// Serializes identity, path compression, hash and the delete flag.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        fn put_padded(out: &mut &mut [u8], data: &[u8], capacity: usize) {
            out.put_u8(data.len() as u8);
            out.put_slice(data);
            out.put_bytes(0, capacity - data.len());
        }

        let mut encoded = [0u8; Self::ENCODED_LEN];
        let mut out = &mut encoded[..];
        out.put_u8(if self.delete { FLAG_DELETE } else { 0 });
        match &self.h {
            Some(h) => put_padded(&mut out, h.as_slice(), 32),
            None => put_padded(&mut out, &[], 32),
        }
        put_padded(&mut out, &self.apk, MAX_ACCOUNT_KEY_LEN);
        put_padded(&mut out, &self.spk, MAX_STORAGE_KEY_LEN);
        put_padded(&mut out, &self.down_hashed_key, STORAGE_DEPTH);
        put_padded(&mut out, &self.extension, MAX_EXTENSION_LEN);
        debug_assert!(out.is_empty());
        encoded
    }

    /// Inverse of [`Cell::encode`]. Value payload fields come back at their defaults.
    pub fn decode(data: &[u8]) -> Result<Self, CommitmentError> {
        fn take_padded<'a>(
            buf: &mut &'a [u8],
            capacity: usize,
            what: &'static str,
        ) -> Result<&'a [u8], CommitmentError> {
            let len = buf.get_u8() as usize;
            if len > capacity {
                return Err(CommitmentError::MalformedEncoding(what));
            }
            let (field, rest) = buf.split_at(capacity);
            *buf = rest;
            Ok(&field[..len])
        }

        if data.len() != Self::ENCODED_LEN {
            return Err(CommitmentError::MalformedEncoding("cell encoding has wrong length"));
        }
        let mut buf = data;
        let flags = buf.get_u8();
        if flags & !FLAG_DELETE != 0 {
            return Err(CommitmentError::MalformedEncoding("unknown cell flags"));
        }

        let mut cell = Self { delete: flags & FLAG_DELETE != 0, ..Default::default() };
        cell.h = match take_padded(&mut buf, 32, "cell hash length")? {
            [] => None,
            h if h.len() == 32 => Some(B256::from_slice(h)),
            _ => return Err(CommitmentError::MalformedEncoding("cell hash length")),
        };
        cell.apk = AccountKey::from_slice(take_padded(
            &mut buf,
            MAX_ACCOUNT_KEY_LEN,
            "account plain key length",
        )?);
        cell.spk = StorageKey::from_slice(take_padded(
            &mut buf,
            MAX_STORAGE_KEY_LEN,
            "storage plain key length",
        )?);
        let down = take_padded(&mut buf, STORAGE_DEPTH, "down hashed key length")?;
        let extension = take_padded(&mut buf, MAX_EXTENSION_LEN, "extension length")?;
        if down.iter().chain(extension).any(|&nibble| nibble > 0x0f) {
            return Err(CommitmentError::MalformedEncoding("nibble out of range"));
        }
        cell.down_hashed_key = Nibbles::from_slice(down);
        cell.extension = Extension::from_slice(extension);
        Ok(cell)
    }

    /// Copy of the cell with the value payload reset, as it comes back from a decode.
    pub fn structural(&self) -> Self {
        Self {
            h: self.h,
            apk: self.apk.clone(),
            spk: self.spk.clone(),
            down_hashed_key: self.down_hashed_key.clone(),
            extension: self.extension.clone(),
            delete: self.delete,
            ..Default::default()
        }
    }

    pub(crate) fn has_storage_key(&self, account_key_len: usize) -> bool {
        self.spk.len() > account_key_len
    }

    pub(crate) fn set_account(&mut self, account: Option<&Account>) {
        let account = account.copied().unwrap_or_default();
        self.nonce = account.nonce;
        self.balance = account.balance;
        self.code_hash = account.code_hash;
    }

    pub(crate) fn clear_account(&mut self) {
        self.set_account(None);
    }

    /// Takes over the part of `up` that lies `depth_increment` nibbles further down.
    pub(crate) fn fill_from_upper_cell(&mut self, up: &Cell, depth: usize, depth_increment: usize) {
        self.down_hashed_key.clear();
        if up.down_hashed_key.len() > depth_increment {
            self.down_hashed_key.extend_from_slice(&up.down_hashed_key[depth_increment..]);
        }
        self.extension.clear();
        if up.extension.len() > depth_increment {
            self.extension.extend_from_slice(&up.extension[depth_increment..]);
        }
        if depth <= ACCOUNT_DEPTH {
            self.apk = up.apk.clone();
            if !up.apk.is_empty() {
                self.nonce = up.nonce;
                self.balance = up.balance;
                self.code_hash = up.code_hash;
                // the extension belongs to the storage subtrie and stays untouched
                self.extension = up.extension.clone();
            }
        } else {
            self.apk.clear();
        }
        self.spk = up.spk.clone();
        if !up.spk.is_empty() {
            self.storage = up.storage.clone();
        }
        self.h = up.h;
    }

    /// Absorbs the single remaining child `low` of a collapsing branch.
    pub(crate) fn fill_from_lower_cell(
        &mut self,
        low: &Cell,
        low_depth: usize,
        pre_extension: &[u8],
        nibble: u8,
    ) {
        self.extension.clear();
        if !low.apk.is_empty() || low_depth < ACCOUNT_DEPTH {
            self.apk = low.apk.clone();
        }
        if !low.apk.is_empty() {
            self.nonce = low.nonce;
            self.balance = low.balance;
            self.code_hash = low.code_hash;
        }
        self.spk = low.spk.clone();
        if !low.spk.is_empty() {
            self.storage = low.storage.clone();
        }
        if low.h.is_some() {
            if (low.apk.is_empty() && low_depth < ACCOUNT_DEPTH)
                || (low.spk.is_empty() && low_depth > ACCOUNT_DEPTH)
            {
                // branch pointer: the path to the child joins the extension
                self.extension.clear();
                self.extension.extend_from_slice(pre_extension);
                self.extension.push(nibble);
                self.extension.extend_from_slice(&low.extension);
            } else {
                self.extension = low.extension.clone();
            }
        }
        self.h = low.h;

        let mut down = Nibbles::with_capacity(pre_extension.len() + 1 + low.down_hashed_key.len());
        down.extend_from_slice(pre_extension);
        down.push(nibble);
        down.extend_from_slice(&low.down_hashed_key);
        self.down_hashed_key = down;
    }

    /// Loads the persisted fields of a child from a branch encoding.
    pub(crate) fn fill_from_fields(&mut self, payload: &CellPayload) {
        self.down_hashed_key.clear();
        self.extension.clear();
        if let Some(extension) = &payload.extension {
            self.down_hashed_key.extend_from_slice(extension);
            self.extension.extend_from_slice(extension);
        }
        self.apk = payload.account_plain_key.clone().unwrap_or_default();
        self.spk = payload.storage_plain_key.clone().unwrap_or_default();
        self.h = payload.hash;
    }

    /// Persisted form of this cell as a branch child.
    pub(crate) fn to_payload(&self) -> CellPayload {
        CellPayload {
            extension: (!self.extension.is_empty() && self.spk.is_empty())
                .then(|| self.extension.clone()),
            account_plain_key: (!self.apk.is_empty()).then(|| self.apk.clone()),
            storage_plain_key: (!self.spk.is_empty()).then(|| self.spk.clone()),
            hash: self.h,
        }
    }

    /// Rebuilds `down_hashed_key` of a cell at `depth` from its plain keys and extension.
    pub(crate) fn derive_hashed_keys(
        &mut self,
        depth: usize,
        account_key_len: usize,
    ) -> Result<(), CommitmentError> {
        let mut down = Nibbles::new();
        if !self.apk.is_empty() {
            if depth > ACCOUNT_DEPTH {
                return Err(CommitmentError::invariant(format!(
                    "account plain key present at depth {depth}"
                )));
            }
            down.extend_from_slice(&hash_key(&self.apk, depth));
        }
        if self.has_storage_key(account_key_len) {
            let offset = depth.saturating_sub(ACCOUNT_DEPTH);
            down.extend_from_slice(&hash_key(&self.spk[account_key_len..], offset));
        }
        down.extend_from_slice(&self.extension);
        self.down_hashed_key = down;
        Ok(())
    }

    /// Hash of the subtree this cell points to, ignoring its own leaf content.
    fn subtree_hash(&self) -> B256 {
        match self.h {
            Some(h) if !self.extension.is_empty() => extension_hash(&self.extension, h),
            Some(h) => h,
            None => EMPTY_ROOT_HASH,
        }
    }

    /// Reference to this cell's node as seen by the branch holding it at `depth`.
    ///
    /// Does not modify the cell.
    pub(crate) fn node_ref(&self, depth: usize, account_key_len: usize) -> NodeRef {
        let mut storage_root = None;
        if self.has_storage_key(account_key_len) {
            let offset = depth.saturating_sub(ACCOUNT_DEPTH);
            let key = hash_key(&self.spk[account_key_len..], offset);
            let leaf = storage_leaf_ref(&key, &self.storage);
            if depth > ACCOUNT_DEPTH {
                return leaf;
            }
            // the only slot of the account: the leaf is the storage root
            storage_root = Some(leaf.digest());
        }
        if !self.apk.is_empty() {
            let key = hash_key(&self.apk, depth);
            let account = TrieAccount {
                nonce: self.nonce,
                balance: self.balance,
                storage_root: storage_root.unwrap_or_else(|| self.subtree_hash()),
                code_hash: self.code_hash,
            };
            return NodeRef::Digest(account_leaf_hash(&key, &account));
        }
        NodeRef::Digest(self.subtree_hash())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hp::to_nibs;
    use hex_literal::hex;
    use revm_primitives::keccak256;

    fn structural_cell() -> Cell {
        let mut cell = Cell {
            h: Some(keccak256(b"subtree")),
            apk: AccountKey::from_slice(&hex!("71562b71999873db5b286df957af199ec94617f7")),
            spk: StorageKey::from_slice(&hex!(
                "71562b71999873db5b286df957af199ec94617f7 0000000000000000000000000000000000000000000000000000000000000003"
            )),
            extension: Extension::from_slice(&[0x1, 0x2, 0x3, 0xf]),
            ..Default::default()
        };
        cell.down_hashed_key = to_nibs(&keccak256(b"down")[..]);
        cell.down_hashed_key.extend_from_slice(&[0x0, 0x7]);
        cell
    }

    #[test]
    fn test_encode_decode_structural_fields() {
        let mut cell = structural_cell();
        cell.nonce = 3;
        cell.balance = U256::from(999860099u64);
        cell.storage = StorageValue::from_slice(&[0x05]);

        let encoded = cell.encode();
        assert_eq!(encoded.len(), Cell::ENCODED_LEN);
        let decoded = Cell::decode(&encoded).unwrap();

        assert_eq!(decoded.hash(), cell.hash());
        assert_eq!(decoded.account_plain_key(), cell.account_plain_key());
        assert_eq!(decoded.storage_plain_key(), cell.storage_plain_key());
        assert_eq!(decoded.down_hashed_key(), cell.down_hashed_key());
        assert_eq!(decoded.extension(), cell.extension());
        assert!(!decoded.is_deleted());
        assert_eq!(decoded.encode(), encoded);
    }

    #[test]
    fn test_encode_empty_and_deleted() {
        let empty = Cell::decode(&Cell::default().encode()).unwrap();
        assert_eq!(empty, Cell::default());

        let deleted = Cell { delete: true, ..Default::default() };
        assert!(Cell::decode(&deleted.encode()).unwrap().is_deleted());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let encoded = structural_cell().encode();
        assert!(Cell::decode(&encoded[..Cell::ENCODED_LEN - 1]).is_err());

        let mut too_long_apk = encoded;
        too_long_apk[1 + 33] = (MAX_ACCOUNT_KEY_LEN + 1) as u8;
        assert!(Cell::decode(&too_long_apk).is_err());

        let mut bad_hash = encoded;
        bad_hash[1] = 31;
        assert!(Cell::decode(&bad_hash).is_err());

        let mut bad_flags = encoded;
        bad_flags[0] = 0x80;
        assert!(Cell::decode(&bad_flags).is_err());
    }

    #[test]
    fn test_derive_hashed_keys() {
        let apk = hex!("03");
        let mut cell = Cell { apk: AccountKey::from_slice(&apk), ..Default::default() };
        cell.derive_hashed_keys(5, 1).unwrap();
        assert_eq!(cell.down_hashed_key(), &to_nibs(keccak256(apk).as_slice())[5..]);

        // account with a storage subtrie below an extension
        cell.extension = Extension::from_slice(&[0xa, 0xb]);
        cell.derive_hashed_keys(5, 1).unwrap();
        assert_eq!(cell.down_hashed_key().len(), 59 + 2);
        assert_eq!(&cell.down_hashed_key()[59..], &[0xa, 0xb]);

        // storage leaf inside the storage subtrie
        let mut storage = Cell { spk: StorageKey::from_slice(&hex!("0356")), ..Default::default() };
        storage.derive_hashed_keys(70, 1).unwrap();
        assert_eq!(storage.down_hashed_key(), &to_nibs(keccak256([0x56]).as_slice())[6..]);

        let mut deep = Cell { apk: AccountKey::from_slice(&apk), ..Default::default() };
        assert!(deep.derive_hashed_keys(65, 1).is_err());
    }

    #[test]
    fn test_node_ref_empty_is_empty_root() {
        assert_eq!(Cell::default().node_ref(0, 20), NodeRef::Digest(EMPTY_ROOT_HASH));
    }

    #[test]
    fn test_node_ref_is_pure() {
        let mut cell = structural_cell();
        cell.storage = StorageValue::from_slice(&[0x01]);
        let before = cell.clone();
        let first = cell.node_ref(10, 20);
        assert_eq!(cell, before);
        assert_eq!(first, cell.node_ref(10, 20));
    }

    #[test]
    fn test_payload_skips_extension_of_storage_cells() {
        let cell = structural_cell();
        let payload = cell.to_payload();
        assert!(payload.extension.is_none());
        assert!(payload.account_plain_key.is_some());
        assert_eq!(payload.hash, cell.hash());

        let mut pointer = Cell::default();
        pointer.fill_from_fields(&CellPayload {
            extension: Some(Extension::from_slice(&[0x4, 0x2])),
            hash: Some(B256::repeat_byte(9)),
            ..Default::default()
        });
        assert_eq!(pointer.down_hashed_key(), &[0x4, 0x2]);
        assert_eq!(pointer.to_payload().extension.as_deref(), Some(&[0x4u8, 0x2][..]));
    }
}
