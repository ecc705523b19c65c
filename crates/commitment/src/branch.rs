//! Encoding of branch nodes as persisted by the state store.
//!
//! A branch encoding is `touch_map (u16 BE) | after_map (u16 BE)` followed by one payload
//! entry per child that is both touched and present, in ascending nibble order. Each entry is
//! a field bitmask byte followed by the selected fields, every field a uvarint length and the
//! raw bytes.
use bytes::{Buf, BufMut};
use revm_primitives::B256;
use smallvec::SmallVec;

use crate::{error::CommitmentError, nibble_set::NibbleSet};

pub(crate) const HASHEDKEY_PART: u8 = 1;
pub(crate) const ACCOUNT_PLAIN_PART: u8 = 2;
pub(crate) const STORAGE_PLAIN_PART: u8 = 4;
pub(crate) const HASH_PART: u8 = 8;

const ALL_PARTS: u8 = HASHEDKEY_PART | ACCOUNT_PLAIN_PART | STORAGE_PLAIN_PART | HASH_PART;

/// Maximum length of an account plain key.
pub const MAX_ACCOUNT_KEY_LEN: usize = 20;
/// Maximum length of a storage plain key (account key ++ 32 byte location).
pub const MAX_STORAGE_KEY_LEN: usize = MAX_ACCOUNT_KEY_LEN + 32;
/// Maximum number of extension nibbles kept by a cell.
pub const MAX_EXTENSION_LEN: usize = 64;

pub type Extension = SmallVec<[u8; MAX_EXTENSION_LEN]>;
pub type AccountKey = SmallVec<[u8; MAX_ACCOUNT_KEY_LEN]>;
pub type StorageKey = SmallVec<[u8; MAX_STORAGE_KEY_LEN]>;

/// Persisted fields of one child cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellPayload {
    pub extension: Option<Extension>,
    pub account_plain_key: Option<AccountKey>,
    pub storage_plain_key: Option<StorageKey>,
    pub hash: Option<B256>,
}

impl CellPayload {
    pub fn field_bits(&self) -> u8 {
        let mut bits = 0;
        if self.extension.is_some() {
            bits |= HASHEDKEY_PART;
        }
        if self.account_plain_key.is_some() {
            bits |= ACCOUNT_PLAIN_PART;
        }
        if self.storage_plain_key.is_some() {
            bits |= STORAGE_PLAIN_PART;
        }
        if self.hash.is_some() {
            bits |= HASH_PART;
        }
        bits
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.put_u8(self.field_bits());
        if let Some(extension) = &self.extension {
            encode_slice(out, extension);
        }
        if let Some(apk) = &self.account_plain_key {
            encode_slice(out, apk);
        }
        if let Some(spk) = &self.storage_plain_key {
            encode_slice(out, spk);
        }
        if let Some(hash) = &self.hash {
            encode_slice(out, hash.as_slice());
        }
    }

    fn decode(buf: &mut &[u8], start: usize) -> Result<Self, CommitmentError> {
        let malformed = |what: &'static str, rest: &[u8]| CommitmentError::MalformedEncodingAt {
            what,
            pos: start - rest.len(),
        };
        if !buf.has_remaining() {
            return Err(malformed("missing field bits", *buf));
        }
        let field_bits = buf.get_u8();
        if field_bits & !ALL_PARTS != 0 {
            return Err(malformed("unknown field bits", *buf));
        }

        let mut payload = Self::default();
        if field_bits & HASHEDKEY_PART != 0 {
            let field = decode_slice(buf, start)?;
            if field.len() > MAX_EXTENSION_LEN || field.iter().any(|&n| n > 0x0f) {
                return Err(malformed("extension", *buf));
            }
            payload.extension = (!field.is_empty()).then(|| Extension::from_slice(field));
        }
        if field_bits & ACCOUNT_PLAIN_PART != 0 {
            let field = decode_slice(buf, start)?;
            if field.len() > MAX_ACCOUNT_KEY_LEN {
                return Err(malformed("account plain key", *buf));
            }
            payload.account_plain_key = (!field.is_empty()).then(|| AccountKey::from_slice(field));
        }
        if field_bits & STORAGE_PLAIN_PART != 0 {
            let field = decode_slice(buf, start)?;
            if field.len() > MAX_STORAGE_KEY_LEN {
                return Err(malformed("storage plain key", *buf));
            }
            payload.storage_plain_key = (!field.is_empty()).then(|| StorageKey::from_slice(field));
        }
        if field_bits & HASH_PART != 0 {
            let field = decode_slice(buf, start)?;
            match field.len() {
                0 => {}
                32 => payload.hash = Some(B256::from_slice(field)),
                _ => return Err(malformed("hash", *buf)),
            }
        }
        Ok(payload)
    }
}

/// A decoded branch node update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchData {
    /// Children modified or deleted by the pass that produced this encoding.
    pub touch_map: NibbleSet,
    /// Children present after the pass.
    pub after_map: NibbleSet,
    /// Fields of every child in `touch_map & after_map`, ascending by nibble.
    pub payload: Vec<CellPayload>,
}

impl BranchData {
    /// Children carrying a payload entry.
    #[inline]
    pub fn payload_map(&self) -> NibbleSet {
        self.touch_map & self.after_map
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.payload.len() * 36);
        out.put_u16(self.touch_map.bits());
        out.put_u16(self.after_map.bits());
        for payload in &self.payload {
            payload.encode(&mut out);
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CommitmentError> {
        let start = data.len();
        let mut buf = data;
        if buf.remaining() < 4 {
            return Err(CommitmentError::MalformedEncoding("branch header too short"));
        }
        let touch_map = NibbleSet::from_bits(buf.get_u16());
        let after_map = NibbleSet::from_bits(buf.get_u16());

        let mut payload = Vec::with_capacity((touch_map & after_map).len());
        while buf.has_remaining() {
            payload.push(CellPayload::decode(&mut buf, start)?);
        }

        let branch = Self { touch_map, after_map, payload };
        if branch.payload.len() != branch.payload_map().len() {
            return Err(CommitmentError::MalformedEncoding(
                "branch payload count does not match its bitmaps",
            ));
        }
        Ok(branch)
    }

    /// Iterates payload entries together with the child nibble they belong to.
    pub fn children(&self) -> impl Iterator<Item = (u8, &CellPayload)> + '_ {
        self.payload_map().iter().zip(&self.payload)
    }
}

/// Combines two encodings of the same branch, `newer` coming after and shadowing `older`.
///
/// The result carries the union of both touch maps, the after map of `newer`, and for every
/// child present in `newer` the latest payload available.
pub fn merge_hex_branches(older: &[u8], newer: &[u8]) -> Result<Vec<u8>, CommitmentError> {
    let older = BranchData::decode(older)?;
    let newer = BranchData::decode(newer)?;

    let bitmap1 = older.payload_map();
    let bitmap2 = newer.payload_map();
    let mut from_older = older.children();
    let mut from_newer = newer.children();

    let mut merged = BranchData {
        touch_map: older.touch_map | newer.touch_map,
        after_map: newer.after_map,
        payload: Vec::with_capacity((bitmap1 | bitmap2).len()),
    };
    for nibble in (bitmap1 | bitmap2).iter() {
        let older_payload = if bitmap1.contains(nibble) { from_older.next() } else { None };
        let newer_payload = if bitmap2.contains(nibble) { from_newer.next() } else { None };
        match (older_payload, newer_payload) {
            (_, Some((_, payload))) => merged.payload.push(payload.clone()),
            (Some((_, payload)), None)
                if !newer.touch_map.contains(nibble) && newer.after_map.contains(nibble) =>
            {
                merged.payload.push(payload.clone())
            }
            _ => {}
        }
    }

    if merged.payload.len() != merged.payload_map().len() {
        return Err(CommitmentError::MalformedEncoding(
            "merged branch has children without payload",
        ));
    }
    Ok(merged.encode())
}

fn encode_uvarint(out: &mut Vec<u8>, mut x: u64) {
    while x >= 0x80 {
        out.put_u8(x as u8 | 0x80);
        x >>= 7;
    }
    out.put_u8(x as u8);
}

fn encode_slice(out: &mut Vec<u8>, s: &[u8]) {
    encode_uvarint(out, s.len() as u64);
    out.put_slice(s);
}

fn decode_uvarint(buf: &mut &[u8], start: usize) -> Result<u64, CommitmentError> {
    let mut x = 0u64;
    let mut shift = 0;
    for i in 0..10 {
        if !buf.has_remaining() {
            break;
        }
        let b = buf.get_u8();
        if b < 0x80 {
            if i == 9 && b > 1 {
                break;
            }
            return Ok(x | (u64::from(b) << shift));
        }
        x |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }
    Err(CommitmentError::MalformedEncodingAt { what: "uvarint", pos: start - buf.remaining() })
}

fn decode_slice<'a>(buf: &mut &'a [u8], start: usize) -> Result<&'a [u8], CommitmentError> {
    let len = decode_uvarint(buf, start)?;
    let data: &'a [u8] = *buf;
    if (data.len() as u64) < len {
        return Err(CommitmentError::MalformedEncodingAt {
            what: "field runs past the end of the branch",
            pos: start - data.len(),
        });
    }
    let (field, rest) = data.split_at(len as usize);
    *buf = rest;
    Ok(field)
}
