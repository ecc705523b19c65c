//! Checkpoint of the engine's working set.
//!
//! Layout (all integers big-endian):
//! ```text
//! root_len u16 | root cell (root_len bytes: 0 or Cell::ENCODED_LEN)
//! root_flags u8 (present = 1, checked = 2, touched = 4)
//! depths [u8; 128]
//! touch_map [u16; 128]
//! after_map [u16; 128]
//! branch_before [u64; 2] (row i is bit i % 64 of word i / 64)
//! ```
use bytes::{Buf, BufMut};

use crate::{cell::Cell, error::CommitmentError, nibble_set::NibbleSet};

/// Number of rows in the working grid, one per nibble of the longest hashed key.
pub const ROWS: usize = 128;

const ROOT_PRESENT: u8 = 1;
const ROOT_CHECKED: u8 = 2;
const ROOT_TOUCHED: u8 = 4;

const FIXED_LEN: usize = 2 + 1 + ROWS + 2 * ROWS + 2 * ROWS + 2 * 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateSnapshot {
    /// Structural fields of the root cell.
    pub root: Cell,
    pub root_present: bool,
    pub root_checked: bool,
    pub root_touched: bool,
    pub depths: [u8; ROWS],
    pub touch_map: [NibbleSet; ROWS],
    pub after_map: [NibbleSet; ROWS],
    pub branch_before: [bool; ROWS],
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            root: Cell::default(),
            root_present: true,
            root_checked: false,
            root_touched: false,
            depths: [0; ROWS],
            touch_map: [NibbleSet::EMPTY; ROWS],
            after_map: [NibbleSet::EMPTY; ROWS],
            branch_before: [false; ROWS],
        }
    }
}

impl StateSnapshot {
    /// Appends the encoding to `buf` and returns it.
    pub fn encode(&self, mut buf: Vec<u8>) -> Vec<u8> {
        buf.reserve(FIXED_LEN + Cell::ENCODED_LEN);

        buf.put_u16(Cell::ENCODED_LEN as u16);
        buf.put_slice(&self.root.encode());

        let mut flags = 0;
        if self.root_present {
            flags |= ROOT_PRESENT;
        }
        if self.root_checked {
            flags |= ROOT_CHECKED;
        }
        if self.root_touched {
            flags |= ROOT_TOUCHED;
        }
        buf.put_u8(flags);

        buf.put_slice(&self.depths);
        for map in &self.touch_map {
            buf.put_u16(map.bits());
        }
        for map in &self.after_map {
            buf.put_u16(map.bits());
        }
        let mut before = [0u64; 2];
        for (row, _) in self.branch_before.iter().enumerate().filter(|(_, existed)| **existed) {
            before[row / 64] |= 1 << (row % 64);
        }
        buf.put_u64(before[0]);
        buf.put_u64(before[1]);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, CommitmentError> {
        let mut buf = data;
        if buf.remaining() < 2 {
            return Err(CommitmentError::MalformedEncoding("state snapshot too short"));
        }
        let root_len = buf.get_u16() as usize;
        if root_len != 0 && root_len != Cell::ENCODED_LEN {
            return Err(CommitmentError::MalformedEncoding("state snapshot root length"));
        }
        if data.len() != FIXED_LEN + root_len {
            return Err(CommitmentError::MalformedEncoding("state snapshot length"));
        }

        let mut state = Self::default();
        if root_len != 0 {
            state.root = Cell::decode(&buf[..root_len])?;
            buf.advance(root_len);
        }

        let flags = buf.get_u8();
        if flags & !(ROOT_PRESENT | ROOT_CHECKED | ROOT_TOUCHED) != 0 {
            return Err(CommitmentError::MalformedEncoding("state snapshot root flags"));
        }
        state.root_present = flags & ROOT_PRESENT != 0;
        state.root_checked = flags & ROOT_CHECKED != 0;
        state.root_touched = flags & ROOT_TOUCHED != 0;

        buf.copy_to_slice(&mut state.depths);
        if state.depths.iter().any(|&depth| depth as usize > ROWS) {
            return Err(CommitmentError::MalformedEncoding("state snapshot depth"));
        }
        for map in state.touch_map.iter_mut() {
            *map = NibbleSet::from_bits(buf.get_u16());
        }
        for map in state.after_map.iter_mut() {
            *map = NibbleSet::from_bits(buf.get_u16());
        }
        let before = [buf.get_u64(), buf.get_u64()];
        for (row, existed) in state.branch_before.iter_mut().enumerate() {
            *existed = before[row / 64] & (1 << (row % 64)) != 0;
        }
        debug_assert!(!buf.has_remaining());
        Ok(state)
    }
}
