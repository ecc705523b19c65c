//! Incremental commitment engine over the hex Patricia hashed trie.
//!
//! The engine keeps a working grid of 128 rows by 16 columns. A pass walks the updated keys in
//! hashed order, unfolding stored branches into the grid on the way down and folding them back
//! into their parent cells on the way up, recomputing hashes only along touched paths.
use std::collections::{BTreeMap, HashMap, btree_map::Entry};

use bytes::Bytes;
use revm_primitives::B256;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::{
    branch::{
        AccountKey, BranchData, Extension, MAX_ACCOUNT_KEY_LEN, StorageKey, merge_hex_branches,
    },
    cell::{Cell, StorageValue},
    error::{CommitmentError, LookupError},
    hp::{ACCOUNT_DEPTH, Nibbles, hashed_key, lcp, to_encoded_path},
    lookup::{Account, AccountLookup, BranchLookup, StorageLookup},
    nibble_set::NibbleSet,
    rlp::{NodeRef, branch_hash},
    snapshot::{ROWS, StateSnapshot},
    update::{Update, UpdateFlags},
};

/// Account key length of Ethereum addresses.
pub const DEFAULT_ACCOUNT_KEY_LEN: usize = 20;

/// Branch encodings produced by one pass, keyed by the hex-prefix encoded nibble path.
pub type BranchUpdates = BTreeMap<Vec<u8>, Vec<u8>>;

/// Engine configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitmentConfig {
    /// Length in bytes of account plain keys, `1..=20`.
    pub account_key_len: usize,
    /// Emit per-step diagnostics through `tracing`.
    pub trace: bool,
}

impl Default for CommitmentConfig {
    fn default() -> Self {
        Self { account_key_len: DEFAULT_ACCOUNT_KEY_LEN, trace: false }
    }
}

type Row = [Cell; 16];

/// Cell address: the root, or a `(row, column)` position in the grid.
type CellPos = Option<(usize, u8)>;

pub struct HexPatriciaHashed<B, A, S> {
    branches: B,
    accounts: A,
    storage: S,
    account_key_len: usize,
    trace: bool,

    root: Cell,
    /// The store was already asked for a branch at the empty prefix.
    root_checked: bool,
    root_touched: bool,
    root_present: bool,

    grid: Vec<Row>,
    active_rows: usize,
    /// Nibble path to the branch of the deepest active row.
    current_key: Nibbles,
    depths: [usize; ROWS],
    touch_map: [NibbleSet; ROWS],
    after_map: [NibbleSet; ROWS],
    /// A stored branch was loaded for the row.
    branch_before: [bool; ROWS],
}

impl<B, A, S> core::fmt::Debug for HexPatriciaHashed<B, A, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HexPatriciaHashed")
            .field("account_key_len", &self.account_key_len)
            .field("root", &self.root)
            .field("root_checked", &self.root_checked)
            .field("root_touched", &self.root_touched)
            .field("root_present", &self.root_present)
            .field("active_rows", &self.active_rows)
            .field("current_key", &hex::encode(&self.current_key))
            .finish_non_exhaustive()
    }
}

impl<B, A, S> HexPatriciaHashed<B, A, S>
where
    B: BranchLookup,
    A: AccountLookup,
    S: StorageLookup,
{
    pub fn new(
        account_key_len: usize,
        branches: B,
        accounts: A,
        storage: S,
    ) -> Result<Self, CommitmentError> {
        let config = CommitmentConfig { account_key_len, ..Default::default() };
        Self::with_config(config, branches, accounts, storage)
    }

    pub fn with_config(
        config: CommitmentConfig,
        branches: B,
        accounts: A,
        storage: S,
    ) -> Result<Self, CommitmentError> {
        if config.account_key_len == 0 || config.account_key_len > MAX_ACCOUNT_KEY_LEN {
            return Err(CommitmentError::InvalidConfig(format!(
                "account key length {} outside 1..={MAX_ACCOUNT_KEY_LEN}",
                config.account_key_len
            )));
        }
        Ok(Self {
            branches,
            accounts,
            storage,
            account_key_len: config.account_key_len,
            trace: config.trace,
            root: Cell::default(),
            root_checked: false,
            root_touched: false,
            root_present: true,
            grid: (0..ROWS).map(|_| core::array::from_fn(|_| Cell::default())).collect(),
            active_rows: 0,
            current_key: Nibbles::new(),
            depths: [0; ROWS],
            touch_map: [NibbleSet::EMPTY; ROWS],
            after_map: [NibbleSet::EMPTY; ROWS],
            branch_before: [false; ROWS],
        })
    }

    pub fn account_key_len(&self) -> usize {
        self.account_key_len
    }

    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    /// Root cell as left by the last pass or restore.
    pub fn root_cell(&self) -> &Cell {
        &self.root
    }

    /// Discards the root, the grid and its bitmaps, keeping the lookups and the key length. The
    /// next pass starts from the stored root branch.
    pub fn reset(&mut self) {
        self.root = Cell::default();
        self.root_checked = false;
        self.root_touched = false;
        self.root_present = true;
        for row in 0..ROWS {
            self.clear_row(row);
        }
        self.depths = [0; ROWS];
        self.active_rows = 0;
        self.current_key.clear();
    }

    /// Replaces the lookup capabilities.
    pub fn reset_fns(&mut self, branches: B, accounts: A, storage: S) {
        self.branches = branches;
        self.accounts = accounts;
        self.storage = storage;
    }

    /// Commitment over the current state. Does not modify the engine.
    pub fn root_hash(&self) -> B256 {
        self.root.node_ref(0, self.account_key_len).digest()
    }

    /// Applies `updates` to the trie and returns the new root with the branch deltas.
    ///
    /// `plain_keys[i]` is the key of `updates[i]`. Only flagged fields are applied; the rest of
    /// an existing account keeps its stored values. A slot can only be written while its account
    /// exists in the account lookup or is set by the same batch.
    pub fn process_updates<K: AsRef<[u8]>>(
        &mut self,
        plain_keys: &[K],
        updates: &[Update],
    ) -> Result<(B256, BranchUpdates), CommitmentError> {
        if plain_keys.len() != updates.len() {
            return Err(CommitmentError::invariant(format!(
                "{} plain keys for {} updates",
                plain_keys.len(),
                updates.len()
            )));
        }
        self.begin_pass()?;
        let keys = self.sort_keys(plain_keys)?;
        self.check_storage_updates(plain_keys, updates)?;
        let mut branch_updates = BranchUpdates::new();
        for (hashed_key, idx) in keys {
            let plain_key = plain_keys[idx].as_ref();
            let mut update = updates[idx].clone();
            if update.flags.contains(UpdateFlags::BALANCE_INCREMENT) {
                let current = self.accounts.account(plain_key)?;
                update.resolve_increment(plain_key, current.as_ref())?;
            }
            if self.trace {
                debug!(plain_key = %hex::encode(plain_key), flags = update.flags.bits(), "update");
            }

            self.walk_to(&hashed_key, &mut branch_updates)?;
            if plain_key.len() == self.account_key_len {
                if update.is_delete() {
                    self.delete_cell(&hashed_key);
                    continue;
                }
                let cell = self.update_cell(&hashed_key)?;
                cell.apk = AccountKey::from_slice(plain_key);
                let mut account =
                    Account { nonce: cell.nonce, balance: cell.balance, code_hash: cell.code_hash };
                update.apply_to_account(&mut account);
                cell.set_account(Some(&account));
            } else if update.is_delete()
                || (update.flags.contains(UpdateFlags::STORAGE) && update.storage.is_empty())
            {
                self.delete_cell(&hashed_key);
            } else if update.flags.contains(UpdateFlags::STORAGE) {
                let cell = self.update_cell(&hashed_key)?;
                cell.spk = StorageKey::from_slice(plain_key);
                cell.storage = update.storage.clone();
            }
        }
        self.fold_to_root(&mut branch_updates)?;
        Ok((self.root_hash(), branch_updates))
    }

    /// Recomputes the trie for `plain_keys`, reading their current values from the lookups.
    ///
    /// Keys the lookups do not know (or storage slots with an empty value) are deleted. A stored
    /// slot whose account the lookup does not know fails the pass with
    /// [`LookupError::UnknownAccount`].
    pub fn process_keys<K: AsRef<[u8]>>(
        &mut self,
        plain_keys: &[K],
    ) -> Result<(B256, BranchUpdates), CommitmentError> {
        self.begin_pass()?;
        let mut branch_updates = BranchUpdates::new();
        for (hashed_key, idx) in self.sort_keys(plain_keys)? {
            let plain_key = plain_keys[idx].as_ref();
            self.walk_to(&hashed_key, &mut branch_updates)?;
            if plain_key.len() == self.account_key_len {
                match self.accounts.account(plain_key)? {
                    Some(account) => {
                        let cell = self.update_cell(&hashed_key)?;
                        cell.apk = AccountKey::from_slice(plain_key);
                        cell.set_account(Some(&account));
                    }
                    None => self.delete_cell(&hashed_key),
                }
            } else {
                match self.storage.storage(plain_key)? {
                    Some(value) if !value.is_empty() => {
                        let owner = &plain_key[..self.account_key_len];
                        if self.accounts.account(owner)?.is_none() {
                            return Err(unknown_account(owner));
                        }
                        let cell = self.update_cell(&hashed_key)?;
                        cell.spk = StorageKey::from_slice(plain_key);
                        cell.storage = StorageValue::from_slice(&value);
                    }
                    _ => self.delete_cell(&hashed_key),
                }
            }
        }
        self.fold_to_root(&mut branch_updates)?;
        Ok((self.root_hash(), branch_updates))
    }

    /// Appends the encoded working state to `buf`. Only valid between passes.
    pub fn encode_current_state(&self, buf: Vec<u8>) -> Result<Vec<u8>, CommitmentError> {
        if self.active_rows != 0 {
            return Err(CommitmentError::invariant("cannot encode state with active rows"));
        }
        let snapshot = StateSnapshot {
            root: self.root.structural(),
            root_present: self.root_present,
            root_checked: self.root_checked,
            root_touched: self.root_touched,
            depths: core::array::from_fn(|row| self.depths[row] as u8),
            touch_map: self.touch_map,
            after_map: self.after_map,
            branch_before: self.branch_before,
        };
        Ok(snapshot.encode(buf))
    }

    /// Restores a state produced by [`Self::encode_current_state`], reloading the root's values
    /// from the lookups.
    pub fn set_state(&mut self, data: &[u8]) -> Result<(), CommitmentError> {
        if self.active_rows != 0 {
            return Err(CommitmentError::invariant("cannot restore state with active rows"));
        }
        let snapshot = StateSnapshot::decode(data)?;
        let mut root = snapshot.root;
        if !root.apk.is_empty() {
            root.set_account(self.accounts.account(&root.apk)?.as_ref());
        }
        if root.has_storage_key(self.account_key_len) {
            root.storage = self
                .storage
                .storage(&root.spk)?
                .map(|value| StorageValue::from_slice(&value))
                .unwrap_or_default();
        }

        self.root = root;
        self.root_present = snapshot.root_present;
        self.root_checked = snapshot.root_checked;
        self.root_touched = snapshot.root_touched;
        self.depths = snapshot.depths.map(usize::from);
        self.touch_map = snapshot.touch_map;
        self.after_map = snapshot.after_map;
        self.branch_before = snapshot.branch_before;
        self.current_key.clear();
        Ok(())
    }

    fn begin_pass(&self) -> Result<(), CommitmentError> {
        if self.active_rows != 0 {
            return Err(CommitmentError::invariant(
                "previous pass did not complete, reset or restore the engine",
            ));
        }
        Ok(())
    }

    /// Rejects storage updates carrying account fields and slot writes for accounts that do not
    /// exist once the batch is applied.
    fn check_storage_updates<K: AsRef<[u8]>>(
        &self,
        plain_keys: &[K],
        updates: &[Update],
    ) -> Result<(), CommitmentError> {
        let account_fields = UpdateFlags::BALANCE
            | UpdateFlags::NONCE
            | UpdateFlags::CODE
            | UpdateFlags::BALANCE_INCREMENT;
        // presence of each account the batch touches, the last update for a key wins
        let batch_accounts: HashMap<&[u8], bool> = plain_keys
            .iter()
            .zip(updates)
            .filter(|(key, _)| key.as_ref().len() == self.account_key_len)
            .map(|(key, update)| (key.as_ref(), !update.is_delete()))
            .collect();

        for (plain_key, update) in plain_keys.iter().zip(updates) {
            let plain_key = plain_key.as_ref();
            if plain_key.len() == self.account_key_len || update.is_delete() {
                continue;
            }
            if update.flags.intersects(account_fields) {
                return Err(CommitmentError::invariant(format!(
                    "account fields set on storage key {}",
                    hex::encode(plain_key)
                )));
            }
            if !update.flags.contains(UpdateFlags::STORAGE) || update.storage.is_empty() {
                continue;
            }
            let owner = &plain_key[..self.account_key_len];
            let exists = match batch_accounts.get(owner) {
                Some(&present) => present,
                None => self.accounts.account(owner)?.is_some(),
            };
            if !exists {
                return Err(unknown_account(owner));
            }
        }
        Ok(())
    }

    /// Hashed keys paired with their input index, stably sorted by hashed key.
    fn sort_keys<K: AsRef<[u8]>>(
        &self,
        plain_keys: &[K],
    ) -> Result<Vec<(Nibbles, usize)>, CommitmentError> {
        let account_key_len = self.account_key_len;
        let mut keys = plain_keys
            .iter()
            .enumerate()
            .map(|(idx, key)| {
                let key = key.as_ref();
                if key.len() < account_key_len || key.len() > account_key_len + 32 {
                    let len = key.len();
                    return Err(CommitmentError::InvalidPlainKey { len, account_key_len });
                }
                Ok((hashed_key(key, account_key_len), idx))
            })
            .collect::<Result<Vec<_>, _>>()?;
        keys.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(keys)
    }

    /// Folds rows off the path and unfolds stored structure until the grid reaches `hashed_key`.
    fn walk_to(
        &mut self,
        hashed_key: &[u8],
        branch_updates: &mut BranchUpdates,
    ) -> Result<(), CommitmentError> {
        while self.need_folding(hashed_key) {
            self.fold(branch_updates)?;
        }
        loop {
            let unfolding = self.need_unfolding(hashed_key);
            if unfolding == 0 {
                return Ok(());
            }
            self.unfold(hashed_key, unfolding)?;
        }
    }

    fn fold_to_root(&mut self, branch_updates: &mut BranchUpdates) -> Result<(), CommitmentError> {
        while self.active_rows > 0 {
            self.fold(branch_updates)?;
        }
        if self.trace {
            debug!(root = %self.root_hash(), branches = branch_updates.len(), "pass complete");
        }
        Ok(())
    }

    fn cell_mut(&mut self, pos: CellPos) -> &mut Cell {
        match pos {
            None => &mut self.root,
            Some((row, col)) => &mut self.grid[row][col as usize],
        }
    }

    fn clear_row(&mut self, row: usize) {
        self.grid[row].iter_mut().for_each(|cell| *cell = Cell::default());
        self.touch_map[row] = NibbleSet::EMPTY;
        self.after_map[row] = NibbleSet::EMPTY;
        self.branch_before[row] = false;
    }

    fn need_folding(&self, hashed_key: &[u8]) -> bool {
        self.active_rows > 0
            && (self.current_key.len() >= hashed_key.len()
                || !hashed_key.starts_with(&self.current_key))
    }

    /// Number of nibbles to unfold below the current position towards `hashed_key`, 0 if the
    /// grid already reaches it.
    fn need_unfolding(&self, hashed_key: &[u8]) -> usize {
        let (cell, depth) = if self.active_rows == 0 {
            if self.root.is_empty() && !self.root_checked {
                return 1;
            }
            (&self.root, 0)
        } else {
            let row = self.active_rows - 1;
            let col = hashed_key[self.current_key.len()];
            (&self.grid[row][col as usize], self.depths[row])
        };
        if hashed_key.len() <= depth {
            return 0;
        }
        if cell.down_hashed_key.is_empty() {
            return usize::from(cell.h.is_some());
        }

        let cpl = lcp(&hashed_key[depth..], &cell.down_hashed_key);
        let mut unfolding = cpl + 1;
        if depth < ACCOUNT_DEPTH && depth + unfolding > ACCOUNT_DEPTH {
            // storage subtries always start on a fresh row
            unfolding = ACCOUNT_DEPTH - depth;
        }
        if self.trace {
            let down = hex::encode(&cell.down_hashed_key);
            trace!(depth, cpl, unfolding, %down, "need unfolding");
        }
        unfolding
    }

    fn unfold(&mut self, hashed_key: &[u8], unfolding: usize) -> Result<(), CommitmentError> {
        let (up_cell, touched, present, up_depth) = if self.active_rows == 0 {
            if self.root_checked && self.root.is_empty() {
                return Ok(());
            }
            (self.root.clone(), self.root_touched, self.root_present, 0)
        } else {
            let up_row = self.active_rows - 1;
            let up_depth = self.depths[up_row];
            let col = hashed_key[up_depth - 1];
            self.current_key.push(col);
            (
                self.grid[up_row][col as usize].clone(),
                self.touch_map[up_row].contains(col),
                self.after_map[up_row].contains(col),
                up_depth,
            )
        };
        let row = self.active_rows;
        if row >= ROWS {
            return Err(CommitmentError::invariant("unfolding past the last row"));
        }
        self.clear_row(row);

        let depth = if up_cell.down_hashed_key.is_empty() {
            let depth = up_depth + 1;
            self.unfold_branch_node(row, touched && !present, depth)?;
            depth
        } else {
            let increment = unfolding.min(up_cell.down_hashed_key.len());
            let depth = up_depth + increment;
            let nibble = up_cell.down_hashed_key[increment - 1];
            if touched {
                self.touch_map[row].insert(nibble);
            }
            if present {
                self.after_map[row].insert(nibble);
            }
            self.grid[row][nibble as usize].fill_from_upper_cell(&up_cell, depth, increment);
            self.current_key.extend_from_slice(&up_cell.down_hashed_key[..increment - 1]);
            depth
        };
        if self.trace {
            trace!(row, up_depth, depth, touched, present, "unfold");
        }
        self.depths[row] = depth;
        self.active_rows += 1;
        Ok(())
    }

    /// Loads the stored branch at the current key into `row`.
    fn unfold_branch_node(
        &mut self,
        row: usize,
        deleted: bool,
        depth: usize,
    ) -> Result<(), CommitmentError> {
        let prefix = to_encoded_path(&self.current_key, false);
        let is_root = self.current_key.is_empty();
        let Some(encoded) = self.branches.branch(&prefix)? else {
            if is_root && !self.root_checked {
                // empty trie
                self.root_checked = true;
                return Ok(());
            }
            return Err(CommitmentError::invariant(format!(
                "missing branch at prefix {}",
                hex::encode(&prefix)
            )));
        };
        if is_root {
            self.root_checked = true;
        }

        let branch = BranchData::decode(&encoded)?;
        let bitmap = branch.after_map;
        if branch.payload.len() != bitmap.len() {
            return Err(CommitmentError::invariant(format!(
                "branch at prefix {} holds {} children for after map {bitmap:016b}",
                hex::encode(&prefix),
                branch.payload.len()
            )));
        }
        self.branch_before[row] = true;
        if deleted {
            self.touch_map[row] = bitmap;
            self.after_map[row] = NibbleSet::EMPTY;
        } else {
            self.touch_map[row] = NibbleSet::EMPTY;
            self.after_map[row] = bitmap;
        }

        for (nibble, payload) in bitmap.iter().zip(&branch.payload) {
            let cell = &mut self.grid[row][nibble as usize];
            cell.fill_from_fields(payload);
            if !cell.apk.is_empty() {
                cell.set_account(self.accounts.account(&cell.apk)?.as_ref());
            }
            if cell.has_storage_key(self.account_key_len) {
                cell.storage = self
                    .storage
                    .storage(&cell.spk)?
                    .map(|value| StorageValue::from_slice(&value))
                    .unwrap_or_default();
            }
            cell.derive_hashed_keys(depth, self.account_key_len)?;
            if self.trace {
                trace!(
                    row,
                    nibble,
                    depth,
                    hash = ?cell.h,
                    down = %hex::encode(&cell.down_hashed_key),
                    "loaded cell"
                );
            }
        }
        Ok(())
    }

    /// Moves the deepest row into its parent cell, emitting the row's branch delta.
    fn fold(&mut self, branch_updates: &mut BranchUpdates) -> Result<(), CommitmentError> {
        if self.active_rows == 0 {
            return Err(CommitmentError::invariant("fold without active rows"));
        }
        let row = self.active_rows - 1;
        let depth = self.depths[row];
        let (up, up_depth, col): (CellPos, usize, u8) = if row == 0 {
            (None, 0, 0)
        } else {
            let up_depth = self.depths[row - 1];
            let col = self.current_key[up_depth - 1];
            (Some((row - 1, col)), up_depth, col)
        };
        let update_key = to_encoded_path(&self.current_key, false);
        let mut touch = self.touch_map[row];
        let after = self.after_map[row];
        if self.trace {
            trace!(
                row,
                depth,
                up_depth,
                touch = %format_args!("{touch:016b}"),
                after = %format_args!("{after:016b}"),
                "fold"
            );
        }

        let mut branch = None;
        match after.len() {
            0 => {
                if !touch.is_empty() {
                    if row == 0 {
                        self.root_touched = true;
                        self.root_present = false;
                    } else if up_depth == ACCOUNT_DEPTH {
                        // the account survives with an empty storage trie
                        self.touch_map[row - 1].insert(col);
                    } else {
                        self.touch_map[row - 1].insert(col);
                        self.after_map[row - 1].remove(col);
                    }
                }
                let up_cell = self.cell_mut(up);
                if up.is_some() && up_depth == ACCOUNT_DEPTH {
                    up_cell.h = None;
                    up_cell.spk.clear();
                    up_cell.storage.clear();
                    up_cell.extension.clear();
                    up_cell.down_hashed_key.clear();
                } else {
                    *up_cell = Cell::default();
                }
                if self.branch_before[row] {
                    branch = Some(BranchData { touch_map: touch, ..Default::default() });
                }
            }
            1 => {
                self.propagate_touch(row, col, touch);
                let nibble = after
                    .first()
                    .ok_or_else(|| CommitmentError::invariant("after map lost its only child"))?;
                let low = self.grid[row][nibble as usize].clone();
                let up_cell = match up {
                    None => &mut self.root,
                    Some((r, c)) => &mut self.grid[r][c as usize],
                };
                up_cell.fill_from_lower_cell(&low, depth, &self.current_key[up_depth..], nibble);
                up_cell.delete = false;
                if self.branch_before[row] {
                    branch = Some(BranchData { touch_map: touch, ..Default::default() });
                }
            }
            _ => {
                self.propagate_touch(row, col, touch);
                let mut payload_map = touch & after;
                if !self.branch_before[row] {
                    // a new branch persists every child
                    touch |= after;
                    payload_map |= after;
                    self.touch_map[row] = touch;
                }

                let cells = &self.grid[row];
                let children: Vec<NodeRef> = after
                    .iter()
                    .map(|nibble| cells[nibble as usize].node_ref(depth, self.account_key_len))
                    .collect();
                let h = branch_hash(after, &children);
                if self.trace {
                    trace!(row, depth, hash = %h, "branch");
                }
                if !touch.is_empty() {
                    branch = Some(BranchData {
                        touch_map: touch,
                        after_map: after,
                        payload: payload_map
                            .iter()
                            .map(|nibble| cells[nibble as usize].to_payload())
                            .collect(),
                    });
                }

                let extension = &self.current_key[up_depth..depth - 1];
                let up_cell = match up {
                    None => &mut self.root,
                    Some((r, c)) => &mut self.grid[r][c as usize],
                };
                up_cell.h = Some(h);
                up_cell.extension = Extension::from_slice(extension);
                up_cell.down_hashed_key = Nibbles::from_slice(extension);
                if up_depth < ACCOUNT_DEPTH {
                    up_cell.apk.clear();
                }
                up_cell.spk.clear();
                up_cell.storage.clear();
                up_cell.delete = false;
            }
        }

        self.active_rows -= 1;
        self.current_key.truncate(up_depth.saturating_sub(1));

        if let Some(branch) = branch {
            let encoded = branch.encode();
            if self.trace {
                let key = hex::encode(&update_key);
                trace!(%key, branch = %hex::encode(&encoded), "branch update");
            }
            match branch_updates.entry(update_key) {
                Entry::Vacant(entry) => {
                    entry.insert(encoded);
                }
                Entry::Occupied(mut entry) => {
                    let merged = merge_hex_branches(entry.get(), &encoded)?;
                    entry.insert(merged);
                }
            }
        }
        Ok(())
    }

    /// Marks the parent of a folding row as modified when anything below it was.
    fn propagate_touch(&mut self, row: usize, col: u8, touch: NibbleSet) {
        if row == 0 {
            if !touch.is_empty() {
                self.root_touched = true;
            }
            self.root_present = true;
        } else if !touch.is_empty() {
            self.touch_map[row - 1].insert(col);
        }
    }

    /// Activates the cell for `hashed_key` in the deepest row and marks it present.
    fn update_cell(&mut self, hashed_key: &[u8]) -> Result<&mut Cell, CommitmentError> {
        if self.active_rows == 0 {
            self.clear_row(0);
            self.depths[0] = 1;
            self.active_rows = 1;
        }
        let row = self.active_rows - 1;
        let depth = self.depths[row];
        let col = *hashed_key
            .get(self.current_key.len())
            .ok_or_else(|| CommitmentError::invariant("key shorter than the current path"))?;
        if !self.after_map[row].contains(col) {
            self.grid[row][col as usize] = Cell::default();
        }
        self.touch_map[row].insert(col);
        self.after_map[row].insert(col);
        if self.trace {
            trace!(row, col, depth, "update cell");
        }

        let cell = &mut self.grid[row][col as usize];
        if cell.down_hashed_key.is_empty() {
            cell.down_hashed_key.extend_from_slice(&hashed_key[depth..]);
        }
        cell.delete = false;
        Ok(cell)
    }

    fn delete_cell(&mut self, hashed_key: &[u8]) {
        let pos = if self.active_rows == 0 {
            self.root_touched = true;
            self.root_present = false;
            None
        } else {
            let row = self.active_rows - 1;
            if self.depths[row] < hashed_key.len() {
                if self.trace {
                    trace!(row, depth = self.depths[row], "skipping delete of absent key");
                }
                return;
            }
            let col = hashed_key[self.current_key.len()];
            if self.after_map[row].contains(col) {
                self.touch_map[row].insert(col);
                self.after_map[row].remove(col);
            }
            if self.trace {
                trace!(row, col, "delete cell");
            }
            Some((row, col))
        };
        let cell = self.cell_mut(pos);
        cell.extension.clear();
        cell.clear_account();
        cell.delete = true;
    }
}

fn unknown_account(plain_key: &[u8]) -> CommitmentError {
    LookupError::UnknownAccount(Bytes::copy_from_slice(plain_key)).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mem_state::InMemoryState, update::UpdateBuilder};
    use reth_trie::EMPTY_ROOT_HASH;
    use revm_primitives::U256;

    type Engine = HexPatriciaHashed<InMemoryState, InMemoryState, InMemoryState>;

    fn engine(account_key_len: usize) -> Engine {
        let state = InMemoryState::default();
        HexPatriciaHashed::new(account_key_len, state.clone(), state.clone(), state).unwrap()
    }

    #[test]
    fn test_config_bounds() {
        let state = InMemoryState::default();
        for len in [0, MAX_ACCOUNT_KEY_LEN + 1] {
            let err = Engine::new(len, state.clone(), state.clone(), state.clone()).unwrap_err();
            assert!(matches!(err, CommitmentError::InvalidConfig(_)));
        }
        let config: CommitmentConfig = serde_json::from_str("{\"trace\":true}").unwrap();
        assert_eq!(config.account_key_len, DEFAULT_ACCOUNT_KEY_LEN);
        assert!(config.trace);
    }

    #[test]
    fn test_fresh_engine_is_empty() {
        let hph = engine(20);
        assert_eq!(hph.root_hash(), EMPTY_ROOT_HASH);
        assert!(hph.root_present && !hph.root_checked && !hph.root_touched);
    }

    #[test]
    fn test_empty_pass_on_empty_trie() {
        let mut hph = engine(1);
        let keys: [&[u8]; 0] = [];
        let (root, updates) = hph.process_keys(&keys).unwrap();
        assert_eq!(root, EMPTY_ROOT_HASH);
        assert!(updates.is_empty());
    }

    #[test]
    fn test_mismatched_inputs() {
        let mut hph = engine(1);
        let err = hph.process_updates(&[[0u8]], &[]).unwrap_err();
        assert!(matches!(err, CommitmentError::InvariantViolation(_)));
        let err = hph.process_updates(&[[0u8; 0]], &[Update::default()]).unwrap_err();
        assert!(matches!(err, CommitmentError::InvalidPlainKey { len: 0, account_key_len: 1 }));
        let err = hph.process_keys(&[vec![0u8; 34]]).unwrap_err();
        assert!(matches!(err, CommitmentError::InvalidPlainKey { len: 34, .. }));
    }

    #[test]
    fn test_reset_matches_fresh_engine() -> Result<(), CommitmentError> {
        let state = InMemoryState::new(1);
        let mut hph = Engine::new(1, state.clone(), state.clone(), state.clone())?;
        let (keys, updates) = UpdateBuilder::new(1)
            .balance([0x00], U256::from(4u64))
            .balance([0x01], U256::from(5u64))
            .balance([0x03], U256::from(7u64))
            .build()?;
        let (root, branch_updates) = hph.process_updates(&keys, &updates)?;
        state.apply_plain_updates(&keys, &updates)?;
        state.apply_branch_node_updates(&branch_updates)?;
        assert!(hph.touch_map.iter().any(|touch| !touch.is_empty()));

        hph.reset();
        let fresh = engine(1).encode_current_state(Vec::new())?;
        assert_eq!(hph.encode_current_state(Vec::new())?, fresh);
        assert!(hph.grid.iter().flatten().all(|cell| *cell == Cell::default()));

        // the next pass reloads the root branch from the store
        assert_eq!(hph.process_keys(&[[0x01u8]])?.0, root);
        Ok(())
    }

    #[test]
    fn test_aborted_pass_requires_reset() {
        let mut hph = engine(1);
        hph.active_rows = 1;
        assert!(hph.encode_current_state(Vec::new()).is_err());
        assert!(hph.set_state(&[]).is_err());
        let keys: [&[u8]; 0] = [];
        assert!(hph.process_keys(&keys).is_err());
        hph.reset();
        assert!(hph.process_keys(&keys).is_ok());
    }
}
