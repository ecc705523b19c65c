use std::collections::HashMap;

use revm_primitives::{B256, U256};

use crate::{
    cell::StorageValue,
    error::{CommitmentError, LookupError},
    hp::{Nibbles, hashed_key},
    lookup::Account,
};

/// Which fields of an [`Update`] are set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UpdateFlags(u8);

impl UpdateFlags {
    pub const NONE: Self = Self(0);
    pub const DELETE: Self = Self(1);
    pub const BALANCE: Self = Self(2);
    pub const NONCE: Self = Self(4);
    pub const CODE: Self = Self(8);
    pub const STORAGE: Self = Self(16);
    /// `balance` holds a delta to add to the stored balance.
    pub const BALANCE_INCREMENT: Self = Self(32);

    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl core::ops::BitOr for UpdateFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for UpdateFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A pending mutation of one account or storage slot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Update {
    pub flags: UpdateFlags,
    pub balance: U256,
    pub nonce: u64,
    pub code_hash: B256,
    /// New slot value; empty means the slot is cleared.
    pub storage: StorageValue,
    /// Hashed nibble path of the key, filled in by [`UpdateBuilder::build`].
    pub hashed_key: Nibbles,
}

impl Update {
    pub fn is_delete(&self) -> bool {
        self.flags.contains(UpdateFlags::DELETE)
    }

    /// Turns a balance increment into a plain balance set against the current account.
    ///
    /// Fails when the account is unknown, unless the balance is also set explicitly.
    pub fn resolve_increment(
        &mut self,
        plain_key: &[u8],
        current: Option<&Account>,
    ) -> Result<(), LookupError> {
        if !self.flags.contains(UpdateFlags::BALANCE_INCREMENT) {
            return Ok(());
        }
        let current = current
            .ok_or_else(|| LookupError::UnknownAccount(plain_key.to_vec().into()))?;
        self.balance = current.balance.saturating_add(self.balance);
        self.flags.remove(UpdateFlags::BALANCE_INCREMENT);
        self.flags.insert(UpdateFlags::BALANCE);
        Ok(())
    }

    /// Applies the flagged account fields onto `account`.
    pub fn apply_to_account(&self, account: &mut Account) {
        if self.flags.contains(UpdateFlags::BALANCE) {
            account.balance = self.balance;
        }
        if self.flags.contains(UpdateFlags::NONCE) {
            account.nonce = self.nonce;
        }
        if self.flags.contains(UpdateFlags::CODE) {
            account.code_hash = self.code_hash;
        }
    }
}

/// Accumulates updates keyed by plain key, keeping the order in which keys were first seen.
///
/// Repeated calls for the same key merge into one [`Update`].
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    account_key_len: usize,
    keys: Vec<Vec<u8>>,
    updates: Vec<Update>,
    index: HashMap<Vec<u8>, usize>,
}

impl Default for UpdateBuilder {
    fn default() -> Self {
        Self::new(crate::hph::DEFAULT_ACCOUNT_KEY_LEN)
    }
}

impl UpdateBuilder {
    pub fn new(account_key_len: usize) -> Self {
        Self { account_key_len, keys: Vec::new(), updates: Vec::new(), index: HashMap::new() }
    }

    fn entry(&mut self, plain_key: &[u8]) -> &mut Update {
        let idx = match self.index.get(plain_key) {
            Some(&idx) => idx,
            None => {
                self.index.insert(plain_key.to_vec(), self.keys.len());
                self.keys.push(plain_key.to_vec());
                self.updates.push(Update::default());
                self.updates.len() - 1
            }
        };
        &mut self.updates[idx]
    }

    fn set(&mut self, plain_key: &[u8], flag: UpdateFlags) -> &mut Update {
        let update = self.entry(plain_key);
        update.flags.remove(UpdateFlags::DELETE);
        update.flags.insert(flag);
        update
    }

    pub fn balance(mut self, account: impl AsRef<[u8]>, balance: U256) -> Self {
        let update = self.set(account.as_ref(), UpdateFlags::BALANCE);
        update.flags.remove(UpdateFlags::BALANCE_INCREMENT);
        update.balance = balance;
        self
    }

    /// Adds `delta` to the balance the account has in the state store when processed.
    pub fn increment_balance(mut self, account: impl AsRef<[u8]>, delta: U256) -> Self {
        let update = self.entry(account.as_ref());
        update.flags.remove(UpdateFlags::DELETE);
        if !update.flags.contains(UpdateFlags::BALANCE) {
            update.flags.insert(UpdateFlags::BALANCE_INCREMENT);
        }
        update.balance = update.balance.saturating_add(delta);
        self
    }

    pub fn nonce(mut self, account: impl AsRef<[u8]>, nonce: u64) -> Self {
        self.set(account.as_ref(), UpdateFlags::NONCE).nonce = nonce;
        self
    }

    pub fn code_hash(mut self, account: impl AsRef<[u8]>, code_hash: B256) -> Self {
        self.set(account.as_ref(), UpdateFlags::CODE).code_hash = code_hash;
        self
    }

    pub fn storage(
        mut self,
        account: impl AsRef<[u8]>,
        location: impl AsRef<[u8]>,
        value: impl AsRef<[u8]>,
    ) -> Self {
        let mut plain_key = account.as_ref().to_vec();
        plain_key.extend_from_slice(location.as_ref());
        let update = self.set(&plain_key, UpdateFlags::STORAGE);
        update.storage = StorageValue::from_slice(value.as_ref());
        self
    }

    /// Deletes an account or, given an account key followed by a location, a storage slot.
    pub fn delete(mut self, plain_key: impl AsRef<[u8]>) -> Self {
        let update = self.entry(plain_key.as_ref());
        let hashed_key = core::mem::take(&mut update.hashed_key);
        *update = Update { flags: UpdateFlags::DELETE, hashed_key, ..Default::default() };
        self
    }

    /// Returns plain keys and updates in authored order, each update carrying its hashed key.
    pub fn build(mut self) -> Result<(Vec<Vec<u8>>, Vec<Update>), CommitmentError> {
        for (key, update) in self.keys.iter().zip(self.updates.iter_mut()) {
            if key.len() < self.account_key_len
                || key.len() > self.account_key_len + 32
                || self.account_key_len == 0
            {
                return Err(CommitmentError::InvalidPlainKey {
                    len: key.len(),
                    account_key_len: self.account_key_len,
                });
            }
            update.hashed_key = hashed_key(key, self.account_key_len);
        }
        Ok((self.keys, self.updates))
    }
}
