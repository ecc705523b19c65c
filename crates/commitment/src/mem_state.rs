//! In-memory account, storage and branch store for tests and tooling.
use std::{collections::BTreeMap, sync::Arc};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::{
    branch::{BranchData, merge_hex_branches},
    error::{CommitmentError, LookupError},
    hph::BranchUpdates,
    lookup::{Account, AccountLookup, BranchLookup, StorageLookup},
    update::{Update, UpdateFlags},
};

/// Cloneable handle to a shared in-memory store.
///
/// Every clone sees the same data, so one store can back all three lookup capabilities of an
/// engine (or of several engines).
#[derive(Debug, Clone)]
pub struct InMemoryState {
    inner: Arc<RwLock<StateInner>>,
    account_key_len: usize,
}

#[derive(Debug, Default)]
struct StateInner {
    accounts: BTreeMap<Vec<u8>, Account>,
    storage: BTreeMap<Vec<u8>, Bytes>,
    branches: BTreeMap<Vec<u8>, Bytes>,
}

impl Default for InMemoryState {
    fn default() -> Self {
        Self::new(crate::hph::DEFAULT_ACCOUNT_KEY_LEN)
    }
}

impl InMemoryState {
    pub fn new(account_key_len: usize) -> Self {
        Self { inner: Arc::default(), account_key_len }
    }

    pub fn account_count(&self) -> usize {
        self.inner.read().accounts.len()
    }

    pub fn storage_count(&self) -> usize {
        self.inner.read().storage.len()
    }

    pub fn branch_count(&self) -> usize {
        self.inner.read().branches.len()
    }

    /// Applies plain updates in order. Balance increments are resolved against the stored
    /// balance; an increment of an unknown account fails.
    pub fn apply_plain_updates<K: AsRef<[u8]>>(
        &self,
        plain_keys: &[K],
        updates: &[Update],
    ) -> Result<(), CommitmentError> {
        if plain_keys.len() != updates.len() {
            return Err(CommitmentError::invariant(format!(
                "{} plain keys for {} updates",
                plain_keys.len(),
                updates.len()
            )));
        }
        let mut inner = self.inner.write();
        for (key, update) in plain_keys.iter().zip(updates) {
            let key = key.as_ref();
            if key.len() == self.account_key_len {
                if update.is_delete() {
                    inner.accounts.remove(key);
                    continue;
                }
                let mut update = update.clone();
                update.resolve_increment(key, inner.accounts.get(key))?;
                update.apply_to_account(inner.accounts.entry(key.to_vec()).or_default());
            } else if update.is_delete()
                || (update.flags.contains(UpdateFlags::STORAGE) && update.storage.is_empty())
            {
                inner.storage.remove(key);
            } else if update.flags.contains(UpdateFlags::STORAGE) {
                inner.storage.insert(key.to_vec(), Bytes::copy_from_slice(&update.storage));
            }
        }
        Ok(())
    }

    /// Merges branch deltas into the stored branches. Branches left without children are removed.
    pub fn apply_branch_node_updates(
        &self,
        branch_updates: &BranchUpdates,
    ) -> Result<(), CommitmentError> {
        let mut inner = self.inner.write();
        for (prefix, update) in branch_updates {
            let merged = match inner.branches.get(prefix) {
                Some(stored) => merge_hex_branches(stored, update)?,
                None => update.clone(),
            };
            if BranchData::decode(&merged)?.after_map.is_empty() {
                inner.branches.remove(prefix);
            } else {
                inner.branches.insert(prefix.clone(), merged.into());
            }
        }
        Ok(())
    }

    pub fn set_account(&self, plain_key: &[u8], account: Account) {
        self.inner.write().accounts.insert(plain_key.to_vec(), account);
    }

    pub fn set_storage(&self, plain_key: &[u8], value: &[u8]) {
        self.inner.write().storage.insert(plain_key.to_vec(), Bytes::copy_from_slice(value));
    }
}

impl BranchLookup for InMemoryState {
    fn branch(&self, prefix: &[u8]) -> Result<Option<Bytes>, LookupError> {
        Ok(self.inner.read().branches.get(prefix).cloned())
    }
}

impl AccountLookup for InMemoryState {
    fn account(&self, plain_key: &[u8]) -> Result<Option<Account>, LookupError> {
        Ok(self.inner.read().accounts.get(plain_key).copied())
    }
}

impl StorageLookup for InMemoryState {
    fn storage(&self, plain_key: &[u8]) -> Result<Option<Bytes>, LookupError> {
        Ok(self.inner.read().storage.get(plain_key).cloned())
    }
}
