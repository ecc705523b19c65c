//! Capabilities the engine consumes from the account/storage state store.
use bytes::Bytes;
use revm_primitives::{B256, KECCAK_EMPTY, U256};
use serde::{Deserialize, Serialize};

use crate::error::LookupError;

/// Account fields committed in an account leaf, apart from the storage root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub nonce: u64,
    pub balance: U256,
    /// Hash of the bytecode, `KECCAK_EMPTY` for accounts without code.
    pub code_hash: B256,
}

impl Default for Account {
    fn default() -> Self {
        Self { nonce: 0, balance: U256::ZERO, code_hash: KECCAK_EMPTY }
    }
}

/// Reads persisted branch encodings by hex-prefix encoded nibble path.
pub trait BranchLookup {
    fn branch(&self, prefix: &[u8]) -> Result<Option<Bytes>, LookupError>;
}

/// Reads the current fields of an account by its plain key.
pub trait AccountLookup {
    fn account(&self, plain_key: &[u8]) -> Result<Option<Account>, LookupError>;
}

/// Reads the current value of a storage slot by its plain key (account key ++ location).
pub trait StorageLookup {
    fn storage(&self, plain_key: &[u8]) -> Result<Option<Bytes>, LookupError>;
}

impl<T: BranchLookup + ?Sized> BranchLookup for &T {
    fn branch(&self, prefix: &[u8]) -> Result<Option<Bytes>, LookupError> {
        (**self).branch(prefix)
    }
}

impl<T: AccountLookup + ?Sized> AccountLookup for &T {
    fn account(&self, plain_key: &[u8]) -> Result<Option<Account>, LookupError> {
        (**self).account(plain_key)
    }
}

impl<T: StorageLookup + ?Sized> StorageLookup for &T {
    fn storage(&self, plain_key: &[u8]) -> Result<Option<Bytes>, LookupError> {
        (**self).storage(plain_key)
    }
}
