use bytes::Bytes;

/// Boxed error produced by a store backend behind one of the lookup capabilities.
pub type BackendError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by the branch, account and storage lookup capabilities.
#[derive(thiserror::Error, Debug)]
pub enum LookupError {
    /// The account is not known to the store but the operation needs it.
    #[error("unknown account {}", hex::encode(.0))]
    UnknownAccount(Bytes),
    /// The backing store failed.
    #[error("state store failure: {0}")]
    Backend(#[from] BackendError),
}

#[derive(thiserror::Error, Debug)]
pub enum CommitmentError {
    /// A lookup capability failed or returned inconsistent data.
    #[error("state lookup failed: {0}")]
    StateLookup(#[from] LookupError),

    /// A cell, snapshot or branch encoding does not have the expected shape.
    #[error("malformed encoding: {0}")]
    MalformedEncoding(&'static str),

    #[error("malformed encoding: {what} at byte {pos}")]
    MalformedEncodingAt { what: &'static str, pos: usize },

    /// Internal structural invariant was broken, usually caused by reusing an engine after a
    /// failed pass without resetting it.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid plain key of {len} bytes for account key length {account_key_len}")]
    InvalidPlainKey { len: usize, account_key_len: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CommitmentError {
    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}
