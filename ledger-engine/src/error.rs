//! Error types for the ledger engine

use crate::types::{Address, Amount};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB or other backend)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Transaction refused at admission
    #[error("Transaction rejected: {0}")]
    Rejected(#[from] Rejection),

    /// Balance would go negative
    #[error("Insufficient funds on {address}: required {required}, available {available}")]
    InsufficientFunds {
        /// Account being debited
        address: Address,
        /// Amount the operation needs
        required: Amount,
        /// Amount the account holds
        available: Amount,
    },

    /// Arithmetic overflow on a balance or nonce
    #[error("Arithmetic overflow: {0}")]
    Overflow(String),

    /// Invalid address text
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Invariant violation (conservation, chain linkage, etc.)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Rejection reason, if this error is an admission rejection
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Error::Rejected(reason) => Some(reason),
            _ => None,
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

/// Synchronous admission rejection. No state changes accompany a rejection.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    /// Malformed transaction
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Signature predicate refused the payload
    #[error("invalid signature")]
    InvalidSignature,

    /// Nonce is not the next expected one for the sender
    #[error("invalid nonce: expected {expected}, got {got}")]
    InvalidNonce {
        /// Next nonce the sender must use
        expected: u64,
        /// Nonce carried by the transaction
        got: u64,
    },

    /// Sender cannot cover amount + fee
    #[error("insufficient balance: required {required}, available {available}")]
    InsufficientBalance {
        /// amount + fee
        required: Amount,
        /// balance minus reservations of pooled transactions
        available: Amount,
    },

    /// Transaction id already known
    #[error("duplicate transaction")]
    Duplicate,

    /// Pending pool at capacity
    #[error("mempool full")]
    MempoolFull,
}

/// Why a journaled transaction ended up `Cancelled`
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// Debit would make the sender balance negative
    #[error("insufficient funds")]
    InsufficientFunds,

    /// Sender nonce moved since admission
    #[error("nonce mismatch: expected {expected}, got {got}")]
    NonceMismatch {
        /// Nonce the account required
        expected: u64,
        /// Nonce carried by the transaction
        got: u64,
    },

    /// Credit would overflow a balance
    #[error("balance overflow")]
    Overflow,

    /// Journal entry older than the staleness threshold at recovery
    #[error("stale journal entry")]
    Stale,

    /// Commit batch could not be written
    #[error("commit failed")]
    CommitFailed,

    /// Recovery retries exhausted
    #[error("recovery retries exhausted")]
    RetriesExhausted,

    /// Reloaded pending transaction no longer passes validation
    #[error("revalidation failed: {0}")]
    Revalidation(Rejection),
}
