//! Ledger Transaction Engine
//!
//! Admits value transfers, applies them to account state atomically and
//! seals them into a hash-linked chain of blocks, with crash recovery.
//!
//! # Architecture
//!
//! - **Single Writer**: one actor task owns every balance mutation
//! - **Write-Ahead Journal**: in-flight transactions are durable before
//!   balances move
//! - **Atomic Batches**: balances, nonces and records commit together
//! - **Merkle Tree**: inclusion proofs per block
//!
//! # Invariants
//!
//! - Money conservation: Σ(balances) == Σ(system issuance)
//! - No negative balance, ever
//! - Nonces advance by exactly one per applied transfer
//! - Every transaction ends Applied or Cancelled, exactly once

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]

pub mod accounts;
pub mod actor;
pub mod applier;
pub mod assembler;
pub mod chain;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod journal;
pub mod ledger;
pub mod mempool;
pub mod merkle;
pub mod metrics;
pub mod recovery;
pub mod storage;
pub mod types;
pub mod validator;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use crypto::{AcceptAll, SignatureVerifier};
pub use error::{CancelReason, Error, Rejection, Result};
pub use events::LedgerEvent;
pub use ledger::{Ledger, LedgerBuilder};
pub use recovery::RecoveryReport;
pub use storage::{MemoryStorage, RocksStorage, Storage, StorageBatch, Table};
pub use types::{
    Account, Address, Amount, Block, BlockRef, JournalEntry, Sender, Transaction, TransactionId,
    TransactionRecord, TxStatus,
};
