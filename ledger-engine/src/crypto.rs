//! Hashing and the signature-verification seam
//!
//! This module provides:
//! - SHA-256 hashing for transaction ids and arbitrary bytes
//! - The `SignatureVerifier` predicate the validator consults
//!
//! Signature schemes themselves live with the caller; the engine only asks
//! a yes/no question about each payload.

use crate::types::{Address, Amount, Sender, Transaction, TransactionId};
use sha2::{Digest, Sha256};

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Deterministic transaction id
///
/// Hashes `sender|recipient|amount|fee|timestamp|nonce`, with the sender
/// written as its lowercase address or `SYSTEM`.
pub fn transaction_id(
    sender: &Sender,
    recipient: &Address,
    amount: Amount,
    fee: Amount,
    timestamp: i64,
    nonce: u64,
) -> TransactionId {
    let canonical = format!(
        "{}|{}|{}|{}|{}|{}",
        sender, recipient, amount, fee, timestamp, nonce
    );
    TransactionId::from_bytes(hash_bytes(canonical.as_bytes()))
}

/// Signature predicate supplied by the signing layer
pub trait SignatureVerifier: Send + Sync {
    /// Whether the transaction's signature payload is acceptable
    fn verify(&self, transaction: &Transaction) -> bool;
}

/// Accepts every payload (signatures checked upstream)
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl SignatureVerifier for AcceptAll {
    fn verify(&self, _transaction: &Transaction) -> bool {
        true
    }
}

impl<F> SignatureVerifier for F
where
    F: Fn(&Transaction) -> bool + Send + Sync,
{
    fn verify(&self, transaction: &Transaction) -> bool {
        self(transaction)
    }
}
