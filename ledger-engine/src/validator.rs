//! Admission checks for submitted transactions
//!
//! Checks run in a fixed order and stop at the first failure:
//! format and signature, replay, nonce, balance, pool capacity.
//! A rejection never changes any state.

use crate::accounts::AccountStore;
use crate::chain::ChainStore;
use crate::clock::Clock;
use crate::config::ValidatorConfig;
use crate::crypto::SignatureVerifier;
use crate::error::{Rejection, Result};
use crate::journal::Journal;
use crate::mempool::Mempool;
use crate::types::{Amount, Sender, Transaction, TransactionId, TxStatus};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Durable state consulted by the stateful checks
#[derive(Clone, Copy)]
pub struct LedgerView<'a> {
    /// Balances and nonces
    pub accounts: &'a AccountStore,
    /// In-flight transactions
    pub journal: &'a Journal,
    /// Transaction records
    pub chain: &'a ChainStore,
}

/// Transaction validator
pub struct Validator {
    config: ValidatorConfig,
    verifier: Arc<dyn SignatureVerifier>,
    clock: Arc<dyn Clock>,
    recent: Mutex<LruCache<TransactionId, ()>>,
}

impl Validator {
    /// Create a validator
    pub fn new(
        config: ValidatorConfig,
        verifier: Arc<dyn SignatureVerifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.recent_id_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            verifier,
            clock,
            recent: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Stateless checks: well-formedness, then the signature predicate
    pub fn check_format(&self, tx: &Transaction) -> std::result::Result<(), Rejection> {
        if !tx.has_valid_id() {
            return Err(Rejection::InvalidFormat(format!(
                "id {} does not match content",
                tx.id
            )));
        }
        if tx.amount > self.config.max_amount {
            return Err(Rejection::InvalidFormat(format!(
                "amount {} exceeds maximum {}",
                tx.amount, self.config.max_amount
            )));
        }
        if tx.total_cost().is_none() {
            return Err(Rejection::InvalidFormat("amount + fee overflows".to_string()));
        }
        if tx.is_system() && tx.fee != Amount::ZERO {
            return Err(Rejection::InvalidFormat(
                "system transactions carry no fee".to_string(),
            ));
        }
        let horizon = self
            .clock
            .now_millis()
            .saturating_add(self.config.max_clock_skew_ms);
        if tx.timestamp > horizon {
            return Err(Rejection::InvalidFormat(format!(
                "timestamp {} is ahead of the clock",
                tx.timestamp
            )));
        }

        if !self.verifier.verify(tx) {
            return Err(Rejection::InvalidSignature);
        }
        Ok(())
    }

    /// Full admission check against the pool and durable state
    ///
    /// Storage failures surface as errors; refusals as `Error::Rejected`.
    pub fn validate(&self, tx: &Transaction, pool: &Mempool, view: &LedgerView<'_>) -> Result<()> {
        self.check_format(tx)?;

        if self.is_duplicate(&tx.id, pool, view)? {
            return Err(Rejection::Duplicate.into());
        }

        if let Sender::Account(sender) = tx.sender {
            let account = view.accounts.get(&sender)?;

            let mut expected = account.nonce.saturating_add(1);
            if let Some(pooled) = pool.next_nonce(&sender) {
                expected = expected.max(pooled);
            }
            if tx.nonce != expected {
                return Err(Rejection::InvalidNonce {
                    expected,
                    got: tx.nonce,
                }
                .into());
            }

            let required = tx
                .total_cost()
                .ok_or_else(|| Rejection::InvalidFormat("amount + fee overflows".to_string()))?;
            let available = u128::from(account.balance.minor_units())
                .saturating_sub(pool.reserved_after(&sender, account.nonce));
            if u128::from(required.minor_units()) > available {
                return Err(Rejection::InsufficientBalance {
                    required,
                    available: Amount::new(u64::try_from(available).unwrap_or(u64::MAX)),
                }
                .into());
            }
        }

        if pool.is_full() {
            return Err(Rejection::MempoolFull.into());
        }
        Ok(())
    }

    fn is_duplicate(&self, id: &TransactionId, pool: &Mempool, view: &LedgerView<'_>) -> Result<bool> {
        if pool.contains(id) || self.recently_applied(id) {
            return Ok(true);
        }
        if view.journal.contains(id)? {
            return Ok(true);
        }
        // Cancelled ids may be submitted again
        Ok(matches!(
            view.chain.record(id)?.map(|record| record.status),
            Some(TxStatus::Applied) | Some(TxStatus::Journaled)
        ))
    }

    /// Remember an applied id for fast replay checks
    pub fn remember_applied(&self, id: TransactionId) {
        self.recent.lock().put(id, ());
    }

    /// Whether `id` is in the recent-applied cache
    pub fn recently_applied(&self, id: &TransactionId) -> bool {
        self.recent.lock().contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::MempoolConfig;
    use crate::crypto::AcceptAll;
    use crate::error::Error;
    use crate::storage::{MemoryStorage, Storage};
    use crate::types::Address;

    struct Fixture {
        accounts: AccountStore,
        journal: Journal,
        chain: ChainStore,
        pool: Mempool,
        validator: Validator,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_verifier(Arc::new(AcceptAll))
        }

        fn with_verifier(verifier: Arc<dyn SignatureVerifier>) -> Self {
            let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
            Self {
                accounts: AccountStore::new(storage.clone()),
                journal: Journal::new(storage.clone()),
                chain: ChainStore::new(storage),
                pool: Mempool::new(MempoolConfig {
                    max_size: 3,
                    ..MempoolConfig::default()
                }),
                validator: Validator::new(
                    ValidatorConfig {
                        max_amount: Amount::new(1_000),
                        ..ValidatorConfig::default()
                    },
                    verifier,
                    Arc::new(ManualClock::new(10_000)),
                ),
            }
        }

        fn check(&self, tx: &Transaction) -> std::result::Result<(), Rejection> {
            let view = LedgerView {
                accounts: &self.accounts,
                journal: &self.journal,
                chain: &self.chain,
            };
            match self.validator.validate(tx, &self.pool, &view) {
                Ok(()) => Ok(()),
                Err(Error::Rejected(rejection)) => Err(rejection),
                Err(other) => panic!("unexpected error: {}", other),
            }
        }
    }

    fn addr(byte: u8) -> Address {
        Address::from_bytes([byte; 20])
    }

    fn transfer(nonce: u64, amount: u64, fee: u64) -> Transaction {
        Transaction::transfer(addr(1), addr(2), Amount::new(amount), Amount::new(fee), nonce, 1_000)
    }

    #[test]
    fn test_accepts_valid_transfer() {
        let f = Fixture::new();
        f.accounts.apply_delta(addr(1), 100, 0).unwrap();
        assert_eq!(f.check(&transfer(1, 30, 1)), Ok(()));
    }

    #[test]
    fn test_rejects_tampered_id() {
        let f = Fixture::new();
        let mut tx = transfer(1, 30, 1);
        tx.amount = Amount::new(31);
        assert!(matches!(f.check(&tx), Err(Rejection::InvalidFormat(_))));
    }

    #[test]
    fn test_rejects_amount_above_maximum() {
        let f = Fixture::new();
        assert!(matches!(f.check(&transfer(1, 1_001, 0)), Err(Rejection::InvalidFormat(_))));
    }

    #[test]
    fn test_rejects_future_timestamp() {
        let f = Fixture::new();
        let tx = Transaction::transfer(addr(1), addr(2), Amount::new(1), Amount::ZERO, 1, 10_000 + 60_001);
        assert!(matches!(f.check(&tx), Err(Rejection::InvalidFormat(_))));
    }

    #[test]
    fn test_rejects_bad_signature() {
        let f = Fixture::with_verifier(Arc::new(|tx: &Transaction| !tx.signature.is_empty()));
        f.accounts.apply_delta(addr(1), 100, 0).unwrap();
        assert_eq!(f.check(&transfer(1, 30, 1)), Err(Rejection::InvalidSignature));
        assert_eq!(f.check(&transfer(1, 30, 1).with_signature(vec![1])), Ok(()));
    }

    #[test]
    fn test_nonce_must_follow_pool() {
        let mut f = Fixture::new();
        f.accounts.apply_delta(addr(1), 100, 0).unwrap();

        assert_eq!(
            f.check(&transfer(2, 1, 0)),
            Err(Rejection::InvalidNonce { expected: 1, got: 2 })
        );

        f.pool.insert(transfer(1, 1, 0)).unwrap();
        assert_eq!(
            f.check(&transfer(1, 2, 0)),
            Err(Rejection::InvalidNonce { expected: 2, got: 1 })
        );
        assert_eq!(f.check(&transfer(2, 1, 0)), Ok(()));
    }

    #[test]
    fn test_balance_counts_reservations() {
        let mut f = Fixture::new();
        f.accounts.apply_delta(addr(1), 100, 0).unwrap();
        f.pool.insert(transfer(1, 60, 1)).unwrap();

        assert_eq!(
            f.check(&transfer(2, 39, 1)),
            Err(Rejection::InsufficientBalance {
                required: Amount::new(40),
                available: Amount::new(39),
            })
        );
        assert_eq!(f.check(&transfer(2, 38, 1)), Ok(()));
    }

    #[test]
    fn test_applied_unsettled_not_reserved_twice() {
        let mut f = Fixture::new();
        f.accounts.apply_delta(addr(1), 100, 0).unwrap();

        let first = transfer(1, 60, 0);
        f.pool.insert(first).unwrap();
        f.pool.drain_batch(1);
        // Committed by the writer, still in flight in the pool
        f.accounts.apply_delta(addr(1), -60, 1).unwrap();

        assert_eq!(f.check(&transfer(2, 30, 0)), Ok(()));
        assert_eq!(
            f.check(&transfer(2, 41, 0)),
            Err(Rejection::InsufficientBalance {
                required: Amount::new(41),
                available: Amount::new(40),
            })
        );
    }

    #[test]
    fn test_duplicate_sources() {
        let mut f = Fixture::new();
        f.accounts.apply_delta(addr(1), 100, 0).unwrap();

        let pooled = transfer(1, 5, 0);
        f.pool.insert(pooled.clone()).unwrap();
        assert_eq!(f.check(&pooled), Err(Rejection::Duplicate));

        let applied = Transaction::system(addr(3), Amount::new(1), 7, 0);
        f.validator.remember_applied(applied.id);
        assert_eq!(f.check(&applied), Err(Rejection::Duplicate));
    }

    #[test]
    fn test_system_skips_nonce_and_balance() {
        let f = Fixture::new();
        let issue = Transaction::system(addr(3), Amount::new(500), 42, 0);
        assert_eq!(f.check(&issue), Ok(()));
    }

    #[test]
    fn test_system_fee_rejected() {
        let f = Fixture::new();
        let mut issue = Transaction::system(addr(3), Amount::new(5), 0, 0);
        issue.fee = Amount::new(1);
        issue.id = issue.compute_id();
        assert!(matches!(f.check(&issue), Err(Rejection::InvalidFormat(_))));
    }

    #[test]
    fn test_pool_full() {
        let mut f = Fixture::new();
        for byte in 10..13 {
            f.pool
                .insert(Transaction::system(addr(byte), Amount::new(1), 0, 0))
                .unwrap();
        }
        let issue = Transaction::system(addr(3), Amount::new(1), 0, 0);
        assert_eq!(f.check(&issue), Err(Rejection::MempoolFull));
    }
}
