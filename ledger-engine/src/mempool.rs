//! Pool of admitted, not yet applied transactions
//!
//! - Fee-priority selection (fee desc, timestamp asc, id asc)
//! - Per-sender nonce order: a transaction is eligible only once its
//!   predecessor nonce has been selected
//! - In-flight set for drained transactions awaiting settlement
//! - Reservations, so admission sees funds already promised to the pool

use crate::config::MempoolConfig;
use crate::error::Rejection;
use crate::types::{Address, Amount, Sender, Transaction, TransactionId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::ops::{Bound, RangeBounds};

/// Selection key for one candidate
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    fee: Amount,
    timestamp: i64,
    id: TransactionId,
    sender: Sender,
}

impl Candidate {
    fn of(tx: &Transaction) -> Self {
        Self {
            fee: tx.fee,
            timestamp: tx.timestamp,
            id: tx.id,
            sender: tx.sender,
        }
    }
}

// Max-heap: highest fee first, then earliest timestamp, then smallest id
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fee
            .cmp(&other.fee)
            .then_with(|| other.timestamp.cmp(&self.timestamp))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Mempool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MempoolStats {
    /// Transactions waiting for selection
    pub pending: usize,
    /// Drained, not yet settled
    pub in_flight: usize,
    /// Maximum capacity
    pub capacity: usize,
    /// Distinct account senders pooled
    pub senders: usize,
    /// Sum of pending fees (minor units)
    pub pending_fees: u128,
    /// Earliest pending timestamp (ms)
    pub oldest_timestamp: Option<i64>,
}

/// Mempool for admitted transactions
#[derive(Debug)]
pub struct Mempool {
    config: MempoolConfig,
    pending: HashMap<TransactionId, Transaction>,
    in_flight: HashMap<TransactionId, Transaction>,
    // Every pooled (pending or in-flight) account transaction by sender nonce
    by_sender: HashMap<Address, BTreeMap<u64, TransactionId>>,
}

impl Mempool {
    /// Create a new mempool
    pub fn new(config: MempoolConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            in_flight: HashMap::new(),
            by_sender: HashMap::new(),
        }
    }

    /// Pending plus in-flight
    pub fn len(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    /// Whether nothing is pooled
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Transactions waiting for selection
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether capacity is exhausted
    pub fn is_full(&self) -> bool {
        self.len() >= self.config.max_size
    }

    /// Whether `id` is pending or in flight
    pub fn contains(&self, id: &TransactionId) -> bool {
        self.pending.contains_key(id) || self.in_flight.contains_key(id)
    }

    /// Pooled transaction by id
    pub fn get(&self, id: &TransactionId) -> Option<&Transaction> {
        self.pending.get(id).or_else(|| self.in_flight.get(id))
    }

    /// Nonce following the sender's highest pooled nonce
    pub fn next_nonce(&self, sender: &Address) -> Option<u64> {
        self.by_sender
            .get(sender)
            .and_then(|nonces| nonces.keys().next_back())
            .map(|nonce| nonce.saturating_add(1))
    }

    /// Sum of amount + fee over the sender's pooled transactions
    pub fn reserved(&self, sender: &Address) -> u128 {
        self.reserved_in(sender, ..)
    }

    /// Like [`Mempool::reserved`], skipping nonces up to `applied_nonce`
    ///
    /// Those are already reflected in the sender's balance (applied, not
    /// yet settled) or can never apply.
    pub fn reserved_after(&self, sender: &Address, applied_nonce: u64) -> u128 {
        self.reserved_in(sender, (Bound::Excluded(applied_nonce), Bound::Unbounded))
    }

    fn reserved_in(&self, sender: &Address, nonces: impl RangeBounds<u64>) -> u128 {
        self.by_sender
            .get(sender)
            .map(|by_nonce| {
                by_nonce
                    .range(nonces)
                    .map(|(_, id)| id)
                    .filter_map(|id| self.get(id))
                    .map(|tx| {
                        u128::from(tx.amount.minor_units()) + u128::from(tx.fee.minor_units())
                    })
                    .sum()
            })
            .unwrap_or(0)
    }

    /// Add an admitted transaction
    pub fn insert(&mut self, tx: Transaction) -> Result<(), Rejection> {
        if self.contains(&tx.id) {
            return Err(Rejection::Duplicate);
        }
        if self.is_full() {
            return Err(Rejection::MempoolFull);
        }

        if let Sender::Account(address) = tx.sender {
            let nonces = self.by_sender.entry(address).or_default();
            if nonces.contains_key(&tx.nonce) {
                return Err(Rejection::Duplicate);
            }
            nonces.insert(tx.nonce, tx.id);
        }
        self.pending.insert(tx.id, tx);
        Ok(())
    }

    /// Lowest-nonce pending transaction of `sender`
    fn pending_head(&self, sender: &Address) -> Option<&Transaction> {
        self.by_sender
            .get(sender)?
            .values()
            .find_map(|id| self.pending.get(id))
    }

    /// Select up to `max` transactions and move them in flight
    ///
    /// Returned in selection order, which is also application order.
    pub fn drain_batch(&mut self, max: usize) -> Vec<Transaction> {
        let mut heap = BinaryHeap::new();
        for tx in self.pending.values() {
            match tx.sender {
                Sender::System => heap.push(Candidate::of(tx)),
                Sender::Account(address) => {
                    if self.pending_head(&address).map(|head| head.id) == Some(tx.id) {
                        heap.push(Candidate::of(tx));
                    }
                }
            }
        }

        let mut selected = Vec::with_capacity(max.min(self.pending.len()));
        while selected.len() < max {
            let candidate = match heap.pop() {
                Some(candidate) => candidate,
                None => break,
            };
            let tx = match self.pending.remove(&candidate.id) {
                Some(tx) => tx,
                None => continue,
            };
            self.in_flight.insert(tx.id, tx.clone());

            // Successor nonce becomes eligible
            if let Sender::Account(address) = candidate.sender {
                if let Some(next) = self.pending_head(&address) {
                    heap.push(Candidate::of(next));
                }
            }
            selected.push(tx);
        }

        selected
    }

    /// Forget in-flight transactions once resolved
    pub fn settle(&mut self, ids: &[TransactionId]) -> usize {
        let mut settled = 0;
        for id in ids {
            if let Some(tx) = self.in_flight.remove(id) {
                self.unindex(&tx);
                settled += 1;
            }
        }
        settled
    }

    /// Return in-flight transactions to pending after a fault
    pub fn requeue(&mut self, txs: Vec<Transaction>) {
        for tx in txs {
            if self.in_flight.remove(&tx.id).is_some() {
                self.pending.insert(tx.id, tx);
            }
        }
    }

    /// Drop a pending transaction
    pub fn remove(&mut self, id: &TransactionId) -> Option<Transaction> {
        let tx = self.pending.remove(id)?;
        self.unindex(&tx);
        Some(tx)
    }

    fn unindex(&mut self, tx: &Transaction) {
        if let Sender::Account(address) = tx.sender {
            if let Some(nonces) = self.by_sender.get_mut(&address) {
                if nonces.get(&tx.nonce) == Some(&tx.id) {
                    nonces.remove(&tx.nonce);
                }
                if nonces.is_empty() {
                    self.by_sender.remove(&address);
                }
            }
        }
    }

    /// Production policy: low-water mark reached, or a non-empty pool has
    /// waited `max_wait_ms` since the last block
    pub fn should_produce(&self, now: i64, last_block_at: i64) -> bool {
        let waiting = self.pending.len();
        if waiting == 0 {
            return false;
        }
        let waited = now.saturating_sub(last_block_at);
        waiting >= self.config.low_water_mark
            || waited >= i64::try_from(self.config.max_wait_ms).unwrap_or(i64::MAX)
    }

    /// Get mempool statistics
    pub fn stats(&self) -> MempoolStats {
        MempoolStats {
            pending: self.pending.len(),
            in_flight: self.in_flight.len(),
            capacity: self.config.max_size,
            senders: self.by_sender.len(),
            pending_fees: self
                .pending
                .values()
                .map(|tx| u128::from(tx.fee.minor_units()))
                .sum(),
            oldest_timestamp: self.pending.values().map(|tx| tx.timestamp).min(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::from_bytes([byte; 20])
    }

    fn tx(sender: u8, nonce: u64, fee: u64, timestamp: i64) -> Transaction {
        Transaction::transfer(addr(sender), addr(99), Amount::new(10), Amount::new(fee), nonce, timestamp)
    }

    fn pool() -> Mempool {
        Mempool::new(MempoolConfig {
            max_size: 4,
            max_batch_size: 10,
            low_water_mark: 3,
            max_wait_ms: 1_000,
        })
    }

    #[test]
    fn test_insert_and_duplicate() {
        let mut pool = pool();
        let t = tx(1, 1, 1, 0);
        pool.insert(t.clone()).unwrap();
        assert!(pool.contains(&t.id));
        assert_eq!(pool.insert(t), Err(Rejection::Duplicate));
    }

    #[test]
    fn test_capacity() {
        let mut pool = pool();
        for nonce in 1..=4 {
            pool.insert(tx(1, nonce, 1, 0)).unwrap();
        }
        assert!(pool.is_full());
        assert_eq!(pool.insert(tx(2, 1, 1, 0)), Err(Rejection::MempoolFull));
    }

    #[test]
    fn test_fee_then_timestamp_order() {
        let mut pool = pool();
        let low = tx(1, 1, 1, 0);
        let high_late = tx(2, 1, 5, 20);
        let high_early = tx(3, 1, 5, 10);
        for t in [&low, &high_late, &high_early] {
            pool.insert(t.clone()).unwrap();
        }

        let ids: Vec<_> = pool.drain_batch(10).iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![high_early.id, high_late.id, low.id]);
    }

    #[test]
    fn test_nonce_order_beats_fee() {
        let mut pool = pool();
        let first = tx(1, 1, 1, 0);
        let second = tx(1, 2, 9, 0);
        let other = tx(2, 1, 5, 0);
        for t in [&second, &first, &other] {
            pool.insert(t.clone()).unwrap();
        }

        let ids: Vec<_> = pool.drain_batch(10).iter().map(|t| t.id).collect();
        // sender 1's high-fee nonce 2 waits for nonce 1
        assert_eq!(ids, vec![other.id, first.id, second.id]);
    }

    #[test]
    fn test_drain_limit_and_in_flight() {
        let mut pool = pool();
        pool.insert(tx(1, 1, 3, 0)).unwrap();
        pool.insert(tx(2, 1, 2, 0)).unwrap();
        pool.insert(tx(3, 1, 1, 0)).unwrap();

        let batch = pool.drain_batch(2);
        assert_eq!(batch.len(), 2);
        assert_eq!(pool.pending_len(), 1);
        assert_eq!(pool.len(), 3);
        assert!(pool.contains(&batch[0].id));

        pool.settle(&[batch[0].id]);
        assert!(!pool.contains(&batch[0].id));

        pool.requeue(vec![batch[1].clone()]);
        assert_eq!(pool.pending_len(), 2);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_next_nonce_and_reserved() {
        let mut pool = pool();
        assert_eq!(pool.next_nonce(&addr(1)), None);

        pool.insert(tx(1, 1, 1, 0)).unwrap();
        pool.insert(tx(1, 2, 2, 0)).unwrap();
        assert_eq!(pool.next_nonce(&addr(1)), Some(3));
        assert_eq!(pool.reserved(&addr(1)), 23);

        // In-flight transactions stay reserved until settled
        let batch = pool.drain_batch(1);
        assert_eq!(pool.reserved(&addr(1)), 23);
        pool.settle(&[batch[0].id]);
        assert_eq!(pool.reserved(&addr(1)), 12);
        assert_eq!(pool.next_nonce(&addr(1)), Some(3));
    }

    #[test]
    fn test_reserved_after_skips_consumed_nonces() {
        let mut pool = pool();
        pool.insert(tx(1, 1, 1, 0)).unwrap();
        pool.insert(tx(1, 2, 2, 0)).unwrap();
        pool.drain_batch(1);

        // Nonce 1 applied but not settled yet
        assert_eq!(pool.reserved_after(&addr(1), 1), 12);
        assert_eq!(pool.reserved_after(&addr(1), 2), 0);
        assert_eq!(pool.reserved_after(&addr(1), 0), pool.reserved(&addr(1)));
    }

    #[test]
    fn test_system_transactions_always_eligible() {
        let mut pool = pool();
        let issue = Transaction::system(addr(5), Amount::new(10), 0, 0);
        pool.insert(issue.clone()).unwrap();
        pool.insert(tx(1, 1, 1, 0)).unwrap();

        let batch = pool.drain_batch(10);
        assert_eq!(batch.len(), 2);
        // Zero-fee system transaction sorts after the paying transfer
        assert_eq!(batch[1].id, issue.id);
    }

    #[test]
    fn test_should_produce() {
        let mut pool = pool();
        assert!(!pool.should_produce(10_000, 0));

        pool.insert(tx(1, 1, 1, 0)).unwrap();
        assert!(!pool.should_produce(500, 0));
        assert!(pool.should_produce(1_000, 0));

        pool.insert(tx(2, 1, 1, 0)).unwrap();
        pool.insert(tx(3, 1, 1, 0)).unwrap();
        assert!(pool.should_produce(0, 0));
    }

    #[test]
    fn test_stats() {
        let mut pool = pool();
        pool.insert(tx(1, 1, 4, 50)).unwrap();
        pool.insert(tx(2, 1, 6, 20)).unwrap();
        pool.drain_batch(1);

        let stats = pool.stats();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.senders, 2);
        assert_eq!(stats.pending_fees, 4);
        assert_eq!(stats.oldest_timestamp, Some(50));
    }
}
