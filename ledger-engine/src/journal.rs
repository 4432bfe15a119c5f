//! Write-ahead journal of in-flight transactions and the recovery audit log
//!
//! A journal entry is written (and synced) before any balance it covers is
//! touched and removed only once the transaction is Applied or Cancelled.
//! Finding one at startup means the process died mid-application.

use crate::error::{CancelReason, Result};
use crate::storage::{decode_seq_key, seq_key, Storage, StorageBatch, StorageExt, Table};
use crate::types::{JournalEntry, TransactionId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Durable map of transaction id → journal entry
#[derive(Clone)]
pub struct Journal {
    storage: Arc<dyn Storage>,
}

impl Journal {
    /// Create over a storage backend
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Durably write `entry` together with the caller's `extra` ops
    pub fn register(&self, entry: &JournalEntry, extra: StorageBatch) -> Result<()> {
        let mut batch = StorageBatch::new();
        Self::stage_put(&mut batch, entry)?;
        batch.extend(extra);
        self.storage.write(batch)?;

        tracing::debug!(
            transaction_id = %entry.transaction_id,
            nonce = entry.nonce,
            "Journal entry registered"
        );
        Ok(())
    }

    /// Overwrite an existing entry (retry counter updates)
    pub fn update(&self, entry: &JournalEntry) -> Result<()> {
        let mut batch = StorageBatch::new();
        Self::stage_put(&mut batch, entry)?;
        self.storage.write(batch)
    }

    /// Remove an entry in its own durable write
    pub fn remove(&self, id: &TransactionId) -> Result<()> {
        self.storage.delete(Table::Journal, id.as_bytes())
    }

    /// Add an entry write to `batch`
    pub fn stage_put(batch: &mut StorageBatch, entry: &JournalEntry) -> Result<()> {
        batch.put_value(Table::Journal, entry.transaction_id.as_bytes().to_vec(), entry)
    }

    /// Add an entry removal to `batch`
    pub fn stage_remove(batch: &mut StorageBatch, id: &TransactionId) {
        batch.delete(Table::Journal, id.as_bytes().to_vec());
    }

    /// Entry for `id`
    pub fn get(&self, id: &TransactionId) -> Result<Option<JournalEntry>> {
        self.storage.get_value(Table::Journal, id.as_bytes())
    }

    /// Whether `id` has an entry
    pub fn contains(&self, id: &TransactionId) -> Result<bool> {
        self.storage.contains(Table::Journal, id.as_bytes())
    }

    /// All entries, oldest first
    pub fn entries(&self) -> Result<Vec<JournalEntry>> {
        let mut entries: Vec<JournalEntry> = self.storage.scan_values(Table::Journal)?;
        entries.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.transaction_id.cmp(&b.transaction_id))
        });
        Ok(entries)
    }

    /// Number of entries
    pub fn len(&self) -> Result<usize> {
        Ok(self.storage.scan(Table::Journal)?.len())
    }

    /// Whether the journal is empty
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.storage.last(Table::Journal)?.is_none())
    }
}

/// How recovery resolved an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryAction {
    /// Transaction ended Applied
    Applied,
    /// Transaction ended Cancelled
    Cancelled,
}

/// One line of the recovery audit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryLogEntry {
    /// Position in the log
    pub seq: u64,
    /// Entry as found at startup
    pub entry: JournalEntry,
    /// Resolution
    pub action: RecoveryAction,
    /// Set when cancelled
    pub reason: Option<CancelReason>,
    /// When it was resolved (ms)
    pub resolved_at: i64,
}

/// Bounded, durable recovery audit log
#[derive(Clone)]
pub struct RecoveryLog {
    storage: Arc<dyn Storage>,
    capacity: usize,
}

impl RecoveryLog {
    /// Keep at most `capacity` entries
    pub fn new(storage: Arc<dyn Storage>, capacity: usize) -> Self {
        Self { storage, capacity }
    }

    /// Append a resolution, evicting the oldest lines beyond capacity
    pub fn append(
        &self,
        entry: &JournalEntry,
        action: RecoveryAction,
        reason: Option<CancelReason>,
        resolved_at: i64,
    ) -> Result<RecoveryLogEntry> {
        let keys: Vec<u64> = self
            .storage
            .scan(Table::RecoveryLog)?
            .iter()
            .map(|(key, _)| decode_seq_key(key))
            .collect::<Result<_>>()?;
        let seq = keys.last().map_or(0, |last| last + 1);

        let line = RecoveryLogEntry {
            seq,
            entry: entry.clone(),
            action,
            reason,
            resolved_at,
        };

        let mut batch = StorageBatch::new();
        batch.put_value(Table::RecoveryLog, seq_key(seq).to_vec(), &line)?;

        let overflow = (keys.len() + 1).saturating_sub(self.capacity);
        for old in keys.iter().take(overflow) {
            batch.delete(Table::RecoveryLog, seq_key(*old).to_vec());
        }
        self.storage.write(batch)?;

        Ok(line)
    }

    /// Lines, oldest first
    pub fn entries(&self) -> Result<Vec<RecoveryLogEntry>> {
        self.storage.scan_values(Table::RecoveryLog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::{Address, Amount, Transaction};

    fn entry(nonce: u64, registered_at: i64) -> JournalEntry {
        let sender = Address::from_bytes([1; 20]);
        let recipient = Address::from_bytes([2; 20]);
        let tx = Transaction::transfer(sender, recipient, Amount::new(5), Amount::new(1), nonce, 0);
        JournalEntry {
            transaction_id: tx.id,
            sender: tx.sender,
            recipient,
            amount: tx.amount,
            fee: tx.fee,
            nonce,
            timestamp: tx.timestamp,
            fee_recipient: recipient,
            original_sender_balance: Some(Amount::new(100)),
            original_recipient_balance: Amount::ZERO,
            original_fee_recipient_balance: Amount::ZERO,
            retry_count: 0,
            registered_at,
        }
    }

    #[test]
    fn test_register_and_remove() {
        let journal = Journal::new(Arc::new(MemoryStorage::new()));
        let e = entry(1, 10);

        journal.register(&e, StorageBatch::new()).unwrap();
        assert!(journal.contains(&e.transaction_id).unwrap());
        assert_eq!(journal.get(&e.transaction_id).unwrap(), Some(e.clone()));

        journal.remove(&e.transaction_id).unwrap();
        assert!(journal.is_empty().unwrap());
    }

    #[test]
    fn test_entries_oldest_first() {
        let journal = Journal::new(Arc::new(MemoryStorage::new()));
        for (nonce, at) in [(1, 30), (2, 10), (3, 20)] {
            journal.register(&entry(nonce, at), StorageBatch::new()).unwrap();
        }

        let order: Vec<i64> = journal
            .entries()
            .unwrap()
            .iter()
            .map(|e| e.registered_at)
            .collect();
        assert_eq!(order, vec![10, 20, 30]);
        assert_eq!(journal.len().unwrap(), 3);
    }

    #[test]
    fn test_update_persists_retry_count() {
        let journal = Journal::new(Arc::new(MemoryStorage::new()));
        let mut e = entry(1, 10);
        journal.register(&e, StorageBatch::new()).unwrap();

        e.retry_count = 2;
        journal.update(&e).unwrap();
        assert_eq!(journal.get(&e.transaction_id).unwrap().unwrap().retry_count, 2);
    }

    #[test]
    fn test_recovery_log_bounded() {
        let log = RecoveryLog::new(Arc::new(MemoryStorage::new()), 3);
        for i in 0..5 {
            log.append(&entry(i, 0), RecoveryAction::Applied, None, i as i64)
                .unwrap();
        }

        let lines = log.entries().unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines.first().unwrap().seq, 2);
        assert_eq!(lines.last().unwrap().seq, 4);
    }
}
