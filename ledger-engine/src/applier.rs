//! Atomic applier: the state-transition function
//!
//! Per transaction:
//! 1. Read original balances (sender, recipient, fee recipient)
//! 2. Durably journal the transaction with a `Journaled` record
//! 3. Re-check nonce and funds, compute deltas
//! 4. Commit balances, `Applied` record, unsealed-queue entry, issuance
//!    counter and pending-copy removal in one batch
//! 5. Delete the journal entry
//!
//! A failed re-check cancels: originals restored, `Cancelled` recorded,
//! journal entry removed, all in one batch. Balances are never clamped.
//!
//! After a storage fault the entry that could not be resolved is held back
//! and must be settled before anything else is applied, so a later commit
//! can never be overwritten by a stale restore.

use crate::accounts::{AccountDelta, AccountStore};
use crate::chain::ChainStore;
use crate::clock::Clock;
use crate::error::{CancelReason, Error, Result};
use crate::events::{EventBus, LedgerEvent};
use crate::journal::Journal;
use crate::metrics::Metrics;
use crate::storage::{StorageBatch, Table};
use crate::types::{
    Address, Amount, JournalEntry, Sender, Transaction, TransactionRecord, TxStatus,
};
use crate::validator::Validator;
use std::sync::Arc;
use std::time::Instant;

/// Result of applying one transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Balances committed
    Applied,
    /// Rolled back
    Cancelled(CancelReason),
}

impl ApplyOutcome {
    /// Whether the transaction was committed
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

/// Single-writer state transition
pub struct Applier {
    accounts: AccountStore,
    journal: Journal,
    chain: ChainStore,
    validator: Arc<Validator>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    metrics: Metrics,
    unresolved: Vec<JournalEntry>,
}

impl Applier {
    /// Create the applier
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        accounts: AccountStore,
        journal: Journal,
        chain: ChainStore,
        validator: Arc<Validator>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        metrics: Metrics,
    ) -> Self {
        Self {
            accounts,
            journal,
            chain,
            validator,
            clock,
            events,
            metrics,
            unresolved: Vec::new(),
        }
    }

    /// Apply `tx`, crediting its fee to `fee_recipient`
    ///
    /// `Ok(Cancelled)` is an application fault confined to this transaction;
    /// `Err` is a persistence fault.
    pub fn apply(&mut self, tx: &Transaction, fee_recipient: Address) -> Result<ApplyOutcome> {
        self.apply_with(tx, fee_recipient, StorageBatch::new())
    }

    /// Like [`Applier::apply`], committing `extra` in the same batch as the
    /// balances; `extra` is dropped if the transaction is cancelled
    pub fn apply_with(
        &mut self,
        tx: &Transaction,
        fee_recipient: Address,
        extra: StorageBatch,
    ) -> Result<ApplyOutcome> {
        self.settle_unresolved()?;
        let started = Instant::now();

        // 1. Originals
        let original_sender_balance = match tx.sender {
            Sender::System => None,
            Sender::Account(sender) => Some(self.accounts.get(&sender)?.balance),
        };
        let now = self.clock.now_millis();
        let entry = JournalEntry {
            transaction_id: tx.id,
            sender: tx.sender,
            recipient: tx.recipient,
            amount: tx.amount,
            fee: tx.fee,
            nonce: tx.nonce,
            timestamp: tx.timestamp,
            fee_recipient,
            original_sender_balance,
            original_recipient_balance: self.accounts.get(&tx.recipient)?.balance,
            original_fee_recipient_balance: self.accounts.get(&fee_recipient)?.balance,
            retry_count: 0,
            registered_at: now,
        };

        // 2. Write-ahead
        let mut journaled = StorageBatch::new();
        ChainStore::stage_record(&mut journaled, &record(tx, TxStatus::Journaled, None, now))?;
        self.journal.register(&entry, journaled)?;

        // 3-5
        let outcome = self.complete(&entry, tx, extra, true)?;
        if outcome.is_applied() {
            self.metrics
                .record_applied(started.elapsed().as_secs_f64());
        }
        Ok(outcome)
    }

    /// Re-run steps 3-5 for a journal entry found at startup
    pub fn resume(&mut self, entry: &JournalEntry) -> Result<ApplyOutcome> {
        // Retried explicitly here, not through the held-back path
        self.unresolved
            .retain(|held| held.transaction_id != entry.transaction_id);
        self.settle_unresolved()?;
        // The record keeps the signature payload the entry does not
        let tx = self
            .chain
            .record(&entry.transaction_id)?
            .map(|record| record.transaction)
            .unwrap_or_else(|| entry.transaction());
        self.complete(entry, &tx, StorageBatch::new(), false)
    }

    /// Whether the entry's balances were already committed
    pub fn is_committed(&self, entry: &JournalEntry) -> Result<bool> {
        match self.chain.record(&entry.transaction_id)?.map(|r| r.status) {
            Some(TxStatus::Applied) => return Ok(true),
            Some(TxStatus::Cancelled) => return Ok(false),
            _ => {}
        }
        match entry.sender {
            Sender::System => Ok(false),
            Sender::Account(sender) => Ok(self.accounts.get(&sender)?.nonce >= entry.nonce),
        }
    }

    /// Drop the journal entry of a committed transaction
    pub fn finalize(&mut self, entry: &JournalEntry) -> Result<()> {
        let mut batch = StorageBatch::new();
        let existing = self.chain.record(&entry.transaction_id)?;
        if existing.as_ref().map(|r| r.status) != Some(TxStatus::Applied) {
            tracing::warn!(
                transaction_id = %entry.transaction_id,
                "Nonce already advanced without an applied record"
            );
            let tx = existing
                .map(|r| r.transaction)
                .unwrap_or_else(|| entry.transaction());
            let now = self.clock.now_millis();
            ChainStore::stage_record(&mut batch, &record(&tx, TxStatus::Applied, None, now))?;
        }
        Journal::stage_remove(&mut batch, &entry.transaction_id);
        batch.delete(Table::Pending, entry.transaction_id.as_bytes().to_vec());
        self.accounts.apply_deltas(&[], batch)?;
        self.validator.remember_applied(entry.transaction_id);
        Ok(())
    }

    /// Roll back: restore originals, record `Cancelled`, drop the entry
    pub fn cancel(&mut self, entry: &JournalEntry, reason: CancelReason) -> Result<()> {
        let mut originals = Vec::with_capacity(3);
        if let (Sender::Account(sender), Some(balance)) = (entry.sender, entry.original_sender_balance) {
            originals.push((sender, balance));
        }
        originals.push((entry.recipient, entry.original_recipient_balance));
        originals.push((entry.fee_recipient, entry.original_fee_recipient_balance));

        let tx = self
            .chain
            .record(&entry.transaction_id)?
            .map(|record| record.transaction)
            .unwrap_or_else(|| entry.transaction());

        let mut batch = self.accounts.stage_restore(&originals)?;
        ChainStore::stage_record(
            &mut batch,
            &record(&tx, TxStatus::Cancelled, Some(reason.clone()), self.clock.now_millis()),
        )?;
        Journal::stage_remove(&mut batch, &entry.transaction_id);
        batch.delete(Table::Pending, entry.transaction_id.as_bytes().to_vec());
        self.accounts.apply_deltas(&[], batch)?;

        tracing::info!(
            transaction_id = %entry.transaction_id,
            reason = %reason,
            "Transaction cancelled"
        );
        self.metrics.record_cancelled();
        self.events.publish(LedgerEvent::TransactionCancelled {
            id: entry.transaction_id,
            reason,
        });
        Ok(())
    }

    /// Entries held back after a storage fault
    pub fn unresolved(&self) -> &[JournalEntry] {
        &self.unresolved
    }

    fn settle_unresolved(&mut self) -> Result<()> {
        while let Some(entry) = self.unresolved.first().cloned() {
            if !self.journal.contains(&entry.transaction_id)? {
                self.unresolved.remove(0);
                continue;
            }
            if self.is_committed(&entry)? {
                self.journal.remove(&entry.transaction_id)?;
            } else {
                self.cancel(&entry, CancelReason::CommitFailed)?;
            }
            self.unresolved.remove(0);
        }
        Ok(())
    }

    /// Steps 3-5; `rollback_on_fault` cancels when the commit batch fails
    fn complete(
        &mut self,
        entry: &JournalEntry,
        tx: &Transaction,
        mut extra: StorageBatch,
        rollback_on_fault: bool,
    ) -> Result<ApplyOutcome> {
        // 3. Re-check
        let deltas = match self.deltas(entry)? {
            Ok(deltas) => deltas,
            Err(reason) => return self.cancel_or_hold(entry, reason),
        };

        // 4. Commit
        let now = self.clock.now_millis();
        ChainStore::stage_record(&mut extra, &record(tx, TxStatus::Applied, None, now))?;
        ChainStore::stage_unsealed(&mut extra, self.chain.next_unsealed_seq()?, tx)?;
        if entry.sender.is_system() {
            extra.extend(self.accounts.stage_issuance(entry.amount)?);
        }
        extra.delete(Table::Pending, entry.transaction_id.as_bytes().to_vec());

        let changes = match self.accounts.apply_deltas(&deltas, extra) {
            Ok(changes) => changes,
            Err(Error::InsufficientFunds { .. }) => {
                return self.cancel_or_hold(entry, CancelReason::InsufficientFunds)
            }
            Err(Error::Overflow(_)) => return self.cancel_or_hold(entry, CancelReason::Overflow),
            Err(err) if !rollback_on_fault => return Err(err),
            Err(err) => {
                tracing::error!(
                    transaction_id = %entry.transaction_id,
                    error = %err,
                    "Commit failed, rolling back"
                );
                if let Err(cancel_err) = self.cancel(entry, CancelReason::CommitFailed) {
                    tracing::error!(error = %cancel_err, "Rollback failed, entry held for recovery");
                    self.unresolved.push(entry.clone());
                }
                return Err(err);
            }
        };

        // 5. Journal removal
        if let Err(err) = self.journal.remove(&entry.transaction_id) {
            self.unresolved.push(entry.clone());
            return Err(err);
        }

        self.validator.remember_applied(entry.transaction_id);
        tracing::debug!(
            transaction_id = %entry.transaction_id,
            sender = %entry.sender,
            recipient = %entry.recipient,
            amount = %entry.amount,
            "Transaction applied"
        );
        self.events.publish(LedgerEvent::TransactionApplied {
            id: entry.transaction_id,
        });
        for change in changes {
            self.events.publish(LedgerEvent::BalanceChanged {
                address: change.address,
                previous: change.previous,
                current: change.current,
            });
        }
        Ok(ApplyOutcome::Applied)
    }

    fn cancel_or_hold(&mut self, entry: &JournalEntry, reason: CancelReason) -> Result<ApplyOutcome> {
        if let Err(err) = self.cancel(entry, reason.clone()) {
            self.unresolved.push(entry.clone());
            return Err(err);
        }
        Ok(ApplyOutcome::Cancelled(reason))
    }

    /// Re-check against current state; `Err` carries the cancel reason
    fn deltas(&self, entry: &JournalEntry) -> Result<std::result::Result<Vec<AccountDelta>, CancelReason>> {
        let mut deltas = Vec::with_capacity(3);

        if let Sender::Account(sender) = entry.sender {
            let account = self.accounts.get(&sender)?;
            let expected = account.nonce.saturating_add(1);
            if entry.nonce != expected {
                return Ok(Err(CancelReason::NonceMismatch {
                    expected,
                    got: entry.nonce,
                }));
            }
            let cost = match entry.amount.checked_add(entry.fee) {
                Some(cost) => cost,
                None => return Ok(Err(CancelReason::Overflow)),
            };
            if account.balance < cost {
                return Ok(Err(CancelReason::InsufficientFunds));
            }
            deltas.push(AccountDelta::debit(sender, cost, 1));
        }

        deltas.push(AccountDelta::credit(entry.recipient, entry.amount));
        if entry.fee > Amount::ZERO {
            deltas.push(AccountDelta::credit(entry.fee_recipient, entry.fee));
        }
        Ok(Ok(deltas))
    }
}

fn record(
    tx: &Transaction,
    status: TxStatus,
    cancel_reason: Option<CancelReason>,
    updated_at: i64,
) -> TransactionRecord {
    TransactionRecord {
        transaction: tx.clone(),
        status,
        cancel_reason,
        block_index: None,
        updated_at,
    }
}
