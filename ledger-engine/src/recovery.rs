//! Startup recovery
//!
//! Runs once before the ledger accepts work. Every journal entry left by a
//! crash is driven to a terminal state, the chain gets its genesis block and
//! any orphaned applied transactions are sealed, and the persisted pending
//! pool is revalidated into the mempool.

use crate::applier::ApplyOutcome;
use crate::assembler::BlockAssembler;
use crate::chain::ChainStore;
use crate::clock::Clock;
use crate::config::{GenesisConfig, RecoveryConfig};
use crate::error::{CancelReason, Error, Result};
use crate::journal::{Journal, RecoveryAction, RecoveryLog};
use crate::mempool::Mempool;
use crate::metrics::Metrics;
use crate::storage::{Storage, StorageBatch, StorageExt, Table};
use crate::types::{JournalEntry, Transaction, TransactionRecord, TxStatus};
use crate::validator::{LedgerView, Validator};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// Summary of one recovery run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Journal entries resolved as applied
    pub applied: usize,
    /// Journal entries resolved as cancelled
    pub cancelled: usize,
    /// Resume attempts made
    pub retries: u32,
    /// Genesis block was created by this run
    pub genesis_created: bool,
    /// Index of the block sealing orphaned transactions
    pub orphan_block: Option<u64>,
    /// Pending transactions put back in the mempool
    pub pending_restored: usize,
    /// Pending copies dropped because they already had a record
    pub pending_dropped: usize,
    /// Pending transactions cancelled on revalidation
    pub pending_cancelled: usize,
    /// Wall time spent (ms)
    pub duration_ms: u64,
}

impl RecoveryReport {
    /// Journal entries found at startup
    pub fn resolved(&self) -> usize {
        self.applied + self.cancelled
    }

    /// Whether the previous run shut down without leftovers
    pub fn is_clean(&self) -> bool {
        self.resolved() == 0 && self.orphan_block.is_none()
    }
}

/// Borrowed state recovery works on
pub struct RecoveryContext<'a> {
    /// Owner of the applier
    pub assembler: &'a mut BlockAssembler,
    /// Admission checks for the pending reload
    pub validator: &'a Validator,
    /// Pool to refill
    pub mempool: &'a Mutex<Mempool>,
    /// Durable state
    pub view: LedgerView<'a>,
}

/// Recovery manager
pub struct RecoveryManager {
    config: RecoveryConfig,
    genesis: GenesisConfig,
    storage: Arc<dyn Storage>,
    journal: Journal,
    log: RecoveryLog,
    clock: Arc<dyn Clock>,
    metrics: Metrics,
}

impl RecoveryManager {
    /// Create a recovery manager
    pub fn new(
        config: RecoveryConfig,
        genesis: GenesisConfig,
        storage: Arc<dyn Storage>,
        log: RecoveryLog,
        clock: Arc<dyn Clock>,
        metrics: Metrics,
    ) -> Self {
        Self {
            config,
            genesis,
            journal: Journal::new(storage.clone()),
            storage,
            log,
            clock,
            metrics,
        }
    }

    /// Run every recovery phase
    pub fn run(&self, ctx: RecoveryContext<'_>) -> Result<RecoveryReport> {
        let started = Instant::now();
        let mut report = RecoveryReport::default();

        let entries = self.journal.entries()?;
        if !entries.is_empty() {
            tracing::warn!(entries = entries.len(), "Unfinished transactions found in journal");
        }
        for entry in entries {
            self.resolve(ctx.assembler, entry, &mut report)?;
        }

        report.genesis_created = ctx.assembler.ensure_genesis(&self.genesis)?.is_some();
        report.orphan_block = ctx.assembler.seal_orphans()?.map(|block| block.index);

        self.reload_pending(ctx.validator, ctx.mempool, &ctx.view, &mut report)?;

        if !self.journal.is_empty()? {
            return Err(Error::InvariantViolation(
                "journal not empty after recovery".to_string(),
            ));
        }

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            applied = report.applied,
            cancelled = report.cancelled,
            retries = report.retries,
            orphan_block = ?report.orphan_block,
            pending_restored = report.pending_restored,
            pending_cancelled = report.pending_cancelled,
            duration_ms = report.duration_ms,
            "Recovery complete"
        );
        Ok(report)
    }

    fn resolve(
        &self,
        assembler: &mut BlockAssembler,
        mut entry: JournalEntry,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let applier = assembler.applier_mut();
        let now = self.clock.now_millis();

        if applier.is_committed(&entry)? {
            applier.finalize(&entry)?;
            return self.record(&entry, ApplyOutcome::Applied, report);
        }

        let age = now.saturating_sub(entry.registered_at);
        if age > self.config.stale_after_ms() {
            tracing::warn!(
                transaction_id = %entry.transaction_id,
                age_ms = age,
                "Cancelling stale journal entry"
            );
            applier.cancel(&entry, CancelReason::Stale)?;
            return self.record(&entry, ApplyOutcome::Cancelled(CancelReason::Stale), report);
        }

        while entry.retry_count < self.config.max_retries {
            entry.retry_count += 1;
            self.journal.update(&entry)?;
            report.retries += 1;

            match applier.resume(&entry) {
                Ok(outcome) => return self.record(&entry, outcome, report),
                Err(err) => tracing::warn!(
                    transaction_id = %entry.transaction_id,
                    attempt = entry.retry_count,
                    error = %err,
                    "Resume failed"
                ),
            }

            // The commit may have landed before the fault
            if applier.is_committed(&entry)? {
                applier.finalize(&entry)?;
                return self.record(&entry, ApplyOutcome::Applied, report);
            }
        }

        applier.cancel(&entry, CancelReason::RetriesExhausted)?;
        self.record(
            &entry,
            ApplyOutcome::Cancelled(CancelReason::RetriesExhausted),
            report,
        )
    }

    fn record(
        &self,
        entry: &JournalEntry,
        outcome: ApplyOutcome,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let (action, reason) = match outcome {
            ApplyOutcome::Applied => {
                report.applied += 1;
                (RecoveryAction::Applied, None)
            }
            ApplyOutcome::Cancelled(reason) => {
                report.cancelled += 1;
                (RecoveryAction::Cancelled, Some(reason))
            }
        };
        tracing::info!(
            transaction_id = %entry.transaction_id,
            action = ?action,
            "Journal entry resolved"
        );
        self.log
            .append(entry, action, reason, self.clock.now_millis())?;
        self.metrics.record_recovered();
        Ok(())
    }

    fn reload_pending(
        &self,
        validator: &Validator,
        mempool: &Mutex<Mempool>,
        view: &LedgerView<'_>,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let mut stored: Vec<Transaction> = self.storage.scan_values(Table::Pending)?;
        // Per-sender nonce order, so each one validates against its predecessor
        stored.sort_by_key(|tx| (tx.nonce, tx.timestamp, tx.id));

        for tx in stored {
            let key = tx.id.as_bytes().to_vec();

            if view.chain.record(&tx.id)?.is_some() {
                self.storage.delete(Table::Pending, &key)?;
                report.pending_dropped += 1;
                continue;
            }

            let mut pool = mempool.lock();
            match validator.validate(&tx, &pool, view) {
                Ok(()) => {
                    pool.insert(tx)?;
                    report.pending_restored += 1;
                }
                Err(Error::Rejected(rejection)) => {
                    tracing::info!(
                        transaction_id = %tx.id,
                        reason = %rejection,
                        "Pending transaction no longer valid"
                    );
                    let mut batch = StorageBatch::new();
                    ChainStore::stage_record(
                        &mut batch,
                        &TransactionRecord {
                            transaction: tx,
                            status: TxStatus::Cancelled,
                            cancel_reason: Some(CancelReason::Revalidation(rejection)),
                            block_index: None,
                            updated_at: self.clock.now_millis(),
                        },
                    )?;
                    batch.delete(Table::Pending, key);
                    self.storage.write(batch)?;
                    report.pending_cancelled += 1;
                }
                Err(other) => return Err(other),
            }
        }

        if report.pending_restored > 0 {
            tracing::info!(restored = report.pending_restored, "Pending pool reloaded");
        }
        Ok(())
    }
}
