//! Block assembler
//!
//! Drains a batch from the mempool, runs it through the applier with the
//! producer as fee recipient, appends the reward and seals everything in the
//! unsealed queue into the next block.

use crate::applier::{ApplyOutcome, Applier};
use crate::chain::{build_block, ChainStore};
use crate::clock::Clock;
use crate::config::{BlockConfig, GenesisConfig};
use crate::error::{Error, Result};
use crate::events::{EventBus, LedgerEvent};
use crate::mempool::Mempool;
use crate::metrics::Metrics;
use crate::storage::StorageBatch;
use crate::types::{Address, Block, Transaction, TxStatus, GENESIS_PREVIOUS_HASH};
use parking_lot::Mutex;
use std::sync::Arc;

/// Produces blocks; owned by the single writer
pub struct BlockAssembler {
    applier: Applier,
    chain: ChainStore,
    mempool: Arc<Mutex<Mempool>>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    metrics: Metrics,
    config: BlockConfig,
    max_batch_size: usize,
    last_block_at: i64,
}

impl BlockAssembler {
    /// Create an assembler
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        applier: Applier,
        chain: ChainStore,
        mempool: Arc<Mutex<Mempool>>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        metrics: Metrics,
        config: BlockConfig,
        max_batch_size: usize,
    ) -> Self {
        let last_block_at = clock.now_millis();
        Self {
            applier,
            chain,
            mempool,
            clock,
            events,
            metrics,
            config,
            max_batch_size,
            last_block_at,
        }
    }

    /// The applier, for recovery
    pub fn applier_mut(&mut self) -> &mut Applier {
        &mut self.applier
    }

    /// When the last block was sealed (ms)
    pub fn last_block_at(&self) -> i64 {
        self.last_block_at
    }

    /// Whether the mempool production policy fires now
    pub fn should_produce(&self) -> bool {
        self.mempool
            .lock()
            .should_produce(self.clock.now_millis(), self.last_block_at)
    }

    /// Produce the next block, or `None` when nothing user-submitted applied
    pub fn produce(&mut self, producer: Address) -> Result<Option<Block>> {
        let batch = self.mempool.lock().drain_batch(self.max_batch_size);
        if batch.is_empty() {
            return Ok(None);
        }
        tracing::debug!(batch_size = batch.len(), producer = %producer, "Assembling block");

        let mut applied = 0usize;
        let mut remaining = batch.into_iter();
        while let Some(tx) = remaining.next() {
            // Admission sees the debit and the released reservation together
            let mut pool = self.mempool.lock();
            let result = self.applier.apply(&tx, producer);
            if result.is_ok() {
                pool.settle(&[tx.id]);
            }
            drop(pool);

            match result {
                Ok(outcome) => {
                    if outcome == ApplyOutcome::Applied {
                        applied += 1;
                    }
                }
                Err(err) => {
                    let failed = tx.id;
                    let mut unattempted: Vec<Transaction> = remaining.collect();
                    // Never journaled: give it back along with the rest
                    match self.chain.record(&failed) {
                        Ok(None) => unattempted.insert(0, tx),
                        _ => {
                            self.mempool.lock().settle(&[failed]);
                        }
                    }
                    tracing::error!(
                        transaction_id = %failed,
                        requeued = unattempted.len(),
                        error = %err,
                        "Block assembly aborted"
                    );
                    let mut pool = self.mempool.lock();
                    pool.requeue(unattempted);
                    self.metrics.set_mempool_size(pool.len());
                    return Err(err);
                }
            }
        }
        self.metrics.set_mempool_size(self.mempool.lock().len());

        if applied == 0 {
            tracing::debug!("No transaction applied, block skipped");
            return Ok(None);
        }

        self.seal(Some(producer)).map(Some)
    }

    /// Seal applied transactions left unsealed by an interrupted block
    pub fn seal_orphans(&mut self) -> Result<Option<Block>> {
        if self.chain.unsealed()?.is_empty() {
            return Ok(None);
        }
        tracing::warn!("Sealing transactions left over from an interrupted block");
        self.seal(None).map(Some)
    }

    /// Create block 0 from the configured allocations if the chain is empty
    pub fn ensure_genesis(&mut self, genesis: &GenesisConfig) -> Result<Option<Block>> {
        if self.chain.height()?.is_some() {
            return Ok(None);
        }

        for (position, allocation) in genesis.allocations.iter().enumerate() {
            let tx = Transaction::system(
                allocation.address,
                allocation.amount,
                position as u64,
                genesis.timestamp,
            );
            let done = self.chain.record(&tx.id)?.map(|r| r.status) == Some(TxStatus::Applied);
            if done {
                continue;
            }
            if let ApplyOutcome::Cancelled(reason) = self.applier.apply(&tx, allocation.address)? {
                return Err(Error::InvariantViolation(format!(
                    "genesis allocation to {} cancelled: {}",
                    allocation.address, reason
                )));
            }
        }

        let (seqs, transactions): (Vec<u64>, Vec<Transaction>) =
            self.chain.unsealed()?.into_iter().unzip();
        let block = build_block(0, GENESIS_PREVIOUS_HASH, genesis.timestamp, transactions, None);
        self.chain.append(&block, &seqs)?;

        tracing::info!(
            block_hash = %block.hash_hex(),
            allocations = genesis.allocations.len(),
            "Genesis block created"
        );
        self.publish_block(&block);
        Ok(Some(block))
    }

    /// Append the reward and seal the unsealed queue
    fn seal(&mut self, producer: Option<Address>) -> Result<Block> {
        let head = self
            .chain
            .head()?
            .ok_or_else(|| Error::InvariantViolation("chain has no genesis block".to_string()))?;
        let index = head.index + 1;
        let timestamp = self.clock.now_millis().max(head.timestamp);

        if let Some(producer) = producer {
            self.reward(producer, index, timestamp)?;
        }

        let (seqs, transactions): (Vec<u64>, Vec<Transaction>) =
            self.chain.unsealed()?.into_iter().unzip();
        let block = build_block(index, head.hash, timestamp, transactions, producer);
        self.chain.append(&block, &seqs)?;

        self.last_block_at = timestamp;
        self.publish_block(&block);
        Ok(block)
    }

    fn reward(&mut self, producer: Address, index: u64, timestamp: i64) -> Result<()> {
        // A previous attempt at this height may already have paid it
        if let Some(paid) = self.chain.reward_paid(index)? {
            tracing::debug!(block_index = index, reward = %paid, "Reward already paid");
            return Ok(());
        }

        let reward = Transaction::system(producer, self.config.reward_amount, index, timestamp);
        let mut marker = StorageBatch::new();
        ChainStore::stage_reward_marker(&mut marker, index, &reward.id)?;
        if let ApplyOutcome::Cancelled(reason) = self.applier.apply_with(&reward, producer, marker)? {
            tracing::warn!(block_index = index, reason = %reason, "Block reward cancelled");
        }
        Ok(())
    }

    fn publish_block(&self, block: &Block) {
        self.metrics.record_block(block.transactions.len());
        self.events.publish(LedgerEvent::BlockProduced {
            index: block.index,
            hash: block.hash_hex(),
            tx_count: block.transactions.len(),
        });
    }
}
