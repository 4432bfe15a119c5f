//! Main ledger orchestration layer
//!
//! This module ties together storage, validation, the single-writer actor
//! and recovery into the high-level API.
//!
//! # Example
//!
//! ```no_run
//! use ledger_engine::{Address, Amount, Config, Ledger, Transaction};
//!
//! #[tokio::main]
//! async fn main() -> ledger_engine::Result<()> {
//!     let ledger = Ledger::open(Config::default()).await?;
//!
//!     let alice = Address::parse("0x00000000000000000000000000000000000000a1")?;
//!     let bob = Address::parse("0x00000000000000000000000000000000000000b2")?;
//!     let tx = Transaction::transfer(alice, bob, Amount::new(30), Amount::new(1), 1, 0);
//!     ledger.submit_transaction(tx)?;
//!     ledger.produce_block(alice).await?;
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::accounts::AccountStore;
use crate::actor::{spawn_ledger_actor, ActorSettings, LedgerHandle};
use crate::applier::Applier;
use crate::assembler::BlockAssembler;
use crate::chain::ChainStore;
use crate::clock::{Clock, SystemClock};
use crate::config::StorageBackend;
use crate::crypto::{AcceptAll, SignatureVerifier};
use crate::events::{EventBus, LedgerEvent};
use crate::journal::{Journal, RecoveryLog, RecoveryLogEntry};
use crate::mempool::{Mempool, MempoolStats};
use crate::merkle::MerkleProof;
use crate::metrics::Metrics;
use crate::recovery::{RecoveryContext, RecoveryManager, RecoveryReport};
use crate::storage::{MemoryStorage, RocksStorage, Storage, Table};
use crate::types::{
    Account, Address, Amount, Block, BlockRef, Transaction, TransactionId, TransactionRecord,
    TxStatus,
};
use crate::validator::{LedgerView, Validator};
use crate::{Config, Error, Result};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Options for opening a [`Ledger`]
pub struct LedgerBuilder {
    config: Config,
    storage: Option<Arc<dyn Storage>>,
    verifier: Arc<dyn SignatureVerifier>,
    clock: Arc<dyn Clock>,
}

impl LedgerBuilder {
    /// Use an already opened backend instead of the configured one
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Signature predicate (default accepts everything)
    pub fn with_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Time source (default [`SystemClock`])
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Open storage, run recovery and start the writer
    pub async fn open(self) -> Result<Ledger> {
        let LedgerBuilder {
            config,
            storage,
            verifier,
            clock,
        } = self;
        config.validate()?;

        let storage: Arc<dyn Storage> = match storage {
            Some(storage) => storage,
            None => match config.storage {
                StorageBackend::Rocks => {
                    Arc::new(RocksStorage::open(&config.data_dir, &config.rocksdb)?)
                }
                StorageBackend::Memory => Arc::new(MemoryStorage::new()),
            },
        };

        let metrics = Metrics::new().map_err(|e| Error::Config(format!("metrics: {}", e)))?;
        let events = EventBus::new(config.event_capacity);
        let accounts = AccountStore::new(storage.clone());
        let journal = Journal::new(storage.clone());
        let chain = ChainStore::new(storage.clone());
        let recovery_log = RecoveryLog::new(storage.clone(), config.recovery.log_capacity);
        let validator = Arc::new(Validator::new(
            config.validator.clone(),
            verifier,
            clock.clone(),
        ));
        let mempool = Arc::new(Mutex::new(Mempool::new(config.mempool.clone())));

        let applier = Applier::new(
            accounts.clone(),
            journal.clone(),
            chain.clone(),
            validator.clone(),
            clock.clone(),
            events.clone(),
            metrics.clone(),
        );
        let mut assembler = BlockAssembler::new(
            applier,
            chain.clone(),
            mempool.clone(),
            clock.clone(),
            events.clone(),
            metrics.clone(),
            config.block.clone(),
            config.mempool.max_batch_size,
        );

        let recovery = RecoveryManager::new(
            config.recovery.clone(),
            config.genesis.clone(),
            storage.clone(),
            recovery_log.clone(),
            clock,
            metrics.clone(),
        )
        .run(RecoveryContext {
            assembler: &mut assembler,
            validator: &validator,
            mempool: &mempool,
            view: LedgerView {
                accounts: &accounts,
                journal: &journal,
                chain: &chain,
            },
        })?;
        metrics.set_mempool_size(mempool.lock().len());

        let (handle, task) = spawn_ledger_actor(
            assembler,
            &ActorSettings {
                mailbox_capacity: config.mailbox_capacity,
                tick: Duration::from_millis(config.block.interval_ms),
                auto_produce: config.block.auto_produce,
                producer: config.block.producer,
            },
        );

        tracing::info!(
            service = %config.service_name,
            height = ?chain.height()?,
            pending = mempool.lock().len(),
            "Ledger opened"
        );

        Ok(Ledger {
            handle,
            task,
            storage,
            accounts,
            journal,
            chain,
            recovery_log,
            mempool,
            validator,
            events,
            metrics,
            recovery,
            config,
        })
    }
}

/// Main ledger interface
pub struct Ledger {
    /// Actor handle for mutations
    handle: LedgerHandle,

    /// Writer task
    task: JoinHandle<()>,

    /// Direct storage access (for reads)
    storage: Arc<dyn Storage>,

    accounts: AccountStore,
    journal: Journal,
    chain: ChainStore,
    recovery_log: RecoveryLog,
    mempool: Arc<Mutex<Mempool>>,
    validator: Arc<Validator>,
    events: EventBus,
    metrics: Metrics,

    /// Outcome of startup recovery
    recovery: RecoveryReport,

    /// Configuration
    config: Config,
}

impl Ledger {
    /// Start building a ledger with custom collaborators
    pub fn builder(config: Config) -> LedgerBuilder {
        LedgerBuilder {
            config,
            storage: None,
            verifier: Arc::new(AcceptAll),
            clock: Arc::new(SystemClock::new()),
        }
    }

    /// Open ledger with configuration
    pub async fn open(config: Config) -> Result<Self> {
        Self::builder(config).open().await
    }

    /// Validate and admit a transaction into the mempool
    ///
    /// Refusals come back as `Error::Rejected`; nothing changes on refusal.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<TransactionId> {
        let id = tx.id;
        let result = {
            let mut pool = self.mempool.lock();
            self.admit(&mut pool, tx).map(|()| pool.len())
        };

        match result {
            Ok(pooled) => {
                self.metrics.record_submitted();
                self.metrics.set_mempool_size(pooled);
                self.events.publish(LedgerEvent::TransactionAccepted { id });
                tracing::debug!(transaction_id = %id, "Transaction accepted");
                Ok(id)
            }
            Err(err) => {
                if let Some(reason) = err.rejection() {
                    self.metrics.record_rejected();
                    self.events.publish(LedgerEvent::TransactionRejected {
                        id,
                        reason: reason.clone(),
                    });
                    tracing::debug!(transaction_id = %id, reason = %reason, "Transaction rejected");
                }
                Err(err)
            }
        }
    }

    fn admit(&self, pool: &mut Mempool, tx: Transaction) -> Result<()> {
        self.validator.validate(&tx, pool, &self.view())?;

        // Survives restarts until applied or cancelled
        self.storage
            .put(Table::Pending, tx.id.as_bytes(), &bincode::serialize(&tx)?)?;
        pool.insert(tx)?;
        Ok(())
    }

    fn view(&self) -> LedgerView<'_> {
        LedgerView {
            accounts: &self.accounts,
            journal: &self.journal,
            chain: &self.chain,
        }
    }

    /// Balance in minor units (zero for unknown accounts)
    pub fn get_balance(&self, address: &Address) -> Result<Amount> {
        Ok(self.accounts.get(address)?.balance)
    }

    /// Balance in major units, per `currency_decimals`
    pub fn get_balance_major(&self, address: &Address) -> Result<Decimal> {
        Ok(self
            .get_balance(address)?
            .to_major(self.config.currency_decimals))
    }

    /// Last applied nonce (zero for unknown accounts)
    pub fn get_nonce(&self, address: &Address) -> Result<u64> {
        Ok(self.accounts.get(address)?.nonce)
    }

    /// Balance and nonce
    pub fn get_account(&self, address: &Address) -> Result<Account> {
        self.accounts.get(address)
    }

    /// Lifecycle state; pooled transactions report `Submitted`
    pub fn get_transaction_status(&self, id: &TransactionId) -> Result<Option<TxStatus>> {
        if let Some(record) = self.chain.record(id)? {
            return Ok(Some(record.status));
        }
        if self.mempool.lock().contains(id) {
            return Ok(Some(TxStatus::Submitted));
        }
        Ok(None)
    }

    /// Durable record of a journaled, applied or cancelled transaction
    pub fn get_transaction(&self, id: &TransactionId) -> Result<Option<TransactionRecord>> {
        self.chain.record(id)
    }

    /// Produce a block now; `None` when no user transaction applied
    pub async fn produce_block(&self, producer: Address) -> Result<Option<Block>> {
        self.handle.produce_block(producer).await
    }

    /// Block by index or hash
    pub fn get_block(&self, block_ref: BlockRef) -> Result<Option<Block>> {
        self.chain.get(block_ref)
    }

    /// Latest block
    pub fn get_chain_head(&self) -> Result<Block> {
        self.chain
            .head()?
            .ok_or_else(|| Error::InvariantViolation("chain has no genesis block".to_string()))
    }

    /// Merkle inclusion proof for a sealed transaction
    pub fn transaction_proof(&self, id: &TransactionId) -> Result<Option<MerkleProof>> {
        self.chain.proof(id)
    }

    /// Recheck every block; returns the number of blocks
    pub fn verify_chain(&self) -> Result<u64> {
        self.chain.verify()
    }

    /// Fail unless balances sum to total issuance
    pub fn check_conservation(&self) -> Result<()> {
        self.accounts.check_conservation()
    }

    /// Stream of ledger events from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }

    /// Mempool statistics
    pub fn mempool_stats(&self) -> MempoolStats {
        self.mempool.lock().stats()
    }

    /// What startup recovery did
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Recovery audit log, oldest first
    pub fn recovery_log(&self) -> Result<Vec<RecoveryLogEntry>> {
        self.recovery_log.entries()
    }

    /// Prometheus metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stop the writer and wait for it to exit
    pub async fn shutdown(self) -> Result<()> {
        self.handle.shutdown().await?;
        self.task
            .await
            .map_err(|e| Error::Concurrency(format!("Actor task failed: {}", e)))?;
        tracing::info!("Ledger shut down");
        Ok(())
    }
}
