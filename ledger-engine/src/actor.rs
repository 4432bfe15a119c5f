//! Actor-based concurrency for the ledger
//!
//! This module implements the single-writer pattern using Tokio actors:
//! - One task owns the applier and block assembler, so balance mutations
//!   never race
//! - Callers talk to it through a bounded mailbox (backpressure)
//! - A timer drives automatic block production
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │   Ledger::submit_transaction (any task)               │
//! │   validate + insert under the mempool lock            │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ Arc<Mutex<Mempool>>
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │               LedgerHandle (Clone)                    │
//! │         Sends messages to actor mailbox              │
//! └─────────────────────┬────────────────────────────────┘
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              LedgerActor (Single Task)                │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │ ProduceBlock → BlockAssembler::produce()       │  │
//! │  │ Timer: production policy → produce()           │  │
//! │  └────────────────────────────────────────────────┘  │
//! │                       │                               │
//! │                       ▼                               │
//! │        Applier: journal → commit batch → unjournal    │
//! └───────────────────────────────────────────────────────┘
//! ```

use crate::assembler::BlockAssembler;
use crate::types::{Address, Block};
use crate::{Error, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};

/// Message sent to the ledger actor
pub enum LedgerMessage {
    /// Produce a block now
    ProduceBlock {
        /// Fee and reward recipient
        producer: Address,
        /// Produced block, `None` when nothing applied
        response: oneshot::Sender<Result<Option<Block>>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Automatic production settings
#[derive(Debug, Clone)]
pub struct ActorSettings {
    /// Mailbox capacity
    pub mailbox_capacity: usize,
    /// Policy check period
    pub tick: Duration,
    /// Produce on the timer
    pub auto_produce: bool,
    /// Recipient of timer-produced blocks
    pub producer: Option<Address>,
}

/// Actor that owns every ledger mutation
pub struct LedgerActor {
    /// Applier and block production
    assembler: BlockAssembler,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<LedgerMessage>,

    /// Policy check period
    tick: Duration,

    /// Timer-driven producer, when enabled
    auto_producer: Option<Address>,
}

impl LedgerActor {
    /// Create new actor
    pub fn new(
        assembler: BlockAssembler,
        mailbox: mpsc::Receiver<LedgerMessage>,
        settings: &ActorSettings,
    ) -> Self {
        let auto_producer = if settings.auto_produce {
            settings.producer
        } else {
            None
        };
        Self {
            assembler,
            mailbox,
            tick: settings.tick,
            auto_producer,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        let mut ticker = interval(self.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                // Process incoming messages
                Some(msg) = self.mailbox.recv() => {
                    match msg {
                        LedgerMessage::ProduceBlock { producer, response } => {
                            let result = self.assembler.produce(producer);
                            let _ = response.send(result);
                        }
                        LedgerMessage::Shutdown => break,
                    }
                }

                // Production policy
                _ = ticker.tick(), if self.auto_producer.is_some() => {
                    self.auto_produce();
                }

                // Mailbox closed
                else => break,
            }
        }

        tracing::info!("Ledger actor stopped");
    }

    fn auto_produce(&mut self) {
        let producer = match self.auto_producer {
            Some(producer) => producer,
            None => return,
        };
        if !self.assembler.should_produce() {
            return;
        }
        match self.assembler.produce(producer) {
            Ok(Some(block)) => tracing::debug!(block_index = block.index, "Block produced on timer"),
            Ok(None) => {}
            Err(e) => tracing::error!("Error producing block: {}", e),
        }
    }
}

/// Handle for sending messages to the actor
#[derive(Clone)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<LedgerMessage>) -> Self {
        Self { sender }
    }

    /// Produce a block credited to `producer`
    pub async fn produce_block(&self, producer: Address) -> Result<Option<Block>> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(LedgerMessage::ProduceBlock {
                producer,
                response: tx,
            })
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(LedgerMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Spawn the ledger actor
pub fn spawn_ledger_actor(
    assembler: BlockAssembler,
    settings: &ActorSettings,
) -> (LedgerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(settings.mailbox_capacity.max(1)); // Bounded channel for backpressure
    let actor = LedgerActor::new(assembler, rx, settings);

    let task = tokio::spawn(async move {
        actor.run().await;
    });

    (LedgerHandle::new(tx), task)
}
