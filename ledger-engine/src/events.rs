//! Outbound notifications
//!
//! State changes are published on a broadcast channel after they are
//! durable. Publishing never blocks the writer; slow subscribers lag and
//! lose the oldest events.

use crate::error::{CancelReason, Rejection};
use crate::types::{Address, Amount, TransactionId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Event emitted by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LedgerEvent {
    /// Admitted into the mempool
    TransactionAccepted {
        /// Transaction
        id: TransactionId,
    },
    /// Refused at admission
    TransactionRejected {
        /// Transaction
        id: TransactionId,
        /// Why
        reason: Rejection,
    },
    /// Balances committed
    TransactionApplied {
        /// Transaction
        id: TransactionId,
    },
    /// Rolled back
    TransactionCancelled {
        /// Transaction
        id: TransactionId,
        /// Why
        reason: CancelReason,
    },
    /// An account balance moved
    BalanceChanged {
        /// Account
        address: Address,
        /// Balance before
        previous: Amount,
        /// Balance after
        current: Amount,
    },
    /// Block sealed
    BlockProduced {
        /// Height
        index: u64,
        /// Block hash (hex)
        hash: String,
        /// Transactions including the reward
        tx_count: usize,
    },
}

/// Broadcast fan-out of [`LedgerEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<LedgerEvent>,
}

impl EventBus {
    /// Bus retaining up to `capacity` undelivered events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish; dropped silently when nobody listens
    pub fn publish(&self, event: LedgerEvent) {
        let _ = self.sender.send(event);
    }

    /// New receiver seeing events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LedgerEvent> {
        self.sender.subscribe()
    }

    /// Number of live receivers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        let id = TransactionId::from_bytes([1; 32]);
        bus.publish(LedgerEvent::TransactionApplied { id });

        assert_eq!(rx.recv().await.unwrap(), LedgerEvent::TransactionApplied { id });
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(8);
        bus.publish(LedgerEvent::BlockProduced {
            index: 1,
            hash: "00".to_string(),
            tx_count: 0,
        });
    }

    #[test]
    fn test_json_shape() {
        let event = LedgerEvent::BalanceChanged {
            address: Address::from_bytes([0xaa; 20]),
            previous: Amount::new(1),
            current: Amount::new(2),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "balance_changed");
        assert_eq!(json["current"], 2);
    }
}
