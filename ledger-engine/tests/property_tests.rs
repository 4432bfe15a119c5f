//! Property-based tests for ledger invariants
//!
//! These tests use proptest to verify critical invariants:
//! - Money conservation: Σ(balances) == Σ(issuance)
//! - Nonce monotonicity: nonce == number of applied transfers, no gaps
//! - Idempotency: duplicate submissions rejected without effect
//! - No empty blocks: every produced block carries a user transaction
//! - Deterministic ids

use ledger_engine::{
    Address, Amount, Config, Ledger, ManualClock, Rejection, Transaction, TransactionId,
    TxStatus,
};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

const ACCOUNTS: u8 = 4;
const PRODUCER: u8 = 0xee;

fn addr(byte: u8) -> Address {
    Address::from_bytes([byte; 20])
}

/// One step of a randomized workload
#[derive(Debug, Clone)]
enum Op {
    Transfer {
        from: u8,
        to: u8,
        amount: u64,
        fee: u64,
        nonce_skew: u64,
    },
    Produce,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..ACCOUNTS, 0..ACCOUNTS, 0u64..80, 0u64..5, prop_oneof![3 => Just(0u64), 1 => 1u64..3])
            .prop_map(|(from, to, amount, fee, nonce_skew)| Op::Transfer {
                from,
                to,
                amount,
                fee,
                nonce_skew,
            }),
        1 => Just(Op::Produce),
    ]
}

/// Create test ledger with funded accounts
async fn create_test_ledger() -> Ledger {
    let mut config = Config::in_memory();
    config.block.reward_amount = Amount::new(10);
    config.genesis.allocations = (0..ACCOUNTS)
        .map(|byte| ledger_engine::config::Allocation {
            address: addr(byte),
            amount: Amount::new(100),
        })
        .collect();

    Ledger::builder(config)
        .with_clock(Arc::new(ManualClock::new(1_000_000)))
        .open()
        .await
        .unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Property: balances always sum to issuance and nonces have no gaps
    #[test]
    fn prop_conservation_and_nonces(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = create_test_ledger().await;
            let mut next_nonce: HashMap<u8, u64> = (0..ACCOUNTS).map(|a| (a, 1)).collect();
            let mut accepted: Vec<(u8, TransactionId)> = Vec::new();
            let mut timestamp = 0i64;

            for op in ops {
                match op {
                    Op::Transfer { from, to, amount, fee, nonce_skew } => {
                        timestamp += 1;
                        let nonce = next_nonce[&from] + nonce_skew;
                        let tx = Transaction::transfer(
                            addr(from),
                            addr(to),
                            Amount::new(amount),
                            Amount::new(fee),
                            nonce,
                            timestamp,
                        );
                        match ledger.submit_transaction(tx) {
                            Ok(id) => {
                                prop_assert_eq!(nonce_skew, 0);
                                *next_nonce.get_mut(&from).unwrap() += 1;
                                accepted.push((from, id));
                            }
                            Err(err) => prop_assert!(err.rejection().is_some()),
                        }
                    }
                    Op::Produce => {
                        ledger.produce_block(addr(PRODUCER)).await.unwrap();
                        for (account, nonce) in next_nonce.iter_mut() {
                            *nonce = ledger.get_nonce(&addr(*account)).unwrap() + 1;
                        }
                    }
                }
                prop_assert!(ledger.check_conservation().is_ok());
            }

            ledger.produce_block(addr(PRODUCER)).await.unwrap();
            prop_assert!(ledger.check_conservation().is_ok());

            // Every accepted transaction reached exactly one terminal state
            let mut applied_per_sender: HashMap<u8, u64> = HashMap::new();
            for (sender, id) in &accepted {
                let status = ledger.get_transaction_status(id).unwrap();
                prop_assert!(matches!(status, Some(TxStatus::Applied) | Some(TxStatus::Cancelled)));
                if status == Some(TxStatus::Applied) {
                    *applied_per_sender.entry(*sender).or_default() += 1;
                }
            }
            for account in 0..ACCOUNTS {
                prop_assert_eq!(
                    ledger.get_nonce(&addr(account)).unwrap(),
                    applied_per_sender.get(&account).copied().unwrap_or(0)
                );
            }

            // No empty blocks
            let head = ledger.get_chain_head().unwrap();
            for index in 1..=head.index {
                let block = ledger.get_block(ledger_engine::BlockRef::Index(index)).unwrap().unwrap();
                prop_assert!(block.transactions.iter().any(|tx| !tx.is_system()));
            }
            prop_assert_eq!(ledger.verify_chain().unwrap(), head.index + 1);

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: a second submission of the same transaction is a duplicate
    #[test]
    fn prop_duplicate_submission_idempotent(amount in 1u64..100, fee in 0u64..3, produce_between in any::<bool>()) {
        prop_assume!(amount + fee <= 100);
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let ledger = create_test_ledger().await;
            let tx = Transaction::transfer(addr(0), addr(1), Amount::new(amount), Amount::new(fee), 1, 7);

            ledger.submit_transaction(tx.clone()).unwrap();
            if produce_between {
                ledger.produce_block(addr(PRODUCER)).await.unwrap();
            }
            let balance = ledger.get_balance(&addr(1)).unwrap();

            let err = ledger.submit_transaction(tx).unwrap_err();
            prop_assert_eq!(err.rejection(), Some(&Rejection::Duplicate));
            prop_assert_eq!(ledger.get_balance(&addr(1)).unwrap(), balance);

            ledger.shutdown().await.unwrap();
            Ok(())
        })?;
    }

    /// Property: identical inputs give identical ids
    #[test]
    fn prop_deterministic_id(from in any::<u8>(), to in any::<u8>(), amount in any::<u64>(), nonce in any::<u64>(), ts in any::<i64>()) {
        let a = Transaction::transfer(addr(from), addr(to), Amount::new(amount), Amount::ZERO, nonce, ts);
        let b = Transaction::transfer(addr(from), addr(to), Amount::new(amount), Amount::ZERO, nonce, ts);
        prop_assert_eq!(a.id, b.id);
        prop_assert!(a.has_valid_id());
    }
}

#[tokio::test]
async fn test_repeated_produce_without_work() {
    let ledger = create_test_ledger().await;
    for _ in 0..5 {
        assert!(ledger.produce_block(addr(PRODUCER)).await.unwrap().is_none());
    }
    assert_eq!(ledger.get_chain_head().unwrap().index, 0);
    ledger.shutdown().await.unwrap();
}
