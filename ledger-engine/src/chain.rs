//! Chain store: sealed blocks, the hash index, transaction records and the
//! queue of applied transactions waiting for a block

use crate::error::{Error, Result};
use crate::merkle::{merkle_root, MerkleProof, MerkleTree};
use crate::storage::{decode_seq_key, seq_key, Storage, StorageBatch, StorageExt, Table};
use crate::types::{
    Address, Block, BlockRef, Transaction, TransactionId, TransactionRecord, GENESIS_PREVIOUS_HASH,
};
use std::sync::Arc;

/// Meta key holding the head block index
pub const HEAD_KEY: &[u8] = b"chain_head";

/// Meta key prefix of per-height reward markers
pub const REWARD_PREFIX: &[u8] = b"reward/";

fn reward_key(index: u64) -> Vec<u8> {
    let mut key = REWARD_PREFIX.to_vec();
    key.extend_from_slice(&seq_key(index));
    key
}

/// Assemble a block and fill in its merkle root and hash
pub fn build_block(
    index: u64,
    previous_hash: [u8; 32],
    timestamp: i64,
    transactions: Vec<Transaction>,
    producer: Option<Address>,
) -> Block {
    let ids: Vec<TransactionId> = transactions.iter().map(|tx| tx.id).collect();
    let mut block = Block {
        index,
        previous_hash,
        timestamp,
        transactions,
        nonce: 0,
        producer,
        merkle_root: merkle_root(&ids),
        hash: [0u8; 32],
    };
    block.hash = block.compute_hash();
    block
}

/// Durable chain state
#[derive(Clone)]
pub struct ChainStore {
    storage: Arc<dyn Storage>,
}

impl ChainStore {
    /// Create over a storage backend
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    // Transaction records

    /// Record for `id`
    pub fn record(&self, id: &TransactionId) -> Result<Option<TransactionRecord>> {
        self.storage.get_value(Table::Transactions, id.as_bytes())
    }

    /// Add a record write to `batch`
    pub fn stage_record(batch: &mut StorageBatch, record: &TransactionRecord) -> Result<()> {
        batch.put_value(
            Table::Transactions,
            record.transaction.id.as_bytes().to_vec(),
            record,
        )
    }

    // Unsealed queue

    /// Sequence number for the next unsealed entry
    pub fn next_unsealed_seq(&self) -> Result<u64> {
        match self.storage.last(Table::Unsealed)? {
            Some((key, _)) => Ok(decode_seq_key(&key)? + 1),
            None => Ok(0),
        }
    }

    /// Add an unsealed-queue write to `batch`
    pub fn stage_unsealed(batch: &mut StorageBatch, seq: u64, tx: &Transaction) -> Result<()> {
        batch.put_value(Table::Unsealed, seq_key(seq).to_vec(), tx)
    }

    /// Applied transactions not yet in a block, in application order
    pub fn unsealed(&self) -> Result<Vec<(u64, Transaction)>> {
        self.storage
            .scan(Table::Unsealed)?
            .into_iter()
            .map(|(key, value)| -> Result<(u64, Transaction)> {
                Ok((decode_seq_key(&key)?, bincode::deserialize(&value)?))
            })
            .collect()
    }

    // Rewards

    /// Reward committed for block `index`, if any
    pub fn reward_paid(&self, index: u64) -> Result<Option<TransactionId>> {
        self.storage.get_value(Table::Meta, &reward_key(index))
    }

    /// Add the reward marker for block `index` to `batch`
    pub fn stage_reward_marker(
        batch: &mut StorageBatch,
        index: u64,
        id: &TransactionId,
    ) -> Result<()> {
        batch.put_value(Table::Meta, reward_key(index), id)
    }

    // Blocks

    /// Index of the head block
    pub fn height(&self) -> Result<Option<u64>> {
        self.storage.get_value(Table::Meta, HEAD_KEY)
    }

    /// Head block
    pub fn head(&self) -> Result<Option<Block>> {
        match self.height()? {
            Some(index) => self.get_block(index),
            None => Ok(None),
        }
    }

    /// Block by index
    pub fn get_block(&self, index: u64) -> Result<Option<Block>> {
        self.storage.get_value(Table::Chain, &seq_key(index))
    }

    /// Block by hash
    pub fn get_block_by_hash(&self, hash: &[u8; 32]) -> Result<Option<Block>> {
        match self.storage.get_value::<u64>(Table::ChainHashes, hash)? {
            Some(index) => self.get_block(index),
            None => Ok(None),
        }
    }

    /// Block by index or hash
    pub fn get(&self, block_ref: BlockRef) -> Result<Option<Block>> {
        match block_ref {
            BlockRef::Index(index) => self.get_block(index),
            BlockRef::Hash(hash) => self.get_block_by_hash(&hash),
        }
    }

    /// All blocks in index order
    pub fn blocks(&self) -> Result<Vec<Block>> {
        self.storage.scan_values(Table::Chain)
    }

    /// Append a block on top of the head
    ///
    /// One batch stores the block, its hash index entry, the block location
    /// of every included record, clears the `sealed` unsealed entries and
    /// moves the head.
    pub fn append(&self, block: &Block, sealed: &[u64]) -> Result<()> {
        match self.head()? {
            Some(head) => {
                if block.index != head.index + 1 || block.previous_hash != head.hash {
                    return Err(Error::InvariantViolation(format!(
                        "block {} does not extend head {}",
                        block.index, head.index
                    )));
                }
            }
            None => {
                if block.index != 0 || block.previous_hash != GENESIS_PREVIOUS_HASH {
                    return Err(Error::InvariantViolation(format!(
                        "first block must be genesis, got index {}",
                        block.index
                    )));
                }
            }
        }
        if block.hash != block.compute_hash() {
            return Err(Error::InvariantViolation(format!(
                "block {} hash does not match contents",
                block.index
            )));
        }

        let mut batch = StorageBatch::new();
        batch.put_value(Table::Chain, seq_key(block.index).to_vec(), block)?;
        batch.put_value(Table::ChainHashes, block.hash.to_vec(), &block.index)?;

        for tx in &block.transactions {
            if let Some(mut record) = self.record(&tx.id)? {
                record.block_index = Some(block.index);
                Self::stage_record(&mut batch, &record)?;
            }
        }
        for seq in sealed {
            batch.delete(Table::Unsealed, seq_key(*seq).to_vec());
        }
        batch.put_value(Table::Meta, HEAD_KEY.to_vec(), &block.index)?;

        self.storage.write(batch)?;

        tracing::info!(
            block_index = block.index,
            block_hash = %block.hash_hex(),
            tx_count = block.transactions.len(),
            "Block appended"
        );
        Ok(())
    }

    /// Recheck every link, hash and merkle root; returns the block count
    pub fn verify(&self) -> Result<u64> {
        let mut previous: Option<Block> = None;
        let mut count = 0u64;

        for block in self.blocks()? {
            let expected_previous = previous.as_ref().map_or(GENESIS_PREVIOUS_HASH, |b| b.hash);
            let expected_index = previous.as_ref().map_or(0, |b| b.index + 1);

            if block.index != expected_index {
                return Err(Error::InvariantViolation(format!(
                    "expected block {} but found {}",
                    expected_index, block.index
                )));
            }
            if block.previous_hash != expected_previous {
                return Err(Error::InvariantViolation(format!(
                    "block {} previous hash mismatch",
                    block.index
                )));
            }
            if block.hash != block.compute_hash() {
                return Err(Error::InvariantViolation(format!(
                    "block {} hash mismatch",
                    block.index
                )));
            }
            if block.merkle_root != merkle_root(&block.transaction_ids()) {
                return Err(Error::InvariantViolation(format!(
                    "block {} merkle root mismatch",
                    block.index
                )));
            }

            count += 1;
            previous = Some(block);
        }

        Ok(count)
    }

    /// Inclusion proof for a sealed transaction
    pub fn proof(&self, id: &TransactionId) -> Result<Option<MerkleProof>> {
        let index = match self.record(id)?.and_then(|record| record.block_index) {
            Some(index) => index,
            None => return Ok(None),
        };
        let block = self
            .get_block(index)?
            .ok_or_else(|| Error::InvariantViolation(format!("record points at missing block {}", index)))?;
        Ok(MerkleTree::build(&block.transaction_ids()).proof_for(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use crate::types::{Amount, TxStatus};

    fn addr(byte: u8) -> Address {
        Address::from_bytes([byte; 20])
    }

    fn applied(chain: &ChainStore, storage: &Arc<MemoryStorage>, tx: &Transaction) -> u64 {
        let seq = chain.next_unsealed_seq().unwrap();
        let mut batch = StorageBatch::new();
        ChainStore::stage_record(
            &mut batch,
            &TransactionRecord {
                transaction: tx.clone(),
                status: TxStatus::Applied,
                cancel_reason: None,
                block_index: None,
                updated_at: 0,
            },
        )
        .unwrap();
        ChainStore::stage_unsealed(&mut batch, seq, tx).unwrap();
        storage.write(batch).unwrap();
        seq
    }

    fn setup() -> (ChainStore, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (ChainStore::new(storage.clone()), storage)
    }

    #[test]
    fn test_genesis_and_append() {
        let (chain, storage) = setup();
        assert!(chain.head().unwrap().is_none());

        let genesis = build_block(0, GENESIS_PREVIOUS_HASH, 0, vec![], None);
        assert_eq!(genesis.merkle_root, [0u8; 32]);
        chain.append(&genesis, &[]).unwrap();

        let tx = Transaction::system(addr(1), Amount::new(5), 1, 10);
        let seq = applied(&chain, &storage, &tx);
        let unsealed: Vec<_> = chain.unsealed().unwrap().into_iter().map(|(_, t)| t).collect();
        let block = build_block(1, genesis.hash, 10, unsealed, Some(addr(1)));
        chain.append(&block, &[seq]).unwrap();

        assert_eq!(chain.height().unwrap(), Some(1));
        assert_eq!(chain.get(BlockRef::Hash(block.hash)).unwrap(), Some(block.clone()));
        assert!(chain.unsealed().unwrap().is_empty());
        assert_eq!(chain.record(&tx.id).unwrap().unwrap().block_index, Some(1));
        assert_eq!(chain.verify().unwrap(), 2);

        let proof = chain.proof(&tx.id).unwrap().unwrap();
        assert!(proof.verify_against(&block.merkle_root));
    }

    #[test]
    fn test_genesis_hash_deterministic() {
        let a = build_block(0, GENESIS_PREVIOUS_HASH, 1_700_000_000_000, vec![], None);
        let b = build_block(0, GENESIS_PREVIOUS_HASH, 1_700_000_000_000, vec![], None);
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn test_append_rejects_broken_link() {
        let (chain, _storage) = setup();
        let genesis = build_block(0, GENESIS_PREVIOUS_HASH, 0, vec![], None);
        chain.append(&genesis, &[]).unwrap();

        let orphan = build_block(1, [7u8; 32], 1, vec![], None);
        assert!(matches!(chain.append(&orphan, &[]), Err(Error::InvariantViolation(_))));

        let skipped = build_block(2, genesis.hash, 1, vec![], None);
        assert!(chain.append(&skipped, &[]).is_err());
    }

    #[test]
    fn test_verify_detects_tampering() {
        let (chain, storage) = setup();
        let genesis = build_block(0, GENESIS_PREVIOUS_HASH, 0, vec![], None);
        chain.append(&genesis, &[]).unwrap();
        let tx = Transaction::system(addr(2), Amount::new(9), 1, 5);
        let block = build_block(1, genesis.hash, 5, vec![tx], None);
        chain.append(&block, &[]).unwrap();

        let mut forged = block.clone();
        forged.transactions[0].amount = Amount::new(9_000);
        forged.transactions[0].id = forged.transactions[0].compute_id();
        let mut batch = StorageBatch::new();
        batch.put_value(Table::Chain, seq_key(1).to_vec(), &forged).unwrap();
        storage.write(batch).unwrap();

        assert!(matches!(chain.verify(), Err(Error::InvariantViolation(_))));
    }

    #[test]
    fn test_reward_marker() {
        let (chain, storage) = setup();
        assert_eq!(chain.reward_paid(3).unwrap(), None);

        let reward = Transaction::system(addr(9), Amount::new(10), 3, 0);
        let mut batch = StorageBatch::new();
        ChainStore::stage_reward_marker(&mut batch, 3, &reward.id).unwrap();
        storage.write(batch).unwrap();

        assert_eq!(chain.reward_paid(3).unwrap(), Some(reward.id));
        assert_eq!(chain.reward_paid(4).unwrap(), None);
    }

    #[test]
    fn test_unsealed_sequence() {
        let (chain, storage) = setup();
        assert_eq!(chain.next_unsealed_seq().unwrap(), 0);
        applied(&chain, &storage, &Transaction::system(addr(1), Amount::new(1), 1, 0));
        applied(&chain, &storage, &Transaction::system(addr(1), Amount::new(1), 2, 0));
        assert_eq!(chain.next_unsealed_seq().unwrap(), 2);
        assert_eq!(chain.unsealed().unwrap().len(), 2);
    }
}
