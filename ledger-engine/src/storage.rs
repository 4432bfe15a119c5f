//! Durable key-value storage
//!
//! The engine talks to storage through the [`Storage`] trait: logical tables,
//! point reads, ordered scans and atomic write batches. Values are bincode.
//!
//! # Tables
//!
//! - `accounts` - Account state (key: address bytes)
//! - `journal` - In-flight transactions (key: transaction id)
//! - `chain` - Sealed blocks (key: block index, big-endian)
//! - `chain_hashes` - Block hash index (key: block hash)
//! - `transactions` - Transaction records (key: transaction id)
//! - `unsealed` - Applied transactions awaiting a block (key: sequence)
//! - `pending` - Admitted transactions not yet drained (key: transaction id)
//! - `recovery_log` - Recovery audit trail (key: sequence)
//! - `meta` - Counters, chain head and per-height reward markers

use crate::config::RocksDBConfig;
use crate::error::{Error, Result};
use parking_lot::RwLock;
use rocksdb::{
    BlockBasedOptions, BoundColumnFamily, ColumnFamilyDescriptor, DBCompactionStyle,
    DBCompressionType, DBWithThreadMode, IteratorMode, MultiThreaded, Options, WriteBatch,
    WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Logical table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// Account state
    Accounts,
    /// Journal entries
    Journal,
    /// Blocks by index
    Chain,
    /// Block index by hash
    ChainHashes,
    /// Transaction records
    Transactions,
    /// Applied, not yet sealed
    Unsealed,
    /// Persisted mempool
    Pending,
    /// Recovery audit log
    RecoveryLog,
    /// Counters and chain head
    Meta,
}

impl Table {
    /// Every table, in column family creation order
    pub const ALL: [Table; 9] = [
        Table::Accounts,
        Table::Journal,
        Table::Chain,
        Table::ChainHashes,
        Table::Transactions,
        Table::Unsealed,
        Table::Pending,
        Table::RecoveryLog,
        Table::Meta,
    ];

    /// Column family name
    pub fn name(&self) -> &'static str {
        match self {
            Table::Accounts => "accounts",
            Table::Journal => "journal",
            Table::Chain => "chain",
            Table::ChainHashes => "chain_hashes",
            Table::Transactions => "transactions",
            Table::Unsealed => "unsealed",
            Table::Pending => "pending",
            Table::RecoveryLog => "recovery_log",
            Table::Meta => "meta",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Single write inside a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Insert or overwrite
    Put {
        /// Target table
        table: Table,
        /// Key
        key: Vec<u8>,
        /// Encoded value
        value: Vec<u8>,
    },
    /// Remove (no-op if absent)
    Delete {
        /// Target table
        table: Table,
        /// Key
        key: Vec<u8>,
    },
}

impl BatchOp {
    /// Table this op writes to
    pub fn table(&self) -> Table {
        match self {
            BatchOp::Put { table, .. } | BatchOp::Delete { table, .. } => *table,
        }
    }

    /// Whether this op is a delete
    pub fn is_delete(&self) -> bool {
        matches!(self, BatchOp::Delete { .. })
    }
}

/// Ordered set of writes committed atomically
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageBatch {
    ops: Vec<BatchOp>,
}

impl StorageBatch {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Put raw bytes
    pub fn put(&mut self, table: Table, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            table,
            key: key.into(),
            value: value.into(),
        });
    }

    /// Put a bincode-encoded value
    pub fn put_value<T: Serialize>(
        &mut self,
        table: Table,
        key: impl Into<Vec<u8>>,
        value: &T,
    ) -> Result<()> {
        let encoded = bincode::serialize(value)?;
        self.put(table, key, encoded);
        Ok(())
    }

    /// Delete a key
    pub fn delete(&mut self, table: Table, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete {
            table,
            key: key.into(),
        });
    }

    /// Move all ops of `other` to the end of this batch
    pub fn extend(&mut self, other: StorageBatch) {
        self.ops.extend(other.ops);
    }

    /// Ops in order
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Number of ops
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Whether any op touches `table`
    pub fn touches(&self, table: Table) -> bool {
        self.ops.iter().any(|op| op.table() == table)
    }
}

/// Persistence backend contract
///
/// `write` must be atomic (all ops or none) and durable before it returns.
/// `scan` returns entries in ascending key order.
pub trait Storage: Send + Sync {
    /// Point read
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Commit a batch atomically
    fn write(&self, batch: StorageBatch) -> Result<()>;

    /// All entries of a table in key order
    fn scan(&self, table: Table) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Single put
    fn put(&self, table: Table, key: &[u8], value: &[u8]) -> Result<()> {
        let mut batch = StorageBatch::new();
        batch.put(table, key, value);
        self.write(batch)
    }

    /// Single delete
    fn delete(&self, table: Table, key: &[u8]) -> Result<()> {
        let mut batch = StorageBatch::new();
        batch.delete(table, key);
        self.write(batch)
    }

    /// Entry with the greatest key
    fn last(&self, table: Table) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(self.scan(table)?.pop())
    }
}

/// Typed helpers over any [`Storage`]
pub trait StorageExt: Storage {
    /// Read and decode
    fn get_value<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> Result<Option<T>> {
        match self.get(table, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Scan and decode every value
    fn scan_values<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<T>> {
        self.scan(table)?
            .into_iter()
            .map(|(_, value)| bincode::deserialize(&value).map_err(Error::from))
            .collect()
    }

    /// Whether a key exists
    fn contains(&self, table: Table, key: &[u8]) -> Result<bool> {
        Ok(self.get(table, key)?.is_some())
    }
}

impl<S: Storage + ?Sized> StorageExt for S {}

/// Big-endian key for sequence-keyed tables, so key order is numeric order
pub fn seq_key(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

/// Decode a key written by [`seq_key`]
pub fn decode_seq_key(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| Error::Storage(format!("malformed sequence key of {} bytes", key.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

type RocksDb = DBWithThreadMode<MultiThreaded>;

/// RocksDB backend, one column family per table
pub struct RocksStorage {
    db: Arc<RocksDb>,
    sync_writes: bool,
}

impl fmt::Debug for RocksStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RocksStorage")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl RocksStorage {
    /// Open or create database
    pub fn open(path: impl AsRef<Path>, config: &RocksDBConfig) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.max_write_buffer_number);
        db_opts.set_target_file_size_base(config.target_file_size_mb * 1024 * 1024);
        db_opts.set_max_background_jobs(config.max_background_jobs);
        db_opts.set_level_zero_file_num_compaction_trigger(
            config.level0_file_num_compaction_trigger,
        );
        db_opts.set_compaction_style(DBCompactionStyle::Universal);

        if config.enable_statistics {
            db_opts.enable_statistics();
        }

        let descriptors = Table::ALL
            .iter()
            .map(|table| ColumnFamilyDescriptor::new(table.name(), Self::cf_options(*table)))
            .collect::<Vec<_>>();

        let db = RocksDb::open_cf_descriptors(&db_opts, path, descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = Table::ALL.len(),
            sync_writes = config.sync_writes,
            "Opened RocksDB"
        );

        Ok(Self {
            db: Arc::new(db),
            sync_writes: config.sync_writes,
        })
    }

    fn cf_options(table: Table) -> Options {
        let mut opts = Options::default();
        match table {
            // Point lookups on every admission and apply
            Table::Accounts | Table::Transactions | Table::ChainHashes => {
                opts.set_compression_type(DBCompressionType::Lz4);
                let mut block_opts = BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            Table::Chain | Table::RecoveryLog => {
                opts.set_compression_type(DBCompressionType::Zstd);
                opts.set_bottommost_compression_type(DBCompressionType::Zstd);
            }
            // Short-lived rows
            Table::Journal | Table::Unsealed | Table::Pending => {
                opts.set_compression_type(DBCompressionType::Lz4);
            }
            Table::Meta => {}
        }
        opts
    }

    fn cf_handle(&self, table: Table) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(table.name())
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", table)))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        opts
    }
}

impl Storage for RocksStorage {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let cf = self.cf_handle(table)?;
        Ok(self.db.get_cf(&cf, key)?)
    }

    fn write(&self, batch: StorageBatch) -> Result<()> {
        let mut handles = HashMap::new();
        for table in Table::ALL {
            if batch.touches(table) {
                handles.insert(table, self.cf_handle(table)?);
            }
        }

        let mut write_batch = WriteBatch::default();
        for op in batch.ops {
            match op {
                BatchOp::Put { table, key, value } => {
                    if let Some(cf) = handles.get(&table) {
                        write_batch.put_cf(cf, key, value);
                    }
                }
                BatchOp::Delete { table, key } => {
                    if let Some(cf) = handles.get(&table) {
                        write_batch.delete_cf(cf, key);
                    }
                }
            }
        }

        self.db.write_opt(write_batch, &self.write_options())?;
        Ok(())
    }

    fn scan(&self, table: Table) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf_handle(table)?;
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    fn last(&self, table: Table) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf_handle(table)?;
        match self.db.iterator_cf(&cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, value) = item?;
                Ok(Some((key.to_vec(), value.to_vec())))
            }
            None => Ok(None),
        }
    }
}

/// In-memory backend for tests and ephemeral nodes
#[derive(Debug, Default)]
pub struct MemoryStorage {
    tables: RwLock<HashMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a table
    pub fn len(&self, table: Table) -> usize {
        self.tables.read().get(&table).map_or(0, BTreeMap::len)
    }
}

impl Storage for MemoryStorage {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .tables
            .read()
            .get(&table)
            .and_then(|rows| rows.get(key).cloned()))
    }

    fn write(&self, batch: StorageBatch) -> Result<()> {
        let mut tables = self.tables.write();
        for op in batch.ops {
            match op {
                BatchOp::Put { table, key, value } => {
                    tables.entry(table).or_default().insert(key, value);
                }
                BatchOp::Delete { table, key } => {
                    if let Some(rows) = tables.get_mut(&table) {
                        rows.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    fn scan(&self, table: Table) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .tables
            .read()
            .get(&table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn last(&self, table: Table) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .tables
            .read()
            .get(&table)
            .and_then(|rows| rows.iter().next_back())
            .map(|(k, v)| (k.clone(), v.clone())))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(storage: &dyn Storage) {
        storage.put(Table::Meta, b"a", b"1").unwrap();
        assert_eq!(storage.get(Table::Meta, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(storage.get(Table::Accounts, b"a").unwrap(), None);

        let mut batch = StorageBatch::new();
        batch.put(Table::Unsealed, seq_key(2).to_vec(), b"two".to_vec());
        batch.put(Table::Unsealed, seq_key(1).to_vec(), b"one".to_vec());
        batch.put(Table::Unsealed, seq_key(256).to_vec(), b"many".to_vec());
        batch.delete(Table::Meta, b"a".to_vec());
        storage.write(batch).unwrap();

        assert_eq!(storage.get(Table::Meta, b"a").unwrap(), None);

        let keys: Vec<u64> = storage
            .scan(Table::Unsealed)
            .unwrap()
            .iter()
            .map(|(k, _)| decode_seq_key(k).unwrap())
            .collect();
        assert_eq!(keys, vec![1, 2, 256]);

        let (last_key, last_value) = storage.last(Table::Unsealed).unwrap().unwrap();
        assert_eq!(decode_seq_key(&last_key).unwrap(), 256);
        assert_eq!(last_value, b"many".to_vec());
        assert!(storage.last(Table::Journal).unwrap().is_none());

        storage.delete(Table::Unsealed, &seq_key(1)).unwrap();
        assert_eq!(storage.scan(Table::Unsealed).unwrap().len(), 2);
    }

    #[test]
    fn test_memory_storage() {
        exercise(&MemoryStorage::new());
    }

    #[test]
    fn test_rocks_storage() {
        let temp = TempDir::new().unwrap();
        let storage = RocksStorage::open(temp.path(), &RocksDBConfig::default()).unwrap();
        exercise(&storage);
    }

    #[test]
    fn test_rocks_storage_reopen() {
        let temp = TempDir::new().unwrap();
        {
            let storage = RocksStorage::open(temp.path(), &RocksDBConfig::default()).unwrap();
            storage.put(Table::Accounts, b"k", b"v").unwrap();
        }
        let storage = RocksStorage::open(temp.path(), &RocksDBConfig::default()).unwrap();
        assert_eq!(storage.get(Table::Accounts, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_typed_helpers() {
        let storage = MemoryStorage::new();
        let mut batch = StorageBatch::new();
        batch.put_value(Table::Meta, b"n".to_vec(), &42u64).unwrap();
        storage.write(batch).unwrap();

        assert_eq!(storage.get_value::<u64>(Table::Meta, b"n").unwrap(), Some(42));
        assert!(storage.contains(Table::Meta, b"n").unwrap());
        assert_eq!(storage.scan_values::<u64>(Table::Meta).unwrap(), vec![42]);
    }

    #[test]
    fn test_failed_batch_leaves_no_trace() {
        let inner = Arc::new(MemoryStorage::new());
        let storage = testing::FailingStorage::new(inner.clone());
        storage.fail_when(|batch| batch.touches(Table::Accounts));

        let mut batch = StorageBatch::new();
        batch.put(Table::Meta, b"x".to_vec(), b"1".to_vec());
        batch.put(Table::Accounts, b"y".to_vec(), b"2".to_vec());
        assert!(matches!(storage.write(batch), Err(Error::Storage(_))));
        assert_eq!(inner.len(Table::Meta), 0);

        storage.heal();
        storage.put(Table::Accounts, b"y", b"2").unwrap();
        assert_eq!(inner.len(Table::Accounts), 1);
    }
}
