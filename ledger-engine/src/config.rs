//! Configuration for the ledger

use crate::types::{Address, Amount};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Service name (log field)
    pub service_name: String,

    /// Persistence backend
    pub storage: StorageBackend,

    /// Fractional digits of one major unit
    pub currency_decimals: u32,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Mempool configuration
    pub mempool: MempoolConfig,

    /// Block production configuration
    pub block: BlockConfig,

    /// Startup recovery configuration
    pub recovery: RecoveryConfig,

    /// Admission configuration
    pub validator: ValidatorConfig,

    /// Genesis configuration
    pub genesis: GenesisConfig,

    /// Actor mailbox capacity
    pub mailbox_capacity: usize,

    /// Event channel capacity
    pub event_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/ledger"),
            service_name: "ledger-engine".to_string(),
            storage: StorageBackend::Rocks,
            currency_decimals: 8,
            rocksdb: RocksDBConfig::default(),
            mempool: MempoolConfig::default(),
            block: BlockConfig::default(),
            recovery: RecoveryConfig::default(),
            validator: ValidatorConfig::default(),
            genesis: GenesisConfig::default(),
            mailbox_capacity: 1024,
            event_capacity: 4096,
        }
    }
}

/// Persistence backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// RocksDB under `data_dir`
    Rocks,
    /// Process memory (lost on exit)
    Memory,
}

impl FromStr for StorageBackend {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rocks" | "rocksdb" => Ok(StorageBackend::Rocks),
            "memory" => Ok(StorageBackend::Memory),
            other => Err(crate::Error::Config(format!("unknown storage backend: {}", other))),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Level 0 file num compaction trigger
    pub level0_file_num_compaction_trigger: i32,

    /// Enable statistics
    pub enable_statistics: bool,

    /// fsync every write batch
    pub sync_writes: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            target_file_size_mb: 64,
            max_background_jobs: 4,
            level0_file_num_compaction_trigger: 4,
            enable_statistics: false,
            sync_writes: true,
        }
    }
}

/// Mempool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolConfig {
    /// Maximum pooled transactions (pending + in-flight)
    pub max_size: usize,

    /// Maximum user transactions per block
    pub max_batch_size: usize,

    /// Produce as soon as this many transactions are pooled
    pub low_water_mark: usize,

    /// Produce a non-empty pool after this long without a block (ms)
    pub max_wait_ms: u64,
}

impl Default for MempoolConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            max_batch_size: 100,
            low_water_mark: 10,
            max_wait_ms: 5_000,
        }
    }
}

/// Block production configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    /// Processing reward credited to the producer (minor units, positive)
    pub reward_amount: Amount,

    /// Producer used by automatic production
    pub producer: Option<Address>,

    /// Production policy tick (ms)
    pub interval_ms: u64,

    /// Produce automatically on the tick
    pub auto_produce: bool,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self {
            // 0.25 at 8 decimals
            reward_amount: Amount::new(25_000_000),
            producer: None,
            interval_ms: 1_000,
            auto_produce: false,
        }
    }
}

/// Startup recovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Journal entries older than this are cancelled (seconds)
    pub stale_after_secs: u64,

    /// Attempts before an entry is cancelled
    pub max_retries: u32,

    /// Recovery log entries kept
    pub log_capacity: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 300,
            max_retries: 3,
            log_capacity: 1_000,
        }
    }
}

impl RecoveryConfig {
    /// Staleness threshold in milliseconds
    pub fn stale_after_ms(&self) -> i64 {
        i64::try_from(self.stale_after_secs.saturating_mul(1_000)).unwrap_or(i64::MAX)
    }
}

/// Admission configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Recently applied ids kept for replay checks
    pub recent_id_capacity: usize,

    /// Largest single transfer amount (minor units)
    pub max_amount: Amount,

    /// Tolerated future timestamp skew (ms)
    pub max_clock_skew_ms: i64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            recent_id_capacity: 100_000,
            max_amount: Amount::new(u64::MAX / 2),
            max_clock_skew_ms: 60_000,
        }
    }
}

/// Genesis block contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisConfig {
    /// Fixed genesis timestamp (ms), keeps the genesis hash deterministic
    pub timestamp: i64,

    /// Initial issuance
    pub allocations: Vec<Allocation>,
}

/// Initial balance issued at genesis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    /// Credited account
    pub address: Address,
    /// Issued amount (minor units)
    pub amount: Amount,
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `LEDGER_*` environment variables
    pub fn apply_env(&mut self) -> crate::Result<()> {
        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            self.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(backend) = std::env::var("LEDGER_STORAGE") {
            self.storage = backend.parse()?;
        }

        if let Ok(producer) = std::env::var("LEDGER_PRODUCER") {
            self.block.producer = Some(producer.parse()?);
        }

        if let Ok(flag) = std::env::var("LEDGER_AUTO_PRODUCE") {
            self.block.auto_produce = parse_env("LEDGER_AUTO_PRODUCE", &flag)?;
        }

        if let Ok(value) = std::env::var("LEDGER_BLOCK_REWARD") {
            self.block.reward_amount =
                parse_major("LEDGER_BLOCK_REWARD", &value, self.currency_decimals)?;
        }

        if let Ok(value) = std::env::var("LEDGER_BLOCK_INTERVAL_MS") {
            self.block.interval_ms = parse_env("LEDGER_BLOCK_INTERVAL_MS", &value)?;
        }

        if let Ok(value) = std::env::var("LEDGER_MEMPOOL_MAX_SIZE") {
            self.mempool.max_size = parse_env("LEDGER_MEMPOOL_MAX_SIZE", &value)?;
        }

        if let Ok(value) = std::env::var("LEDGER_MAX_BATCH_SIZE") {
            self.mempool.max_batch_size = parse_env("LEDGER_MAX_BATCH_SIZE", &value)?;
        }

        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        let fail = |msg: &str| -> crate::Result<()> { Err(crate::Error::Config(msg.to_string())) };

        if self.currency_decimals > 28 {
            return fail("currency_decimals must be at most 28");
        }
        if self.mempool.max_size == 0 {
            return fail("mempool.max_size must be positive");
        }
        if self.mempool.max_batch_size == 0 {
            return fail("mempool.max_batch_size must be positive");
        }
        if self.block.reward_amount == Amount::ZERO {
            return fail("block.reward_amount must be positive");
        }
        if self.block.interval_ms == 0 {
            return fail("block.interval_ms must be positive");
        }
        if self.block.auto_produce && self.block.producer.is_none() {
            return fail("block.auto_produce requires block.producer");
        }
        if self.recovery.max_retries == 0 {
            return fail("recovery.max_retries must be positive");
        }
        if self.recovery.log_capacity == 0 {
            return fail("recovery.log_capacity must be positive");
        }
        if self.validator.recent_id_capacity == 0 {
            return fail("validator.recent_id_capacity must be positive");
        }
        if self.mailbox_capacity == 0 || self.event_capacity == 0 {
            return fail("channel capacities must be positive");
        }

        self.genesis
            .allocations
            .iter()
            .try_fold(Amount::ZERO, |total, allocation| total.checked_add(allocation.amount))
            .ok_or_else(|| crate::Error::Config("genesis allocations overflow".to_string()))?;

        Ok(())
    }

    /// In-memory configuration for tests and demos
    pub fn in_memory() -> Self {
        Self {
            storage: StorageBackend::Memory,
            ..Self::default()
        }
    }
}

/// Parse an amount written in major units (`"0.25"`) into minor units
pub fn parse_major(name: &str, value: &str, decimals: u32) -> crate::Result<Amount> {
    let major = Decimal::from_str(value.trim())
        .map_err(|e| crate::Error::Config(format!("invalid amount for {}: {}", name, e)))?;
    Amount::from_major(major, decimals).ok_or_else(|| {
        crate::Error::Config(format!(
            "{} must be non-negative with at most {} decimals: {}",
            name, decimals, value
        ))
    })
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> crate::Result<T> {
    value
        .parse()
        .map_err(|_| crate::Error::Config(format!("invalid value for {}: {}", name, value)))
}
