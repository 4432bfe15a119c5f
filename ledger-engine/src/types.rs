//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (integer minor units for money)
//! - Case-normalized identifiers

use crate::crypto;
use crate::error::{CancelReason, Error};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Length of an account address in bytes
pub const ADDRESS_LEN: usize = 20;

/// Literal used in place of a sender address for system transactions
pub const SYSTEM_SENDER: &str = "SYSTEM";

/// `previous_hash` of the genesis block
pub const GENESIS_PREVIOUS_HASH: [u8; 32] = [0u8; 32];

/// Account address (`0x` + 40 hex digits, lowercase canonical form)
///
/// Serialized as text in human-readable formats (config files, JSON) and as
/// raw bytes in bincode.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    /// Create from raw bytes
    pub const fn from_bytes(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse textual form; accepts any letter case
    pub fn parse(text: &str) -> Result<Self, Error> {
        let digits = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .ok_or_else(|| Error::InvalidAddress(format!("missing 0x prefix: {}", text)))?;

        if digits.len() != ADDRESS_LEN * 2 {
            return Err(Error::InvalidAddress(format!(
                "expected {} hex digits, got {}",
                ADDRESS_LEN * 2,
                digits.len()
            )));
        }

        let mut bytes = [0u8; ADDRESS_LEN];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|e| Error::InvalidAddress(format!("{}: {}", text, e)))?;
        Ok(Self(bytes))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            Address::parse(&text).map_err(serde::de::Error::custom)
        } else {
            <[u8; ADDRESS_LEN]>::deserialize(deserializer).map(Address)
        }
    }
}

/// Money in integer minor units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Amount(u64);

impl Amount {
    /// Zero
    pub const ZERO: Amount = Amount(0);

    /// Create from minor units
    pub const fn new(minor_units: u64) -> Self {
        Self(minor_units)
    }

    /// Minor units
    pub const fn minor_units(&self) -> u64 {
        self.0
    }

    /// Checked addition
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Checked subtraction (None if the result would be negative)
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    /// Saturating subtraction, used only for reporting available funds
    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    /// Convert to major units with `decimals` fractional digits
    pub fn to_major(&self, decimals: u32) -> Decimal {
        Decimal::from_i128_with_scale(self.0 as i128, decimals)
    }

    /// Convert from major units; None if the value is negative, has more
    /// fractional digits than `decimals`, or does not fit
    pub fn from_major(value: Decimal, decimals: u32) -> Option<Amount> {
        if value.is_sign_negative() || value.scale() > decimals {
            return None;
        }
        let factor = Decimal::from_i128_with_scale(10i128.checked_pow(decimals)?, 0);
        value.checked_mul(factor)?.to_u64().map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Originator of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sender {
    /// Issuance, reward and genesis transactions
    System,
    /// Regular account
    Account(Address),
}

impl Sender {
    /// Account address, None for the system sender
    pub fn address(&self) -> Option<&Address> {
        match self {
            Sender::System => None,
            Sender::Account(address) => Some(address),
        }
    }

    /// Whether this is the system sentinel
    pub fn is_system(&self) -> bool {
        matches!(self, Sender::System)
    }
}

impl fmt::Display for Sender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sender::System => write!(f, "{}", SYSTEM_SENDER),
            Sender::Account(address) => write!(f, "{}", address),
        }
    }
}

/// Content hash identifying a transaction
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId([u8; 32]);

impl TransactionId {
    /// Create from hash bytes
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a 64-digit hex string (optional `0x` prefix)
    pub fn from_hex(text: &str) -> Option<Self> {
        let digits = text.strip_prefix("0x").unwrap_or(text);
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(digits, &mut bytes).ok()?;
        Some(Self(bytes))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps logs readable
        write!(f, "TransactionId(0x{}..)", hex::encode(&self.0[..8]))
    }
}

impl Serialize for TransactionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for TransactionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            TransactionId::from_hex(&text)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid transaction id: {}", text)))
        } else {
            <[u8; 32]>::deserialize(deserializer).map(TransactionId)
        }
    }
}

/// Value transfer (or system issuance)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Deterministic content hash
    pub id: TransactionId,

    /// Originator
    pub sender: Sender,

    /// Credited account
    pub recipient: Address,

    /// Transferred amount
    pub amount: Amount,

    /// Fee paid by the sender to the block producer
    pub fee: Amount,

    /// Sender nonce (block index for reward transactions)
    pub nonce: u64,

    /// Submission timestamp (milliseconds since Unix epoch)
    pub timestamp: i64,

    /// Opaque signature payload for the verification predicate
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

impl Transaction {
    /// Build a transfer between accounts
    pub fn transfer(
        sender: Address,
        recipient: Address,
        amount: Amount,
        fee: Amount,
        nonce: u64,
        timestamp: i64,
    ) -> Self {
        Self::build(Sender::Account(sender), recipient, amount, fee, nonce, timestamp)
    }

    /// Build a system issuance (no fee, no balance or nonce checks)
    pub fn system(recipient: Address, amount: Amount, nonce: u64, timestamp: i64) -> Self {
        Self::build(Sender::System, recipient, amount, Amount::ZERO, nonce, timestamp)
    }

    fn build(
        sender: Sender,
        recipient: Address,
        amount: Amount,
        fee: Amount,
        nonce: u64,
        timestamp: i64,
    ) -> Self {
        let id = crypto::transaction_id(&sender, &recipient, amount, fee, timestamp, nonce);
        Self {
            id,
            sender,
            recipient,
            amount,
            fee,
            nonce,
            timestamp,
            signature: Vec::new(),
        }
    }

    /// Attach a signature payload (does not change the id)
    pub fn with_signature(mut self, signature: Vec<u8>) -> Self {
        self.signature = signature;
        self
    }

    /// Recompute the id from the content fields
    pub fn compute_id(&self) -> TransactionId {
        crypto::transaction_id(
            &self.sender,
            &self.recipient,
            self.amount,
            self.fee,
            self.timestamp,
            self.nonce,
        )
    }

    /// Whether the stored id matches the content
    pub fn has_valid_id(&self) -> bool {
        self.compute_id() == self.id
    }

    /// Whether the sender is the system sentinel
    pub fn is_system(&self) -> bool {
        self.sender.is_system()
    }

    /// amount + fee, None on overflow
    pub fn total_cost(&self) -> Option<Amount> {
        self.amount.checked_add(self.fee)
    }
}

/// Lifecycle of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxStatus {
    /// Accepted into the mempool (never persisted as a record)
    Submitted = 1,
    /// Journal entry written, balances not yet committed
    Journaled = 2,
    /// Balances committed (terminal)
    Applied = 3,
    /// Rolled back (terminal)
    Cancelled = 4,
}

impl TxStatus {
    /// Check if status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Applied | TxStatus::Cancelled)
    }
}

/// Durable per-transaction record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// The transaction
    pub transaction: Transaction,

    /// Current status
    pub status: TxStatus,

    /// Set when `status == Cancelled`
    pub cancel_reason: Option<CancelReason>,

    /// Block that includes the transaction, once sealed
    pub block_index: Option<u64>,

    /// Last status change (milliseconds)
    pub updated_at: i64,
}

/// Account state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account address
    pub address: Address,

    /// Balance in minor units
    pub balance: Amount,

    /// Last applied nonce (0 for never-used accounts)
    pub nonce: u64,
}

impl Account {
    /// Zero-balance, zero-nonce account
    pub fn empty(address: Address) -> Self {
        Self {
            address,
            balance: Amount::ZERO,
            nonce: 0,
        }
    }
}

/// Sealed block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block height (sequential, genesis = 0)
    pub index: u64,

    /// Hash of previous block
    pub previous_hash: [u8; 32],

    /// Block creation timestamp (milliseconds)
    pub timestamp: i64,

    /// Transactions in application order; the last may be the reward
    pub transactions: Vec<Transaction>,

    /// Always 0, kept in the hash preimage for format stability
    pub nonce: u64,

    /// Reward recipient (None for genesis)
    pub producer: Option<Address>,

    /// Merkle root over transaction ids
    pub merkle_root: [u8; 32],

    /// Hash of this block's contents
    pub hash: [u8; 32],
}

impl Block {
    /// Compute block hash
    pub fn compute_hash(&self) -> [u8; 32] {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(self.index.to_be_bytes());
        hasher.update(self.previous_hash);
        hasher.update(self.timestamp.to_be_bytes());
        for tx in &self.transactions {
            hasher.update(tx.id.as_bytes());
        }
        hasher.update(self.nonce.to_be_bytes());

        hasher.finalize().into()
    }

    /// Transaction ids in block order
    pub fn transaction_ids(&self) -> Vec<TransactionId> {
        self.transactions.iter().map(|tx| tx.id).collect()
    }

    /// Hex form of the block hash
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Block lookup key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    /// By height
    Index(u64),
    /// By block hash
    Hash([u8; 32]),
}

/// Write-ahead record of an in-flight transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Transaction being applied
    pub transaction_id: TransactionId,

    /// Originator
    pub sender: Sender,

    /// Credited account
    pub recipient: Address,

    /// Transferred amount
    pub amount: Amount,

    /// Fee
    pub fee: Amount,

    /// Sender nonce carried by the transaction
    pub nonce: u64,

    /// Transaction timestamp, needed to rebuild the transaction
    pub timestamp: i64,

    /// Account credited with the fee
    pub fee_recipient: Address,

    /// Sender balance before application (None for the system sender)
    pub original_sender_balance: Option<Amount>,

    /// Recipient balance before application
    pub original_recipient_balance: Amount,

    /// Fee recipient balance before application
    pub original_fee_recipient_balance: Amount,

    /// Recovery attempts so far
    pub retry_count: u32,

    /// When the entry was written (milliseconds)
    pub registered_at: i64,
}

impl JournalEntry {
    /// Rebuild the transaction described by this entry (signature is not kept)
    pub fn transaction(&self) -> Transaction {
        Transaction {
            id: self.transaction_id,
            sender: self.sender,
            recipient: self.recipient,
            amount: self.amount,
            fee: self.fee,
            nonce: self.nonce,
            timestamp: self.timestamp,
            signature: Vec::new(),
        }
    }
}
