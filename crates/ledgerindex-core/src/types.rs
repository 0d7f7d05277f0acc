//! Shared types for the indexing pipeline.

use serde::{Deserialize, Serialize};

use crate::key::EventKey;

// ─── BlockSummary ─────────────────────────────────────────────────────────────

/// A minimal summary of a block, enough for reorg checks and timestamp enrichment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
}

impl BlockSummary {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockSummary) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }
}

// ─── TransferKind ─────────────────────────────────────────────────────────────

/// The two transfer event families the pipeline indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferKind {
    /// Non-fungible transfer; the discriminator is the token id.
    Nft,
    /// Fungible transfer; the discriminator is the transferred value.
    Token,
}

impl TransferKind {
    pub const ALL: [TransferKind; 2] = [TransferKind::Nft, TransferKind::Token];

    /// Event name persisted in the `event_name` column.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Nft => "NFTTransfer",
            Self::Token => "TokenTransfer",
        }
    }

    /// Prefix used in idempotency keys.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            Self::Nft => "nft",
            Self::Token => "token",
        }
    }

    /// Parse an `event_name` column value back into a kind.
    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "NFTTransfer" => Some(Self::Nft),
            "TokenTransfer" => Some(Self::Token),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransferKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.event_name())
    }
}

// ─── TransferLog ──────────────────────────────────────────────────────────────

/// A normalized transfer log as delivered by a [`ChainSource`](crate::source::ChainSource).
///
/// Decoding raw logs into this shape is the chain adapter's job; the pipeline
/// only ever sees normalized records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLog {
    pub kind: TransferKind,
    /// Emitting contract address.
    pub contract: String,
    pub from: String,
    pub to: String,
    /// Token id (NFT) or value (token), as a `0x` hex or decimal string.
    pub discriminator: String,
    pub block_number: u64,
    pub block_hash: Option<String>,
    pub tx_hash: String,
    pub log_index: u32,
    /// Block timestamp if the source already knows it.
    pub timestamp: Option<i64>,
}

impl TransferLog {
    /// The idempotency key of the logical event this log describes.
    pub fn event_key(&self) -> EventKey {
        EventKey::derive(self.kind, &self.contract, &self.discriminator, &self.tx_hash)
    }

    /// Convert into a persisted record. `timestamp` overrides the log's own timestamp.
    pub fn into_event(self, timestamp: i64) -> IndexedEvent {
        let now = chrono::Utc::now().timestamp();
        let key = self.event_key();
        let (token_id, value) = match self.kind {
            TransferKind::Nft => (Some(self.discriminator), None),
            TransferKind::Token => (None, Some(self.discriminator)),
        };
        IndexedEvent {
            event_key: key.into_string(),
            block_number: self.block_number,
            block_hash: self.block_hash,
            tx_hash: self.tx_hash.to_ascii_lowercase(),
            log_index: self.log_index,
            event_name: self.kind.event_name().to_string(),
            contract: self.contract.to_ascii_lowercase(),
            from: self.from.to_ascii_lowercase(),
            to: self.to.to_ascii_lowercase(),
            token_id,
            value,
            timestamp,
            created_at: now,
            updated_at: now,
        }
    }
}

// ─── IndexedEvent ─────────────────────────────────────────────────────────────

/// A canonical transfer record as stored in the `events` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexedEvent {
    /// Idempotency key; unique across the table.
    pub event_key: String,
    pub block_number: u64,
    pub block_hash: Option<String>,
    pub tx_hash: String,
    pub log_index: u32,
    /// `"NFTTransfer"` or `"TokenTransfer"`.
    pub event_name: String,
    pub contract: String,
    pub from: String,
    pub to: String,
    pub token_id: Option<String>,
    pub value: Option<String>,
    /// Block timestamp (seconds).
    pub timestamp: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl IndexedEvent {
    pub fn kind(&self) -> Option<TransferKind> {
        TransferKind::from_event_name(&self.event_name)
    }
}

// ─── ProcessedEventMarker ─────────────────────────────────────────────────────

/// Durable record that a logical event has been persisted at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEventMarker {
    pub key: String,
    /// Block of the event; lets rollback delete markers by height.
    pub block_number: u64,
    pub processed: bool,
    pub timestamp: i64,
}

impl ProcessedEventMarker {
    pub fn new(key: impl Into<String>, block_number: u64) -> Self {
        Self {
            key: key.into(),
            block_number,
            processed: true,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

// ─── LogFilter ────────────────────────────────────────────────────────────────

/// Which logs a chain source should deliver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFilter {
    /// Only deliver logs from these contract addresses (empty = all addresses).
    pub addresses: Vec<String>,
    /// Only deliver these transfer kinds (empty = both).
    pub kinds: Vec<TransferKind>,
    /// First block to deliver for subscriptions; `None` = from the current head.
    pub from_block: Option<u64>,
}

impl LogFilter {
    /// Filter for a set of contracts and a single transfer kind.
    pub fn new(addresses: Vec<String>, kind: TransferKind) -> Self {
        Self {
            addresses,
            kinds: vec![kind],
            from_block: None,
        }
    }

    /// Set the start block.
    pub fn from_block(mut self, block: u64) -> Self {
        self.from_block = Some(block);
        self
    }

    /// Returns `true` if `address` matches this filter.
    pub fn matches_address(&self, address: &str) -> bool {
        self.addresses.is_empty()
            || self.addresses.iter().any(|a| a.eq_ignore_ascii_case(address))
    }

    /// Returns `true` if `kind` matches this filter.
    pub fn matches_kind(&self, kind: TransferKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }

    pub fn matches(&self, log: &TransferLog) -> bool {
        self.matches_address(&log.contract) && self.matches_kind(log.kind)
    }
}

// ─── EventQuery ───────────────────────────────────────────────────────────────

/// Read-side filter for `GetEvents`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventQuery {
    pub kind: Option<TransferKind>,
    pub contract: Option<String>,
    pub from_block: Option<u64>,
    pub to_block: Option<u64>,
    pub limit: u32,
    pub offset: u32,
}

impl Default for EventQuery {
    fn default() -> Self {
        Self {
            kind: None,
            contract: None,
            from_block: None,
            to_block: None,
            limit: 100,
            offset: 0,
        }
    }
}

impl EventQuery {
    /// Returns `true` if `event` satisfies every predicate (ignores paging).
    pub fn matches(&self, event: &IndexedEvent) -> bool {
        if let Some(kind) = self.kind {
            if event.event_name != kind.event_name() {
                return false;
            }
        }
        if let Some(contract) = &self.contract {
            if !event.contract.eq_ignore_ascii_case(contract) {
                return false;
            }
        }
        if self.from_block.is_some_and(|from| event.block_number < from) {
            return false;
        }
        if self.to_block.is_some_and(|to| event.block_number > to) {
            return false;
        }
        true
    }

    /// Stable string form used in cache keys.
    pub fn fingerprint(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.kind.map(|k| k.key_prefix()).unwrap_or("*"),
            self.contract.as_deref().map(str::to_ascii_lowercase).unwrap_or_else(|| "*".into()),
            self.from_block.map(|b| b.to_string()).unwrap_or_else(|| "*".into()),
            self.to_block.map(|b| b.to_string()).unwrap_or_else(|| "*".into()),
            self.limit,
            self.offset,
        )
    }
}

// ─── IndexStats ───────────────────────────────────────────────────────────────

/// Aggregate counters over the `events` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_events: u64,
    pub contracts: u64,
    pub latest_block: Option<u64>,
}

/// Returns `true` for a `0x`-prefixed, 20-byte hex address.
pub fn is_valid_address(address: &str) -> bool {
    address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .is_some_and(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
}

// ─── Tests ────────────────────────────────────────────────────────────────────
