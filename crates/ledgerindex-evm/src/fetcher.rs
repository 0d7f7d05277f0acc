//! EVM log fetcher and chain source.
//!
//! Uses JSON-RPC `eth_getLogs` with range batching for both historical
//! fetches and the polling live subscription, and decodes the standard
//! `Transfer(address,address,uint256)` event into [`TransferLog`]s:
//!
//! - 4 topics: NFT transfer, token id in `topics[3]`
//! - 3 topics: token transfer, value in `data`
//!
//! Logs flagged `removed` by the node are dropped here; reorg handling
//! belongs to the reorg monitor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use ledgerindex_core::error::IndexerError;
use ledgerindex_core::source::{ChainSource, LogSubscription, SourceEvent};
use ledgerindex_core::types::{BlockSummary, LogFilter, TransferKind, TransferLog};

use crate::rpc::EvmRpcClient;

/// `keccak256("Transfer(address,address,uint256)")`
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// A raw EVM log as returned by `eth_getLogs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    #[serde(rename = "data")]
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "blockHash")]
    pub block_hash: Option<String>,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
    #[serde(rename = "removed", default)]
    pub removed: Option<bool>,
}

impl RawLog {
    pub fn block_number_u64(&self) -> Result<u64, IndexerError> {
        try_parse_hex_u64(&self.block_number).ok_or_else(|| {
            IndexerError::Decode(format!("log blockNumber {:?} is not a hex quantity", self.block_number))
        })
    }

    /// Fails on malformed hex and on indexes that do not fit in `u32`.
    pub fn log_index_u32(&self) -> Result<u32, IndexerError> {
        let raw = try_parse_hex_u64(&self.log_index).ok_or_else(|| {
            IndexerError::Decode(format!("log logIndex {:?} is not a hex quantity", self.log_index))
        })?;
        u32::try_from(raw)
            .map_err(|_| IndexerError::Decode(format!("log logIndex {raw} exceeds u32")))
    }

    /// Returns `true` if this log was removed by a reorg.
    pub fn is_removed(&self) -> bool {
        self.removed.unwrap_or(false)
    }

    /// Decode a `Transfer` log.
    ///
    /// `Ok(None)` for removed logs, other events and malformed topic words.
    /// A block number or log index that cannot be decoded is an error.
    pub fn to_transfer(&self) -> Result<Option<TransferLog>, IndexerError> {
        if self.is_removed() {
            return Ok(None);
        }
        match self.topics.first() {
            Some(topic0) if topic0.eq_ignore_ascii_case(TRANSFER_TOPIC) => {}
            _ => return Ok(None),
        }
        let decoded = match self.topics.len() {
            4 => word_to_quantity(&self.topics[3]).map(|q| (TransferKind::Nft, q)),
            3 => word_to_quantity(&self.data).map(|q| (TransferKind::Token, q)),
            _ => None,
        };
        let (Some((kind, discriminator)), Some(from), Some(to)) = (
            decoded,
            self.topics.get(1).and_then(|t| topic_to_address(t)),
            self.topics.get(2).and_then(|t| topic_to_address(t)),
        ) else {
            return Ok(None);
        };
        Ok(Some(TransferLog {
            kind,
            contract: self.address.to_ascii_lowercase(),
            from,
            to,
            discriminator,
            block_number: self.block_number_u64()?,
            block_hash: self.block_hash.clone(),
            tx_hash: self.tx_hash.to_ascii_lowercase(),
            log_index: self.log_index_u32()?,
            timestamp: None,
        }))
    }
}

/// Parse a hex quantity (with or without `0x`); `None` on malformed input.
pub fn try_parse_hex_u64(s: &str) -> Option<u64> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).ok()
}

/// Convert a `Value` JSON block response to `BlockSummary`.
pub fn block_from_json(v: &Value) -> Option<BlockSummary> {
    Some(BlockSummary {
        number: try_parse_hex_u64(v["number"].as_str()?)?,
        hash: v["hash"].as_str()?.to_string(),
        parent_hash: v["parentHash"].as_str()?.to_string(),
        timestamp: try_parse_hex_u64(v["timestamp"].as_str()?)? as i64,
    })
}

/// Last 20 bytes of a 32-byte topic, as a lower-case address.
fn topic_to_address(topic: &str) -> Option<String> {
    let hex = topic.strip_prefix("0x").unwrap_or(topic);
    if hex.len() < 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!("0x{}", hex[hex.len() - 40..].to_ascii_lowercase()))
}

/// A 256-bit word as a canonical string: decimal when it fits in `u128`,
/// otherwise minimal `0x` hex.
fn word_to_quantity(word: &str) -> Option<String> {
    let hex = word.strip_prefix("0x").unwrap_or(word);
    if hex.is_empty() || hex.len() > 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let trimmed = hex.trim_start_matches('0');
    if trimmed.len() <= 32 {
        let n = if trimmed.is_empty() {
            0
        } else {
            u128::from_str_radix(trimmed, 16).ok()?
        };
        return Some(n.to_string());
    }
    Some(format!("0x{}", trimmed.to_ascii_lowercase()))
}

// ─── EvmFetcher ───────────────────────────────────────────────────────────────

/// EVM fetcher that wraps an `EvmRpcClient` and adds batching logic.
pub struct EvmFetcher<C> {
    client: Arc<C>,
    max_range: u64,
}

impl<C> Clone for EvmFetcher<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            max_range: self.max_range,
        }
    }
}

impl<C: EvmRpcClient> EvmFetcher<C> {
    pub fn new(client: Arc<C>, max_range: u64) -> Self {
        Self {
            client,
            max_range: max_range.max(1),
        }
    }

    /// Fetch the current chain head block number.
    pub async fn head_block_number(&self) -> Result<u64, IndexerError> {
        self.client.get_block_number().await
    }

    /// Fetch all raw `Transfer` logs in `[from, to]` for `addresses`,
    /// splitting the range into `max_range`-block requests.
    pub async fn logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[String],
    ) -> Result<Vec<RawLog>, IndexerError> {
        let mut all_logs = Vec::new();
        let mut start = from;
        while start <= to {
            let end = start.saturating_add(self.max_range - 1).min(to);
            let chunk = self
                .client
                .get_logs(start, end, addresses, TRANSFER_TOPIC)
                .await?;
            all_logs.extend(chunk);
            if end == u64::MAX {
                break;
            }
            start = end + 1;
        }
        Ok(all_logs)
    }

    /// Decoded transfers in `[from, to]` matching `filter`, ordered by
    /// block then log index.
    pub async fn transfers(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<TransferLog>, IndexerError> {
        let raw = self.logs(from, to, &filter.addresses).await?;
        let mut decoded = Vec::with_capacity(raw.len());
        for log in &raw {
            if let Some(transfer) = log.to_transfer()? {
                if filter.matches(&transfer) {
                    decoded.push(transfer);
                }
            }
        }
        decoded.sort_by_key(|log| (log.block_number, log.log_index));
        Ok(decoded)
    }
}

// ─── EvmChainSource ───────────────────────────────────────────────────────────

/// Settings for [`EvmChainSource`].
#[derive(Debug, Clone)]
pub struct EvmSourceConfig {
    /// Blocks per `eth_getLogs` request.
    pub log_range_size: u64,
    /// Live polling interval.
    pub poll_interval: Duration,
    /// Capacity of each subscription's log channel.
    pub buffer: usize,
    /// A subscription gives up (its stream ends) after this many failures in a row.
    pub max_consecutive_errors: u32,
}

impl Default for EvmSourceConfig {
    fn default() -> Self {
        Self {
            log_range_size: 1_000,
            poll_interval: Duration::from_millis(2_000),
            buffer: 512,
            max_consecutive_errors: 5,
        }
    }
}

/// [`ChainSource`] over an EVM JSON-RPC endpoint.
///
/// `subscribe_logs` is a polling subscription: each tick reads the head and
/// delivers every matching log from the last delivered block up to it,
/// followed by a [`SourceEvent::Scanned`] marker per fetched range.
pub struct EvmChainSource<C> {
    client: Arc<C>,
    fetcher: EvmFetcher<C>,
    config: EvmSourceConfig,
}

impl<C: EvmRpcClient + 'static> EvmChainSource<C> {
    pub fn new(client: C, config: EvmSourceConfig) -> Self {
        let client = Arc::new(client);
        Self {
            fetcher: EvmFetcher::new(client.clone(), config.log_range_size),
            client,
            config,
        }
    }

    pub fn fetcher(&self) -> &EvmFetcher<C> {
        &self.fetcher
    }
}

#[async_trait]
impl<C: EvmRpcClient + 'static> ChainSource for EvmChainSource<C> {
    async fn subscribe_logs(
        &self,
        filter: LogFilter,
        cancel: CancellationToken,
    ) -> Result<LogSubscription, IndexerError> {
        let (events_tx, events) = mpsc::channel(self.config.buffer.max(1));
        let (errors_tx, errors) = mpsc::channel(16);
        let poller = Poller {
            fetcher: self.fetcher.clone(),
            filter,
            config: self.config.clone(),
            events: events_tx,
            errors: errors_tx,
            cancel,
        };
        tokio::spawn(poller.run());
        Ok(LogSubscription { events, errors })
    }

    async fn filter_logs(
        &self,
        from: u64,
        to: u64,
        filter: &LogFilter,
    ) -> Result<Vec<TransferLog>, IndexerError> {
        if from > to {
            return Err(IndexerError::Configuration(format!(
                "invalid block range: from {from} > to {to}"
            )));
        }
        self.fetcher.transfers(from, to, filter).await
    }

    async fn block_by_number(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError> {
        self.client.get_block_by_number(number).await
    }

    async fn block_by_hash(&self, hash: &str) -> Result<Option<BlockSummary>, IndexerError> {
        self.client.get_block_by_hash(hash).await
    }

    async fn current_block_number(&self) -> Result<u64, IndexerError> {
        self.client.get_block_number().await
    }

    async fn close(&self) {
        tracing::info!("EVM chain source closed");
    }
}

/// Background task behind one polling subscription.
struct Poller<C> {
    fetcher: EvmFetcher<C>,
    filter: LogFilter,
    config: EvmSourceConfig,
    events: mpsc::Sender<SourceEvent>,
    errors: mpsc::Sender<IndexerError>,
    cancel: CancellationToken,
}

impl<C: EvmRpcClient + 'static> Poller<C> {
    async fn run(self) {
        let mut next = self.filter.from_block;
        let mut failures = 0u32;
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let head = match self.fetcher.head_block_number().await {
                Ok(head) => head,
                Err(e) => {
                    if self.report(e, &mut failures) {
                        return;
                    }
                    continue;
                }
            };
            let mut cursor = *next.get_or_insert(head.saturating_add(1));

            while cursor <= head {
                let end = cursor
                    .saturating_add(self.config.log_range_size.max(1) - 1)
                    .min(head);
                match self.fetcher.transfers(cursor, end, &self.filter).await {
                    Ok(logs) => {
                        failures = 0;
                        for log in logs {
                            if !self.send(SourceEvent::Log(log)).await {
                                return;
                            }
                        }
                        if !self.send(SourceEvent::Scanned(end)).await {
                            return;
                        }
                        cursor = end.saturating_add(1);
                        next = Some(cursor);
                    }
                    Err(e) => {
                        if self.report(e, &mut failures) {
                            return;
                        }
                        break;
                    }
                }
                if end == u64::MAX {
                    break;
                }
            }
        }
    }

    /// Deliver `event`; `false` once the subscription is cancelled or dropped.
    async fn send(&self, event: SourceEvent) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.events.send(event) => sent.is_ok(),
        }
    }

    /// Surface `error`; returns `true` when the subscription should end.
    fn report(&self, error: IndexerError, failures: &mut u32) -> bool {
        *failures += 1;
        tracing::warn!(attempt = *failures, error = %error, "log poll failed");
        let _ = self.errors.try_send(error);
        if *failures >= self.config.max_consecutive_errors.max(1) {
            tracing::warn!(failures = *failures, "log subscription giving up");
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    const NFT: &str = "0xbc4ca0eda7647a8ab7c2061c2e118a18a936f13d";
    const TOKEN: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";

    fn word(hex: &str) -> String {
        format!("0x{hex:0>64}")
    }

    fn raw(address: &str, block: u64, index: u32, topics: Vec<String>, data: &str) -> RawLog {
        RawLog {
            address: address.into(),
            topics,
            data: data.into(),
            block_number: format!("0x{block:x}"),
            block_hash: Some(format!("0x{block:064x}")),
            tx_hash: format!("0x{:064X}", block * 100 + index as u64),
            log_index: format!("0x{index:x}"),
            removed: None,
        }
    }

    fn nft_log(block: u64, index: u32, token_id: &str) -> RawLog {
        raw(
            NFT,
            block,
            index,
            vec![
                TRANSFER_TOPIC.into(),
                word("1111111111111111111111111111111111111111"),
                word("2222222222222222222222222222222222222222"),
                word(token_id),
            ],
            "0x",
        )
    }

    fn token_log(block: u64, index: u32, value: &str) -> RawLog {
        raw(
            TOKEN,
            block,
            index,
            vec![
                TRANSFER_TOPIC.into(),
                word("3333333333333333333333333333333333333333"),
                word("4444444444444444444444444444444444444444"),
            ],
            &word(value),
        )
    }

    #[test]
    fn parse_hex_u64_basic() {
        assert_eq!(try_parse_hex_u64("0x1"), Some(1));
        assert_eq!(try_parse_hex_u64("0xff"), Some(255));
        assert_eq!(try_parse_hex_u64("1234"), Some(0x1234));
        assert_eq!(try_parse_hex_u64("0xzz"), None);
    }

    #[test]
    fn raw_log_block_number() {
        let log = nft_log(5_000_000_000, 5, "1");
        assert_eq!(log.block_number_u64().unwrap(), 5_000_000_000);
        assert_eq!(log.log_index_u32().unwrap(), 5);
    }

    #[test]
    fn malformed_block_number_is_a_decode_error() {
        let mut log = nft_log(1, 0, "1");
        log.block_number = "0xnothex".into();
        assert!(matches!(log.block_number_u64(), Err(IndexerError::Decode(_))));
        assert!(matches!(log.to_transfer(), Err(IndexerError::Decode(_))));
    }

    #[test]
    fn oversized_log_index_is_a_decode_error() {
        let mut log = token_log(1, 0, "1");
        log.log_index = format!("0x{:x}", u64::from(u32::MAX) + 1);
        assert!(matches!(log.log_index_u32(), Err(IndexerError::Decode(_))));
        assert!(matches!(log.to_transfer(), Err(IndexerError::Decode(_))));

        log.log_index = format!("0x{:x}", u32::MAX);
        assert_eq!(log.log_index_u32().unwrap(), u32::MAX);
    }

    #[test]
    fn removed_log_with_bad_position_is_still_skipped() {
        let mut log = nft_log(1, 0, "1");
        log.removed = Some(true);
        log.log_index = "garbage".into();
        assert!(log.to_transfer().unwrap().is_none());
    }

    #[test]
    fn four_topics_decode_as_nft() {
        let t = nft_log(100, 2, "1a").to_transfer().unwrap().unwrap();
        assert_eq!(t.kind, TransferKind::Nft);
        assert_eq!(t.contract, NFT);
        assert_eq!(t.from, "0x1111111111111111111111111111111111111111");
        assert_eq!(t.to, "0x2222222222222222222222222222222222222222");
        assert_eq!(t.discriminator, "26");
        assert_eq!(t.block_number, 100);
        assert_eq!(t.log_index, 2);
        assert_eq!(t.tx_hash, t.tx_hash.to_ascii_lowercase());
    }

    #[test]
    fn three_topics_decode_as_token_with_value_from_data() {
        let t = token_log(7, 0, "de0b6b3a7640000").to_transfer().unwrap().unwrap();
        assert_eq!(t.kind, TransferKind::Token);
        assert_eq!(t.discriminator, "1000000000000000000");
    }

    #[test]
    fn huge_values_stay_hex() {
        let t = token_log(7, 0, &"f".repeat(64)).to_transfer().unwrap().unwrap();
        assert_eq!(t.discriminator, format!("0x{}", "f".repeat(64)));
    }

    #[test]
    fn removed_and_foreign_logs_are_skipped() {
        let mut removed = nft_log(1, 0, "1");
        removed.removed = Some(true);
        assert!(removed.to_transfer().unwrap().is_none());

        let mut approval = nft_log(1, 0, "1");
        approval.topics[0] =
            "0x8c5be1e5ebec7d5bd14f71427d1e84f3dd0314c0f7b2291e5b200ac8c7c3b925".into();
        assert!(approval.to_transfer().unwrap().is_none());

        let mut short = token_log(1, 0, "1");
        short.topics.truncate(2);
        assert!(short.to_transfer().unwrap().is_none());
    }

    #[test]
    fn block_json_decodes() {
        let v = serde_json::json!({
            "number": "0x10",
            "hash": "0xaa",
            "parentHash": "0xbb",
            "timestamp": "0x65f0a000",
            "transactions": []
        });
        let b = block_from_json(&v).unwrap();
        assert_eq!(b.number, 16);
        assert_eq!(b.parent_hash, "0xbb");
        assert_eq!(b.timestamp, 0x65f0a000);
    }

    /// Serves logs from a block → logs map; records requested ranges.
    #[derive(Default)]
    struct ScriptedRpc {
        head: Mutex<u64>,
        logs: Mutex<BTreeMap<u64, Vec<RawLog>>>,
        ranges: Mutex<Vec<(u64, u64)>>,
    }

    #[async_trait]
    impl EvmRpcClient for ScriptedRpc {
        async fn get_block_number(&self) -> Result<u64, IndexerError> {
            Ok(*self.head.lock().unwrap())
        }
        async fn get_block_by_number(&self, _: u64) -> Result<Option<BlockSummary>, IndexerError> {
            Ok(None)
        }
        async fn get_block_by_hash(&self, _: &str) -> Result<Option<BlockSummary>, IndexerError> {
            Ok(None)
        }
        async fn get_logs(
            &self,
            from: u64,
            to: u64,
            _addresses: &[String],
            _topic0: &str,
        ) -> Result<Vec<RawLog>, IndexerError> {
            self.ranges.lock().unwrap().push((from, to));
            Ok(self
                .logs
                .lock()
                .unwrap()
                .range(from..=to)
                .flat_map(|(_, logs)| logs.clone())
                .collect())
        }
    }

    #[tokio::test]
    async fn fetcher_splits_ranges() {
        let rpc = Arc::new(ScriptedRpc::default());
        let fetcher = EvmFetcher::new(rpc.clone(), 100);
        fetcher.logs(1_000, 1_250, &[]).await.unwrap();
        assert_eq!(
            *rpc.ranges.lock().unwrap(),
            vec![(1_000, 1_099), (1_100, 1_199), (1_200, 1_250)]
        );
    }

    #[tokio::test]
    async fn filter_logs_applies_kind_and_address() {
        let rpc = ScriptedRpc::default();
        rpc.logs
            .lock()
            .unwrap()
            .insert(10, vec![token_log(10, 1, "5"), nft_log(10, 0, "9")]);
        let source = EvmChainSource::new(rpc, EvmSourceConfig::default());

        let nfts = source
            .filter_logs(
                0,
                20,
                &LogFilter::new(
                    vec!["0xBC4CA0EdA7647A8aB7C2061c2E118A18a936f13D".into()],
                    TransferKind::Nft,
                ),
            )
            .await
            .unwrap();
        assert_eq!(nfts.len(), 1);
        assert_eq!(nfts[0].discriminator, "9");

        assert!(source
            .filter_logs(0, 20, &LogFilter::new(vec![NFT.into()], TransferKind::Token))
            .await
            .unwrap()
            .is_empty());
        assert!(source
            .filter_logs(5, 4, &LogFilter::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn subscription_delivers_logs_then_scanned_marker() {
        let rpc = ScriptedRpc::default();
        *rpc.head.lock().unwrap() = 12;
        rpc.logs.lock().unwrap().insert(11, vec![token_log(11, 0, "1")]);
        let source = EvmChainSource::new(
            rpc,
            EvmSourceConfig {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );

        let cancel = CancellationToken::new();
        let filter = LogFilter::new(vec![TOKEN.into()], TransferKind::Token).from_block(10);
        let mut sub = source.subscribe_logs(filter, cancel.clone()).await.unwrap();

        match sub.events.recv().await.unwrap() {
            SourceEvent::Log(log) => assert_eq!(log.block_number, 11),
            other => panic!("expected log, got {other:?}"),
        }
        assert_eq!(sub.events.recv().await.unwrap(), SourceEvent::Scanned(12));

        cancel.cancel();
        assert!(sub.events.recv().await.is_none());
    }
}
