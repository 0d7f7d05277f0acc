//! EVM JSON-RPC client backed by `reqwest`.
//!
//! Transport failures (connect, timeout, non-2xx) are retried with the
//! shared [`RetryPolicy`]; JSON-RPC error objects are returned as-is because
//! repeating the same call will not change the node's answer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use ledgerindex_core::error::IndexerError;
use ledgerindex_core::retry::{RetryConfig, RetryPolicy};
use ledgerindex_core::types::BlockSummary;

use crate::fetcher::{block_from_json, RawLog};

// ─── Wire types ───────────────────────────────────────────────────────────────

/// A JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    pub params: Vec<Value>,
    pub id: u64,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params,
            id,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

/// A JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// The `result` field, or the node's error as [`IndexerError::Rpc`].
    pub fn into_result(self, method: &str) -> Result<Value, IndexerError> {
        if let Some(err) = self.error {
            return Err(IndexerError::Rpc(format!(
                "{method}: JSON-RPC error {}: {}",
                err.code, err.message
            )));
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

// ─── Client trait ─────────────────────────────────────────────────────────────

/// The JSON-RPC calls the EVM chain source needs.
#[async_trait]
pub trait EvmRpcClient: Send + Sync {
    /// `eth_blockNumber`
    async fn get_block_number(&self) -> Result<u64, IndexerError>;

    /// `eth_getBlockByNumber` (header only). `Ok(None)` if the node does not know it.
    async fn get_block_by_number(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError>;

    /// `eth_getBlockByHash` (header only).
    async fn get_block_by_hash(&self, hash: &str) -> Result<Option<BlockSummary>, IndexerError>;

    /// `eth_getLogs` for `[from, to]`, restricted to `addresses` and `topic0`.
    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[String],
        topic0: &str,
    ) -> Result<Vec<RawLog>, IndexerError>;
}

// ─── HttpEvmClient ────────────────────────────────────────────────────────────

/// Configuration for [`HttpEvmClient`].
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub retry: RetryConfig,
    pub request_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP JSON-RPC client.
pub struct HttpEvmClient {
    url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

impl HttpEvmClient {
    /// Create a client for the given JSON-RPC endpoint URL.
    pub fn new(url: impl Into<String>, config: HttpClientConfig) -> Result<Self, IndexerError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| IndexerError::Configuration(format!("http client: {e}")))?;

        Ok(Self {
            url: url.into(),
            http,
            retry: RetryPolicy::new(config.retry),
            next_id: AtomicU64::new(1),
        })
    }

    /// Create with default configuration.
    pub fn default_for(url: impl Into<String>) -> Result<Self, IndexerError> {
        Self::new(url, HttpClientConfig::default())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send_once(&self, req: &JsonRpcRequest) -> Result<JsonRpcResponse, IndexerError> {
        let resp = self
            .http
            .post(&self.url)
            .json(req)
            .send()
            .await
            .map_err(|e| IndexerError::Rpc(format!("{}: {e}", req.method)))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(IndexerError::Rpc(format!(
                "{}: HTTP {status}: {body}",
                req.method
            )));
        }

        resp.json::<JsonRpcResponse>()
            .await
            .map_err(|e| IndexerError::Rpc(format!("{}: malformed response: {e}", req.method)))
    }

    /// Send `method` with retry on transport failure and return its `result`.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, IndexerError> {
        let req = JsonRpcRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params);
        let resp = self.retry.retry(method, None, || self.send_once(&req)).await?;
        resp.into_result(method)
    }
}

#[async_trait]
impl EvmRpcClient for HttpEvmClient {
    async fn get_block_number(&self) -> Result<u64, IndexerError> {
        let value = self.call("eth_blockNumber", vec![]).await?;
        value
            .as_str()
            .and_then(crate::fetcher::try_parse_hex_u64)
            .ok_or_else(|| IndexerError::Rpc(format!("eth_blockNumber: unexpected result {value}")))
    }

    async fn get_block_by_number(&self, number: u64) -> Result<Option<BlockSummary>, IndexerError> {
        let value = self
            .call("eth_getBlockByNumber", vec![json!(format!("0x{number:x}")), json!(false)])
            .await?;
        decode_block("eth_getBlockByNumber", &value)
    }

    async fn get_block_by_hash(&self, hash: &str) -> Result<Option<BlockSummary>, IndexerError> {
        let value = self
            .call("eth_getBlockByHash", vec![json!(hash), json!(false)])
            .await?;
        decode_block("eth_getBlockByHash", &value)
    }

    async fn get_logs(
        &self,
        from: u64,
        to: u64,
        addresses: &[String],
        topic0: &str,
    ) -> Result<Vec<RawLog>, IndexerError> {
        let filter = json!({
            "fromBlock": format!("0x{from:x}"),
            "toBlock": format!("0x{to:x}"),
            "address": addresses,
            "topics": [topic0],
        });
        let value = self.call("eth_getLogs", vec![filter]).await?;
        serde_json::from_value(value)
            .map_err(|e| IndexerError::Rpc(format!("eth_getLogs: malformed logs: {e}")))
    }
}

fn decode_block(method: &str, value: &Value) -> Result<Option<BlockSummary>, IndexerError> {
    if value.is_null() {
        return Ok(None);
    }
    block_from_json(value)
        .map(Some)
        .ok_or_else(|| IndexerError::Rpc(format!("{method}: malformed block")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serializes_as_jsonrpc_2() {
        let req = JsonRpcRequest::new(7, "eth_blockNumber", vec![]);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["jsonrpc"], "2.0");
        assert_eq!(v["id"], 7);
        assert_eq!(v["method"], "eth_blockNumber");
        assert!(v["params"].as_array().unwrap().is_empty());
    }

    #[test]
    fn error_object_becomes_rpc_error() {
        let resp: JsonRpcResponse = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32005,"message":"query returned more than 10000 results"}}"#,
        )
        .unwrap();
        let err = resp.into_result("eth_getLogs").unwrap_err();
        assert!(matches!(err, IndexerError::Rpc(ref m) if m.contains("-32005")));
    }

    #[test]
    fn null_block_is_not_found() {
        assert_eq!(decode_block("eth_getBlockByNumber", &Value::Null).unwrap(), None);
        assert!(decode_block("eth_getBlockByNumber", &json!({"number": "0x1"})).is_err());
    }

    #[test]
    fn client_builds_without_network() {
        let client = HttpEvmClient::default_for("http://127.0.0.1:8545").unwrap();
        assert_eq!(client.url(), "http://127.0.0.1:8545");
    }
}
