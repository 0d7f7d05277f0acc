//! CLI settings: a JSON file plus environment overrides.
//!
//! ```json
//! {
//!   "rpc_url": "http://localhost:8545",
//!   "database_url": "sqlite:./index.db",
//!   "log": { "level": "info", "components": { "ledgerindex_core": "debug" } },
//!   "indexer": { "chain_id": "1", "start_block": 19000000, "batch": { "batch_size": 200 } }
//! }
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use ledgerindex_core::indexer::IndexerConfig;

use crate::tracing_setup::LogConfig;

pub const ENV_RPC_URL: &str = "LEDGERINDEX_RPC_URL";
pub const ENV_DATABASE_URL: &str = "LEDGERINDEX_DATABASE_URL";
pub const ENV_LOG: &str = "LEDGERINDEX_LOG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub rpc_url: String,
    /// `sqlite:<path>`, `postgres://…`, or `memory:`.
    pub database_url: String,
    pub log: LogConfig,
    pub indexer: IndexerConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".into(),
            database_url: "sqlite:./ledgerindex.db".into(),
            log: LogConfig::default(),
            indexer: IndexerConfig::default(),
        }
    }
}

impl Settings {
    /// Load from `path` (defaults when absent) and apply the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config {}", path.display()))?;
                Self::from_json(&raw)
                    .with_context(|| format!("parsing config {}", path.display()))?
            }
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Environment values win over the file.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(ENV_RPC_URL).filter(|v| !v.is_empty()) {
            self.rpc_url = url;
        }
        if let Some(url) = lookup(ENV_DATABASE_URL).filter(|v| !v.is_empty()) {
            self.database_url = url;
        }
        if let Some(level) = lookup(ENV_LOG).filter(|v| !v.is_empty()) {
            self.log.level = level;
        }
    }
}

/// Which store engine a database URL selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Database {
    Sqlite(String),
    Postgres(String),
    Memory,
}

impl Database {
    pub fn parse(url: &str) -> Result<Self> {
        if url == "memory:" || url == "memory" {
            return Ok(Self::Memory);
        }
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            return Ok(Self::Postgres(url.to_string()));
        }
        if let Some(path) = url.strip_prefix("sqlite:") {
            let path = path.trim_start_matches("//");
            anyhow::ensure!(!path.is_empty(), "sqlite database path is empty");
            return Ok(Self::Sqlite(path.to_string()));
        }
        anyhow::bail!("unsupported database url `{url}` (expected sqlite:, postgres:// or memory:)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let s = Settings::from_json(
            r#"{"rpc_url":"http://node:8545","indexer":{"chain_id":"137","batch":{"batch_size":50}}}"#,
        )
        .unwrap();
        assert_eq!(s.rpc_url, "http://node:8545");
        assert_eq!(s.database_url, "sqlite:./ledgerindex.db");
        assert_eq!(s.indexer.chain_id, "137");
        assert_eq!(s.indexer.batch.batch_size, 50);
        assert_eq!(s.indexer.reorg.depth, 12);
        assert_eq!(s.log.level, "info");
    }

    #[test]
    fn env_overrides_file() {
        let env: HashMap<&str, &str> = [
            (ENV_RPC_URL, "http://env:8545"),
            (ENV_DATABASE_URL, "postgres://u@db/index"),
            (ENV_LOG, "debug"),
        ]
        .into_iter()
        .collect();

        let mut s = Settings::default();
        s.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(s.rpc_url, "http://env:8545");
        assert_eq!(s.database_url, "postgres://u@db/index");
        assert_eq!(s.log.level, "debug");
    }

    #[test]
    fn empty_env_values_are_ignored() {
        let mut s = Settings::default();
        s.apply_env(|_| Some(String::new()));
        assert_eq!(s, Settings::default());
    }

    #[test]
    fn database_url_selects_engine() {
        assert_eq!(
            Database::parse("sqlite:./index.db").unwrap(),
            Database::Sqlite("./index.db".into())
        );
        assert_eq!(
            Database::parse("sqlite:///var/lib/index.db").unwrap(),
            Database::Sqlite("/var/lib/index.db".into())
        );
        assert!(matches!(
            Database::parse("postgresql://localhost/index").unwrap(),
            Database::Postgres(_)
        ));
        assert_eq!(Database::parse("memory:").unwrap(), Database::Memory);
        assert!(Database::parse("mysql://localhost").is_err());
        assert!(Database::parse("sqlite:").is_err());
    }
}
