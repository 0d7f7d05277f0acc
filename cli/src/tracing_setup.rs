//! `tracing-subscriber` initialisation.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default level for every target.
    pub level: String,
    /// Per-target overrides, e.g. `{"ledgerindex_core::reorg": "debug"}`.
    pub components: BTreeMap<String, String>,
    /// One JSON object per line instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            components: BTreeMap::new(),
            json: false,
        }
    }
}

impl LogConfig {
    /// Filter directives in `EnvFilter` syntax.
    pub fn directives(&self) -> String {
        let mut parts = vec![self.level.clone()];
        parts.extend(
            self.components
                .iter()
                .map(|(target, level)| format!("{target}={level}")),
        );
        parts.join(",")
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the config when set.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.directives()))
        .map_err(|e| anyhow!("invalid log filter: {e}"))?;

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_current_span(false),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()
    }
    .map_err(|e| anyhow!("tracing init: {e}"))
}
