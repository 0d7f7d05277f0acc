//! Idempotency keys.
//!
//! Every ingestion path (live subscription, historical fetch, replay) derives
//! the key through [`EventKey::derive`], so one logical event always maps to
//! one key:
//!
//! ```text
//! <kind>:<contract>:<discriminator>:<tx hash>
//! nft:0xbc4c…f13d:0x1a:0x9f2e…
//! ```
//!
//! Addresses and hashes are lower-cased. Hex discriminators lose their
//! leading zeros so a 32-byte topic word and a short hex literal agree.

use serde::{Deserialize, Serialize};

use crate::types::TransferKind;

/// Deterministic identifier of one logical transfer event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventKey(String);

impl EventKey {
    /// Build the key for `(kind, contract, discriminator, tx_hash)`.
    pub fn derive(kind: TransferKind, contract: &str, discriminator: &str, tx_hash: &str) -> Self {
        Self(format!(
            "{}:{}:{}:{}",
            kind.key_prefix(),
            contract.trim().to_ascii_lowercase(),
            normalize_discriminator(discriminator),
            tx_hash.trim().to_ascii_lowercase(),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EventKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn normalize_discriminator(raw: &str) -> String {
    let raw = raw.trim();
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => {
            let digits = hex.trim_start_matches('0').to_ascii_lowercase();
            if digits.is_empty() {
                "0x0".to_string()
            } else {
                format!("0x{digits}")
            }
        }
        None => raw.to_string(),
    }
}
