//! Streams (Mercury) price-report trigger
//!
//! Feed reports travel inside a trigger event's outputs as
//!
//! ```text
//! { "Payload": [FeedReport...], "Metadata": { "Signers": [...], "MinRequiredSignatures": n },
//!   "Timestamp": t }
//! ```
//!
//! Byte fields are `0x`-prefixed hex so encoded events are byte-for-byte
//! reproducible across nodes.

pub mod aggregator;
pub mod trigger_service;

use std::fmt;
use std::str::FromStr;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::capabilities::TriggerEvent;
use crate::codec::{hex_bytes, hex_bytes_list};
use crate::{Error, Result};

pub use aggregator::MercuryRemoteAggregator;
pub use trigger_service::{MercuryTriggerService, StreamsTriggerConfig};

/// Id prefix of the only trigger that can be consumed remotely
pub const STREAMS_TRIGGER_PREFIX: &str = "streams-trigger";

/// Default id the trigger service registers under
pub const DEFAULT_TRIGGER_ID: &str = "streams-trigger@1.0.0";

/// 32-byte feed identifier in `0x`-prefixed lowercase hex
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FeedId(String);

impl FeedId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for FeedId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let hex_part = s
            .strip_prefix("0x")
            .ok_or_else(|| Error::InvalidConfig(format!("feed id {s} must start with 0x")))?;
        if hex_part.len() != 64 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidConfig(format!(
                "feed id {s} must be 32 bytes of hex"
            )));
        }
        Ok(Self(format!("0x{}", hex_part.to_ascii_lowercase())))
    }
}

impl TryFrom<String> for FeedId {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<FeedId> for String {
    fn from(id: FeedId) -> Self {
        id.0
    }
}

impl fmt::Display for FeedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One signed price report for one feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FeedReport {
    #[serde(rename = "FeedID")]
    pub feed_id: FeedId,

    #[serde(with = "hex_bytes")]
    pub full_report: Vec<u8>,

    #[serde(with = "hex_bytes")]
    pub report_context: Vec<u8>,

    #[serde(with = "hex_bytes_list")]
    pub signatures: Vec<Vec<u8>>,

    /// Unsigned big-endian integer
    #[serde(with = "hex_bytes")]
    pub benchmark_price: Vec<u8>,

    /// Unix seconds
    pub observation_timestamp: i64,
}

impl FeedReport {
    /// Benchmark price as an integer
    #[must_use]
    pub fn price(&self) -> BigUint {
        BigUint::from_bytes_be(&self.benchmark_price)
    }
}

/// Who signed the reports and how many signatures a consumer must check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SignersMetadata {
    #[serde(with = "hex_bytes_list")]
    pub signers: Vec<Vec<u8>>,
    pub min_required_signatures: usize,
}

/// Decoded trigger event outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TriggerOutputs {
    pub payload: Vec<FeedReport>,
    #[serde(default)]
    pub metadata: SignersMetadata,
    #[serde(default)]
    pub timestamp: i64,
}

/// Event id for the tick at `timestamp` over the subscribed `feeds`
///
/// Depends only on the aligned tick and the feed set, never on report
/// contents, so every member of a capability DON names the same event even
/// when their latest reports differ. Feed order does not matter.
#[must_use]
pub fn event_id(timestamp: i64, feeds: &[FeedId]) -> String {
    let mut sorted: Vec<&FeedId> = feeds.iter().collect();
    sorted.sort();
    sorted.dedup();

    let mut hasher = Sha256::new();
    hasher.update(timestamp.to_be_bytes());
    for feed in sorted {
        hasher.update(feed.as_str().as_bytes());
    }
    format!("streams_{}", hex::encode(hasher.finalize()))
}

/// Build a trigger event carrying `reports`
///
/// # Errors
///
/// Returns error if the outputs cannot be serialized
pub fn wrap_reports(
    trigger_type: &str,
    id: &str,
    reports: Vec<FeedReport>,
    timestamp: i64,
    metadata: SignersMetadata,
) -> Result<TriggerEvent> {
    let outputs = TriggerOutputs {
        payload: reports,
        metadata,
        timestamp,
    };
    Ok(TriggerEvent {
        trigger_type: trigger_type.to_string(),
        id: id.to_string(),
        outputs: serde_json::to_value(outputs)?,
    })
}

/// Extract the feed reports from a trigger event
///
/// # Errors
///
/// Returns [`Error::Codec`] if the outputs do not hold feed reports
pub fn unwrap_reports(event: &TriggerEvent) -> Result<TriggerOutputs> {
    TriggerOutputs::deserialize(&event.outputs)
        .map_err(|e| Error::Codec(format!("invalid streams trigger outputs: {e}")))
}
