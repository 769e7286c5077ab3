//! DataFeeds consensus outcome aggregator
//!
//! Each round merges the feed reports observed by every oracle, compares
//! them with what was last reported, and decides which feeds moved enough
//! (price deviation) or sat still long enough (heartbeat) to be reported
//! again. The per-feed "last reported" state is carried from round to round
//! inside the outcome metadata.

use std::collections::BTreeMap;

use num_bigint::BigUint;
use num_traits::{ToPrimitive, Zero};
use prost::Message;
use serde::{Deserialize, Deserializer, Serialize};

use crate::codec::hex_bytes;
use crate::streams::{FeedId, FeedReport, TriggerOutputs};
use crate::{Error, Result};

/// Oracle index within the consensus round
pub type OracleId = u32;

/// Per-feed last reported state
#[derive(Clone, PartialEq, Eq, Message)]
pub struct ReportInfo {
    #[prost(int64, tag = "1")]
    pub observation_timestamp: i64,
    #[prost(bytes = "vec", tag = "2")]
    pub benchmark_price: Vec<u8>,
}

/// Round-to-round state, keyed by feed id
#[derive(Clone, PartialEq, Message)]
pub struct DataFeedsOutcomeMetadata {
    #[prost(btree_map = "string, message", tag = "1")]
    pub feed_info: BTreeMap<String, ReportInfo>,
}

/// Result of one aggregation round
#[derive(Clone, PartialEq, Eq, Message)]
pub struct AggregationOutcome {
    /// Encoded [`DataFeedsOutcomeMetadata`]
    #[prost(bytes = "vec", tag = "1")]
    pub metadata: Vec<u8>,
    /// JSON `{"Reports": [...]}` ready for the report encoder
    #[prost(bytes = "vec", tag = "2")]
    pub encodable_outcome: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub should_report: bool,
}

impl AggregationOutcome {
    /// Decode the persisted per-feed state
    ///
    /// # Errors
    ///
    /// Returns error if the metadata is not valid protobuf
    pub fn decode_metadata(&self) -> Result<DataFeedsOutcomeMetadata> {
        Ok(DataFeedsOutcomeMetadata::decode(self.metadata.as_slice())?)
    }

    /// Decode the reports selected this round
    ///
    /// # Errors
    ///
    /// Returns error if the outcome is not valid JSON
    pub fn reports(&self) -> Result<Vec<EncodableReport>> {
        if self.encodable_outcome.is_empty() {
            return Ok(Vec::new());
        }
        let outcome: EncodableOutcome = serde_json::from_slice(&self.encodable_outcome)?;
        Ok(outcome.reports)
    }
}

/// One report selected for on-chain delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncodableReport {
    #[serde(rename = "FeedID")]
    pub feed_id: FeedId,
    #[serde(with = "hex_bytes")]
    pub raw_report: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub price: Vec<u8>,
    pub timestamp: i64,
    #[serde(rename = "RemappedID", default, skip_serializing_if = "Option::is_none")]
    pub remapped_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EncodableOutcome {
    reports: Vec<EncodableReport>,
}

fn decimal<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Decimal {
        Text(String),
        Number(f64),
    }

    let value = match Decimal::deserialize(deserializer)? {
        Decimal::Text(s) => s.trim().parse::<f64>().map_err(serde::de::Error::custom)?,
        Decimal::Number(n) => n,
    };
    if !value.is_finite() || value < 0.0 {
        return Err(serde::de::Error::custom(format!(
            "decimal must be finite and non-negative, got {value}"
        )));
    }
    Ok(value)
}

/// Thresholds for one feed
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedConfig {
    /// Fractional price change that forces a report (`"0.005"` = 0.5%)
    #[serde(deserialize_with = "decimal")]
    pub deviation: f64,
    /// Seconds after which a report is due even without price movement
    pub heartbeat: u32,
    #[serde(rename = "remappedID", default)]
    pub remapped_id: Option<String>,
}

/// Aggregator configuration as stored in the consensus capability config
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFeedsAggregatorConfig {
    pub feeds: BTreeMap<FeedId, FeedConfig>,
    /// Fraction of a heartbeat after which a feed rides along with another
    /// feed's report
    #[serde(default, deserialize_with = "decimal")]
    pub allowed_partial_staleness: f64,
}

/// Deviation/heartbeat outcome aggregator
#[derive(Debug, Clone)]
pub struct DataFeedsAggregator {
    config: DataFeedsAggregatorConfig,
}

/// `|new - old| / old`; infinite when only `old` is zero
#[must_use]
pub fn deviation(old: &BigUint, new: &BigUint) -> f64 {
    if old.is_zero() {
        return if new.is_zero() { 0.0 } else { f64::INFINITY };
    }
    let diff = if new > old { new - old } else { old - new };
    let diff = diff.to_f64().unwrap_or(f64::INFINITY);
    let base = old.to_f64().unwrap_or(f64::INFINITY);
    diff / base
}

impl DataFeedsAggregator {
    #[must_use]
    pub const fn new(config: DataFeedsAggregatorConfig) -> Self {
        Self { config }
    }

    /// Parse the aggregator configuration
    ///
    /// # Errors
    ///
    /// Returns error if the config is malformed or the staleness fraction is
    /// above one
    pub fn from_json(config: &serde_json::Value) -> Result<Self> {
        let config = DataFeedsAggregatorConfig::deserialize(config)
            .map_err(|e| Error::InvalidConfig(format!("datafeeds aggregator: {e}")))?;
        if config.allowed_partial_staleness > 1.0 {
            return Err(Error::InvalidConfig(format!(
                "allowedPartialStaleness {} must not exceed 1",
                config.allowed_partial_staleness
            )));
        }
        Ok(Self::new(config))
    }

    #[must_use]
    pub const fn config(&self) -> &DataFeedsAggregatorConfig {
        &self.config
    }

    /// Run one round
    ///
    /// Each oracle contributes a list of observations; the first entry is
    /// its streams trigger outputs. Empty or undecodable contributions are
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns error if the previous outcome metadata cannot be decoded
    pub fn aggregate(
        &self,
        previous: Option<&AggregationOutcome>,
        observations: &BTreeMap<OracleId, Vec<serde_json::Value>>,
    ) -> Result<AggregationOutcome> {
        let latest = latest_reports(observations);

        let mut metadata = match previous {
            Some(outcome) if !outcome.metadata.is_empty() => outcome.decode_metadata()?,
            _ => DataFeedsOutcomeMetadata::default(),
        };
        for feed_id in self.config.feeds.keys() {
            metadata
                .feed_info
                .entry(feed_id.to_string())
                .or_insert_with(|| ReportInfo {
                    observation_timestamp: 0,
                    benchmark_price: Vec::new(),
                });
        }

        let mut selected: Vec<&FeedId> = Vec::new();
        for (feed_id, feed_config) in &self.config.feeds {
            let Some(report) = latest.get(feed_id) else {
                tracing::debug!(feed_id = %feed_id, "no observation for feed this round");
                continue;
            };
            let Some(previous) = metadata.feed_info.get(feed_id.as_str()) else {
                continue;
            };

            let elapsed = report
                .observation_timestamp
                .saturating_sub(previous.observation_timestamp);
            let dev = deviation(
                &BigUint::from_bytes_be(&previous.benchmark_price),
                &report.price(),
            );
            let heartbeat_due = elapsed > i64::from(feed_config.heartbeat);
            let deviation_due = dev > feed_config.deviation;

            if heartbeat_due || deviation_due {
                tracing::debug!(
                    feed_id = %feed_id,
                    elapsed,
                    deviation = dev,
                    heartbeat_due,
                    deviation_due,
                    "feed needs report"
                );
                selected.push(feed_id);
            }
        }

        if !selected.is_empty() && self.config.allowed_partial_staleness > 0.0 {
            for (feed_id, feed_config) in &self.config.feeds {
                if selected.contains(&feed_id) {
                    continue;
                }
                let (Some(report), Some(previous)) = (
                    latest.get(feed_id),
                    metadata.feed_info.get(feed_id.as_str()),
                ) else {
                    continue;
                };
                #[allow(clippy::cast_precision_loss)]
                let elapsed = report
                    .observation_timestamp
                    .saturating_sub(previous.observation_timestamp) as f64;
                let threshold = f64::from(feed_config.heartbeat)
                    * (1.0 - self.config.allowed_partial_staleness);
                if elapsed > threshold {
                    tracing::debug!(feed_id = %feed_id, elapsed, "partially stale feed rides along");
                    selected.push(feed_id);
                }
            }
        }
        selected.sort();

        let mut reports = Vec::with_capacity(selected.len());
        for feed_id in selected {
            let Some(report) = latest.get(feed_id) else {
                continue;
            };
            metadata.feed_info.insert(
                feed_id.to_string(),
                ReportInfo {
                    observation_timestamp: report.observation_timestamp,
                    benchmark_price: report.benchmark_price.clone(),
                },
            );
            reports.push(EncodableReport {
                feed_id: feed_id.clone(),
                raw_report: report.full_report.clone(),
                price: report.benchmark_price.clone(),
                timestamp: report.observation_timestamp,
                remapped_id: self
                    .config
                    .feeds
                    .get(feed_id)
                    .and_then(|c| c.remapped_id.clone()),
            });
        }

        let should_report = !reports.is_empty();
        tracing::debug!(
            feeds = self.config.feeds.len(),
            observed = latest.len(),
            reporting = reports.len(),
            "datafeeds aggregation round"
        );

        Ok(AggregationOutcome {
            metadata: metadata.encode_to_vec(),
            encodable_outcome: serde_json::to_vec(&EncodableOutcome { reports })?,
            should_report,
        })
    }
}

/// Latest report per feed across all oracles; ties keep the first seen
fn latest_reports(
    observations: &BTreeMap<OracleId, Vec<serde_json::Value>>,
) -> BTreeMap<FeedId, FeedReport> {
    let mut latest: BTreeMap<FeedId, FeedReport> = BTreeMap::new();
    for (oracle, values) in observations {
        let Some(first) = values.first() else {
            tracing::warn!(oracle, "empty observation");
            continue;
        };
        let outputs = match TriggerOutputs::deserialize(first) {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(oracle, error = %e, "undecodable observation");
                continue;
            }
        };
        for report in outputs.payload {
            let newer = latest
                .get(&report.feed_id)
                .is_none_or(|existing| report.observation_timestamp > existing.observation_timestamp);
            if newer {
                latest.insert(report.feed_id.clone(), report);
            }
        }
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::tests::{feed, report};
    use crate::streams::{SignersMetadata, wrap_reports};

    fn aggregator(staleness: &str) -> DataFeedsAggregator {
        DataFeedsAggregator::from_json(&serde_json::json!({
            "feeds": {
                feed(1).to_string(): { "deviation": "0.1", "heartbeat": 60 },
                feed(2).to_string(): { "deviation": "0.1", "heartbeat": 60, "remappedID": "0xbeef" },
            },
            "allowedPartialStaleness": staleness,
        }))
        .unwrap()
    }

    fn observation(reports: Vec<FeedReport>) -> Vec<serde_json::Value> {
        vec![
            wrap_reports("streams-trigger@1.0.0", "ev", reports, 0, SignersMetadata::default())
                .unwrap()
                .outputs,
        ]
    }

    fn info(outcome: &AggregationOutcome, n: u8) -> ReportInfo {
        outcome.decode_metadata().unwrap().feed_info[feed(n).as_str()].clone()
    }

    #[test]
    fn first_round_initializes_every_feed() {
        let outcome = aggregator("0").aggregate(None, &BTreeMap::new()).unwrap();
        assert!(!outcome.should_report);
        assert!(outcome.reports().unwrap().is_empty());
        for n in [1, 2] {
            let state = info(&outcome, n);
            assert_eq!(state.observation_timestamp, 0);
            assert!(BigUint::from_bytes_be(&state.benchmark_price).is_zero());
        }
    }

    #[test]
    fn first_price_after_zero_baseline_is_reported() {
        let agg = aggregator("0");
        let round1 = agg.aggregate(None, &BTreeMap::new()).unwrap();
        let observations = BTreeMap::from([(0, observation(vec![report(1, 1, 1)]))]);

        let round2 = agg.aggregate(Some(&round1), &observations).unwrap();
        assert!(round2.should_report);
        let state = info(&round2, 1);
        assert_eq!(state.observation_timestamp, 1);
        assert_eq!(BigUint::from_bytes_be(&state.benchmark_price), BigUint::from(1u8));
        assert_eq!(info(&round2, 2).observation_timestamp, 0);
    }

    #[test]
    fn small_moves_wait_for_heartbeat() {
        let agg = aggregator("0");
        let round1 = agg
            .aggregate(None, &BTreeMap::from([(0, observation(vec![report(1, 100, 1000)]))]))
            .unwrap();
        assert!(round1.should_report);

        // 5% move, 30s later: nothing due
        let round2 = agg
            .aggregate(
                Some(&round1),
                &BTreeMap::from([(0, observation(vec![report(1, 130, 1050)]))]),
            )
            .unwrap();
        assert!(!round2.should_report);
        assert_eq!(info(&round2, 1).observation_timestamp, 100);

        // heartbeat exceeded
        let round3 = agg
            .aggregate(
                Some(&round2),
                &BTreeMap::from([(0, observation(vec![report(1, 161, 1050)]))]),
            )
            .unwrap();
        assert!(round3.should_report);
        assert_eq!(info(&round3, 1).observation_timestamp, 161);

        // 20% move triggers deviation immediately
        let round4 = agg
            .aggregate(
                Some(&round3),
                &BTreeMap::from([(0, observation(vec![report(1, 162, 1260)]))]),
            )
            .unwrap();
        assert!(round4.should_report);
    }

    #[test]
    fn latest_observation_across_oracles_wins() {
        let agg = aggregator("0");
        let observations = BTreeMap::from([
            (0, observation(vec![report(1, 10, 5)])),
            (1, observation(vec![report(1, 20, 7)])),
            (2, Vec::new()),
            (3, vec![serde_json::json!({"garbage": true})]),
        ]);
        let outcome = agg.aggregate(None, &observations).unwrap();
        let reports = outcome.reports().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].timestamp, 20);
    }

    #[test]
    fn remapped_id_and_partial_staleness() {
        let agg = aggregator("0.5");
        let round1 = agg
            .aggregate(
                None,
                &BTreeMap::from([(0, observation(vec![report(1, 100, 10), report(2, 100, 10)]))]),
            )
            .unwrap();
        let reports = round1.reports().unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1].remapped_id.as_deref(), Some("0xbeef"));

        // feed 1 deviates; feed 2 is 40s stale, past half its heartbeat
        let round2 = agg
            .aggregate(
                Some(&round1),
                &BTreeMap::from([(0, observation(vec![report(1, 140, 20), report(2, 140, 10)]))]),
            )
            .unwrap();
        let ids: Vec<FeedId> = round2.reports().unwrap().into_iter().map(|r| r.feed_id).collect();
        assert_eq!(ids, vec![feed(1), feed(2)]);
    }

    #[test]
    fn extreme_timestamps_saturate() {
        let agg = aggregator("0.5");
        let round1 = agg
            .aggregate(
                None,
                &BTreeMap::from([(0, observation(vec![report(1, i64::MIN, 5), report(2, i64::MIN, 5)]))]),
            )
            .unwrap();
        assert!(round1.should_report);
        assert_eq!(info(&round1, 1).observation_timestamp, i64::MIN);

        // span from i64::MIN overflows; treated as a heartbeat long overdue
        let round2 = agg
            .aggregate(
                Some(&round1),
                &BTreeMap::from([(0, observation(vec![report(1, 10, 5), report(2, i64::MAX, 5)]))]),
            )
            .unwrap();
        assert!(round2.should_report);
        let ids: Vec<FeedId> = round2.reports().unwrap().into_iter().map(|r| r.feed_id).collect();
        assert_eq!(ids, vec![feed(1), feed(2)]);
        assert_eq!(info(&round2, 1).observation_timestamp, 10);
    }

    #[test]
    fn deviation_edge_cases() {
        let zero = BigUint::zero();
        assert!(deviation(&zero, &zero).abs() < f64::EPSILON);
        assert!(deviation(&zero, &BigUint::from(1u8)).is_infinite());
        let d = deviation(&BigUint::from(100u8), &BigUint::from(90u8));
        assert!((d - 0.1).abs() < 1e-9);
    }

    #[test]
    fn rejects_bad_config() {
        assert!(DataFeedsAggregator::from_json(&serde_json::json!({
            "feeds": { feed(1).to_string(): { "deviation": "abc", "heartbeat": 1 } }
        }))
        .is_err());
        assert!(DataFeedsAggregator::from_json(&serde_json::json!({
            "feeds": { "0x12": { "deviation": "0.1", "heartbeat": 1 } }
        }))
        .is_err());
        assert!(DataFeedsAggregator::from_json(&serde_json::json!({
            "feeds": {}, "allowedPartialStaleness": "1.5"
        }))
        .is_err());
    }
}
