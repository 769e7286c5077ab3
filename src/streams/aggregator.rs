//! Merges the streams trigger events reported by several remote nodes

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use super::{FeedId, FeedReport, SignersMetadata, unwrap_reports, wrap_reports};
use crate::capabilities::TriggerResponse;
use crate::remote::Aggregator;
use crate::{Error, Result};

/// Latest-wins merge of per-node feed reports
///
/// Each feed keeps the report with the newest observation timestamp; on a
/// tie the first one seen stays. Output is ordered by feed id so every node
/// produces the same bytes for the same inputs.
#[derive(Debug, Clone)]
pub struct MercuryRemoteAggregator {
    metadata: SignersMetadata,
}

impl MercuryRemoteAggregator {
    /// `signers` are the capability DON's signing addresses, `min_required`
    /// its `F+1`
    #[must_use]
    pub const fn new(signers: Vec<Vec<u8>>, min_required: usize) -> Self {
        Self {
            metadata: SignersMetadata {
                signers,
                min_required_signatures: min_required,
            },
        }
    }
}

impl Aggregator for MercuryRemoteAggregator {
    fn aggregate(&self, event_id: &str, responses: &[Vec<u8>]) -> Result<TriggerResponse> {
        let mut latest: BTreeMap<FeedId, FeedReport> = BTreeMap::new();
        let mut latest_timestamp = 0i64;
        let mut trigger_type = None;

        for (idx, raw) in responses.iter().enumerate() {
            let response = match TriggerResponse::from_bytes(raw) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(event_id, idx, error = %e, "skipping undecodable response");
                    continue;
                }
            };
            if let Some(err) = &response.err {
                tracing::warn!(event_id, idx, error = %err, "skipping error response");
                continue;
            }
            let outputs = match unwrap_reports(&response.event) {
                Ok(o) => o,
                Err(e) => {
                    tracing::warn!(event_id, idx, error = %e, "skipping response without reports");
                    continue;
                }
            };

            trigger_type.get_or_insert(response.event.trigger_type);
            for report in outputs.payload {
                latest_timestamp = latest_timestamp.max(report.observation_timestamp);
                match latest.entry(report.feed_id.clone()) {
                    Entry::Vacant(slot) => {
                        slot.insert(report);
                    }
                    Entry::Occupied(mut slot) => {
                        if report.observation_timestamp > slot.get().observation_timestamp {
                            slot.insert(report);
                        }
                    }
                }
            }
        }

        if latest.is_empty() {
            return Err(Error::Aggregation("no valid reports found".to_string()));
        }

        tracing::debug!(
            event_id,
            feeds = latest.len(),
            responses = responses.len(),
            latest_timestamp,
            "aggregated streams reports"
        );

        let event = wrap_reports(
            trigger_type.as_deref().unwrap_or(super::DEFAULT_TRIGGER_ID),
            event_id,
            latest.into_values().collect(),
            latest_timestamp,
            self.metadata.clone(),
        )?;
        Ok(TriggerResponse { event, err: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::DEFAULT_TRIGGER_ID;
    use crate::streams::tests::{feed, report};

    fn response(reports: Vec<FeedReport>) -> Vec<u8> {
        let event = wrap_reports(
            DEFAULT_TRIGGER_ID,
            "node-local",
            reports,
            0,
            SignersMetadata::default(),
        )
        .unwrap();
        TriggerResponse { event, err: None }.to_bytes().unwrap()
    }

    fn aggregator() -> MercuryRemoteAggregator {
        MercuryRemoteAggregator::new(vec![vec![0x01], vec![0x02]], 2)
    }

    #[test]
    fn latest_report_wins() {
        let responses = vec![
            response(vec![report(1, 100, 10)]),
            response(vec![report(1, 200, 20)]),
        ];
        let merged = aggregator().aggregate("ev", &responses).unwrap();
        let outputs = unwrap_reports(&merged.event).unwrap();

        assert_eq!(outputs.payload.len(), 1);
        assert_eq!(outputs.payload[0].observation_timestamp, 200);
        assert_eq!(outputs.timestamp, 200);
        assert_eq!(merged.event.id, "ev");
        assert_eq!(outputs.metadata.min_required_signatures, 2);
        assert_eq!(outputs.metadata.signers.len(), 2);
    }

    #[test]
    fn tie_keeps_first_seen() {
        let mut first = report(1, 100, 10);
        first.full_report = b"first".to_vec();
        let mut second = report(1, 100, 99);
        second.full_report = b"second".to_vec();

        let merged = aggregator()
            .aggregate("ev", &[response(vec![first]), response(vec![second])])
            .unwrap();
        let outputs = unwrap_reports(&merged.event).unwrap();
        assert_eq!(outputs.payload[0].full_report, b"first");
    }

    #[test]
    fn output_sorted_regardless_of_input_order() {
        let a = vec![
            response(vec![report(3, 1, 1), report(1, 1, 1)]),
            response(vec![report(2, 1, 1)]),
        ];
        let b = vec![
            response(vec![report(2, 1, 1)]),
            response(vec![report(1, 1, 1), report(3, 1, 1)]),
        ];

        let merged_a = aggregator().aggregate("ev", &a).unwrap();
        let merged_b = aggregator().aggregate("ev", &b).unwrap();
        assert_eq!(merged_a.to_bytes().unwrap(), merged_b.to_bytes().unwrap());

        let ids: Vec<FeedId> = unwrap_reports(&merged_a.event)
            .unwrap()
            .payload
            .into_iter()
            .map(|r| r.feed_id)
            .collect();
        assert_eq!(ids, vec![feed(1), feed(2), feed(3)]);
    }

    #[test]
    fn malformed_responses_are_skipped() {
        let responses = vec![b"garbage".to_vec(), response(vec![report(1, 5, 1)])];
        let merged = aggregator().aggregate("ev", &responses).unwrap();
        assert_eq!(unwrap_reports(&merged.event).unwrap().payload.len(), 1);
    }

    #[test]
    fn no_valid_reports() {
        let err = aggregator()
            .aggregate("ev", &[b"garbage".to_vec(), response(vec![])])
            .unwrap_err();
        assert!(err.to_string().contains("no valid reports found"));
    }
}
