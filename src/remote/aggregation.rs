//! Combining responses from several remote nodes into one

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::capabilities::TriggerResponse;
use crate::Result;

/// Merges the raw trigger responses that several nodes sent for one event
pub trait Aggregator: Send + Sync {
    /// Produce one canonical response for `event_id`
    ///
    /// # Errors
    ///
    /// Returns error if no acceptable response can be built
    fn aggregate(&self, event_id: &str, responses: &[Vec<u8>]) -> Result<TriggerResponse>;
}

/// Most common payload, if at least `min_count` senders agree on it
///
/// Ties are broken by first occurrence in `payloads`.
#[must_use]
pub fn mode(payloads: &[Vec<u8>], min_count: usize) -> Option<(&[u8], usize)> {
    let mut counts: HashMap<[u8; 32], (usize, usize)> = HashMap::new();
    for (idx, payload) in payloads.iter().enumerate() {
        let digest: [u8; 32] = Sha256::digest(payload).into();
        counts.entry(digest).or_insert((idx, 0)).1 += 1;
    }

    counts
        .values()
        .filter(|(_, count)| *count >= min_count)
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
        .map(|(idx, count)| (payloads[*idx].as_slice(), *count))
}
