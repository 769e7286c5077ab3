//! Per-key collection of payloads from distinct senders
//!
//! Shims use this to wait until enough DON members sent the same event or
//! registration before acting on it. Each sender gets one slot per key; a
//! later message from the same sender replaces its earlier payload.

use std::collections::HashMap;
use std::hash::Hash;

use tokio::time::Instant;

#[derive(Debug)]
struct Entry<S> {
    created_at: Instant,
    ready: bool,
    payloads: HashMap<S, (Instant, Vec<u8>)>,
}

/// Payloads keyed by event and sender
#[derive(Debug)]
pub struct MessageCache<K, S> {
    entries: HashMap<K, Entry<S>>,
}

impl<K, S> Default for MessageCache<K, S> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<K, S> MessageCache<K, S>
where
    K: Eq + Hash + Clone,
    S: Eq + Hash + Ord + Clone,
{
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `payload` from `sender`; returns the number of distinct senders
    pub fn insert(&mut self, key: K, sender: S, at: Instant, payload: Vec<u8>) -> usize {
        let entry = self.entries.entry(key).or_insert_with(|| Entry {
            created_at: at,
            ready: false,
            payloads: HashMap::new(),
        });
        entry.payloads.insert(sender, (at, payload));
        entry.payloads.len()
    }

    /// Payloads received at or after `min_timestamp`, if at least `min_count`
    /// senders contributed
    ///
    /// With `once`, a key is reported ready only the first time.
    /// Payloads are ordered by sender so results are deterministic.
    pub fn ready(
        &mut self,
        key: &K,
        min_count: usize,
        min_timestamp: Option<Instant>,
        once: bool,
    ) -> Option<Vec<Vec<u8>>> {
        let entry = self.entries.get_mut(key)?;
        if once && entry.ready {
            return None;
        }

        let mut fresh: Vec<(&S, &Vec<u8>)> = entry
            .payloads
            .iter()
            .filter(|(_, (at, _))| min_timestamp.is_none_or(|min| *at >= min))
            .map(|(sender, (_, payload))| (sender, payload))
            .collect();

        if fresh.len() < min_count {
            return None;
        }

        fresh.sort_by(|a, b| a.0.cmp(b.0));
        let payloads = fresh.into_iter().map(|(_, p)| p.clone()).collect();
        entry.ready = true;
        Some(payloads)
    }

    /// Whether `key` was already reported ready
    #[must_use]
    pub fn is_ready(&self, key: &K) -> bool {
        self.entries.get(key).is_some_and(|e| e.ready)
    }

    /// Drop one sender's contribution
    pub fn remove_sender(&mut self, key: &K, sender: &S) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.payloads.remove(sender);
        }
    }

    /// Drop a key entirely
    pub fn delete(&mut self, key: &K) {
        self.entries.remove(key);
    }

    /// Drop keys first seen before `cutoff`; returns the removed keys
    pub fn delete_older_than(&mut self, cutoff: Instant) -> Vec<K> {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, e)| e.created_at < cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        expired
    }

    /// Keys currently tracked
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.keys()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn ready_after_enough_senders() {
        let mut cache = MessageCache::new();
        let now = Instant::now();

        assert_eq!(cache.insert("ev", 1u8, now, b"a".to_vec()), 1);
        assert!(cache.ready(&"ev", 2, None, true).is_none());

        // same sender does not count twice
        assert_eq!(cache.insert("ev", 1u8, now, b"a2".to_vec()), 1);
        assert!(cache.ready(&"ev", 2, None, true).is_none());

        assert_eq!(cache.insert("ev", 0u8, now, b"b".to_vec()), 2);
        let payloads = cache.ready(&"ev", 2, None, true).unwrap();
        // ordered by sender
        assert_eq!(payloads, vec![b"b".to_vec(), b"a2".to_vec()]);
        assert!(cache.is_ready(&"ev"));

        // once: not reported again
        assert!(cache.ready(&"ev", 2, None, true).is_none());
        assert!(cache.ready(&"ev", 2, None, false).is_some());
    }

    #[test]
    fn stale_payloads_do_not_count() {
        let mut cache = MessageCache::new();
        let start = Instant::now();
        let later = start + Duration::from_secs(10);

        cache.insert("reg", 1u8, start, vec![]);
        cache.insert("reg", 2u8, later, vec![]);

        assert!(cache.ready(&"reg", 2, Some(later), false).is_none());
        assert!(cache.ready(&"reg", 1, Some(later), false).is_some());
        assert!(cache.ready(&"reg", 2, Some(start), false).is_some());
    }

    #[test]
    fn expiry_and_removal() {
        let mut cache = MessageCache::new();
        let start = Instant::now();

        cache.insert("old", 1u8, start, vec![]);
        cache.insert("new", 1u8, start + Duration::from_secs(5), vec![]);
        cache.insert("new", 2u8, start + Duration::from_secs(5), vec![]);

        let expired = cache.delete_older_than(start + Duration::from_secs(1));
        assert_eq!(expired, vec!["old"]);
        assert_eq!(cache.len(), 1);

        cache.remove_sender(&"new", &1u8);
        assert!(cache.ready(&"new", 2, None, false).is_none());
        cache.delete(&"new");
        assert!(cache.is_empty());
    }
}
