//! Time- and capacity-bounded key presence tracking.
//!
//! Expiry is lazy: there is no background sweeper. Callers run [`TtlCache::sweep`]
//! at the start of each check, and a capacity-bounded cache sweeps on its own
//! before evicting.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Tracks when keys were last seen, forgetting them after `ttl`.
#[derive(Debug)]
pub struct TtlCache {
    entries: HashMap<String, Instant>,
    /// Insertion order for capacity eviction. Refreshing a key keeps its slot.
    order: VecDeque<String>,
    ttl: Duration,
    max_entries: Option<usize>,
}

impl TtlCache {
    /// An unbounded cache.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            max_entries: None,
        }
    }

    /// A cache holding at most `max_entries` keys (minimum 1).
    pub fn bounded(ttl: Duration, max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries.max(1)),
            ..Self::new(ttl)
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if `key` was marked no more than `ttl` before `now`.
    pub fn contains(&self, key: &str, now: Instant) -> bool {
        self.entries
            .get(key)
            .is_some_and(|seen| !self.is_expired(*seen, now))
    }

    /// Record `key` as seen at `now`.
    ///
    /// An existing key only has its timestamp refreshed. A new key arriving
    /// at capacity first sweeps expired entries, then evicts the
    /// oldest-inserted key if the cache is still full.
    pub fn mark(&mut self, key: &str, now: Instant) {
        if let Some(seen) = self.entries.get_mut(key) {
            *seen = now;
            return;
        }

        if let Some(max) = self.max_entries
            && self.entries.len() >= max
        {
            self.sweep(now);
            if self.entries.len() >= max {
                self.evict_oldest();
            }
        }

        self.entries.insert(key.to_string(), now);
        self.order.push_back(key.to_string());
    }

    /// Drop every entry older than `ttl`. Returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries
            .retain(|_, seen| now.saturating_duration_since(*seen) <= ttl);

        let removed = before - self.entries.len();
        if removed > 0 {
            self.order.retain(|key| self.entries.contains_key(key));
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    fn is_expired(&self, seen: Instant, now: Instant) -> bool {
        now.saturating_duration_since(seen) > self.ttl
    }

    fn evict_oldest(&mut self) -> Option<String> {
        while let Some(key) = self.order.pop_front() {
            if self.entries.remove(&key).is_some() {
                return Some(key);
            }
        }
        None
    }
}
