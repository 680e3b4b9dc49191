//! Inter-query cache shared across evaluations within one instance.
//!
//! Built-in functions that perform external lookups (`http.send` and
//! friends) park their results here so repeated evaluations against the
//! same instance do not refetch. Entries may carry a freshness bound.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: JsonValue,
    expires: Option<Instant>,
}

/// Concurrency-safe value cache keyed by the built-in's own cache key.
///
/// The size bound is approximate: when full, an insert evicts one arbitrary
/// resident entry rather than tracking recency.
#[derive(Debug)]
pub struct InterQueryCache {
    entries: DashMap<String, CacheEntry>,
    max_entries: usize,
}

const DEFAULT_MAX_ENTRIES: usize = 1024;

impl Default for InterQueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl InterQueryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Fetch a live entry; expired entries are dropped on access.
    pub fn get(&self, key: &str) -> Option<JsonValue> {
        let expired = match self.entries.get(key) {
            Some(entry) => match entry.expires {
                Some(deadline) if Instant::now() >= deadline => true,
                _ => return Some(entry.value.clone()),
            },
            None => return None,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Insert a value, optionally with a time-to-live.
    pub fn insert(&self, key: impl Into<String>, value: JsonValue, ttl: Option<Duration>) {
        if self.entries.len() >= self.max_entries {
            let victim = self.entries.iter().next().map(|e| e.key().clone());
            if let Some(victim) = victim {
                self.entries.remove(&victim);
            }
        }
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                expires: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
