use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Best-effort in-process TTL cache.
///
/// Holds two kinds of operator-facing entries: requests parked when the
/// queue backend is unreachable (`cached_request_<id>`, 1 h) and forensic
/// copies of dead-lettered messages (`failed_request_<id>`, 24 h). The
/// worker never drains it — entries exist so operators can see them.
#[derive(Default)]
pub struct EphemeralCache {
    entries: DashMap<String, CacheEntry>,
}

struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
}

impl EphemeralCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: serde_json::Value, ttl: Duration) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    /// Live entry count; sweeps expired entries first so the number is
    /// honest on the status surface.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
