//! TTL cache for cloud provider model listings.
//!
//! Keyed by backend id; an entry is valid only while the requesting API key
//! matches the one it was fetched with, so rotating a key invalidates
//! immediately. The time source is injectable for tests.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

/// Injectable time source.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

struct CacheEntry<V> {
    api_key: String,
    inserted_at: DateTime<Utc>,
    value: V,
}

/// Listing cache with TTL + API-key invalidation.
pub struct ProviderListingCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    ttl: Duration,
}

impl<V: Clone> ProviderListingCache<V> {
    pub fn new() -> Self {
        Self::with_ttl(Duration::hours(24))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Returns the cached listing when fresh and fetched with the same key.
    pub fn get(&self, backend_id: &str, api_key: &str, now: DateTime<Utc>) -> Option<V> {
        let entry = self.entries.get(backend_id)?;
        if entry.api_key != api_key {
            return None;
        }
        if now - entry.inserted_at > self.ttl {
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn insert(&self, backend_id: &str, api_key: &str, value: V, now: DateTime<Utc>) {
        self.entries.insert(
            backend_id.to_string(),
            CacheEntry {
                api_key: api_key.to_string(),
                inserted_at: now,
                value,
            },
        );
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl<V: Clone> Default for ProviderListingCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
