//! In-process TTL cache of resolved image URLs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::clock::{duration_millis, Clock};
use crate::models::FabricCode;

/// One cached resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub url: String,
    /// Set when the URL came from an exact object mapping.
    pub object_id: Option<String>,
    /// Unix ms when the entry was written.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntryStats {
    pub fabric_code: FabricCode,
    pub url: String,
    pub age_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub size: usize,
    pub ttl_ms: i64,
    pub entries: Vec<CacheEntryStats>,
}

/// Fabric code to URL map with a fixed time-to-live.
///
/// Entries are valid while `now - timestamp < ttl`; anything older is
/// dropped on read and never returned.
pub struct RuntimeCache {
    entries: Mutex<HashMap<FabricCode, CacheEntry>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl RuntimeCache {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, code: &str) -> Option<CacheEntry> {
        let now = self.clock.now_millis();
        let mut entries = self.lock();
        let entry = entries.get(code)?;
        if self.is_fresh(entry, now) {
            return Some(entry.clone());
        }
        entries.remove(code);
        None
    }

    pub fn insert(&self, code: &FabricCode, url: impl Into<String>) -> CacheEntry {
        self.insert_with_object_id(code, url, None)
    }

    pub fn insert_with_object_id(
        &self,
        code: &FabricCode,
        url: impl Into<String>,
        object_id: Option<String>,
    ) -> CacheEntry {
        let entry = CacheEntry {
            url: url.into(),
            object_id,
            timestamp: self.clock.now_millis(),
        };
        self.lock().insert(code.clone(), entry.clone());
        entry
    }

    pub fn remove(&self, code: &str) -> bool {
        self.lock().remove(code).is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Count of stored entries, expired ones included until they are read or purged.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| self.is_fresh(entry, now));
        before - entries.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.purge_expired();
        let now = self.clock.now_millis();
        let mut entries: Vec<CacheEntryStats> = self
            .lock()
            .iter()
            .map(|(code, entry)| CacheEntryStats {
                fabric_code: code.clone(),
                url: entry.url.clone(),
                age_ms: now - entry.timestamp,
            })
            .collect();
        entries.sort_by(|a, b| a.fabric_code.cmp(&b.fabric_code));
        CacheStats {
            size: entries.len(),
            ttl_ms: duration_millis(self.ttl),
            entries,
        }
    }

    fn is_fresh(&self, entry: &CacheEntry, now: i64) -> bool {
        now.saturating_sub(entry.timestamp) < duration_millis(self.ttl)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<FabricCode, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RuntimeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeCache")
            .field("ttl", &self.ttl)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::clock::ManualClock;

    fn code(value: &str) -> FabricCode {
        FabricCode::new(value).unwrap()
    }

    #[test]
    fn entry_expires_exactly_at_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = RuntimeCache::new(Duration::from_secs(300), clock.clone());
        cache.insert(&code("A"), "https://x/a");

        clock.advance(Duration::from_millis(299_999));
        assert_eq!(cache.get("A").map(|entry| entry.url), Some("https://x/a".to_string()));

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get("A"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn insert_overwrites_and_refreshes_timestamp() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = RuntimeCache::new(Duration::from_secs(10), clock.clone());
        cache.insert(&code("A"), "https://x/old");
        clock.advance(Duration::from_secs(8));
        cache.insert(&code("A"), "https://x/new");
        clock.advance(Duration::from_secs(8));

        let entry = cache.get("A").unwrap();
        assert_eq!(entry.url, "https://x/new");
        assert_eq!(entry.timestamp, 8_000);
    }

    #[test]
    fn stats_purge_expired_and_report_age() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = RuntimeCache::new(Duration::from_secs(10), clock.clone());
        cache.insert(&code("OLD"), "https://x/old");
        clock.advance(Duration::from_secs(9));
        cache.insert(&code("NEW"), "https://x/new");
        clock.advance(Duration::from_secs(2));

        let stats = cache.stats();
        assert_eq!(stats.size, 1);
        assert_eq!(stats.ttl_ms, 10_000);
        assert_eq!(stats.entries[0].fabric_code, code("NEW"));
        assert_eq!(stats.entries[0].age_ms, 2_000);
    }

    #[test]
    fn entry_keeps_object_id() {
        let cache = RuntimeCache::new(Duration::from_secs(10), Arc::new(ManualClock::new(0)));
        cache.insert_with_object_id(&code("A"), "https://x/a", Some("fabric_images/a".to_string()));
        cache.insert(&code("B"), "https://x/b");

        assert_eq!(cache.get("A").unwrap().object_id.as_deref(), Some("fabric_images/a"));
        assert_eq!(cache.get("B").unwrap().object_id, None);
    }

    #[test]
    fn remove_and_clear() {
        let cache = RuntimeCache::new(Duration::from_secs(10), Arc::new(ManualClock::new(0)));
        cache.insert(&code("A"), "https://x/a");
        cache.insert(&code("B"), "https://x/b");
        assert!(cache.remove("A"));
        assert!(!cache.remove("A"));
        cache.clear();
        assert!(cache.is_empty());
    }
}
