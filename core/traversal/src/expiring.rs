//! Expiring key/value map
//!
//! Entries carry the time they were last refreshed. Anything older than the
//! TTL is treated as gone and is swept out lazily by lookups, so the map
//! needs no timer of its own.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Default time-to-live for unrefreshed entries
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);

/// Map whose entries expire `ttl` after their last refresh
#[derive(Debug)]
pub struct ExpiringMap<K, V> {
    entries: HashMap<K, Entry<V>>,
    ttl: Duration,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    refreshed_at: Instant,
}

impl<K: Eq + Hash, V> ExpiringMap<K, V> {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Look up a live entry, optionally resetting its expiry window.
    pub fn find(&mut self, key: &K, refresh: bool) -> Option<&V> {
        self.find_at(key, refresh, Instant::now())
    }

    /// Look up a live entry as of `now`.
    ///
    /// Every expired entry in the map is evicted first.
    pub fn find_at(&mut self, key: &K, refresh: bool, now: Instant) -> Option<&V> {
        self.purge_expired(now);

        let entry = self.entries.get_mut(key)?;
        if refresh {
            entry.refreshed_at = now;
        }
        Some(&entry.value)
    }

    pub fn contains_key_at(&mut self, key: &K, now: Instant) -> bool {
        self.find_at(key, false, now).is_some()
    }

    /// Insert or overwrite, stamping the entry with the current time.
    pub fn insert(&mut self, key: K, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    pub fn insert_at(&mut self, key: K, value: V, now: Instant) {
        self.entries.insert(
            key,
            Entry {
                value,
                refreshed_at: now,
            },
        );
    }

    /// Evict every entry whose age has reached the TTL. Returns how many
    /// entries were dropped.
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now.saturating_duration_since(e.refreshed_at) < ttl);
        before - self.entries.len()
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash, V> Default for ExpiringMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_find() {
        let mut map = ExpiringMap::new();
        let now = Instant::now();

        map.insert_at("a", 1, now);

        assert_eq!(map.find_at(&"a", false, now), Some(&1));
        assert_eq!(map.find_at(&"b", false, now), None);
    }

    #[test]
    fn test_entry_expires_at_ttl() {
        let mut map = ExpiringMap::new();
        let now = Instant::now();
        map.insert_at("a", 1, now);

        assert!(map.contains_key_at(&"a", now + Duration::from_millis(29_999)));
        assert!(!map.contains_key_at(&"a", now + DEFAULT_TTL));
        assert!(map.is_empty());
    }

    #[test]
    fn test_refresh_resets_window() {
        let mut map = ExpiringMap::new();
        let now = Instant::now();
        map.insert_at("a", 1, now);

        // Refresh at 20s, still alive at 40s
        assert!(map.find_at(&"a", true, now + Duration::from_secs(20)).is_some());
        assert!(map.contains_key_at(&"a", now + Duration::from_secs(40)));
        assert!(!map.contains_key_at(&"a", now + Duration::from_secs(50)));
    }

    #[test]
    fn test_lookup_without_refresh_keeps_age() {
        let mut map = ExpiringMap::new();
        let now = Instant::now();
        map.insert_at("a", 1, now);

        assert!(map.find_at(&"a", false, now + Duration::from_secs(20)).is_some());
        assert!(!map.contains_key_at(&"a", now + Duration::from_secs(31)));
    }

    #[test]
    fn test_lookup_sweeps_other_entries() {
        let mut map = ExpiringMap::with_ttl(Duration::from_secs(5));
        let now = Instant::now();
        map.insert_at("old", 1, now);
        map.insert_at("new", 2, now + Duration::from_secs(4));

        assert_eq!(map.find_at(&"new", false, now + Duration::from_secs(6)), Some(&2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_insert_overwrites() {
        let mut map = ExpiringMap::new();
        let now = Instant::now();
        map.insert_at("a", 1, now);
        map.insert_at("a", 2, now + Duration::from_secs(25));

        assert_eq!(map.find_at(&"a", false, now + Duration::from_secs(40)), Some(&2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_purge_expired_count() {
        let mut map = ExpiringMap::with_ttl(Duration::from_secs(1));
        let now = Instant::now();
        map.insert_at(1, (), now);
        map.insert_at(2, (), now);
        map.insert_at(3, (), now + Duration::from_secs(1));

        assert_eq!(map.purge_expired(now + Duration::from_secs(1)), 2);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key_at(&3, now + Duration::from_secs(1)));
    }
}
