//! A key/value map whose entries carry an absolute expiry time.
//!
//! Expired entries are not swept; a read past the deadline behaves exactly
//! like a miss and the next `set` overwrites the stale entry.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
}

/// Thread-safe expiring cache shared by concurrently running commands.
pub struct ExpiringCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn set(&self, key: K, value: V, expires_at: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key, Entry { value, expires_at });
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Utc::now())
    }

    /// Like [`get`](Self::get) but evaluated at `now`.
    pub fn get_at(&self, key: &K, now: DateTime<Utc>) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.value.clone())
    }
}

impl<K, V> Default for ExpiringCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn hit_before_deadline_miss_after() {
        let cache = ExpiringCache::new();
        let now = Utc::now();
        let ttl = Duration::hours(2);
        cache.set("alice".to_string(), 42, now + ttl);

        let key = "alice".to_string();
        assert_eq!(cache.get_at(&key, now), Some(42));
        assert_eq!(cache.get_at(&key, now + ttl - Duration::milliseconds(1)), Some(42));
        assert_eq!(cache.get_at(&key, now + ttl), None);
        assert_eq!(cache.get_at(&key, now + ttl + Duration::seconds(1)), None);
    }

    #[test]
    fn missing_key_is_a_miss() {
        let cache: ExpiringCache<String, u32> = ExpiringCache::new();
        assert_eq!(cache.get(&"nobody".to_string()), None);
    }

    #[test]
    fn set_overwrites_expired_entry() {
        let cache = ExpiringCache::new();
        let now = Utc::now();
        cache.set(1u32, "old", now - Duration::seconds(1));
        assert_eq!(cache.get(&1), None);

        cache.set(1u32, "new", now + Duration::minutes(5));
        assert_eq!(cache.get(&1), Some("new"));
    }
}
