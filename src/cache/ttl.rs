use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Thread-safe map with per-entry expiration.
///
/// Expired entries report a miss and are evicted lazily on the access that
/// finds them; there is no background sweeper. Readers never hold the lock
/// across await points (the API is fully synchronous).
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, Entry<V>>>,
    default_ttl: Duration,
}

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    #[must_use]
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Look up a live entry, evicting it if it has expired.
    pub fn get(&self, key: &K) -> Option<V> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }

        // Entry was present but expired: evict under the write lock,
        // re-checking in case a writer replaced it meanwhile.
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.value.clone());
            }
            entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().insert(key, entry);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.write().remove(key).map(|e| e.value)
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Entry count including not-yet-evicted expired entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<K, V> std::fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("len", &self.entries.read().len())
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get_within_ttl() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        cache.insert("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
    }

    #[test]
    fn test_expired_entry_is_a_miss_and_evicted() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::from_secs(60));
        cache.insert_with_ttl("a".to_string(), 1, Duration::ZERO);
        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_per_entry_ttl_overrides_default() {
        let cache: TtlCache<String, u32> = TtlCache::new(Duration::ZERO);
        cache.insert_with_ttl("long".to_string(), 1, Duration::from_secs(60));
        cache.insert("short".to_string(), 2);
        assert_eq!(cache.get(&"long".to_string()), Some(1));
        assert_eq!(cache.get(&"short".to_string()), None);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache: TtlCache<u64, &'static str> = TtlCache::new(Duration::from_secs(60));
        cache.insert(1, "one");
        cache.insert(2, "two");
        assert_eq!(cache.remove(&1), Some("one"));
        assert_eq!(cache.get(&1), None);
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_overwrite_refreshes_value() {
        let cache: TtlCache<u64, u32> = TtlCache::new(Duration::from_secs(60));
        cache.insert(1, 10);
        cache.insert(1, 20);
        assert_eq!(cache.get(&1), Some(20));
    }

    #[test]
    fn test_concurrent_readers_see_set_value() {
        use std::sync::Arc;

        let cache: Arc<TtlCache<u64, u64>> = Arc::new(TtlCache::new(Duration::from_secs(60)));
        cache.insert(7, 7);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        assert_eq!(cache.get(&7), Some(7));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }
}
