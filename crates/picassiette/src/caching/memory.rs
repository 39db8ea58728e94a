use std::fmt;
use std::sync::{Arc, Mutex};

use lru::LruCache;

/// Computes the "cost" of keeping a value in the [`MemoryCache`].
pub type Weigher<P> = Arc<dyn Fn(&str, &P) -> u64 + Send + Sync>;

/// A value in the in-memory cache, together with its weight at insertion time.
struct Weighted<P> {
    value: P,
    weight: u64,
}

/// An entry that left the [`MemoryCache`] and has to be written back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evicted<P> {
    pub key: String,
    pub value: P,
    /// Increases with every eviction from the same cache, so the persistent store can tell which
    /// of two write-backs of the same key is newer.
    pub version: u64,
}

struct MemoryInner<P> {
    entries: LruCache<String, Weighted<P>>,
    size: u64,
    next_version: u64,
}

impl<P> MemoryInner<P> {
    fn evicted(&mut self, key: String, value: P) -> Evicted<P> {
        let version = self.next_version;
        self.next_version += 1;
        Evicted {
            key,
            value,
            version,
        }
    }
}

/// A bounded in-memory cache with least-recently-used eviction.
///
/// The capacity is expressed in the units of the configured [`Weigher`]. Every operation is a
/// single critical section, so the size accounting and the eviction that restores it are atomic.
///
/// Evicted entries are not dropped silently: [`insert`](Self::insert) and
/// [`evict_all`](Self::evict_all) hand them back to the caller, which is responsible for writing
/// them back to the persistent store.
pub struct MemoryCache<P> {
    capacity: u64,
    weigher: Weigher<P>,
    inner: Mutex<MemoryInner<P>>,
}

impl<P> fmt::Debug for MemoryCache<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (len, size) = self
            .inner
            .try_lock()
            .map(|inner| (inner.entries.len(), inner.size))
            .unwrap_or_default();
        f.debug_struct("MemoryCache")
            .field("capacity", &self.capacity)
            .field("size", &size)
            .field("entries", &len)
            .finish()
    }
}

impl<P: Clone> MemoryCache<P> {
    pub fn new(capacity: u64, weigher: Weigher<P>) -> Self {
        Self {
            capacity,
            weigher,
            inner: Mutex::new(MemoryInner {
                entries: LruCache::unbounded(),
                size: 0,
                next_version: 1,
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The total weight of all held entries.
    pub fn size(&self) -> u64 {
        self.inner.lock().unwrap().size
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a clone of the value for `key`, marking it as most recently used.
    pub fn get(&self, key: &str) -> Option<P> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    /// Whether `key` is present, without touching its recency.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().unwrap().entries.contains(key)
    }

    /// Inserts `value` as the most recently used entry.
    ///
    /// A previous value for the same key is replaced and dropped. Afterwards, least recently used
    /// entries are evicted one at a time until the total size fits the capacity again. This can
    /// include the new entry itself if it is larger than the whole capacity.
    ///
    /// Returns the evicted entries, least recently used first.
    pub fn insert(&self, key: String, value: P) -> Vec<Evicted<P>> {
        let weight = (self.weigher)(&key, &value);

        let mut inner = self.inner.lock().unwrap();
        if let Some(previous) = inner.entries.put(key, Weighted { value, weight }) {
            inner.size -= previous.weight;
        }
        inner.size += weight;

        let mut evicted = vec![];
        while inner.size > self.capacity {
            let Some((key, entry)) = inner.entries.pop_lru() else {
                break;
            };
            inner.size -= entry.weight;
            let entry = inner.evicted(key, entry.value);
            evicted.push(entry);
        }
        drop(inner);

        if !evicted.is_empty() {
            tracing::trace!(count = evicted.len(), "Evicted entries from memory cache");
            metric!(counter("caches.memory.evicted") += evicted.len() as i64);
        }
        evicted
    }

    /// Removes `key` without handing it out for write-back.
    pub fn remove(&self, key: &str) -> Option<P> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.pop(key)?;
        inner.size -= entry.weight;
        Some(entry.value)
    }

    /// Evicts every entry, least recently used first.
    pub fn evict_all(&self) -> Vec<Evicted<P>> {
        let mut inner = self.inner.lock().unwrap();
        let mut evicted = Vec::with_capacity(inner.entries.len());
        while let Some((key, entry)) = inner.entries.pop_lru() {
            let entry = inner.evicted(key, entry.value);
            evicted.push(entry);
        }
        inner.size = 0;
        drop(inner);

        metric!(counter("caches.memory.evicted") += evicted.len() as i64);
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn per_entry() -> Weigher<&'static str> {
        Arc::new(|_, _| 1)
    }

    fn keys<P>(entries: &[Evicted<P>]) -> Vec<&str> {
        entries.iter().map(|entry| entry.key.as_str()).collect()
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = MemoryCache::new(2, per_entry());

        assert!(cache.insert("A".into(), "a").is_empty());
        assert!(cache.insert("B".into(), "b").is_empty());
        let evicted = cache.insert("C".into(), "c");

        assert_eq!(
            evicted,
            vec![Evicted {
                key: "A".to_owned(),
                value: "a",
                version: 1,
            }]
        );
        assert_eq!(cache.get("A"), None);
        assert_eq!(cache.get("B"), Some("b"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.size(), 2);
    }

    #[test]
    fn test_get_refreshes_recency() {
        let cache = MemoryCache::new(2, per_entry());
        cache.insert("A".into(), "a");
        cache.insert("B".into(), "b");

        assert_eq!(cache.get("A"), Some("a"));
        let evicted = cache.insert("C".into(), "c");
        assert_eq!(keys(&evicted), ["B"]);

        // `contains` must not count as a use
        assert!(cache.contains("A"));
        let evicted = cache.insert("D".into(), "d");
        assert_eq!(keys(&evicted), ["A"]);
    }

    #[test]
    fn test_weighted_eviction() {
        let cache: MemoryCache<Vec<u8>> = MemoryCache::new(10, Arc::new(|_, v| v.len() as u64));

        cache.insert("small".into(), vec![0; 2]);
        cache.insert("medium".into(), vec![0; 4]);
        assert_eq!(cache.size(), 6);

        // needs two evictions to fit
        let evicted = cache.insert("large".into(), vec![0; 8]);
        assert_eq!(keys(&evicted), ["small", "medium"]);
        assert_eq!(cache.size(), 8);

        // larger than the whole cache, evicts everything including itself
        let evicted = cache.insert("huge".into(), vec![0; 11]);
        assert_eq!(keys(&evicted), ["large", "huge"]);
        assert_eq!(cache.size(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replace_does_not_evict() {
        let cache: MemoryCache<Vec<u8>> = MemoryCache::new(10, Arc::new(|_, v| v.len() as u64));

        cache.insert("a".into(), vec![0; 6]);
        let evicted = cache.insert("a".into(), vec![1; 9]);
        assert!(evicted.is_empty());
        assert_eq!(cache.size(), 9);
        assert_eq!(cache.get("a"), Some(vec![1; 9]));

        assert_eq!(cache.remove("a"), Some(vec![1; 9]));
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.remove("a"), None);
    }

    #[test]
    fn test_evict_all() {
        let cache = MemoryCache::new(5, per_entry());
        cache.insert("A".into(), "a");
        cache.insert("B".into(), "b");
        cache.insert("C".into(), "c");
        cache.get("A");

        let evicted = cache.evict_all();
        assert_eq!(keys(&evicted), ["B", "C", "A"]);
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn test_eviction_versions_increase() {
        let cache = MemoryCache::new(1, per_entry());
        cache.insert("A".into(), "a1");
        let first = cache.insert("B".into(), "b");
        cache.insert("A".into(), "a2");
        let second = cache.evict_all();

        let versions: Vec<_> = first.iter().chain(&second).map(|e| e.version).collect();
        assert_eq!(versions, [1, 2, 3]);
        assert_eq!(keys(&second), ["A"]);
        assert_eq!(second[0].value, "a2");
    }
}
