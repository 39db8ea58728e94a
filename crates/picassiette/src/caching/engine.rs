use std::fmt;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::task::TaskTracker;

use super::{CacheError, CacheKey, Codec, Evicted, MemoryCache, PersistentStore, StoreState};

/// The two cache tiers behind a single read path and a single write path.
///
/// Reads consult the [`MemoryCache`] first and fall back to the [`PersistentStore`]. Writes only
/// ever go to memory. Values reach the disk as a side effect of being evicted from memory, so a
/// value can be lost if the process exits before it was evicted.
pub struct CacheEngine<P> {
    memory: MemoryCache<P>,
    disk: Option<Arc<PersistentStore>>,
    codec: Arc<dyn Codec<P>>,
    write_backs: TaskTracker,
    flush_lock: AsyncMutex<()>,
    runtime: Handle,
}

impl<P> fmt::Debug for CacheEngine<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEngine")
            .field("memory", &self.memory)
            .field("disk", &self.disk)
            .field("pending_write_backs", &self.write_backs.len())
            .finish()
    }
}

impl<P: Clone + Send + Sync + 'static> CacheEngine<P> {
    /// Creates a new engine and starts initializing the persistent store in the background.
    pub fn new(
        memory: MemoryCache<P>,
        disk: Option<PersistentStore>,
        codec: Arc<dyn Codec<P>>,
        runtime: Handle,
    ) -> Self {
        let disk = disk.map(Arc::new);
        if let Some(store) = &disk {
            let store = Arc::clone(store);
            runtime.spawn_blocking(move || {
                if let Err(e) = store.initialize() {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        path = %store.dir().display(),
                        "Failed to initialize persistent store"
                    );
                }
            });
        }

        Self {
            memory,
            disk,
            codec,
            write_backs: TaskTracker::new(),
            flush_lock: AsyncMutex::new(()),
            runtime,
        }
    }

    pub fn memory(&self) -> &MemoryCache<P> {
        &self.memory
    }

    pub fn disk(&self) -> Option<&PersistentStore> {
        self.disk.as_deref()
    }

    /// The state of the persistent store, or `None` if the engine has no disk tier.
    pub fn disk_state(&self) -> Option<StoreState> {
        self.disk.as_ref().map(|disk| disk.state())
    }

    /// Waits until the persistent store is ready. Returns immediately without a disk tier.
    pub async fn ready(&self) {
        if let Some(disk) = &self.disk {
            disk.ready().await;
        }
    }

    /// Looks up `key` in memory, then on disk.
    pub async fn lookup(&self, key: &str) -> Option<P> {
        metric!(counter("caches.access") += 1);
        if let Some(value) = self.lookup_memory(key) {
            return Some(value);
        }
        self.lookup_disk(key).await
    }

    /// Looks up `key` in the memory tier only.
    pub fn lookup_memory(&self, key: &str) -> Option<P> {
        let value = self.memory.get(key)?;
        metric!(counter("caches.memory.hit") += 1);
        Some(value)
    }

    /// Looks up `key` in the disk tier only.
    ///
    /// The file is read and decoded on the blocking pool. A hit is promoted into the memory tier.
    /// Every failure is logged and counts as a miss, and undecodable entries are removed.
    pub async fn lookup_disk(&self, key: &str) -> Option<P> {
        let disk = self.disk.as_ref()?;
        let cache_key = CacheKey::new(key);
        let store = Arc::clone(disk);
        let codec = Arc::clone(&self.codec);

        let result = self
            .runtime
            .spawn_blocking(move || -> Result<Option<P>, CacheError> {
                let Some(bytes) = store.get(&cache_key)? else {
                    return Ok(None);
                };
                metric!(time_raw("caches.disk.size") = bytes.len() as u64);
                match codec.decode(&bytes) {
                    Ok(value) => Ok(Some(value)),
                    Err(e) => {
                        // an unreadable entry would never become readable again
                        let _ = store.remove(&cache_key);
                        Err(e)
                    }
                }
            })
            .await;

        let value = match result {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                e.log(key, "read");
                None
            }
            Err(e) => {
                tracing::error!(error = &e as &dyn std::error::Error, key, "Disk lookup panicked");
                None
            }
        };

        match value {
            Some(value) => {
                metric!(counter("caches.disk.hit") += 1);
                tracing::trace!(key, "Promoting disk hit into memory");
                self.store(key.to_owned(), value.clone());
                Some(value)
            }
            None => {
                metric!(counter("caches.disk.miss") += 1);
                None
            }
        }
    }

    /// Inserts `value` into the memory tier, writing back whatever gets evicted.
    pub fn store(&self, key: String, value: P) {
        let evicted = self.memory.insert(key, value);
        self.write_back(evicted);
    }

    /// Empties the memory tier, writing back every entry.
    pub fn evict_all(&self) {
        let evicted = self.memory.evict_all();
        tracing::debug!(count = evicted.len(), "Evicted all entries from memory");
        self.write_back(evicted);
    }

    /// Empties the memory tier, then deletes and reinitializes the persistent store.
    ///
    /// Write-backs of the entries evicted here, and of all earlier evictions still in flight,
    /// belong to the old store generation and are discarded. To persist memory before clearing,
    /// call [`evict_all`](Self::evict_all) and [`flush`](Self::flush) first.
    pub fn evict_all_and_reset_disk(&self) {
        self.evict_all();
        self.reset_disk();
    }

    /// Deletes and reinitializes the persistent store in the background.
    ///
    /// The store is [`Resetting`](StoreState::Resetting) as soon as this returns.
    pub fn reset_disk(&self) {
        let Some(disk) = &self.disk else {
            return;
        };
        let generation = disk.begin_reset();
        tracing::debug!(generation, path = %disk.dir().display(), "Resetting persistent store");

        let store = Arc::clone(disk);
        self.runtime.spawn_blocking(move || {
            if let Err(e) = store.wipe(generation) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %store.dir().display(),
                    "Failed to reset persistent store"
                );
            }
        });
    }

    /// Waits until every write-back started so far has completed.
    pub async fn flush(&self) {
        let _guard = self.flush_lock.lock().await;
        self.write_backs.close();
        self.write_backs.wait().await;
        self.write_backs.reopen();
    }

    /// Persists `entries` on the blocking pool.
    ///
    /// The store generation is captured now, so the write is discarded if the store gets reset
    /// before it lands. Batches may land in any order, the eviction version of each entry keeps an
    /// older value from replacing a newer one.
    fn write_back(&self, entries: Vec<Evicted<P>>) {
        if entries.is_empty() {
            return;
        }
        let Some(disk) = &self.disk else {
            return;
        };
        let generation = disk.generation();
        let store = Arc::clone(disk);
        let codec = Arc::clone(&self.codec);

        self.write_backs.spawn_blocking_on(
            move || {
                for entry in entries {
                    let result = codec.encode(&entry.value).and_then(|bytes| {
                        let key = CacheKey::new(&entry.key);
                        store.put(&key, &bytes, generation, entry.version)
                    });
                    if let Err(e) = result {
                        e.log(&entry.key, "write-back");
                    }
                }
            },
            &self.runtime,
        );
    }
}
