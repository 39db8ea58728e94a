use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use filetime::FileTime;
use lru::LruCache;
use tempfile::NamedTempFile;
use tokio::sync::watch;
use walkdir::WalkDir;

use super::{CacheError, CacheKey};

/// Name of the directory inside the store that holds in-progress writes.
const TMP_DIR: &str = "tmp";

/// The lifecycle state of a [`PersistentStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// The store was created, but the existing files have not been scanned yet.
    Uninitialized,
    /// The store can be read from and written to.
    Ready,
    /// The store is being wiped and will be initialized again.
    Resetting,
}

/// What the index knows about a stored file.
#[derive(Debug, Clone, Copy)]
struct DiskEntry {
    size: u64,
    /// The version of the value in the file. Entries found on disk at startup have version `0`.
    version: u64,
}

/// The in-memory view of the files in the store, in recency order.
struct DiskIndex {
    entries: LruCache<CacheKey, DiskEntry>,
    size: u64,
}

impl DiskIndex {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            size: 0,
        }
    }

    /// Records `entry` as most recently used and returns the entries that have to be removed to
    /// get back under `capacity`.
    fn insert(&mut self, key: CacheKey, entry: DiskEntry, capacity: u64) -> Vec<CacheKey> {
        if let Some(previous) = self.entries.put(key, entry) {
            self.size -= previous.size;
        }
        self.size += entry.size;
        self.trim(capacity)
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.pop(key) {
            self.size -= entry.size;
        }
    }

    fn trim(&mut self, capacity: u64) -> Vec<CacheKey> {
        let mut evicted = vec![];
        while self.size > capacity {
            let Some((key, entry)) = self.entries.pop_lru() else {
                break;
            };
            self.size -= entry.size;
            evicted.push(key);
        }
        evicted
    }
}

/// A bounded, durable key-value store with least-recently-used eviction.
///
/// Every entry is a file named after the [`CacheKey`] of its logical key. Writes go to a temporary
/// file first, which never contends. Moving files into place and unlinking them happens while the
/// in-memory index is locked, so the index and the directory always agree on which version of an
/// entry is stored.
///
/// The store starts out [`Uninitialized`](StoreState::Uninitialized) and only becomes
/// [`Ready`](StoreState::Ready) once [`initialize`](Self::initialize) has rebuilt the index from the
/// files on disk. Until then every read and write fails with [`CacheError::StoreUnavailable`].
pub struct PersistentStore {
    dir: PathBuf,
    tmp_dir: PathBuf,
    capacity: u64,
    state: watch::Sender<StoreState>,
    /// Bumped on every reset. Initializers and writes of an older generation are discarded.
    generation: AtomicU64,
    index: Mutex<DiskIndex>,
}

impl std::fmt::Debug for PersistentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentStore")
            .field("dir", &self.dir)
            .field("capacity", &self.capacity)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

impl PersistentStore {
    /// Creates a new store rooted at `dir`, without touching the file system.
    pub fn new(dir: PathBuf, capacity: u64) -> Self {
        let tmp_dir = dir.join(TMP_DIR);
        let (state, _) = watch::channel(StoreState::Uninitialized);
        Self {
            dir,
            tmp_dir,
            capacity,
            state,
            generation: AtomicU64::new(0),
            index: Mutex::new(DiskIndex::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn state(&self) -> StoreState {
        *self.state.borrow()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Waits until the store is [`Ready`](StoreState::Ready).
    ///
    /// The fetch path never waits for this. It exists for callers that need a usable store, like
    /// tests or maintenance commands.
    pub async fn ready(&self) {
        let mut state = self.state.subscribe();
        // the sender lives in `self`, so this can not fail
        let _ = state.wait_for(|state| *state == StoreState::Ready).await;
    }

    /// The total size of all stored entries, in bytes.
    pub fn size(&self) -> u64 {
        self.index.lock().unwrap().size
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an entry for `key` is stored, without touching its recency.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.index.lock().unwrap().entries.contains(key)
    }

    fn ensure_ready(&self) -> Result<(), CacheError> {
        match self.state() {
            StoreState::Ready => Ok(()),
            _ => Err(CacheError::StoreUnavailable),
        }
    }

    fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.cache_path())
    }

    /// Rebuilds the index from the files on disk and marks the store as ready.
    ///
    /// Blocks on file system access.
    pub fn initialize(&self) -> Result<(), CacheError> {
        self.initialize_generation(self.generation())
    }

    fn initialize_generation(&self, generation: u64) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir)?;
        // leftovers of writes that were interrupted by a crash
        if self.tmp_dir.exists() {
            fs::remove_dir_all(&self.tmp_dir)?;
        }
        fs::create_dir_all(&self.tmp_dir)?;

        let mut found = self.scan()?;
        found.sort_by_key(|(_, _, mtime)| *mtime);

        let mut index = DiskIndex::new();
        let mut evicted = vec![];
        for (key, size, _) in found {
            let entry = DiskEntry { size, version: 0 };
            evicted.extend(index.insert(key, entry, self.capacity));
        }

        {
            let mut current = self.index.lock().unwrap();
            if self.generation() != generation {
                tracing::debug!(path = %self.dir.display(), "Discarding outdated store initialization");
                return Ok(());
            }
            self.remove_files(&evicted);
            *current = index;
            self.state.send_replace(StoreState::Ready);
        }

        tracing::debug!(
            path = %self.dir.display(),
            entries = self.len(),
            size = self.size(),
            "Persistent store ready"
        );
        Ok(())
    }

    /// Collects all entries in the store directory, with their size and modification time.
    fn scan(&self) -> Result<Vec<(CacheKey, u64, SystemTime)>, CacheError> {
        let mut found = vec![];
        let walker = WalkDir::new(&self.dir)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| entry.path() != self.tmp_dir);

        for entry in walker {
            let entry = entry.map_err(io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.dir) else {
                continue;
            };
            let Some(key) = CacheKey::from_cache_path(relative) else {
                tracing::trace!(path = %entry.path().display(), "Ignoring unknown file in store");
                continue;
            };
            let metadata = entry.metadata().map_err(io::Error::from)?;
            let mtime = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((key, metadata.len(), mtime));
        }
        Ok(found)
    }

    /// Marks the store as [`Resetting`](StoreState::Resetting) and forgets all entries.
    ///
    /// Returns the new generation, which has to be passed to [`wipe`](Self::wipe).
    pub fn begin_reset(&self) -> u64 {
        let mut index = self.index.lock().unwrap();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *index = DiskIndex::new();
        self.state.send_replace(StoreState::Resetting);
        generation
    }

    /// Deletes the store directory and initializes the store again from empty.
    ///
    /// Blocks on file system access.
    pub fn wipe(&self, generation: u64) -> Result<(), CacheError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.initialize_generation(generation)
    }

    /// Reads the entry for `key`.
    ///
    /// Returns `Ok(None)` on a miss. Blocks on file system access.
    pub fn get(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        self.ensure_ready()?;
        if self.index.lock().unwrap().entries.get(key).is_none() {
            return Ok(None);
        }

        let path = self.path_for(key);
        tracing::trace!("Reading cache file at path {:?}", path.display());
        match fs::read(&path) {
            Ok(bytes) => {
                // keeps the recency order across restarts
                if let Err(e) = filetime::set_file_mtime(&path, FileTime::now()) {
                    tracing::debug!(error = &e as &dyn std::error::Error, "Failed to touch cache file");
                }
                Ok(Some(bytes))
            }
            // the entry might have been evicted concurrently
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let mut index = self.index.lock().unwrap();
                if !path.exists() {
                    index.remove(key);
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Writes the entry for `key`, evicting least recently used entries to stay within capacity.
    ///
    /// `version` orders writes of the same key: a write never replaces an entry with a higher
    /// version, so a late write of an older value can not clobber a newer one. Writes belonging to
    /// an older `generation` than the current one are discarded. An entry larger than the whole
    /// capacity is not stored. Blocks on file system access.
    pub fn put(
        &self,
        key: &CacheKey,
        bytes: &[u8],
        generation: u64,
        version: u64,
    ) -> Result<(), CacheError> {
        self.ensure_ready()?;
        if generation != self.generation() {
            return Err(CacheError::StoreUnavailable);
        }

        let size = bytes.len() as u64;
        if size > self.capacity {
            tracing::debug!(size, capacity = self.capacity, "Entry does not fit into store");
            return Ok(());
        }

        let path = self.path_for(key);
        let mut temp_file = self.tempfile()?;
        temp_file.write_all(bytes)?;

        {
            let mut index = self.index.lock().unwrap();
            // the store was reset while we were writing
            if generation != self.generation() {
                return Err(CacheError::StoreUnavailable);
            }
            if let Some(stored) = index.entries.peek(key) {
                if stored.version > version {
                    tracing::trace!(
                        version,
                        stored = stored.version,
                        "Skipping write of outdated cache entry"
                    );
                    return Ok(());
                }
            }

            tracing::trace!("Creating cache file at path {:?}", path.display());
            persist_tempfile(temp_file, &path)?;
            let evicted = index.insert(*key, DiskEntry { size, version }, self.capacity);
            self.remove_files(&evicted);
        }

        metric!(counter("caches.disk.write") += 1);
        metric!(time_raw("caches.disk.size") = size);
        Ok(())
    }

    /// Removes the entry for `key`, returning whether it was stored.
    pub fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        self.ensure_ready()?;
        let mut index = self.index.lock().unwrap();
        let existed = index.entries.contains(key);
        if existed {
            index.remove(key);
            self.remove_files(&[*key]);
        }
        Ok(existed)
    }

    fn remove_files(&self, keys: &[CacheKey]) {
        for key in keys {
            let path = self.path_for(key);
            tracing::trace!("Removing cache file at path {:?}", path.display());
            if let Err(e) = fs::remove_file(&path) {
                // `NotFound` errors are no cause for concern, the file may have never been written.
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::error!(
                        error = &e as &dyn std::error::Error,
                        path = %path.display(),
                        "Failed to remove cache file"
                    );
                }
            }
        }
    }

    /// Creates a new temporary file next to the store entries.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        // A concurrent reset could remove the directory we are operating in, so retry the fs
        // operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(&self.tmp_dir) {
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match NamedTempFile::new_in(&self.tmp_dir) {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                    continue;
                }
            }
        }
    }
}

fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<fs::File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    // A concurrent reset could remove the parent directories we are operating in, so retry the
    // fs operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    let file = loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!("Failed to create cache directory: {:?}", e);
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(cache_path) {
            Ok(file) => break file,
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!("Failed to create cache file: {:?}", err);
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    };
    Ok(file)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn ready_store(dir: &Path, capacity: u64) -> PersistentStore {
        let store = PersistentStore::new(dir.join("store"), capacity);
        store.initialize().unwrap();
        store
    }

    #[test]
    fn test_unavailable_until_initialized() {
        let tempdir = picassiette_test::tempdir();
        let store = PersistentStore::new(tempdir.path().join("store"), 1024);
        let key = CacheKey::new("a");

        assert_eq!(store.state(), StoreState::Uninitialized);
        assert!(store.get(&key).unwrap_err().is_unavailable());
        assert!(store.put(&key, b"a", 0, 0).unwrap_err().is_unavailable());

        store.initialize().unwrap();
        assert_eq!(store.state(), StoreState::Ready);
        assert_eq!(store.get(&key).unwrap(), None);
        store.put(&key, b"a", 0, 0).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn test_lru_eviction_by_size() {
        let tempdir = picassiette_test::tempdir();
        let store = ready_store(tempdir.path(), 10);
        let (a, b, c) = (CacheKey::new("a"), CacheKey::new("b"), CacheKey::new("c"));

        store.put(&a, b"aaaa", 0, 0).unwrap();
        store.put(&b, b"bbbb", 0, 0).unwrap();
        // `a` is now the most recently used
        assert!(store.get(&a).unwrap().is_some());
        store.put(&c, b"cccc", 0, 0).unwrap();

        assert_eq!(store.get(&b).unwrap(), None);
        assert!(!store.dir().join(b.cache_path()).exists());
        assert_eq!(store.get(&a).unwrap(), Some(b"aaaa".to_vec()));
        assert_eq!(store.get(&c).unwrap(), Some(b"cccc".to_vec()));
        assert_eq!(store.size(), 8);

        // too large to ever fit
        store.put(&b, &[0; 11], 0, 0).unwrap();
        assert_eq!(store.get(&b).unwrap(), None);
        assert_eq!(store.size(), 8);
    }

    #[test]
    fn test_overwrite_same_key() {
        let tempdir = picassiette_test::tempdir();
        let store = ready_store(tempdir.path(), 100);
        let key = CacheKey::new("a");

        store.put(&key, b"first", 0, 0).unwrap();
        store.put(&key, b"second!", 0, 0).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(b"second!".to_vec()));
        assert_eq!(store.len(), 1);
        assert_eq!(store.size(), 7);

        assert!(store.remove(&key).unwrap());
        assert!(!store.remove(&key).unwrap());
        assert_eq!(store.get(&key).unwrap(), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_older_version_does_not_overwrite() {
        let tempdir = picassiette_test::tempdir();
        let store = ready_store(tempdir.path(), 100);
        let key = CacheKey::new("a");

        store.put(&key, b"newer", 0, 2).unwrap();
        // a write-back that was scheduled earlier, but finishes later
        store.put(&key, b"older", 0, 1).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(b"newer".to_vec()));
        assert_eq!(store.size(), 5);
        assert_eq!(fs::read_dir(tempdir.path().join("store/tmp")).unwrap().count(), 0);

        store.put(&key, b"newest", 0, 3).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(b"newest".to_vec()));

        // the version is forgotten once the entry is gone
        assert!(store.remove(&key).unwrap());
        store.put(&key, b"older", 0, 1).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(b"older".to_vec()));
    }

    #[test]
    fn test_rebuilt_from_disk() {
        let tempdir = picassiette_test::tempdir();
        let (a, b, c) = (CacheKey::new("a"), CacheKey::new("b"), CacheKey::new("c"));

        {
            let store = ready_store(tempdir.path(), 100);
            store.put(&a, b"aaaa", 0, 0).unwrap();
            std::thread::sleep(Duration::from_millis(20));
            store.put(&b, b"bbbb", 0, 0).unwrap();
            std::thread::sleep(Duration::from_millis(20));
            store.put(&c, b"cccc", 0, 0).unwrap();
        }
        // junk and interrupted writes are not picked up as entries
        fs::write(tempdir.path().join("store/README"), b"hello").unwrap();
        fs::write(tempdir.path().join("store/tmp/.tmp1234"), b"partial").unwrap();

        // a smaller store only keeps the most recently written entries
        let store = ready_store(tempdir.path(), 8);
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&a).unwrap(), None);
        assert!(!store.dir().join(a.cache_path()).exists());
        assert_eq!(store.get(&b).unwrap(), Some(b"bbbb".to_vec()));
        assert_eq!(store.get(&c).unwrap(), Some(b"cccc".to_vec()));
        assert!(!tempdir.path().join("store/tmp/.tmp1234").exists());
    }

    #[test]
    fn test_reset() {
        let tempdir = picassiette_test::tempdir();
        let store = ready_store(tempdir.path(), 100);
        let key = CacheKey::new("a");
        store.put(&key, b"aaaa", 0, 0).unwrap();

        let generation = store.begin_reset();
        assert_eq!(generation, 1);
        assert_eq!(store.state(), StoreState::Resetting);
        assert!(store.get(&key).unwrap_err().is_unavailable());

        store.wipe(generation).unwrap();
        assert_eq!(store.state(), StoreState::Ready);
        assert_eq!(store.get(&key).unwrap(), None);
        assert!(!store.dir().join(key.cache_path()).exists());

        // a write-back that was started before the reset is discarded
        assert!(store.put(&key, b"aaaa", 0, 0).unwrap_err().is_unavailable());
        assert_eq!(store.get(&key).unwrap(), None);
        store.put(&key, b"bbbb", generation, 0).unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(b"bbbb".to_vec()));
    }

    #[test]
    fn test_outdated_initialization_is_discarded() {
        let tempdir = picassiette_test::tempdir();
        let store = PersistentStore::new(tempdir.path().join("store"), 100);

        store.begin_reset();
        // an initializer of generation 0 finishing late must not mark the store as ready
        store.initialize_generation(0).unwrap();
        assert_eq!(store.state(), StoreState::Resetting);

        store.initialize().unwrap();
        assert_eq!(store.state(), StoreState::Ready);
    }
}
