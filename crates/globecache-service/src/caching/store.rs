use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};

use filetime::FileTime;
use tempfile::NamedTempFile;
use walkdir::WalkDir;

use super::cache_error::{IoResultExt, StoreError};
use super::cache_key::ResourceKey;
use super::metadata::{self, Metadata};

/// The interval in which cached files are touched.
///
/// The file mtime is only used to restore the recency order when the store is reopened, so
/// this is debounced to once every hour to not have to touch the files on every single use.
const TOUCH_EVERY: Duration = Duration::from_secs(3600);

/// How often [`CacheStore::clear_all`] tries to remove the cache directory.
const CLEAR_ATTEMPTS: u32 = 10;

/// An entry of the in-memory index.
#[derive(Debug)]
pub(super) struct IndexEntry {
    pub(super) size: u64,
    tick: u64,
    readers: Arc<AtomicUsize>,
    metadata: Metadata,
    touched: SystemTime,
}

impl IndexEntry {
    fn is_pinned(&self) -> bool {
        self.readers.load(Ordering::Acquire) > 0
    }
}

/// The in-memory index of a [`CacheStore`].
///
/// Entries are keyed by their path relative to the `files` directory. `recency` maps a
/// monotonically increasing access tick to the entry path, so iterating it yields the least
/// recently used entries first.
#[derive(Debug, Default)]
pub(super) struct StoreIndex {
    pub(super) entries: HashMap<String, IndexEntry>,
    recency: BTreeMap<u64, String>,
    pub(super) resident: u64,
    pub(super) budget: u64,
    clock: u64,
}

impl StoreIndex {
    fn next_tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, path: String, size: u64, metadata: Metadata, touched: SystemTime) {
        self.remove(&path);
        let tick = self.next_tick();
        self.recency.insert(tick, path.clone());
        self.resident += size;
        self.entries.insert(
            path,
            IndexEntry {
                size,
                tick,
                readers: Arc::default(),
                metadata,
                touched,
            },
        );
    }

    fn remove(&mut self, path: &str) -> Option<IndexEntry> {
        let entry = self.entries.remove(path)?;
        self.recency.remove(&entry.tick);
        self.resident = self.resident.saturating_sub(entry.size);
        Some(entry)
    }

    fn bump(&mut self, path: &str) {
        let tick = self.next_tick();
        if let Some(entry) = self.entries.get_mut(path) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, path.to_owned());
        }
    }

    /// Returns the least recently used entries that have to go to get back under budget.
    ///
    /// `keep` and entries with open readers are never selected.
    pub(super) fn eviction_victims(&self, keep: Option<&str>) -> Vec<String> {
        let mut excess = self.resident.saturating_sub(self.budget);
        let mut victims = Vec::new();
        for path in self.recency.values() {
            if excess == 0 {
                break;
            }
            if Some(path.as_str()) == keep {
                continue;
            }
            let Some(entry) = self.entries.get(path) else {
                continue;
            };
            if entry.is_pinned() {
                continue;
            }
            excess = excess.saturating_sub(entry.size);
            victims.push(path.clone());
        }
        victims
    }
}

/// A disk-backed, size-bounded key/blob store with LRU eviction.
///
/// Blobs live under `<root>/files`, laid out by [`ResourceKey::cache_path`], each one
/// accompanied by a JSON metadata sidecar. New blobs are written into `<root>/tmp` first and
/// moved into place once completely written, so a partially written blob is never visible.
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    files_dir: PathBuf,
    tmp_dir: PathBuf,
    index: Mutex<StoreIndex>,
}

/// An open cached blob.
///
/// While a reader is alive, the entry it was opened for is exempt from eviction.
#[derive(Debug)]
pub struct CacheReader {
    file: File,
    len: u64,
    metadata: Metadata,
    _lease: ReaderLease,
}

impl CacheReader {
    /// The size of the blob in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The `Last-Modified` time the server reported for this blob.
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.metadata.last_modified
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

impl Read for CacheReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

#[derive(Debug)]
struct ReaderLease(Arc<AtomicUsize>);

impl ReaderLease {
    fn acquire(readers: &Arc<AtomicUsize>) -> Self {
        readers.fetch_add(1, Ordering::AcqRel);
        Self(readers.clone())
    }
}

impl Drop for ReaderLease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl CacheStore {
    /// Opens the store rooted at `root`, rebuilding the index from disk.
    ///
    /// Leftover temporary files are removed, and the store is trimmed to `budget` bytes.
    pub fn open(root: impl Into<PathBuf>, budget: u64) -> Result<Self, StoreError> {
        let root = root.into();
        let files_dir = root.join("files");
        let tmp_dir = root.join("tmp");

        fs::create_dir_all(&files_dir).at(&files_dir)?;
        clear_tmp(&tmp_dir)?;

        let store = Self {
            root,
            files_dir,
            tmp_dir,
            index: Mutex::new(StoreIndex {
                budget,
                ..Default::default()
            }),
        };

        let mut index = store.lock();
        for (path, size, metadata, mtime) in store.scan() {
            index.insert(path, size, metadata, mtime);
        }
        tracing::info!(
            root = %store.root.display(),
            entries = index.entries.len(),
            resident = index.resident,
            budget,
            "Opened cache store",
        );
        store.evict(&mut index, None);
        drop(index);

        Ok(store)
    }

    /// Scans the `files` directory and returns all readable entries, least recent first.
    fn scan(&self) -> Vec<(String, u64, Metadata, SystemTime)> {
        let mut found = Vec::new();
        for entry in WalkDir::new(&self.files_dir) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = &e as &dyn std::error::Error, "Skipping cache entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();

            if metadata::is_metadata_path(path) {
                if !metadata::blob_path(path).exists() {
                    tracing::debug!(path = %path.display(), "Removing orphaned cache metadata");
                    if let Err(e) = fs::remove_file(path) {
                        tracing::warn!(
                            error = &e as &dyn std::error::Error,
                            path = %path.display(),
                            "Failed to remove orphaned cache metadata",
                        );
                    }
                }
                continue;
            }

            let Some(relative) = self.relative_path(path) else {
                continue;
            };
            let (size, mtime) = match entry.metadata() {
                Ok(md) => (md.len(), md.modified().unwrap_or(SystemTime::UNIX_EPOCH)),
                Err(e) => {
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        path = %path.display(),
                        "Skipping unreadable cache entry",
                    );
                    continue;
                }
            };
            let metadata = metadata::read_metadata(path).unwrap_or_else(|| Metadata {
                key: relative.clone(),
                last_modified: None,
                time_created: mtime,
            });
            found.push((relative, size, metadata, mtime));
        }

        found.sort_by_key(|(_, _, _, mtime)| *mtime);
        found
    }

    /// Returns the `/`-separated path of `path` relative to the `files` directory.
    fn relative_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.files_dir).ok()?;
        let mut out = String::new();
        for component in relative.components() {
            let Component::Normal(segment) = component else {
                return None;
            };
            if !out.is_empty() {
                out.push('/');
            }
            out.push_str(segment.to_str()?);
        }
        Some(out)
    }

    fn lock(&self) -> MutexGuard<'_, StoreIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The root directory of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The absolute location of the blob for `key`.
    pub fn blob_path(&self, key: &ResourceKey) -> PathBuf {
        self.files_dir.join(key.cache_path())
    }

    /// Opens the cached blob for `key`, marking it as most recently used.
    pub fn get(&self, key: &ResourceKey) -> Option<CacheReader> {
        let relative = key.cache_path();
        let path = self.blob_path(key);
        let mut index = self.lock();

        if !index.entries.contains_key(relative) {
            metric!(counter("caches.access") += 1, "hit" => "false");
            return None;
        }

        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) => {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(
                        error = &e as &dyn std::error::Error,
                        path = %path.display(),
                        "Failed to open cache file",
                    );
                }
                // the blob vanished from under us
                index.remove(relative);
                metric!(counter("caches.access") += 1, "hit" => "false");
                return None;
            }
        };

        index.bump(relative);
        let entry = index.entries.get_mut(relative)?;
        let now = SystemTime::now();
        if now.duration_since(entry.touched).unwrap_or_default() >= TOUCH_EVERY {
            if let Err(e) = filetime::set_file_mtime(&path, FileTime::from_system_time(now)) {
                tracing::debug!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to touch cache file",
                );
            }
            entry.touched = now;
        }

        metric!(counter("caches.access") += 1, "hit" => "true");
        Some(CacheReader {
            file,
            len: entry.size,
            metadata: entry.metadata.clone(),
            _lease: ReaderLease::acquire(&entry.readers),
        })
    }

    /// Stores the contents of `source` under `key`, replacing any previous blob.
    ///
    /// Returns the number of bytes written. After writing, least recently used entries are
    /// evicted until the store is within budget again. The entry just written is exempt from
    /// that, so a single blob larger than the budget is still retained.
    pub fn put(
        &self,
        key: &ResourceKey,
        mut source: impl Read,
        last_modified: Option<SystemTime>,
    ) -> Result<u64, StoreError> {
        let mut temp_file = self.tempfile()?;
        let written = io::copy(&mut source, temp_file.as_file_mut()).at(temp_file.path())?;
        temp_file.as_file().sync_all().at(temp_file.path())?;

        let on_disk = temp_file.as_file().metadata().at(temp_file.path())?.len();
        if on_disk != written {
            return Err(StoreError::Incomplete {
                expected: written,
                written: on_disk,
            });
        }

        let metadata = Metadata::fresh(key.canonical(), last_modified);
        let mut md_file = self.tempfile()?;
        serde_json::to_writer(md_file.as_file_mut(), &metadata)
            .map_err(io::Error::from)
            .at(md_file.path())?;

        let relative = key.cache_path();
        let path = self.blob_path(key);
        let md_path = metadata::metadata_path(&path);

        let mut index = self.lock();
        persist_tempfile(md_file, &md_path).at(&md_path)?;
        if let Err(e) = persist_tempfile(temp_file, &path) {
            let _ = fs::remove_file(&md_path);
            return Err(StoreError::from_io(e, &path));
        }

        index.insert(relative.to_owned(), written, metadata, SystemTime::now());
        self.evict(&mut index, Some(relative));

        metric!(time_raw("caches.file.size") = written);
        tracing::trace!(key = %key, bytes = written, "Stored cache file");
        Ok(written)
    }

    /// Removes the blob for `key` and its metadata.
    ///
    /// Deleting a key that is not cached is not an error.
    pub fn delete(&self, key: &ResourceKey) -> Result<(), StoreError> {
        let path = self.blob_path(key);
        let mut index = self.lock();
        index.remove(key.cache_path());
        remove_entry_files(&path)
    }

    /// Changes the size budget, evicting entries if the store is now over it.
    pub fn set_budget(&self, budget: u64) {
        let mut index = self.lock();
        index.budget = budget;
        self.evict(&mut index, None);
    }

    /// Removes every cached blob.
    ///
    /// Removing the directory is retried with a growing back-off, as files may be briefly in
    /// use by other processes.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        // The files are removed without holding the lock, so readers are not stalled by the
        // retries below. Blobs that vanish under a reader are dropped from the index by `get`.
        let removed = {
            let mut index = self.lock();
            let (budget, clock) = (index.budget, index.clock);
            let old = std::mem::replace(
                &mut *index,
                StoreIndex {
                    budget,
                    clock,
                    ..Default::default()
                },
            );
            old.entries.len()
        };

        let mut last_error = None;
        for attempt in 0..CLEAR_ATTEMPTS {
            match fs::remove_dir_all(&self.files_dir) {
                Ok(()) => {
                    last_error = None;
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    last_error = None;
                    break;
                }
                Err(e) => {
                    tracing::debug!(
                        error = &e as &dyn std::error::Error,
                        attempt,
                        "Failed to clear cache directory",
                    );
                    last_error = Some(e);
                    std::thread::sleep(Duration::from_millis(10 << attempt.min(6)));
                }
            }
        }
        if let Some(e) = last_error {
            return Err(StoreError::from_io(e, &self.files_dir));
        }

        fs::create_dir_all(&self.files_dir).at(&self.files_dir)?;
        tracing::info!(root = %self.root.display(), removed, "Cleared cache store");
        Ok(())
    }

    /// The total size of all cached blobs in bytes.
    pub fn resident_size(&self) -> u64 {
        self.lock().resident
    }

    /// The number of cached blobs.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn budget(&self) -> u64 {
        self.lock().budget
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.lock().entries.contains_key(key.cache_path())
    }

    /// The `Last-Modified` time the server reported for the blob cached under `key`.
    pub fn last_modified(&self, key: &ResourceKey) -> Option<SystemTime> {
        self.lock()
            .entries
            .get(key.cache_path())
            .and_then(|entry| entry.metadata.last_modified)
    }

    /// The metadata of the blob cached under `key`.
    pub fn metadata(&self, key: &ResourceKey) -> Option<Metadata> {
        self.lock()
            .entries
            .get(key.cache_path())
            .map(|entry| entry.metadata.clone())
    }

    pub(super) fn files_dir(&self) -> &Path {
        &self.files_dir
    }

    pub(super) fn tmp_dir(&self) -> &Path {
        &self.tmp_dir
    }

    pub(super) fn with_index<R>(&self, f: impl FnOnce(&mut StoreIndex) -> R) -> R {
        f(&mut self.lock())
    }

    /// Evicts least recently used entries while the store is over budget.
    ///
    /// Returns the number of evicted entries and bytes.
    pub(super) fn evict(&self, index: &mut StoreIndex, keep: Option<&str>) -> (usize, u64) {
        if index.resident <= index.budget {
            return (0, 0);
        }

        let mut count = 0;
        let mut bytes = 0;
        for relative in index.eviction_victims(keep) {
            let Some(entry) = index.remove(&relative) else {
                continue;
            };
            let path = self.files_dir.join(&relative);
            if let Err(e) = remove_entry_files(&path) {
                tracing::warn!(
                    error = &e as &dyn std::error::Error,
                    "Failed to remove evicted cache file",
                );
            }
            count += 1;
            bytes += entry.size;
        }

        if count > 0 {
            tracing::debug!(
                entries = count,
                bytes,
                resident = index.resident,
                budget = index.budget,
                "Evicted cache entries",
            );
            metric!(counter("caches.evicted") += count as i64);
            metric!(gauge("caches.size.bytes") = index.resident);
        }
        (count, bytes)
    }

    /// Create a new temporary file to write a cache entry into.
    fn tempfile(&self) -> Result<NamedTempFile, StoreError> {
        // The `clear_all` and `cleanup` operations could remove the parent directory
        // concurrently, so retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(&self.tmp_dir) {
                tracing::error!("Failed to create temp directory: {:?}", e);
                if self.tmp_dir.is_file() {
                    return Err(StoreError::PermissionDenied(
                        self.tmp_dir.display().to_string(),
                    ));
                }
                if retries > MAX_RETRIES {
                    return Err(StoreError::from_io(e, &self.tmp_dir));
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix("tmp")
                .tempfile_in(&self.tmp_dir)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    tracing::error!("Failed to create temp file: {:?}", e);
                    if retries > MAX_RETRIES {
                        return Err(StoreError::from_io(e, &self.tmp_dir));
                    }
                    continue;
                }
            }
        }
    }
}

/// Removes everything in the temp directory, and recreates it.
fn clear_tmp(tmp_dir: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(tmp_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(StoreError::from_io(e, tmp_dir)),
    }
    fs::create_dir_all(tmp_dir).at(tmp_dir)
}

/// Removes the blob at `path` and its sidecar, ignoring files that do not exist.
fn remove_entry_files(path: &Path) -> Result<(), StoreError> {
    for path in [metadata::metadata_path(path), path.to_owned()] {
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::from_io(e, &path)),
        }
    }
    Ok(())
}

/// Moves a completely written temp file to its final location.
fn persist_tempfile(mut temp_file: NamedTempFile, cache_path: &Path) -> io::Result<File> {
    let parent = cache_path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    // The `clear_all` and `cleanup` operations could remove the parent directories we are
    // operating in, so retry the fs operations.
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
                tracing::error!("Failed to persist cache file: {:?}", err);
                if retries > MAX_RETRIES {
                    return Err(err);
                }
                continue;
            }
        }
    };
    Ok(file)
}
