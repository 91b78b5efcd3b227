use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::download::{DownloadService, FetchResponse, ServerBreaker};
use crate::utils::coalesce::Coalescer;

use super::cache_error::{CacheError, StoreError};
use super::cache_key::ResourceKey;
use super::store::{CacheReader, CacheStore};

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// The smallest accepted cache size.
pub const MIN_CACHE_SIZE: u64 = MIB;

/// The cache sizes offered to users.
pub const SIZE_CHOICES: &[u64] = &[
    256 * MIB,
    512 * MIB,
    GIB,
    2 * GIB,
    4 * GIB,
    8 * GIB,
    16 * GIB,
    32 * GIB,
];

/// The default cache size.
pub const DEFAULT_CACHE_SIZE: u64 = 2 * GIB;

/// An invalid cache configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The requested size is below [`MIN_CACHE_SIZE`].
    #[error("cache size of {size} bytes is below the minimum of {MIN_CACHE_SIZE} bytes")]
    TooSmall { size: u64 },
    /// No cache directory was given.
    #[error("no cache directory configured")]
    MissingDirectory,
    /// The cache directory could not be opened.
    #[error("failed to open cache directory")]
    Store(#[from] StoreError),
}

/// User-facing cache settings.
///
/// This is plain data: changing it has no effect until it is applied with
/// [`CacheManager::configure`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    dir: PathBuf,
    enabled: bool,
    max_size: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("globe"),
            enabled: true,
            max_size: DEFAULT_CACHE_SIZE,
        }
    }
}

impl CacheSettings {
    pub fn new(dir: impl Into<PathBuf>, max_size: u64) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        settings.set_dir(dir)?;
        settings.set_max_size(max_size)?;
        Ok(settings)
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The size budget in bytes.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn set_dir(&mut self, dir: impl Into<PathBuf>) -> Result<(), ConfigError> {
        let dir = dir.into();
        if dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingDirectory);
        }
        self.dir = dir;
        Ok(())
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_max_size(&mut self, max_size: u64) -> Result<(), ConfigError> {
        if max_size < MIN_CACHE_SIZE {
            return Err(ConfigError::TooSmall { size: max_size });
        }
        self.max_size = max_size;
        Ok(())
    }

    /// Checks settings that did not go through the setters, e.g. deserialized ones.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingDirectory);
        }
        if self.max_size < MIN_CACHE_SIZE {
            return Err(ConfigError::TooSmall {
                size: self.max_size,
            });
        }
        Ok(())
    }
}

/// The cache configuration that was active when a fetch started.
#[derive(Debug)]
pub struct CacheSnapshot {
    generation: u64,
    settings: CacheSettings,
    store: Option<Arc<CacheStore>>,
}

impl CacheSnapshot {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// The store, if caching is enabled.
    pub fn store(&self) -> Option<&Arc<CacheStore>> {
        self.store.as_ref()
    }
}

/// The result of [`CacheManager::fetch_and_store`].
#[derive(Debug, Clone)]
pub enum Fetched<T> {
    /// The server sent new data, which was decoded into `payload`.
    Fresh {
        payload: T,
        last_modified: Option<SystemTime>,
    },
    /// The server confirmed that the cached copy is still current.
    NotModified,
}

/// A readable resource, either from the cache or freshly downloaded.
#[derive(Debug)]
pub enum ResourceStream {
    Cached(CacheReader),
    Fresh(Cursor<Bytes>),
}

impl ResourceStream {
    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached(_))
    }

    /// Reads the remaining contents into memory.
    pub fn into_bytes(self) -> io::Result<Bytes> {
        match self {
            Self::Cached(mut reader) => {
                let mut buf = Vec::with_capacity(reader.len() as usize);
                reader.read_to_end(&mut buf)?;
                Ok(buf.into())
            }
            Self::Fresh(cursor) => {
                let position = cursor.position() as usize;
                Ok(cursor.into_inner().slice(position..))
            }
        }
    }
}

impl Read for ResourceStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Cached(reader) => reader.read(buf),
            Self::Fresh(cursor) => cursor.read(buf),
        }
    }
}

/// A summary of the cache state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub dir: PathBuf,
    pub enabled: bool,
    pub degraded: bool,
    pub entries: usize,
    pub resident_bytes: u64,
    pub budget: u64,
}

/// Owns the cache configuration and mediates every access to the cache store.
///
/// All fetches that end up in the store go through the manager, which makes sure that:
/// - data fetched under an old configuration is not written into a newly configured store,
/// - no data is written while the cache is being cleared,
/// - after the first storage failure, the cache is bypassed for the rest of the session.
#[derive(Debug)]
pub struct CacheManager {
    downloader: Arc<DownloadService>,
    state: RwLock<Arc<CacheSnapshot>>,
    write_gate: RwLock<()>,
    generation: AtomicU64,
    degraded: AtomicBool,
    streams: Coalescer<(ResourceKey, Option<SystemTime>), Fetched<Bytes>>,
}

impl CacheManager {
    /// Creates a manager with caching disabled, see [`configure`](Self::configure).
    pub fn new(downloader: Arc<DownloadService>) -> Self {
        Self {
            downloader,
            state: RwLock::new(Arc::new(CacheSnapshot {
                generation: 0,
                settings: CacheSettings::disabled(),
                store: None,
            })),
            write_gate: RwLock::new(()),
            generation: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
            streams: Coalescer::default(),
        }
    }

    pub fn downloader(&self) -> &Arc<DownloadService> {
        &self.downloader
    }

    pub fn breaker(&self) -> &Arc<ServerBreaker> {
        self.downloader.breaker()
    }

    /// Whether the tile server may be contacted.
    pub fn server_enabled(&self) -> bool {
        self.breaker().is_enabled()
    }

    /// Applies new cache settings.
    ///
    /// If the cache directory did not change, the open store is kept and only its budget is
    /// updated. On failure, caching is disabled and the error is returned.
    pub fn configure(&self, settings: CacheSettings) -> Result<(), ConfigError> {
        let current = self.snapshot();

        let result = settings.validate().and_then(|()| {
            if !settings.enabled() {
                return Ok(None);
            }
            match current.store() {
                Some(store) if store.root() == settings.dir() => {
                    store.set_budget(settings.max_size());
                    Ok(Some(store.clone()))
                }
                _ => Ok(Some(Arc::new(CacheStore::open(
                    settings.dir(),
                    settings.max_size(),
                )?))),
            }
        });

        let (settings, store, result) = match result {
            Ok(store) => (settings, store, Ok(())),
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    dir = %settings.dir().display(),
                    "Failed to configure cache, caching is disabled",
                );
                let mut settings = settings;
                settings.set_enabled(false);
                (settings, None, Err(err))
            }
        };

        // Wait for running writes, so that they all end up in the old store.
        let _gate = self
            .write_gate
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(
            generation,
            enabled = settings.enabled(),
            dir = %settings.dir().display(),
            max_size = settings.max_size(),
            "Configured cache",
        );
        *self.state.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(CacheSnapshot {
            generation,
            settings,
            store,
        });
        self.degraded.store(false, Ordering::Release);

        result
    }

    /// Returns the currently active configuration.
    pub fn snapshot(&self) -> Arc<CacheSnapshot> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The current settings.
    pub fn settings(&self) -> CacheSettings {
        self.snapshot().settings.clone()
    }

    /// Whether `snapshot` is still the active configuration.
    pub fn is_current(&self, snapshot: &CacheSnapshot) -> bool {
        snapshot.generation == self.generation.load(Ordering::Acquire)
    }

    /// Whether the cache was bypassed after a storage failure.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// The store of `snapshot`, unless the cache is degraded.
    pub fn usable_store<'a>(&self, snapshot: &'a CacheSnapshot) -> Option<&'a Arc<CacheStore>> {
        if self.is_degraded() {
            return None;
        }
        snapshot.store()
    }

    /// Opens the cached copy of `key`.
    pub fn lookup(&self, snapshot: &CacheSnapshot, key: &ResourceKey) -> Option<CacheReader> {
        self.usable_store(snapshot)?.get(key)
    }

    /// Removes `key` from the store of `snapshot`.
    pub fn invalidate(&self, snapshot: &CacheSnapshot, key: &ResourceKey) {
        if let Some(store) = snapshot.store()
            && let Err(e) = store.delete(key)
        {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                %key,
                "Failed to delete cache entry",
            );
        }
    }

    /// Writes `data` into the store of `snapshot`.
    ///
    /// Nothing is written if the configuration changed since `snapshot` was taken, if the
    /// cache is degraded, or while the cache is being cleared. Returns whether the data was
    /// written.
    pub fn commit(
        &self,
        snapshot: &CacheSnapshot,
        key: &ResourceKey,
        data: &[u8],
        last_modified: Option<SystemTime>,
    ) -> bool {
        let Some(store) = snapshot.store() else {
            return false;
        };

        let _gate = self.write_gate.read().unwrap_or_else(PoisonError::into_inner);
        if !self.is_current(snapshot) {
            tracing::debug!(%key, "Cache configuration changed, not storing");
            return false;
        }
        if self.is_degraded() {
            tracing::debug!(%key, "Cache is degraded, not storing");
            return false;
        }

        match store.put(key, data, last_modified) {
            Ok(_) => true,
            Err(err) if err.is_storage_failure() => {
                if !self.degraded.swap(true, Ordering::AcqRel) {
                    tracing::warn!(
                        error = &err as &dyn std::error::Error,
                        "Cache storage failed, continuing without cache",
                    );
                    metric!(counter("caches.degraded") += 1);
                }
                false
            }
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    %key,
                    "Failed to store cache entry",
                );
                false
            }
        }
    }

    /// Downloads `key`, decodes it and writes it into the store.
    ///
    /// Data that fails decoding is not stored.
    pub async fn fetch_and_store<T, F>(
        &self,
        snapshot: &CacheSnapshot,
        key: &ResourceKey,
        if_modified_since: Option<SystemTime>,
        decode: F,
    ) -> Result<Fetched<T>, CacheError>
    where
        F: FnOnce(&Bytes) -> Result<T, CacheError>,
    {
        match self.downloader.fetch(key.url(), if_modified_since).await? {
            FetchResponse::NotModified => Ok(Fetched::NotModified),
            FetchResponse::Fresh {
                data,
                last_modified,
            } => {
                let payload = decode(&data)?;
                self.commit(snapshot, key, &data, last_modified);
                Ok(Fetched::Fresh {
                    payload,
                    last_modified,
                })
            }
        }
    }

    /// Returns the contents of `url`, preferring up-to-date data.
    ///
    /// A cached copy is revalidated with the server. If the server is disabled or cannot be
    /// reached, the cached copy is returned as is.
    pub async fn get_input_stream(
        self: &Arc<Self>,
        url: &Url,
    ) -> Result<ResourceStream, CacheError> {
        let key = ResourceKey::from_url(url);
        let snapshot = self.snapshot();
        let cached = self.lookup(&snapshot, &key);

        if !self.server_enabled() {
            return cached
                .map(ResourceStream::Cached)
                .ok_or(CacheError::ServerDisabled);
        }

        let if_modified_since = cached.as_ref().map(|r| r.metadata().revalidation_time());
        let manager = self.clone();
        let fetch_key = key.clone();
        let fetch = self
            .streams
            .run((key.clone(), if_modified_since), move || async move {
                manager
                    .fetch_and_store(&snapshot, &fetch_key, if_modified_since, |data| {
                        Ok(data.clone())
                    })
                    .await
            });

        match (fetch.await, cached) {
            (Ok(Fetched::Fresh { payload, .. }), _) => {
                Ok(ResourceStream::Fresh(Cursor::new(payload)))
            }
            (Ok(Fetched::NotModified), Some(cached)) => Ok(ResourceStream::Cached(cached)),
            (Ok(Fetched::NotModified), None) => Err(CacheError::InternalError),
            (Err(err), Some(cached)) => {
                tracing::debug!(%key, error = &err as &dyn std::error::Error, "Using cached copy");
                Ok(ResourceStream::Cached(cached))
            }
            (Err(err), None) => Err(err),
        }
    }

    /// Removes the cached copy of `url`.
    pub fn delete_file(&self, url: &Url) -> Result<(), StoreError> {
        match self.snapshot().store() {
            Some(store) => store.delete(&ResourceKey::from_url(url)),
            None => Ok(()),
        }
    }

    /// Removes all cached data.
    ///
    /// Writes are paused until the cache is cleared.
    pub fn clear(&self) -> Result<(), StoreError> {
        let _gate = self
            .write_gate
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match self.snapshot().store() {
            Some(store) => store.clear_all(),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> CacheStats {
        let snapshot = self.snapshot();
        let store = snapshot.store();
        CacheStats {
            dir: snapshot.settings.dir().to_owned(),
            enabled: store.is_some(),
            degraded: self.is_degraded(),
            entries: store.map_or(0, |s| s.len()),
            resident_bytes: store.map_or(0, |s| s.resident_size()),
            budget: store.map_or(0, |s| s.budget()),
        }
    }
}

/// Implemented by everything that carries a [`CacheManager`].
pub trait HasCacheManager {
    fn cache_manager(&self) -> &Arc<CacheManager>;
}

impl HasCacheManager for Arc<CacheManager> {
    fn cache_manager(&self) -> &Arc<CacheManager> {
        self
    }
}
