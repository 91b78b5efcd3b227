//! # Tile caching infrastructure
//!
//! Every resource fetched from a tile server ends up in a local, size-bounded disk cache, so
//! that panning back to a known region does not hit the network again.
//! This module contains the [`CacheStore`] itself, the [`ResourceKey`] that identifies remote
//! resources, our central [`CacheError`] type, and the [`CacheManager`] facade that every other
//! component goes through.
//!
//! ## Layers
//!
//! - Request coalescing: concurrent fetches of the same [`ResourceKey`] share one download.
//! - The file-system layer: the [`CacheStore`] keeps blobs under `<dir>/files`, mirroring the
//!   origin of each resource, and evicts the least recently used ones once over budget.
//! - The network: conditional requests revalidate cached copies with the server.
//!
//! ### Metrics
//!
//! - `caches.access`: All store accesses, tagged with `hit`.
//! - `caches.evicted`: Entries evicted to get back under budget.
//! - `caches.file.size`: A histogram for the size (in bytes) of written cache files.
//! - `caches.degraded`: Storage failures that disabled writing for the session.
//! - `coalesce.channel.hit` / `coalesce.channel.miss`: Deduplicated and new downloads.
//!
//! ### Configuration
//!
//! The cache is configured with [`CacheSettings`], applied through
//! [`CacheManager::configure`]. Reconfiguring takes effect for every fetch started afterwards.
//! Data of fetches that were started before is not written into a newly configured store.

mod cache_error;
mod cache_key;
mod cleanup;
mod manager;
mod metadata;
mod store;


pub use cache_error::{CacheError, StoreError};
pub use cache_key::{ResourceKey, ResourceRequest};
pub use cleanup::CleanupStats;
pub use manager::{
    CacheManager, CacheSettings, CacheSnapshot, CacheStats, ConfigError, DEFAULT_CACHE_SIZE,
    Fetched, HasCacheManager, MIN_CACHE_SIZE, ResourceStream, SIZE_CHOICES,
};
pub use metadata::Metadata;
pub use store::{CacheReader, CacheStore};
