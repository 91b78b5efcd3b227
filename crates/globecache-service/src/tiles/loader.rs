use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::caching::{
    CacheError, CacheManager, CacheSnapshot, Fetched, HasCacheManager, ResourceKey,
};
use crate::config::{Config, LoaderConfig};
use crate::utils::coalesce::Coalescer;

use super::decode::{ElevationDecoder, TextureDecoder, TileDecoder};
use super::id::TileId;
use super::queue::{LoadMode, LoadRequest, RequestQueue};
use super::source::TileSource;
use super::state::{Tile, TileDelivery, TileOutcome, TileState};

/// The priority of revalidation requests, below every regular request.
pub const REVALIDATE_PRIORITY: i32 = i32::MIN;

/// Settings of a [`TileLoader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderOptions {
    pub workers: usize,
    pub max_pending: usize,
    pub revalidate: bool,
    pub retry_delay: Duration,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self::new(LoaderConfig::default(), Duration::from_secs(2))
    }
}

impl LoaderOptions {
    pub fn new(config: LoaderConfig, retry_delay: Duration) -> Self {
        Self {
            workers: config.workers.max(1),
            max_pending: config.max_pending,
            revalidate: config.revalidate,
            retry_delay,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.loaders, config.retry_delay)
    }
}

/// The receiving end of the deliveries of a [`TileLoader`].
pub type DeliveryReceiver<P> = mpsc::UnboundedReceiver<TileDelivery<P>>;

pub type ElevationLoader = TileLoader<ElevationDecoder>;
pub type TextureLoader = TileLoader<TextureDecoder>;

/// Loads tiles in the background, from the disk cache or the tile server.
///
/// Requests are handled by a fixed pool of worker tasks, and every finished load is delivered on
/// the channel returned by [`TileLoader::new`], whether it succeeded or not. Cancelled requests
/// are not delivered.
///
/// Requests for tiles that resolve to the same resource share a single download.
#[derive(Debug)]
pub struct TileLoader<D: TileDecoder> {
    shared: Arc<LoaderShared<D>>,
}

#[derive(Debug)]
struct LoaderShared<D: TileDecoder> {
    manager: Arc<CacheManager>,
    source: Arc<dyn TileSource>,
    decoder: D,
    queue: RequestQueue<D::Payload>,
    fetches: Coalescer<(ResourceKey, Option<SystemTime>), Fetched<Arc<D::Payload>>>,
    deliveries: mpsc::UnboundedSender<TileDelivery<D::Payload>>,
    options: LoaderOptions,
    shutdown: CancellationToken,
}

impl<D: TileDecoder> TileLoader<D> {
    /// Creates a loader and spawns its workers on the current tokio runtime.
    pub fn new(
        manager: Arc<CacheManager>,
        source: Arc<dyn TileSource>,
        decoder: D,
        options: LoaderOptions,
    ) -> (Self, DeliveryReceiver<D::Payload>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(LoaderShared {
            manager,
            source,
            decoder,
            queue: RequestQueue::new(options.max_pending),
            fetches: Coalescer::default(),
            deliveries: sender,
            options,
            shutdown: CancellationToken::new(),
        });

        for _ in 0..options.workers {
            tokio::spawn(run_worker(shared.clone()));
        }
        tracing::debug!(kind = D::KIND, workers = options.workers, "Started tile loader");

        (Self { shared }, receiver)
    }

    pub fn source(&self) -> &Arc<dyn TileSource> {
        &self.shared.source
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.shared.options
    }

    /// Creates an unloaded tile sized for this loader's source.
    pub fn new_tile(&self, id: TileId) -> Arc<Tile<D::Payload>> {
        Arc::new(Tile::new(id, self.shared.source.tile_size()))
    }

    /// Queues `tile` for loading.
    ///
    /// Only unloaded and aborted tiles are queued, for all other tiles this returns `false`.
    pub fn request(&self, tile: &Arc<Tile<D::Payload>>, priority: i32) -> bool {
        if self.shared.shutdown.is_cancelled() || !tile.begin_loading() {
            return false;
        }
        self.shared
            .enqueue(LoadRequest::new(tile.clone(), priority, LoadMode::Load));
        true
    }

    /// Removes the pending request of `tile`.
    ///
    /// Returns `false` if there is none, e.g. because a worker already claimed it. Such requests
    /// run to completion.
    pub fn cancel(&self, tile: &Arc<Tile<D::Payload>>) -> bool {
        match self.shared.queue.remove(tile) {
            Some(request) => {
                self.shared.discard(request, false);
                true
            }
            None => false,
        }
    }

    /// The number of requests waiting for a worker.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Stops all workers and discards pending requests.
    pub fn shutdown(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        self.shared.shutdown.cancel();
        let discarded = self.shared.queue.drain();
        tracing::debug!(
            kind = D::KIND,
            discarded = discarded.len(),
            "Shut down tile loader"
        );
        for request in discarded {
            self.shared.discard(request, false);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }
}

impl<D: TileDecoder> Drop for TileLoader<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl<D: TileDecoder> HasCacheManager for TileLoader<D> {
    fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.shared.manager
    }
}

async fn run_worker<D: TileDecoder>(shared: Arc<LoaderShared<D>>) {
    let shutdown = shared.shutdown.clone();
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            request = shared.queue.pop() => match request.mode {
                LoadMode::Load => shared.load(request).await,
                LoadMode::Revalidate => shared.revalidate(request).await,
            },
        }
    }
}

impl<D: TileDecoder> LoaderShared<D> {
    fn enqueue(&self, request: LoadRequest<D::Payload>) {
        if let Some(dropped) = self.queue.push(request) {
            tracing::debug!(tile = %dropped.tile.id(), "Request queue is full, dropping request");
            metric!(counter("tiles.dropped") += 1, "kind" => D::KIND);
            self.discard(dropped, true);
        }
    }

    /// Puts the tile of a request that will not be processed back into a settled state.
    fn discard(&self, request: LoadRequest<D::Payload>, deliver: bool) {
        match request.mode {
            LoadMode::Load if deliver => self.finish(&request.tile, TileOutcome::Aborted),
            LoadMode::Load => {
                let _ = request.tile.transition(TileState::Aborted);
            }
            LoadMode::Revalidate => self.settle(&request.tile),
        }
    }

    async fn load(self: &Arc<Self>, request: LoadRequest<D::Payload>) {
        let tile = &request.tile;
        let Some(resource) = self.source.resolve(tile.id(), tile.pixel_size()) else {
            tracing::trace!(tile = %tile.id(), "No data at this resolution");
            return self.finish(tile, TileOutcome::OutsideOfResolution);
        };
        let key = ResourceKey::from_request(&resource);
        let snapshot = self.manager.snapshot();

        if let Some((payload, last_modified)) = self.read_cached(&snapshot, &key) {
            let revalidate = self.options.revalidate && self.manager.server_enabled();
            let state = if revalidate {
                TileState::Stale
            } else {
                TileState::Loaded
            };
            if self.complete(tile, state, payload, Some(last_modified)) && revalidate {
                self.enqueue(LoadRequest::new(
                    tile.clone(),
                    REVALIDATE_PRIORITY,
                    LoadMode::Revalidate,
                ));
            }
            return;
        }

        if !self.manager.server_enabled() {
            tracing::trace!(tile = %tile.id(), "Tile server is disabled");
            return self.finish(tile, TileOutcome::Aborted);
        }

        // A `304` can only be answered from the cache.
        let if_modified_since = tile
            .last_modified()
            .filter(|_| self.manager.usable_store(&snapshot).is_some());

        match self.fetch(snapshot, key.clone(), if_modified_since).await {
            Ok(Fetched::Fresh {
                payload,
                last_modified,
            }) => {
                self.complete(tile, TileState::Loaded, payload, last_modified);
            }
            Ok(Fetched::NotModified) => {
                match self.read_cached(&self.manager.snapshot(), &key) {
                    Some((payload, last_modified)) => {
                        self.complete(tile, TileState::Loaded, payload, Some(last_modified));
                    }
                    None => {
                        tracing::debug!(tile = %tile.id(), "Tile not modified, but not cached");
                        // the retry asks for the full tile
                        tile.forget_last_modified();
                        self.finish(tile, TileOutcome::Aborted);
                        self.schedule_retry(&request);
                    }
                }
            }
            Err(CacheError::NotFound) => self.finish(tile, TileOutcome::OutsideOfResolution),
            Err(err) if err.is_transient() => {
                tracing::debug!(
                    tile = %tile.id(),
                    error = &err as &dyn std::error::Error,
                    "Failed to load tile, retrying",
                );
                self.finish(tile, TileOutcome::Aborted);
                self.schedule_retry(&request);
            }
            Err(err) => {
                tracing::warn!(
                    tile = %tile.id(),
                    %key,
                    error = &err as &dyn std::error::Error,
                    "Failed to load tile",
                );
                self.finish(tile, TileOutcome::Aborted);
            }
        }
    }

    /// Checks the payload of a tile served from the cache with the server.
    async fn revalidate(self: &Arc<Self>, request: LoadRequest<D::Payload>) {
        let tile = &request.tile;
        if tile.state() != TileState::Stale {
            return;
        }
        let resource = self.source.resolve(tile.id(), tile.pixel_size());
        let Some(resource) = resource.filter(|_| self.manager.server_enabled()) else {
            return self.settle(tile);
        };
        let key = ResourceKey::from_request(&resource);
        let snapshot = self.manager.snapshot();

        match self
            .fetch(snapshot.clone(), key.clone(), tile.last_modified())
            .await
        {
            Ok(Fetched::NotModified) => {
                metric!(
                    counter("tiles.revalidated") += 1,
                    "kind" => D::KIND,
                    "modified" => "false",
                );
                self.settle(tile);
            }
            Ok(Fetched::Fresh {
                payload,
                last_modified,
            }) => {
                metric!(counter("tiles.revalidated") += 1, "kind" => D::KIND, "modified" => "true");
                self.complete(tile, TileState::Loaded, payload, last_modified);
            }
            Err(CacheError::NotFound) => {
                self.manager.invalidate(&snapshot, &key);
                self.finish(tile, TileOutcome::OutsideOfResolution);
            }
            Err(err) => {
                tracing::debug!(
                    tile = %tile.id(),
                    error = &err as &dyn std::error::Error,
                    "Failed to revalidate tile, keeping cached data",
                );
                self.settle(tile);
            }
        }
    }

    /// Downloads `key`, sharing the download with every concurrent request for the same key.
    async fn fetch(
        self: &Arc<Self>,
        snapshot: Arc<CacheSnapshot>,
        key: ResourceKey,
        if_modified_since: Option<SystemTime>,
    ) -> Result<Fetched<Arc<D::Payload>>, CacheError> {
        let shared = self.clone();
        let coalesce_key = (key.clone(), if_modified_since);
        self.fetches
            .run(coalesce_key, move || async move {
                shared
                    .manager
                    .fetch_and_store(&snapshot, &key, if_modified_since, |data| {
                        shared.decoder.decode(data).map(Arc::new)
                    })
                    .await
            })
            .await
    }

    /// Reads and decodes the cached copy of `key`.
    ///
    /// A cached copy that fails to decode is removed from the cache.
    fn read_cached(
        &self,
        snapshot: &CacheSnapshot,
        key: &ResourceKey,
    ) -> Option<(Arc<D::Payload>, SystemTime)> {
        let mut reader = self.manager.lookup(snapshot, key)?;
        let last_modified = reader.metadata().revalidation_time();

        let mut data = Vec::with_capacity(reader.len() as usize);
        let decoded = reader
            .read_to_end(&mut data)
            .map_err(CacheError::from)
            .and_then(|_| self.decoder.decode(&data));
        drop(reader);

        match decoded {
            Ok(payload) => Some((Arc::new(payload), last_modified)),
            Err(err) => {
                tracing::warn!(
                    %key,
                    error = &err as &dyn std::error::Error,
                    "Discarding corrupt cache entry",
                );
                metric!(counter("tiles.corrupt") += 1, "kind" => D::KIND);
                self.manager.invalidate(snapshot, key);
                None
            }
        }
    }

    /// Queues the request again after the retry delay, unless the server was disabled by then.
    fn schedule_retry(self: &Arc<Self>, request: &LoadRequest<D::Payload>) {
        if !self.manager.server_enabled() {
            return;
        }
        metric!(counter("tiles.retry") += 1, "kind" => D::KIND);

        let shared = Arc::downgrade(self);
        let tile = Arc::downgrade(&request.tile);
        let priority = request.priority;
        let delay = self.options.retry_delay;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            // Tiles the consumer has let go of in the meantime are not retried.
            let (Some(shared), Some(tile)) = (shared.upgrade(), tile.upgrade()) else {
                return;
            };
            if shared.manager.server_enabled() && tile.begin_loading() {
                shared.enqueue(LoadRequest::new(tile, priority, LoadMode::Load));
            }
        });
    }

    fn complete(
        &self,
        tile: &Arc<Tile<D::Payload>>,
        state: TileState,
        payload: Arc<D::Payload>,
        last_modified: Option<SystemTime>,
    ) -> bool {
        if tile
            .complete(state, payload.clone(), last_modified)
            .is_err()
        {
            return false;
        }
        let result = if state == TileState::Stale {
            "stale"
        } else {
            "loaded"
        };
        self.deliver(tile, Ok(payload), result);
        true
    }

    fn finish(&self, tile: &Arc<Tile<D::Payload>>, outcome: TileOutcome) {
        let (state, result) = match outcome {
            TileOutcome::OutsideOfResolution => (TileState::OutsideOfResolution, "outside"),
            TileOutcome::Aborted => (TileState::Aborted, "aborted"),
        };
        if tile.transition(state).is_ok() {
            self.deliver(tile, Err(outcome), result);
        }
    }

    /// Ends the revalidation of a stale tile, keeping its payload.
    fn settle(&self, tile: &Tile<D::Payload>) {
        let _ = tile.transition(TileState::Loaded);
    }

    fn deliver(
        &self,
        tile: &Arc<Tile<D::Payload>>,
        result: Result<Arc<D::Payload>, TileOutcome>,
        tag: &str,
    ) {
        metric!(counter("tiles.delivered") += 1, "kind" => D::KIND, "result" => tag);
        // The consumer may have gone away already.
        let _ = self.deliveries.send(TileDelivery {
            tile: tile.clone(),
            result,
        });
    }
}
