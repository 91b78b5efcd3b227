use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::state::Tile;

/// What a worker does with a claimed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadMode {
    /// Load the tile from the cache or the server.
    Load,
    /// Check a tile served from the cache with the server.
    Revalidate,
}

/// A request to load one tile, owned by the queue until a worker claims it.
#[derive(Debug)]
pub struct LoadRequest<P> {
    pub tile: Arc<Tile<P>>,
    pub priority: i32,
    pub mode: LoadMode,
    seq: u64,
}

impl<P> LoadRequest<P> {
    pub fn new(tile: Arc<Tile<P>>, priority: i32, mode: LoadMode) -> Self {
        Self {
            tile,
            priority,
            mode,
            seq: 0,
        }
    }
}

type QueueKey = (i32, u64);

/// Identifies a tile object by address, which is stable while the queue holds a reference.
fn tile_ref<P>(tile: &Arc<Tile<P>>) -> usize {
    Arc::as_ptr(tile) as usize
}

#[derive(Debug)]
struct QueueInner<P> {
    entries: BTreeMap<QueueKey, LoadRequest<P>>,
    by_tile: HashMap<usize, QueueKey>,
    next_seq: u64,
}

/// A bounded priority queue of pending tile requests.
///
/// Requests with a higher priority are claimed first, and among equal priorities the newest
/// request wins. There is at most one pending request per tile object.
#[derive(Debug)]
pub struct RequestQueue<P> {
    inner: Mutex<QueueInner<P>>,
    notify: Notify,
    capacity: usize,
}

impl<P> RequestQueue<P> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: BTreeMap::new(),
                by_tile: HashMap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `request`, replacing a pending request for the same tile.
    ///
    /// Returns the request that was pushed out to make room, which may be `request` itself if
    /// it ranks lowest.
    pub fn push(&self, mut request: LoadRequest<P>) -> Option<LoadRequest<P>> {
        let dropped = {
            let mut inner = self.lock();
            let id = tile_ref(&request.tile);
            if let Some(old_key) = inner.by_tile.remove(&id) {
                inner.entries.remove(&old_key);
            }

            request.seq = inner.next_seq;
            inner.next_seq += 1;
            let key = (request.priority, request.seq);
            inner.by_tile.insert(id, key);
            inner.entries.insert(key, request);

            if inner.entries.len() > self.capacity {
                inner.entries.pop_first().map(|(_, dropped)| {
                    inner.by_tile.remove(&tile_ref(&dropped.tile));
                    dropped
                })
            } else {
                None
            }
        };
        self.notify.notify_one();
        dropped
    }

    /// Removes the pending request for `tile`.
    pub fn remove(&self, tile: &Arc<Tile<P>>) -> Option<LoadRequest<P>> {
        let mut inner = self.lock();
        let key = inner.by_tile.remove(&tile_ref(tile))?;
        inner.entries.remove(&key)
    }

    /// Claims the highest ranking request, if any.
    pub fn try_pop(&self) -> Option<LoadRequest<P>> {
        let mut inner = self.lock();
        let (_, request) = inner.entries.pop_last()?;
        inner.by_tile.remove(&tile_ref(&request.tile));
        Some(request)
    }

    /// Waits for a request and claims it.
    pub async fn pop(&self) -> LoadRequest<P> {
        loop {
            if let Some(request) = self.try_pop() {
                return request;
            }
            self.notify.notified().await;
        }
    }

    /// Removes all pending requests.
    pub fn drain(&self) -> Vec<LoadRequest<P>> {
        let mut inner = self.lock();
        inner.by_tile.clear();
        std::mem::take(&mut inner.entries).into_values().collect()
    }

    pub fn contains(&self, tile: &Arc<Tile<P>>) -> bool {
        self.lock().by_tile.contains_key(&tile_ref(tile))
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
