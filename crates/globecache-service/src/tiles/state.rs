use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use thiserror::Error;

use super::id::TileId;

/// The load state of a [`Tile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileState {
    /// Nothing has been requested yet, or the payload was dropped again.
    Unloaded,
    /// A load request is queued or running.
    Loading,
    /// The payload is available.
    Loaded,
    /// The payload was served from disk and is being revalidated with the server.
    Stale,
    /// The server has no data for this tile. This is final.
    OutsideOfResolution,
    /// Loading failed. The tile may be requested again.
    Aborted,
}

impl TileState {
    /// Whether the tile has a payload that can be displayed.
    pub fn is_displayable(self) -> bool {
        matches!(self, Self::Loaded | Self::Stale)
    }

    /// Whether the state machine allows moving from `self` to `to`.
    pub fn can_transition(self, to: Self) -> bool {
        use TileState::*;
        matches!(
            (self, to),
            (Unloaded | Aborted, Loading)
                | (Loading, Loaded | Stale | OutsideOfResolution | Aborted)
                | (Stale, Loaded | OutsideOfResolution)
                | (Loaded | Stale, Unloaded)
        )
    }
}

impl fmt::Display for TileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid transition of tile {tile} from {from} to {to}")]
pub struct InvalidTransition {
    pub tile: TileId,
    pub from: TileState,
    pub to: TileState,
}

/// Why a tile did not get a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileOutcome {
    /// The server has no data for this tile.
    OutsideOfResolution,
    /// Loading failed, possibly only for now.
    Aborted,
}

/// The result of a load, as handed to the consumer.
#[derive(Debug)]
pub struct TileDelivery<P> {
    pub tile: Arc<Tile<P>>,
    pub result: Result<Arc<P>, TileOutcome>,
}

impl<P> Clone for TileDelivery<P> {
    fn clone(&self) -> Self {
        Self {
            tile: self.tile.clone(),
            result: self.result.clone(),
        }
    }
}

#[derive(Debug)]
struct TileInner<P> {
    state: TileState,
    payload: Option<Arc<P>>,
    last_modified: Option<SystemTime>,
}

/// A loadable node of the tile pyramid.
///
/// All state changes happen under the tile's own lock, and only along the edges allowed by
/// [`TileState::can_transition`].
#[derive(Debug)]
pub struct Tile<P> {
    id: TileId,
    pixel_size: f64,
    inner: Mutex<TileInner<P>>,
}

impl<P> Tile<P> {
    /// Creates an unloaded tile with `tile_size` pixels in each direction.
    pub fn new(id: TileId, tile_size: u32) -> Self {
        Self {
            id,
            pixel_size: id.pixel_size(tile_size),
            inner: Mutex::new(TileInner {
                state: TileState::Unloaded,
                payload: None,
                last_modified: None,
            }),
        }
    }

    pub fn id(&self) -> TileId {
        self.id
    }

    /// The size of a texel of this tile in degrees.
    pub fn pixel_size(&self) -> f64 {
        self.pixel_size
    }

    fn lock(&self) -> MutexGuard<'_, TileInner<P>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> TileState {
        self.lock().state
    }

    pub fn payload(&self) -> Option<Arc<P>> {
        self.lock().payload.clone()
    }

    /// The `Last-Modified` time of the payload.
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.lock().last_modified
    }

    /// Moves the tile to `to`, returning the previous state.
    ///
    /// Moving to a state without payload drops the current payload.
    pub fn transition(&self, to: TileState) -> Result<TileState, InvalidTransition> {
        let mut inner = self.lock();
        let from = self.transition_locked(&mut inner, to)?;
        if !to.is_displayable() {
            inner.payload = None;
        }
        Ok(from)
    }

    fn transition_locked(
        &self,
        inner: &mut TileInner<P>,
        to: TileState,
    ) -> Result<TileState, InvalidTransition> {
        let from = inner.state;
        if !from.can_transition(to) {
            let err = InvalidTransition {
                tile: self.id,
                from,
                to,
            };
            tracing::debug!(error = &err as &dyn std::error::Error, "Rejected tile transition");
            return Err(err);
        }
        inner.state = to;
        Ok(from)
    }

    /// Starts loading an unloaded or aborted tile.
    pub(crate) fn begin_loading(&self) -> bool {
        let mut inner = self.lock();
        if !matches!(inner.state, TileState::Unloaded | TileState::Aborted) {
            return false;
        }
        self.transition_locked(&mut inner, TileState::Loading).is_ok()
    }

    /// Stores `payload` and moves the tile to `state`, which is either `Loaded` or `Stale`.
    pub(crate) fn complete(
        &self,
        state: TileState,
        payload: Arc<P>,
        last_modified: Option<SystemTime>,
    ) -> Result<(), InvalidTransition> {
        debug_assert!(state.is_displayable());
        let mut inner = self.lock();
        self.transition_locked(&mut inner, state)?;
        inner.payload = Some(payload);
        inner.last_modified = last_modified;
        Ok(())
    }

    pub(crate) fn forget_last_modified(&self) {
        self.lock().last_modified = None;
    }

    /// Drops the payload of a displayable tile, so it can be loaded again later.
    pub fn unload(&self) -> bool {
        let mut inner = self.lock();
        if !inner.state.is_displayable() {
            return false;
        }
        let unloaded = self.transition_locked(&mut inner, TileState::Unloaded).is_ok();
        inner.payload = None;
        unloaded
    }
}
