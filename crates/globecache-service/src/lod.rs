//! The consumer side of a [`TileLoader`].
//!
//! A [`LodSurface`] keeps the set of tiles a view needs resident. It is updated once per frame
//! and never waits for the loader: finished loads are picked up on the next update.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::tiles::{
    DeliveryReceiver, GeoRect, MAX_LEVEL, Tile, TileDecoder, TileId, TileLoader, TileState,
};

/// Describes what a view needs from the surface.
pub trait ViewCriteria {
    /// Whether any part of `bounds` is visible.
    fn is_visible(&self, bounds: &GeoRect) -> bool;

    /// The pixel size in degrees needed to display `bounds` at full detail.
    fn target_pixel_size(&self, bounds: &GeoRect) -> f64;

    /// The priority of the load request for `tile`.
    ///
    /// Coarser tiles come first by default, so there is something to show early.
    fn priority(&self, tile: TileId) -> i32 {
        i32::from(MAX_LEVEL) - i32::from(tile.level())
    }
}

/// A view of a rectangular region at a fixed resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectView {
    pub rect: GeoRect,
    pub pixel_size: f64,
}

impl RectView {
    /// A view of the whole globe.
    pub fn globe(pixel_size: f64) -> Self {
        Self {
            rect: GeoRect {
                west: -180.0,
                south: -90.0,
                east: 180.0,
                north: 90.0,
            },
            pixel_size,
        }
    }
}

impl ViewCriteria for RectView {
    fn is_visible(&self, bounds: &GeoRect) -> bool {
        self.rect.intersects(bounds)
    }

    fn target_pixel_size(&self, _bounds: &GeoRect) -> f64 {
        self.pixel_size
    }
}

/// What happened during one [`LodSurface::update`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SurfaceStats {
    /// Deliveries received.
    pub delivered: usize,
    /// Deliveries for tiles that had already left the working set.
    pub ignored: usize,
    /// Tiles the view needs.
    pub wanted: usize,
    /// Load requests issued.
    pub requested: usize,
    /// Wanted tiles that can be displayed.
    pub displayable: usize,
    /// Tiles that left the working set.
    pub dropped: usize,
}

/// Keeps the tiles needed by a view resident.
#[derive(Debug)]
pub struct LodSurface<D: TileDecoder> {
    loader: TileLoader<D>,
    deliveries: DeliveryReceiver<D::Payload>,
    tiles: HashMap<TileId, Arc<Tile<D::Payload>>>,
    max_level: u8,
}

impl<D: TileDecoder> LodSurface<D> {
    pub fn new(loader: TileLoader<D>, deliveries: DeliveryReceiver<D::Payload>) -> Self {
        Self {
            loader,
            deliveries,
            tiles: HashMap::new(),
            max_level: MAX_LEVEL,
        }
    }

    /// Limits refinement to tiles up to `level`.
    pub fn with_max_level(mut self, level: u8) -> Self {
        self.max_level = level.min(MAX_LEVEL);
        self
    }

    pub fn loader(&self) -> &TileLoader<D> {
        &self.loader
    }

    /// Updates the working set for `view`.
    ///
    /// Visible tiles are requested, starting at the roots. A tile is refined into its children
    /// once it can be displayed and is too coarse for the view. Tiles that are no longer needed
    /// are cancelled and unloaded.
    pub fn update(&mut self, view: &impl ViewCriteria) -> SurfaceStats {
        let mut stats = SurfaceStats::default();

        while let Ok(delivery) = self.deliveries.try_recv() {
            stats.delivered += 1;
            let current = self
                .tiles
                .get(&delivery.tile.id())
                .is_some_and(|tile| Arc::ptr_eq(tile, &delivery.tile));
            if !current {
                stats.ignored += 1;
            }
        }

        let mut wanted = HashSet::new();
        let mut stack = Vec::from(TileId::roots());
        while let Some(id) = stack.pop() {
            let bounds = id.bounds().to_degrees();
            if !view.is_visible(&bounds) {
                continue;
            }
            wanted.insert(id);

            let tile = self
                .tiles
                .entry(id)
                .or_insert_with(|| self.loader.new_tile(id))
                .clone();
            let state = tile.state();
            if state == TileState::Unloaded && self.loader.request(&tile, view.priority(id)) {
                stats.requested += 1;
            }

            if !state.is_displayable() {
                continue;
            }
            stats.displayable += 1;
            if id.level() < self.max_level
                && view.target_pixel_size(&bounds) < tile.pixel_size()
                && let Some(children) = id.children()
            {
                stack.extend(children);
            }
        }
        stats.wanted = wanted.len();

        let loader = &self.loader;
        self.tiles.retain(|id, tile| {
            if wanted.contains(id) {
                return true;
            }
            loader.cancel(tile);
            tile.unload();
            stats.dropped += 1;
            false
        });

        stats
    }

    /// Requests all aborted tiles of the working set again.
    ///
    /// Aborted tiles are not requested by [`update`](Self::update), as the loader already
    /// retries transient failures. This is useful after the tile server was enabled again.
    pub fn retry_aborted(&self) -> usize {
        self.tiles
            .iter()
            .filter(|(_, tile)| tile.state() == TileState::Aborted)
            .filter(|(id, tile)| self.loader.request(tile, i32::from(MAX_LEVEL - id.level())))
            .count()
    }

    /// The nearest tile at or above `id` that can be displayed.
    pub fn renderable(&self, id: TileId) -> Option<&Arc<Tile<D::Payload>>> {
        let mut current = Some(id);
        while let Some(id) = current {
            if let Some(tile) = self.tiles.get(&id)
                && tile.state().is_displayable()
            {
                return Some(tile);
            }
            current = id.parent();
        }
        None
    }

    pub fn tile(&self, id: TileId) -> Option<&Arc<Tile<D::Payload>>> {
        self.tiles.get(&id)
    }

    /// The number of tiles in the working set.
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Whether no tile of the working set is waiting for the loader.
    pub fn is_settled(&self) -> bool {
        self.tiles
            .values()
            .all(|tile| tile.state() != TileState::Loading)
    }
}
