//! Tiles of the global pyramid and their background loading.
//!
//! A [`TileSource`] maps a [`TileId`] to the remote resource holding its data, a
//! [`TileDecoder`] turns the downloaded bytes into a payload, and the [`TileLoader`] drives
//! each [`Tile`] through its [`TileState`]s using a pool of worker tasks.
//!
//! ### Metrics
//!
//! - `tiles.delivered`: Deliveries to the consumer, tagged with `kind` and `result`.
//! - `tiles.retry`: Loads that failed transiently and will be retried.
//! - `tiles.revalidated`: Cached tiles checked with the server, tagged with `modified`.
//! - `tiles.corrupt`: Cached tiles that failed to decode.
//! - `tiles.dropped`: Requests dropped because the queue was full.

mod decode;
mod id;
mod loader;
mod queue;
mod source;
mod state;

pub use decode::{
    DdsTexture, ElevationDecoder, ElevationGrid, TextureDecoder, TextureImage, TileDecoder,
};
pub use id::{GeoRect, MAX_LEVEL, ROOT_SPAN, TileBounds, TileId};
pub use loader::{
    DeliveryReceiver, ElevationLoader, LoaderOptions, REVALIDATE_PRIORITY, TextureLoader,
    TileLoader,
};
pub use queue::{LoadMode, LoadRequest, RequestQueue};
pub use source::{PyramidSource, TileSource, WmsLayer, WmsSource};
pub use state::{InvalidTransition, Tile, TileDelivery, TileOutcome, TileState};
