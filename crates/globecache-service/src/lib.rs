//! Tile cache and asynchronous streaming pipeline for a virtual globe.
//!
//! Elevation and imagery tiles are streamed from remote servers, cached on local disk under a
//! size budget and handed to a level-of-detail surface without ever blocking its update loop.
//! See [`services::GlobeServices`] for the application root that wires everything together.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod documents;
pub mod download;
pub mod lod;
pub mod logging;
pub mod services;
pub mod tiles;
pub mod utils;
