//! Globecache.
//!
//! Command line access to the tile cache of the virtual globe. It fetches documents and tiles
//! through the same cache the viewer uses, and maintains the cache directory.

#![warn(
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cache;
mod cli;
mod fetch;
mod logging;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
