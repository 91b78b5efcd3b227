// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod documents;
pub mod download;
pub mod loader;
pub mod lod;
pub mod manager;
pub mod utils;

pub use utils::*;
