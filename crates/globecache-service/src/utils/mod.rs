pub mod coalesce;
pub mod compression;
pub mod http;
