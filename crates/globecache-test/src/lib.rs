//! Test support for the tile cache: logging, temporary cache directories, a local tile server
//! and tile fixtures.
//!
//! Call [`setup`] at the start of every test, so that logs end up in the test output.
//!
//! The [`TempDir`] returned by [`tempdir`] deletes the directory when dropped. Bind it to a
//! variable that lives as long as the cache using it, e.g. `let cache_dir = test::tempdir();`.
//!
//! A [`TileServer`] stops serving when dropped. Keep it alive until the last request to it was
//! made, otherwise requests fail with connection errors.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use axum::Router;
use axum::extract::{self, OriginalUri, Request};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;
use url::Url;

pub use tempfile::TempDir;

/// Sends trace logs of the service crate to the test output.
///
/// Logs of dependencies such as hyper or reqwest are muted.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("globecache_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory, deleted along with the returned guard.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A file served by the [`TileServer`].
#[derive(Debug, Clone)]
struct ServedFile {
    data: Bytes,
    last_modified: Option<SystemTime>,
}

#[derive(Debug, Default)]
struct ServerState {
    files: Mutex<HashMap<String, ServedFile>>,
    hits: Mutex<BTreeMap<String, usize>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A tile server that binds to a random port and counts every request by URI.
///
/// Routes:
///  - `/files/*path`: the files added with [`put_file`](Self::put_file), honouring
///    `If-Modified-Since`.
///  - `/delay/:time/*path`: the same file, served after waiting for `time`.
///  - `/status/:code/*path`: an empty response with the given status code.
///  - `/wms`: a PNG for every `GetMap` request with at least one layer.
///
/// The server runs on the current tokio runtime, so it must be created within a `tokio::test`.
#[derive(Debug)]
pub struct TileServer {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    state: Arc<ServerState>,
}

impl TileServer {
    pub fn new() -> Self {
        let state = Arc::new(ServerState::default());

        let hitcounter = {
            let state = state.clone();
            move |OriginalUri(uri), req: Request, next: Next| {
                let state = state.clone();
                async move {
                    *lock(&state.hits).entry(uri.to_string()).or_default() += 1;
                    next.run(req).await
                }
            }
        };

        let files_state = state.clone();
        let delay_state = state.clone();
        let router = Router::new()
            .route(
                "/files/*path",
                get(
                    move |extract::Path(path): extract::Path<String>, headers: HeaderMap| {
                        let state = files_state.clone();
                        async move { serve_file(&state, &path, &headers) }
                    },
                ),
            )
            .route(
                "/delay/:time/*path",
                get(
                    move |extract::Path((time, path)): extract::Path<(String, String)>,
                          headers: HeaderMap| {
                        let state = delay_state.clone();
                        async move {
                            let duration = humantime::parse_duration(&time).unwrap();
                            tokio::time::sleep(duration).await;
                            serve_file(&state, &path, &headers)
                        }
                    },
                ),
            )
            .route(
                "/status/:code/*tail",
                get(
                    |extract::Path((code, _)): extract::Path<(u16, String)>| async move {
                        StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                    },
                ),
            )
            .route(
                "/wms",
                get(
                    |extract::Query(params): extract::Query<HashMap<String, String>>| async move {
                        serve_wms(&params)
                    },
                ),
            )
            .layer(middleware::from_fn(hitcounter));

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = std::net::TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            handle,
            socket,
            state,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket
    }

    pub fn port(&self) -> u16 {
        self.addr().port()
    }

    /// The URL of `path` on this server.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://127.0.0.1:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }

    /// Serves `data` under `/files/<path>`.
    pub fn put_file(&self, path: &str, data: impl Into<Bytes>, last_modified: Option<SystemTime>) {
        let file = ServedFile {
            data: data.into(),
            last_modified,
        };
        lock(&self.state.files).insert(path.trim_start_matches('/').to_owned(), file);
    }

    /// Stops serving `/files/<path>`, it responds with `404` afterwards.
    pub fn remove_file(&self, path: &str) {
        lock(&self.state.files).remove(path.trim_start_matches('/'));
    }

    /// The number of requests to `path`, including the query string.
    pub fn hits(&self, path: &str) -> usize {
        let uri = format!("/{}", path.trim_start_matches('/'));
        lock(&self.state.hits).get(&uri).copied().unwrap_or(0)
    }

    /// The number of requests since the last call, resetting the counter.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *lock(&self.state.hits));
        map.into_values().sum()
    }

    /// All requests since the last call, by URI, resetting the counter.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *lock(&self.state.hits));
        map.into_iter().collect()
    }
}

impl Default for TileServer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TileServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn serve_file(state: &ServerState, path: &str, headers: &HeaderMap) -> Response {
    let Some(file) = lock(&state.files).get(path).cloned() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let if_modified_since = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
        .map(SystemTime::from);
    if let (Some(since), Some(modified)) = (if_modified_since, file.last_modified) {
        // HTTP dates have a resolution of seconds
        if modified <= since + Duration::from_millis(999) {
            return StatusCode::NOT_MODIFIED.into_response();
        }
    }

    match file.last_modified {
        Some(modified) => (
            [(header::LAST_MODIFIED, http_date(modified))],
            file.data,
        )
            .into_response(),
        None => file.data.into_response(),
    }
}

fn serve_wms(params: &HashMap<String, String>) -> Response {
    let param = |name: &str| params.get(name).map(String::as_str).unwrap_or_default();
    if param("SERVICE") != "WMS" || param("REQUEST") != "GetMap" || param("LAYERS").is_empty() {
        return StatusCode::BAD_REQUEST.into_response();
    }
    let size = |name: &str| param(name).parse().unwrap_or(1);
    (
        [(header::CONTENT_TYPE, "image/png")],
        png_fixture(size("WIDTH"), size("HEIGHT")),
    )
        .into_response()
}

/// Formats `time` as HTTP date.
pub fn http_date(time: SystemTime) -> String {
    DateTime::<Utc>::from(time)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Returns a time with whole seconds, as it survives a round trip through an HTTP header.
pub fn http_time(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

/// Builds an elevation grid of `i16` samples, all set to `value` metres.
pub fn elevation_fixture(width: u32, height: u32, value: i16) -> Vec<u8> {
    let mut data = Vec::new();
    for field in [0x3000, width as i32, height as i32, 1000] {
        data.extend_from_slice(&field.to_be_bytes());
    }
    for _ in 0..width * height {
        data.extend_from_slice(&value.to_be_bytes());
    }
    data
}

/// Builds a DXT1 compressed DDS texture with a single mip level.
pub fn dds_fixture(width: u32, height: u32) -> Vec<u8> {
    let mut data = vec![0u8; 128];
    data[..4].copy_from_slice(b"DDS ");
    data[4..8].copy_from_slice(&124u32.to_le_bytes());
    data[12..16].copy_from_slice(&height.to_le_bytes());
    data[16..20].copy_from_slice(&width.to_le_bytes());
    data[28..32].copy_from_slice(&1u32.to_le_bytes());
    data[84..88].copy_from_slice(b"DXT1");
    // 8 bytes per 4x4 block
    let blocks = width.div_ceil(4) * height.div_ceil(4);
    data.resize(128 + blocks as usize * 8, 0x55);
    data
}

/// Builds a gzip compressed DDS texture, as served for `.dds.gz` tiles.
pub fn gz_dds_fixture(width: u32, height: u32) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&dds_fixture(width, height)).unwrap();
    encoder.finish().unwrap()
}

/// Builds a PNG of the given size.
pub fn png_fixture(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbaImage::from_fn(width, height, |x, y| {
        image::Rgba([(x % 256) as u8, (y % 256) as u8, 128, 255])
    });
    let mut data = Cursor::new(Vec::new());
    image
        .write_to(&mut data, image::ImageFormat::Png)
        .unwrap();
    data.into_inner()
}
