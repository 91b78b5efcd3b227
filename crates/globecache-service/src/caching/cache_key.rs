use std::fmt::{self, Write};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use url::Url;
use url::form_urlencoded;

/// Maximum number of bytes kept from a single path segment.
const MAX_SEGMENT_LEN: usize = 64;

/// Maximum number of directories mirrored from the URL path.
///
/// Deeper paths are still distinct, since the leaf always carries the key hash.
const MAX_DIRECTORIES: usize = 8;

/// A resolved request for a remote resource: a URL plus optional query parameters.
///
/// Parametrized requests are used by WMS-like services, where the same base URL yields
/// different resources depending on layers, styles and bounding box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub url: Url,
    pub params: Vec<(String, String)>,
}

impl ResourceRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            params: Vec::new(),
        }
    }

    pub fn with_params(url: Url, params: Vec<(String, String)>) -> Self {
        Self { url, params }
    }
}

/// The canonical identity of a remote resource.
///
/// The same key is used to deduplicate in-flight network requests and to derive the location
/// of the resource in the on-disk cache. Keys are compared by their SHA-256 hash, which is
/// computed over the canonical URL and is therefore stable across restarts.
///
/// The canonical URL only identifies the resource. Requests go to [`url`](Self::url), which
/// keeps the query exactly as the caller built it.
#[derive(Debug, Clone, Eq)]
pub struct ResourceKey {
    url: Url,
    canonical: Arc<str>,
    cache_path: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl PartialEq for ResourceKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for ResourceKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl ResourceKey {
    /// Creates the key for a plain URL.
    ///
    /// Query parameters of the URL are canonicalized the same way as explicit request
    /// parameters are.
    pub fn from_url(url: &Url) -> Self {
        Self::from_parts(url, &[])
    }

    /// Creates the key for a resolved request.
    pub fn from_request(request: &ResourceRequest) -> Self {
        Self::from_parts(&request.url, &request.params)
    }

    fn from_parts(url: &Url, params: &[(String, String)]) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params);
        }

        // Parameter order does not matter, names and values are compared as they are.
        let mut canonical_url = url.clone();
        let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        if pairs.is_empty() {
            canonical_url.set_query(None);
        } else {
            pairs.sort();
            let query = form_urlencoded::Serializer::new(String::new())
                .extend_pairs(&pairs)
                .finish();
            canonical_url.set_query(Some(&query));
        }

        let canonical = canonical_url.to_string();
        let hash = Sha256::digest(canonical.as_bytes());
        // FIXME: `sha2` should really adopt const generics, this is such a pain right now
        let hash: [u8; 32] = hash.into();
        let cache_path = build_cache_path(&canonical_url, &hash);

        Self {
            url,
            canonical: canonical.into(),
            cache_path: cache_path.into(),
            hash,
        }
    }

    /// The URL which is sent to the server.
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The canonical URL as string.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// The full key hash, hex-formatted.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Returns the relative path of this resource inside the cache directory.
    ///
    /// The path mirrors the origin of the resource, for example
    /// `tiles_example_com_8080/elevation/012/301/2_bin~0f1e2d3c4b5a6978`.
    pub fn cache_path(&self) -> &str {
        &self.cache_path
    }
}

fn build_cache_path(url: &Url, hash: &[u8; 32]) -> String {
    let mut path = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => safe_path_segment(&format!("{host}_{port}")),
        (Some(host), None) => safe_path_segment(host),
        (None, _) => safe_path_segment(url.scheme()),
    };

    let mut segments: Vec<_> = url
        .path_segments()
        .map(|s| s.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    let leaf = segments.pop().unwrap_or("index");

    for segment in segments.iter().take(MAX_DIRECTORIES) {
        path.push('/');
        path.push_str(&safe_path_segment(segment));
    }

    path.push('/');
    path.push_str(&safe_path_segment(leaf));
    path.push('~');
    for b in &hash[..8] {
        // writing into a `String` is infallible
        let _ = write!(path, "{b:02x}");
    }
    path
}

/// Protect against:
/// * ".."
/// * absolute paths
/// * ":" (not a threat on POSIX filesystems, but confuses OS X Finder)
/// * overly long names
fn safe_path_segment(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_SEGMENT_LEN));
    for c in s.chars() {
        let c = match c {
            '.' | '/' | '\\' | ':' | '~' | '*' | '?' | '"' | '<' | '>' | '|' | '%' => '_',
            c if c.is_control() => '_',
            c => c,
        };
        if out.len() + c.len_utf8() > MAX_SEGMENT_LEN {
            break;
        }
        out.push(c);
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}
