use std::io;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

/// An error that happens when fetching a resource from a remote server.
///
/// Every variant except [`InternalError`](Self::InternalError) describes the outcome of talking
/// to the server, and tile loaders map each of them to a tile state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The resource does not exist on the server.
    ///
    /// This is a permanent condition for the lifetime of a session.
    #[error("not found")]
    NotFound,
    /// The resource could not be fetched within the configured time.
    #[error("download timed out after {0:?}")]
    Timeout(Duration),
    /// The resource could not be fetched due to a transient problem,
    /// like connection loss, DNS resolution, or a 5xx server response.
    ///
    /// The attached string contains the remote server's response.
    #[error("download failed: {0}")]
    DownloadError(String),
    /// The server answered with a status code that is neither success nor a known failure.
    #[error("unexpected status code {0}")]
    UnexpectedStatus(u16),
    /// The resource was fetched successfully, but could not be decoded.
    #[error("malformed: {0}")]
    Malformed(String),
    /// The server has been flagged as disabled and no request was made.
    #[error("server is disabled")]
    ServerDisabled,
    /// An unexpected error in the pipeline itself.
    #[error("internal error")]
    InternalError,
}

impl From<io::Error> for CacheError {
    #[track_caller]
    fn from(err: io::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl From<serde_json::Error> for CacheError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}

impl CacheError {
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// Whether the failure may go away when the same request is retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::DownloadError(_))
    }

    /// A short, stable name of the variant, used as metric tag.
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::NotFound => "notfound",
            Self::Timeout(_) => "timeout",
            Self::DownloadError(_) => "downloaderror",
            Self::UnexpectedStatus(_) => "unexpectedstatus",
            Self::Malformed(_) => "malformed",
            Self::ServerDisabled => "serverdisabled",
            Self::InternalError => "internalerror",
        }
    }
}

/// A failure of the on-disk [`CacheStore`](super::CacheStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The device holding the cache directory ran out of space.
    #[error("no space left for cache file `{0}`")]
    DiskFull(String),
    /// The cache directory or one of its files is not writable.
    #[error("permission denied for cache file `{0}`")]
    PermissionDenied(String),
    /// The derived cache path exceeds what the file system supports.
    #[error("cache path too long: `{0}`")]
    PathTooLong(String),
    /// Fewer bytes ended up in the file than were read from the source.
    #[error("incomplete cache write: expected {expected} bytes, got {written}")]
    Incomplete { expected: u64, written: u64 },
    /// Any other I/O failure.
    #[error("cache i/o failure at `{path}`")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    /// Classifies an [`io::Error`] that happened while operating on `path`.
    pub fn from_io(source: io::Error, path: &Path) -> Self {
        let path = path.display().to_string();
        match source.kind() {
            io::ErrorKind::StorageFull => Self::DiskFull(path),
            io::ErrorKind::PermissionDenied
            | io::ErrorKind::ReadOnlyFilesystem
            | io::ErrorKind::NotADirectory => Self::PermissionDenied(path),
            io::ErrorKind::InvalidFilename => Self::PathTooLong(path),
            _ => Self::Io { path, source },
        }
    }

    /// Whether this failure means the cache location cannot be written to for the rest of
    /// the session.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            Self::DiskFull(_) | Self::PermissionDenied(_) | Self::PathTooLong(_)
        )
    }
}

/// Extension to attach a path to [`io::Result`]s inside the store.
pub(crate) trait IoResultExt<T> {
    fn at(self, path: &Path) -> Result<T, StoreError>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, path: &Path) -> Result<T, StoreError> {
        self.map_err(|e| StoreError::from_io(e, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(CacheError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(CacheError::DownloadError("503 Service Unavailable".into()).is_transient());
        assert!(!CacheError::NotFound.is_transient());
        assert!(!CacheError::UnexpectedStatus(418).is_transient());
        assert!(!CacheError::ServerDisabled.is_transient());
    }

    #[test]
    fn test_storage_failures() {
        let path = Path::new("/cache/files/x");
        let full = StoreError::from_io(io::ErrorKind::StorageFull.into(), path);
        assert!(matches!(full, StoreError::DiskFull(_)));
        assert!(full.is_storage_failure());

        let denied = StoreError::from_io(io::ErrorKind::PermissionDenied.into(), path);
        assert!(denied.is_storage_failure());

        let blocked = StoreError::from_io(io::ErrorKind::NotADirectory.into(), path);
        assert!(matches!(blocked, StoreError::PermissionDenied(_)));

        let other = StoreError::from_io(io::ErrorKind::UnexpectedEof.into(), path);
        assert!(!other.is_storage_failure());
    }
}
