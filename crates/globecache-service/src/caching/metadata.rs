use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// File extension of the metadata sidecar that sits next to every cached blob.
pub(crate) const METADATA_EXTENSION: &str = "meta";

/// Information stored next to a cached blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// The canonical key this entry was stored under.
    pub key: String,
    /// The `Last-Modified` time reported by the server, if any.
    pub last_modified: Option<SystemTime>,
    /// The time the entry was written.
    pub time_created: SystemTime,
}

impl Metadata {
    /// Creates metadata for freshly downloaded data.
    pub(crate) fn fresh(key: &str, last_modified: Option<SystemTime>) -> Self {
        Self {
            key: key.to_owned(),
            last_modified,
            time_created: SystemTime::now(),
        }
    }

    /// The time that should be sent as `If-Modified-Since` when revalidating this entry.
    pub fn revalidation_time(&self) -> SystemTime {
        self.last_modified.unwrap_or(self.time_created)
    }
}

/// Returns the path of the metadata sidecar belonging to the blob at `path`.
pub(crate) fn metadata_path(path: &Path) -> PathBuf {
    let mut path = path.as_os_str().to_owned();
    path.push(".");
    path.push(METADATA_EXTENSION);
    path.into()
}

/// Whether `path` is a metadata sidecar.
pub(crate) fn is_metadata_path(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == METADATA_EXTENSION)
}

/// Returns the blob path a metadata sidecar belongs to.
pub(crate) fn blob_path(metadata_path: &Path) -> PathBuf {
    metadata_path.with_extension("")
}

/// Reads the sidecar of the blob at `path`.
///
/// A missing or unparsable sidecar yields `None`, the blob is still usable without it.
pub(crate) fn read_metadata(path: &Path) -> Option<Metadata> {
    let md_path = metadata_path(path);
    let bytes = match fs::read(&md_path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                path = %md_path.display(),
                "Failed to read cache metadata",
            );
            return None;
        }
    };

    match serde_json::from_slice(&bytes) {
        Ok(md) => Some(md),
        Err(e) => {
            tracing::warn!(
                error = &e as &dyn std::error::Error,
                path = %md_path.display(),
                "Failed to parse cache metadata",
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sidecar_paths() {
        let blob = Path::new("/cache/files/example_com/tiles/0_bin~0011223344556677");
        let md = metadata_path(blob);
        assert_eq!(
            md,
            Path::new("/cache/files/example_com/tiles/0_bin~0011223344556677.meta")
        );
        assert!(is_metadata_path(&md));
        assert!(!is_metadata_path(blob));
        assert_eq!(blob_path(&md), blob);
    }

    #[test]
    fn test_revalidation_time() {
        let created = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1000);
        let mut md = Metadata {
            key: "http://example.com/a".into(),
            last_modified: None,
            time_created: created,
        };
        assert_eq!(md.revalidation_time(), created);

        let modified = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(10);
        md.last_modified = Some(modified);
        assert_eq!(md.revalidation_time(), modified);
    }
}
