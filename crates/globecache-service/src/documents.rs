//! One-shot loading of documents, such as layer descriptions, through the cache.

use std::sync::Arc;

use thiserror::Error;
use url::Url;

use crate::caching::{CacheError, CacheManager, HasCacheManager, ResourceStream};
use crate::config::Config;

/// An error loading a document.
#[derive(Debug, Error)]
pub enum DocumentError {
    /// The document could not be fetched, and there is no cached copy.
    #[error("failed to fetch document")]
    Fetch(#[from] CacheError),
    /// The document was fetched, but could not be parsed.
    #[error("failed to parse document")]
    Parse(#[source] anyhow::Error),
}

/// Loads and parses documents, preferring up-to-date copies.
///
/// If a cached copy fails to parse, it is removed from the cache and the document is fetched
/// again, up to the configured number of attempts.
#[derive(Debug, Clone)]
pub struct DocumentLoader {
    manager: Arc<CacheManager>,
    attempts: usize,
}

impl DocumentLoader {
    pub fn new(manager: Arc<CacheManager>, attempts: usize) -> Self {
        Self {
            manager,
            attempts: attempts.max(1),
        }
    }

    pub fn from_config(manager: Arc<CacheManager>, config: &Config) -> Self {
        Self::new(manager, config.document_attempts)
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Fetches the document at `url` and parses it with `parse`.
    pub async fn load<T, F>(&self, url: &Url, mut parse: F) -> Result<T, DocumentError>
    where
        F: FnMut(&mut ResourceStream) -> anyhow::Result<T>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut stream = self.manager.get_input_stream(url).await?;
            let cached = stream.is_cached();

            let err = match parse(&mut stream) {
                Ok(document) => return Ok(document),
                Err(err) => err,
            };
            drop(stream);

            if !cached {
                return Err(DocumentError::Parse(err));
            }

            tracing::warn!(
                %url,
                attempt,
                error = &*err as &dyn std::error::Error,
                "Failed to parse cached document, discarding it",
            );
            metric!(counter("documents.corrupt") += 1);
            if let Err(e) = self.manager.delete_file(url) {
                tracing::error!(
                    %url,
                    error = &e as &dyn std::error::Error,
                    "Failed to delete cached document",
                );
            }

            if attempt >= self.attempts {
                return Err(DocumentError::Parse(err));
            }
        }
    }
}

impl HasCacheManager for DocumentLoader {
    fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use crate::caching::{CacheSettings, MIN_CACHE_SIZE, ResourceKey};
    use crate::download::DownloadService;

    use super::*;

    fn parse_number(stream: &mut ResourceStream) -> anyhow::Result<u32> {
        let mut text = String::new();
        stream.read_to_string(&mut text)?;
        Ok(text.trim().parse()?)
    }

    #[tokio::test]
    async fn test_offline_documents() {
        let cache_dir = tempfile::tempdir_in(".").unwrap();
        let downloader = DownloadService::from_config(&Config::default()).unwrap();
        let manager = Arc::new(CacheManager::new(downloader));
        manager
            .configure(CacheSettings::new(cache_dir.path(), MIN_CACHE_SIZE).unwrap())
            .unwrap();
        manager.breaker().set_enabled(false);

        let store = manager.snapshot().store().unwrap().clone();
        let good = Url::parse("http://127.0.0.1:1/good.txt").unwrap();
        let corrupt = Url::parse("http://127.0.0.1:1/corrupt.txt").unwrap();
        store
            .put(&ResourceKey::from_url(&good), &b"42\n"[..], None)
            .unwrap();
        store
            .put(&ResourceKey::from_url(&corrupt), &b"forty-two"[..], None)
            .unwrap();

        let loader = DocumentLoader::new(manager, 2);
        assert_eq!(loader.load(&good, parse_number).await.unwrap(), 42);

        // the corrupt copy is dropped, and the server cannot be asked for a new one
        let err = loader.load(&corrupt, parse_number).await.unwrap_err();
        assert!(matches!(
            err,
            DocumentError::Fetch(CacheError::ServerDisabled)
        ));
        assert!(!store.contains(&ResourceKey::from_url(&corrupt)));
    }
}
