//! Provides the application root, which builds the shared services from a [`Config`].
//!
//! There is exactly one [`CacheManager`] per [`GlobeServices`], and every loader created from
//! it shares that manager, the download client and the server breaker.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::caching::{CacheManager, HasCacheManager};
use crate::config::Config;
use crate::documents::DocumentLoader;
use crate::download::{DownloadService, ServerBreaker};
use crate::tiles::{
    DeliveryReceiver, ElevationDecoder, ElevationGrid, ElevationLoader, LoaderOptions,
    TextureDecoder, TextureImage, TextureLoader, TileSource,
};

pub struct GlobeServices {
    pub config: Config,
    pub download_svc: Arc<DownloadService>,
    pub cache_manager: Arc<CacheManager>,
    pub documents: DocumentLoader,
}

impl GlobeServices {
    /// Creates the services.
    ///
    /// A cache configuration that cannot be applied is logged, and the services run without
    /// a cache.
    pub fn new(config: Config) -> Result<Self> {
        let download_svc =
            DownloadService::from_config(&config).context("failed to create http client")?;
        let cache_manager = Arc::new(CacheManager::new(download_svc.clone()));

        if let Err(e) = cache_manager.configure(config.cache.clone()) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                "Failed to set up the cache, continuing without",
            );
        }

        let documents = DocumentLoader::from_config(cache_manager.clone(), &config);

        Ok(Self {
            config,
            download_svc,
            cache_manager,
            documents,
        })
    }

    pub fn breaker(&self) -> &Arc<ServerBreaker> {
        self.download_svc.breaker()
    }

    pub fn loader_options(&self) -> LoaderOptions {
        LoaderOptions::from_config(&self.config)
    }

    /// Creates an elevation loader for `source`.
    ///
    /// This spawns the loader's workers, and must be called within a tokio runtime.
    pub fn elevation_loader(
        &self,
        source: Arc<dyn TileSource>,
    ) -> (ElevationLoader, DeliveryReceiver<ElevationGrid>) {
        ElevationLoader::new(
            self.cache_manager.clone(),
            source,
            ElevationDecoder,
            self.loader_options(),
        )
    }

    /// Creates a texture loader for `source`.
    ///
    /// This spawns the loader's workers, and must be called within a tokio runtime.
    pub fn texture_loader(
        &self,
        source: Arc<dyn TileSource>,
    ) -> (TextureLoader, DeliveryReceiver<TextureImage>) {
        TextureLoader::new(
            self.cache_manager.clone(),
            source,
            TextureDecoder,
            self.loader_options(),
        )
    }
}

impl HasCacheManager for GlobeServices {
    fn cache_manager(&self) -> &Arc<CacheManager> {
        &self.cache_manager
    }
}
