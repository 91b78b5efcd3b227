use std::sync::Arc;
use std::time::Duration;

use globecache_service::caching::{HasCacheManager, ResourceKey};
use globecache_service::tiles::{
    PyramidSource, TextureImage, TileId, TileOutcome, TileSource, TileState, WmsLayer, WmsSource,
};
use globecache_test::{elevation_fixture, gz_dds_fixture, http_time};

use crate::{TileServer, assert_pending, next_delivery, setup_services, wait_until};

fn pyramid(server: &TileServer, path: &str) -> Arc<PyramidSource> {
    Arc::new(PyramidSource::new(server.url(path), "bin", 16))
}

fn tile_id() -> TileId {
    TileId::from_pos_code("103").unwrap()
}

#[tokio::test]
async fn test_coalesced_loads() {
    let (services, _cache_dir) = setup_services(|_| {});
    let server = TileServer::new();
    server.put_file("elev/103.bin", elevation_fixture(16, 16, 12), None);

    let (loader, mut deliveries) =
        services.elevation_loader(pyramid(&server, "delay/200ms/elev/"));
    let tiles: Vec<_> = (0..5).map(|_| loader.new_tile(tile_id())).collect();
    for tile in &tiles {
        assert!(loader.request(tile, 10));
    }

    for _ in &tiles {
        let delivery = next_delivery(&mut deliveries).await;
        let grid = delivery.result.unwrap();
        assert_eq!((grid.width, grid.height), (16, 16));
        assert_eq!(grid.get(3, 3), Some(12.0));
    }
    for tile in &tiles {
        assert_eq!(tile.state(), TileState::Loaded);
    }
    assert_eq!(server.hits("delay/200ms/elev/103.bin"), 1);
    assert_eq!(services.cache_manager().stats().entries, 1);
}

#[tokio::test]
async fn test_not_found_is_final() {
    let (services, _cache_dir) = setup_services(|config| {
        config.retry_delay = Duration::from_millis(20);
    });
    let server = TileServer::new();

    let (loader, mut deliveries) = services.elevation_loader(pyramid(&server, "files/elev/"));
    let tile = loader.new_tile(tile_id());
    assert!(loader.request(&tile, 0));

    let delivery = next_delivery(&mut deliveries).await;
    assert_eq!(delivery.result.unwrap_err(), TileOutcome::OutsideOfResolution);
    assert_eq!(tile.state(), TileState::OutsideOfResolution);

    // neither the consumer nor the loader asks again
    assert!(!loader.request(&tile, 0));
    assert_pending(deliveries.recv()).await;
    assert_eq!(server.hits("files/elev/103.bin"), 1);
    assert!(services.breaker().is_enabled());
}

#[tokio::test]
async fn test_retries_until_breaker_trips() {
    let (services, _cache_dir) = setup_services(|config| {
        config.retry_delay = Duration::from_millis(50);
        config.server_failure_threshold = 3;
    });
    let server = TileServer::new();

    let (loader, mut deliveries) =
        services.elevation_loader(pyramid(&server, "status/503/elev/"));
    let tile = loader.new_tile(tile_id());
    assert!(loader.request(&tile, 0));

    for _ in 0..3 {
        let delivery = next_delivery(&mut deliveries).await;
        assert_eq!(delivery.result.unwrap_err(), TileOutcome::Aborted);
    }

    // the third failure disabled the server, which stops the retries
    assert_pending(deliveries.recv()).await;
    assert!(!services.breaker().is_enabled());
    assert_eq!(tile.state(), TileState::Aborted);
    assert_eq!(server.accesses(), 3);
}

/// Tiles requested while the server is disabled are aborted, and not retried until the
/// server is enabled again.
#[tokio::test]
async fn test_disabled_server() {
    let (services, _cache_dir) = setup_services(|config| {
        config.retry_delay = Duration::from_millis(20);
    });
    let server = TileServer::new();
    server.put_file("elev/103.bin", elevation_fixture(4, 4, 1), None);
    services.breaker().set_enabled(false);

    let (loader, mut deliveries) = services.elevation_loader(pyramid(&server, "files/elev/"));
    let tile = loader.new_tile(tile_id());
    assert!(loader.request(&tile, 0));

    let delivery = next_delivery(&mut deliveries).await;
    assert_eq!(delivery.result.unwrap_err(), TileOutcome::Aborted);
    assert_pending(deliveries.recv()).await;
    assert_eq!(tile.state(), TileState::Aborted);
    assert_eq!(server.accesses(), 0);

    services.breaker().set_enabled(true);
    assert!(loader.request(&tile, 0));
    let delivery = next_delivery(&mut deliveries).await;
    assert!(delivery.result.is_ok());
    assert_eq!(tile.state(), TileState::Loaded);
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_revalidation() {
    let (services, _cache_dir) = setup_services(|_| {});
    let server = TileServer::new();
    let path = "files/elev/103.bin";
    server.put_file("elev/103.bin", elevation_fixture(4, 4, 7), Some(http_time(1_000_000)));

    let (loader, mut deliveries) = services.elevation_loader(pyramid(&server, "files/elev/"));

    // the first load goes to the server
    let first = loader.new_tile(tile_id());
    assert!(loader.request(&first, 0));
    let delivery = next_delivery(&mut deliveries).await;
    assert_eq!(delivery.result.unwrap().get(0, 0), Some(7.0));
    assert_eq!(first.state(), TileState::Loaded);
    assert_eq!(first.last_modified(), Some(http_time(1_000_000)));
    assert_eq!(server.hits(path), 1);

    // the second one is served from the cache, and revalidated with a 304
    let second = loader.new_tile(tile_id());
    assert!(loader.request(&second, 0));
    let delivery = next_delivery(&mut deliveries).await;
    assert_eq!(delivery.result.unwrap().get(0, 0), Some(7.0));
    wait_until(|| second.state() == TileState::Loaded).await;
    assert_eq!(server.hits(path), 2);
    assert_pending(deliveries.recv()).await;
    assert_eq!(second.payload().unwrap().get(0, 0), Some(7.0));

    // a changed tile is delivered twice: first from the cache, then the new version
    server.put_file("elev/103.bin", elevation_fixture(4, 4, 9), Some(http_time(2_000_000)));
    let third = loader.new_tile(tile_id());
    assert!(loader.request(&third, 0));
    let stale = next_delivery(&mut deliveries).await;
    assert_eq!(stale.result.unwrap().get(0, 0), Some(7.0));
    let fresh = next_delivery(&mut deliveries).await;
    assert!(Arc::ptr_eq(&fresh.tile, &third));
    assert_eq!(fresh.result.unwrap().get(0, 0), Some(9.0));
    assert_eq!(third.state(), TileState::Loaded);
    assert_eq!(third.last_modified(), Some(http_time(2_000_000)));
    assert_eq!(server.hits(path), 3);
}

/// A tile that was loaded before asks the server whether it changed when it is loaded again.
#[tokio::test]
async fn test_conditional_reload() {
    let (services, _cache_dir) = setup_services(|config| {
        config.retry_delay = Duration::from_millis(20);
    });
    let server = TileServer::new();
    let path = "files/elev/103.bin";
    server.put_file("elev/103.bin", elevation_fixture(4, 4, 7), Some(http_time(1_000_000)));

    let (loader, mut deliveries) = services.elevation_loader(pyramid(&server, "files/elev/"));
    let tile = loader.new_tile(tile_id());
    assert!(loader.request(&tile, 0));
    assert!(next_delivery(&mut deliveries).await.result.is_ok());
    assert!(tile.unload());
    assert_eq!(tile.last_modified(), Some(http_time(1_000_000)));

    // the server answers `304`, but the cached copy is gone
    services.cache_manager().clear().unwrap();
    assert!(loader.request(&tile, 0));
    let delivery = next_delivery(&mut deliveries).await;
    assert_eq!(delivery.result.unwrap_err(), TileOutcome::Aborted);

    // so the retry asks for the whole tile
    let delivery = next_delivery(&mut deliveries).await;
    assert_eq!(delivery.result.unwrap().get(0, 0), Some(7.0));
    assert_eq!(tile.state(), TileState::Loaded);
    assert_eq!(server.hits(path), 3);
    assert_eq!(services.cache_manager().stats().entries, 1);
}

/// After a storage failure the cache is bypassed until it is configured again.
#[tokio::test]
async fn test_degraded_cache() {
    let (services, _cache_dir) = setup_services(|config| {
        config.loaders.revalidate = false;
    });
    let server = TileServer::new();
    let path = "files/elev/103.bin";
    server.put_file("elev/103.bin", elevation_fixture(2, 2, 4), None);
    let manager = services.cache_manager().clone();
    let store = manager.snapshot().store().unwrap().clone();

    // nothing can be written while a file sits in place of the temp directory
    let tmp_dir = store.root().join("tmp");
    std::fs::remove_dir_all(&tmp_dir).unwrap();
    std::fs::write(&tmp_dir, b"").unwrap();

    let (loader, mut deliveries) = services.elevation_loader(pyramid(&server, "files/elev/"));
    let first = loader.new_tile(tile_id());
    assert!(loader.request(&first, 0));
    let delivery = next_delivery(&mut deliveries).await;
    assert_eq!(delivery.result.unwrap().get(0, 0), Some(4.0));
    assert!(manager.stats().degraded);
    assert!(store.is_empty());

    // the writable store is not used any more
    std::fs::remove_file(&tmp_dir).unwrap();
    let second = loader.new_tile(tile_id());
    assert!(loader.request(&second, 0));
    assert!(next_delivery(&mut deliveries).await.result.is_ok());
    assert!(manager.stats().degraded);
    assert!(store.is_empty());
    assert_eq!(server.hits(path), 2);

    // configuring the cache again puts it back to use
    manager.configure(manager.settings()).unwrap();
    assert!(!manager.stats().degraded);
    let third = loader.new_tile(tile_id());
    assert!(loader.request(&third, 0));
    assert!(next_delivery(&mut deliveries).await.result.is_ok());
    assert_eq!(store.len(), 1);
    assert_eq!(server.hits(path), 3);
}

#[tokio::test]
async fn test_corrupt_cache_entry() {
    let (services, _cache_dir) = setup_services(|config| {
        config.loaders.revalidate = false;
    });
    let server = TileServer::new();
    server.put_file("elev/103.bin", elevation_fixture(2, 2, 5), None);
    let source = pyramid(&server, "files/elev/");

    let request = source.resolve(tile_id(), 0.0).unwrap();
    let key = ResourceKey::from_request(&request);
    let store = services.cache_manager().snapshot().store().unwrap().clone();
    store.put(&key, &b"garbage"[..], None).unwrap();

    let (loader, mut deliveries) = services.elevation_loader(source);
    let tile = loader.new_tile(tile_id());
    assert!(loader.request(&tile, 0));

    let delivery = next_delivery(&mut deliveries).await;
    assert_eq!(delivery.result.unwrap().get(1, 1), Some(5.0));
    assert_eq!(server.accesses(), 1);

    // the broken copy was replaced
    let mut cached = Vec::new();
    std::io::Read::read_to_end(&mut store.get(&key).unwrap(), &mut cached).unwrap();
    assert_eq!(cached, elevation_fixture(2, 2, 5));
}

#[tokio::test]
async fn test_compressed_textures() {
    let (services, _cache_dir) = setup_services(|_| {});
    let server = TileServer::new();
    server.put_file("tex/103.dds.gz", gz_dds_fixture(64, 64), None);

    let source = Arc::new(PyramidSource::new(server.url("files/tex/"), "dds.gz", 64));
    let (loader, mut deliveries) = services.texture_loader(source);
    let tile = loader.new_tile(tile_id());
    assert!(loader.request(&tile, 0));

    let delivery = next_delivery(&mut deliveries).await;
    let TextureImage::Compressed(dds) = &*delivery.result.unwrap() else {
        panic!("expected a compressed texture");
    };
    assert_eq!((dds.width, dds.height), (64, 64));
    assert_eq!(&dds.fourcc, b"DXT1");
}

/// Disabling the cache while a tile is downloading still delivers the tile, but nothing is
/// written to disk.
#[tokio::test]
async fn test_disable_cache_during_fetch() {
    let (services, _cache_dir) = setup_services(|_| {});
    let server = TileServer::new();
    server.put_file("elev/103.bin", elevation_fixture(4, 4, 3), None);
    let manager = services.cache_manager().clone();
    let store = manager.snapshot().store().unwrap().clone();

    let (loader, mut deliveries) =
        services.elevation_loader(pyramid(&server, "delay/300ms/elev/"));
    let tile = loader.new_tile(tile_id());
    assert!(loader.request(&tile, 0));

    wait_until(|| server.hits("delay/300ms/elev/103.bin") > 0).await;
    let mut settings = manager.settings();
    settings.set_enabled(false);
    manager.configure(settings).unwrap();

    let delivery = next_delivery(&mut deliveries).await;
    assert_eq!(delivery.result.unwrap().get(0, 0), Some(3.0));
    assert_eq!(tile.state(), TileState::Loaded);
    assert!(store.is_empty());
    assert!(!manager.stats().enabled);
}

/// Different sets of visible overlay layers are different resources.
#[tokio::test]
async fn test_overlay_keys() {
    let (services, _cache_dir) = setup_services(|config| {
        config.loaders.revalidate = false;
    });
    let server = TileServer::new();
    let layers = vec![WmsLayer::new("roads"), WmsLayer::new("labels")];
    let source = Arc::new(WmsSource::new(server.url("wms"), layers, 32, "image/png"));
    let (loader, mut deliveries) = services.texture_loader(source.clone());

    let with_labels = loader.new_tile(tile_id());
    let key_with_labels =
        ResourceKey::from_request(&source.resolve(tile_id(), with_labels.pixel_size()).unwrap());
    assert!(loader.request(&with_labels, 0));
    let delivery = next_delivery(&mut deliveries).await;
    assert_eq!(delivery.result.unwrap().dimensions(), (32, 32));

    assert!(source.set_layer_visible("labels", false));
    let without_labels = loader.new_tile(tile_id());
    let key_without_labels = ResourceKey::from_request(
        &source
            .resolve(tile_id(), without_labels.pixel_size())
            .unwrap(),
    );
    assert_ne!(key_with_labels, key_without_labels);
    assert!(loader.request(&without_labels, 0));
    let delivery = next_delivery(&mut deliveries).await;
    assert!(delivery.result.is_ok());

    assert_eq!(server.accesses(), 2);
    let store = services.cache_manager().snapshot().store().unwrap().clone();
    assert_eq!(store.len(), 2);
    assert!(store.contains(&key_with_labels));
    assert!(store.contains(&key_without_labels));

    // the same combination is served from the cache
    let again = loader.new_tile(tile_id());
    assert!(loader.request(&again, 0));
    let delivery = next_delivery(&mut deliveries).await;
    assert!(delivery.result.is_ok());
    assert_eq!(server.accesses(), 0);
}
