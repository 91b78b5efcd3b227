use std::future::Future;
use std::time::Duration;

use globecache_service::caching::{CacheSettings, MIN_CACHE_SIZE};
use globecache_service::config::Config;
use globecache_service::services::GlobeServices;
use globecache_service::tiles::{DeliveryReceiver, TileDelivery};
use globecache_test as test;

pub use test::{TileServer, TempDir};

/// How long tests wait for the loader before giving up.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Setup tests and create the services.
///
/// This function returns a tuple containing the services to test, and a temporary cache
/// directory. The directory is cleaned up when the [`TempDir`] instance is dropped. Keep it as
/// guard until the test has finished.
///
/// The `update_config` closure can modify any default configuration if needed before the
/// services are created.
pub fn setup_services(update_config: impl FnOnce(&mut Config)) -> (GlobeServices, TempDir) {
    test::setup();

    let cache_dir = test::tempdir();
    let mut config = Config {
        cache: CacheSettings::new(cache_dir.path(), 16 * MIN_CACHE_SIZE).unwrap(),
        retry_delay: Duration::from_secs(30),
        ..Default::default()
    };
    update_config(&mut config);

    let services = GlobeServices::new(config).unwrap();
    (services, cache_dir)
}

/// Waits for the next delivery of a loader.
pub async fn next_delivery<P>(deliveries: &mut DeliveryReceiver<P>) -> TileDelivery<P> {
    tokio::time::timeout(WAIT_TIMEOUT, deliveries.recv())
        .await
        .expect("timed out waiting for a delivery")
        .expect("the loader was shut down")
}

/// Polls `condition` until it holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(WAIT_TIMEOUT, poll)
        .await
        .expect("timed out waiting for condition");
}

/// Asserts that `future` does not complete within a short time.
pub async fn assert_pending<F: Future>(future: F) {
    let result = tokio::time::timeout(Duration::from_millis(200), future).await;
    assert!(result.is_err(), "expected the future to be pending");
}
