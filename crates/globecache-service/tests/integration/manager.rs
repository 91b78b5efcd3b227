use std::io::Read;

use globecache_service::caching::{CacheError, CacheSettings, HasCacheManager, MIN_CACHE_SIZE};
use globecache_test::http_time;

use crate::{TileServer, setup_services};

fn read_all(mut stream: impl Read) -> String {
    let mut contents = String::new();
    stream.read_to_string(&mut contents).unwrap();
    contents
}

#[tokio::test]
async fn test_input_stream() {
    let (services, _cache_dir) = setup_services(|_| {});
    let server = TileServer::new();
    server.put_file("layers.xml", "<layers/>", Some(http_time(1_000_000)));
    let url = server.url("files/layers.xml");
    let manager = services.cache_manager();

    let stream = manager.get_input_stream(&url).await.unwrap();
    assert!(!stream.is_cached());
    assert_eq!(read_all(stream), "<layers/>");

    // the cached copy is revalidated
    let stream = manager.get_input_stream(&url).await.unwrap();
    assert!(stream.is_cached());
    assert_eq!(read_all(stream), "<layers/>");
    assert_eq!(server.accesses(), 2);

    // and used as is while the server is disabled
    services.breaker().set_enabled(false);
    let stream = manager.get_input_stream(&url).await.unwrap();
    assert!(stream.is_cached());
    assert_eq!(server.accesses(), 0);

    let missing = server.url("files/missing.xml");
    let err = manager.get_input_stream(&missing).await.unwrap_err();
    assert!(matches!(err, CacheError::ServerDisabled));
}

#[tokio::test]
async fn test_query_is_sent_unchanged() {
    let (services, _cache_dir) = setup_services(|_| {});
    let server = TileServer::new();
    server.put_file("scene.xml", "<scene/>", Some(http_time(1_000_000)));
    let manager = services.cache_manager();

    let url = server.url("files/scene.xml?version=2&token=Abc");
    let stream = manager.get_input_stream(&url).await.unwrap();
    assert_eq!(read_all(stream), "<scene/>");
    assert_eq!(
        server.all_hits(),
        vec![("/files/scene.xml?version=2&token=Abc".to_owned(), 1)]
    );

    // the same parameters in another order are the same resource
    let reordered = server.url("files/scene.xml?token=Abc&version=2");
    let stream = manager.get_input_stream(&reordered).await.unwrap();
    assert!(stream.is_cached());
    assert_eq!(
        server.all_hits(),
        vec![("/files/scene.xml?token=Abc&version=2".to_owned(), 1)]
    );

    // while differently named ones are not
    let renamed = server.url("files/scene.xml?VERSION=2&TOKEN=Abc");
    let stream = manager.get_input_stream(&renamed).await.unwrap();
    assert!(!stream.is_cached());
    assert_eq!(manager.stats().entries, 2);
}

#[tokio::test]
async fn test_cached_copy_on_failure() {
    let (services, _cache_dir) = setup_services(|config| {
        config.server_failure_threshold = 0;
    });
    let server = TileServer::new();
    server.put_file("doc.txt", "v1", None);
    let manager = services.cache_manager();

    let url = server.url("files/doc.txt");
    read_all(manager.get_input_stream(&url).await.unwrap());

    // the server goes away, the cached copy stays usable
    server.remove_file("doc.txt");
    let stream = manager.get_input_stream(&url).await.unwrap();
    assert!(stream.is_cached());
    assert_eq!(read_all(stream), "v1");

    manager.delete_file(&url).unwrap();
    // deleting twice is fine
    manager.delete_file(&url).unwrap();
    let err = manager.get_input_stream(&url).await.unwrap_err();
    assert!(matches!(err, CacheError::NotFound));
}

#[tokio::test]
async fn test_reconfigure() {
    let (services, cache_dir) = setup_services(|_| {});
    let server = TileServer::new();
    server.put_file("a.txt", "a", None);
    server.put_file("b.txt", "b", None);
    let manager = services.cache_manager();

    read_all(manager.get_input_stream(&server.url("files/a.txt")).await.unwrap());
    assert_eq!(manager.stats().entries, 1);

    // a new directory starts out empty
    let other_dir = globecache_test::tempdir();
    manager
        .configure(CacheSettings::new(other_dir.path(), MIN_CACHE_SIZE).unwrap())
        .unwrap();
    let stats = manager.stats();
    assert_eq!(stats.dir, other_dir.path());
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.budget, MIN_CACHE_SIZE);

    read_all(manager.get_input_stream(&server.url("files/b.txt")).await.unwrap());

    // switching back finds the old entries again
    manager
        .configure(CacheSettings::new(cache_dir.path(), 16 * MIN_CACHE_SIZE).unwrap())
        .unwrap();
    assert_eq!(manager.stats().entries, 1);
    server.accesses();
    services.breaker().set_enabled(false);
    let stream = manager.get_input_stream(&server.url("files/a.txt")).await.unwrap();
    assert_eq!(read_all(stream), "a");

    manager.clear().unwrap();
    let stats = manager.stats();
    assert!(stats.enabled);
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.resident_bytes, 0);
}
