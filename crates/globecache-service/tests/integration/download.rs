use std::time::Duration;

use globecache_service::caching::CacheError;
use globecache_service::download::FetchResponse;
use globecache_test::http_time;

use crate::{TileServer, setup_services};

#[tokio::test]
async fn test_conditional_fetch() {
    let (services, _cache_dir) = setup_services(|_| {});
    let server = TileServer::new();
    let modified = http_time(1_600_000_000);
    server.put_file("doc.txt", "hello", Some(modified));

    let url = server.url("files/doc.txt");
    let response = services.download_svc.fetch(&url, None).await.unwrap();
    assert_eq!(
        response,
        FetchResponse::Fresh {
            data: "hello".into(),
            last_modified: Some(modified),
        }
    );

    let response = services
        .download_svc
        .fetch(&url, Some(modified))
        .await
        .unwrap();
    assert_eq!(response, FetchResponse::NotModified);

    // older copies are sent again
    let response = services
        .download_svc
        .fetch(&url, Some(http_time(1_500_000_000)))
        .await
        .unwrap();
    assert!(matches!(response, FetchResponse::Fresh { .. }));

    assert_eq!(server.accesses(), 3);
}

#[tokio::test]
async fn test_download_errors() {
    let (services, _cache_dir) = setup_services(|config| {
        config.max_download_timeout = Duration::from_millis(100);
        config.server_failure_threshold = 0;
    });
    let server = TileServer::new();
    server.put_file("slow.txt", "zzz", None);
    let download_svc = &services.download_svc;

    let err = download_svc
        .fetch(&server.url("files/missing.txt"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::NotFound));

    let err = download_svc
        .fetch(&server.url("status/410/gone.txt"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::NotFound));

    let err = download_svc
        .fetch(&server.url("status/503/busy.txt"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::DownloadError(_)));
    assert!(err.is_transient());

    let err = download_svc
        .fetch(&server.url("status/403/forbidden.txt"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::UnexpectedStatus(403)));
    assert!(!err.is_transient());

    let err = download_svc
        .fetch(&server.url("delay/2s/slow.txt"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Timeout(_)));
    assert!(err.is_transient());

    // a threshold of zero never disables the server
    assert!(services.breaker().is_enabled());
}

#[tokio::test]
async fn test_breaker_trips() {
    let (services, _cache_dir) = setup_services(|config| {
        config.server_failure_threshold = 2;
    });
    let server = TileServer::new();
    server.put_file("ok.txt", "ok", None);
    let download_svc = &services.download_svc;
    let failing = server.url("status/500/fail.txt");

    download_svc.fetch(&failing, None).await.unwrap_err();
    // a success resets the count
    download_svc
        .fetch(&server.url("files/ok.txt"), None)
        .await
        .unwrap();
    download_svc.fetch(&failing, None).await.unwrap_err();
    assert!(services.breaker().is_enabled());

    download_svc.fetch(&failing, None).await.unwrap_err();
    assert!(!services.breaker().is_enabled());
    assert_eq!(server.accesses(), 4);

    // no more requests reach the server
    let err = download_svc
        .fetch(&server.url("files/ok.txt"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::ServerDisabled));
    assert_eq!(server.accesses(), 0);

    services.breaker().set_enabled(true);
    assert_eq!(services.breaker().consecutive_failures(), 0);
    download_svc
        .fetch(&server.url("files/ok.txt"), None)
        .await
        .unwrap();
    assert_eq!(server.accesses(), 1);
}
