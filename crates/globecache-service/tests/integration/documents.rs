use std::io::Read;

use globecache_service::caching::{HasCacheManager, ResourceKey, ResourceStream};
use globecache_service::documents::DocumentError;
use globecache_test::http_time;

use crate::{TileServer, setup_services};

fn parse_layers(stream: &mut ResourceStream) -> anyhow::Result<Vec<String>> {
    let mut text = String::new();
    stream.read_to_string(&mut text)?;
    let Some(list) = text.strip_prefix("layers:") else {
        anyhow::bail!("not a layer list");
    };
    Ok(list.split(',').map(|name| name.trim().to_owned()).collect())
}

#[tokio::test]
async fn test_recover_from_corrupt_copy() {
    let (services, _cache_dir) = setup_services(|_| {});
    let server = TileServer::new();
    server.put_file("layers.txt", "layers: roads, labels", Some(http_time(1_000_000)));
    let url = server.url("files/layers.txt");

    // a broken copy, newer than the one on the server
    let store = services.cache_manager().snapshot().store().unwrap().clone();
    store
        .put(&ResourceKey::from_url(&url), &b"<html>"[..], None)
        .unwrap();

    let layers = services.documents.load(&url, parse_layers).await.unwrap();
    assert_eq!(layers, ["roads", "labels"]);
    // one revalidation answered with 304, then a full download
    assert_eq!(server.accesses(), 2);

    let layers = services.documents.load(&url, parse_layers).await.unwrap();
    assert_eq!(layers, ["roads", "labels"]);
}

#[tokio::test]
async fn test_broken_document() {
    let (services, _cache_dir) = setup_services(|_| {});
    let server = TileServer::new();
    server.put_file("broken.txt", "<html>", None);
    let url = server.url("files/broken.txt");

    let err = services
        .documents
        .load(&url, parse_layers)
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::Parse(_)));
    assert_eq!(server.accesses(), 1);

    let err = services
        .documents
        .load(&server.url("files/missing.txt"), parse_layers)
        .await
        .unwrap_err();
    assert!(matches!(err, DocumentError::Fetch(_)));
}
