use std::sync::Arc;
use std::time::Duration;

use globecache_service::lod::{LodSurface, RectView};
use globecache_service::tiles::{
    ElevationDecoder, GeoRect, PyramidSource, TileDecoder, TileId, TileState,
};
use globecache_test::elevation_fixture;

use crate::{TileServer, setup_services};

fn view(west: f64, south: f64, east: f64, north: f64) -> RectView {
    RectView {
        rect: GeoRect {
            west,
            south,
            east,
            north,
        },
        pixel_size: 1e-6,
    }
}

/// Updates `surface` like a render loop would, until no more tiles are loading.
async fn settle<D: TileDecoder>(surface: &mut LodSurface<D>, view: &RectView) {
    for _ in 0..500 {
        let stats = surface.update(view);
        if stats.requested == 0 && surface.is_settled() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("surface did not settle");
}

#[tokio::test]
async fn test_follow_view() {
    let (services, _cache_dir) = setup_services(|config| {
        config.loaders.revalidate = false;
    });
    let server = TileServer::new();
    server.put_file("elev/0.bin", elevation_fixture(2, 2, 100), None);
    server.put_file("elev/02.bin", elevation_fixture(2, 2, 200), None);

    let source = PyramidSource::new(server.url("files/elev/"), "bin", 2).with_max_level(1);
    let (loader, deliveries) = services.elevation_loader(Arc::new(source));
    let mut surface = LodSurface::<ElevationDecoder>::new(loader, deliveries);

    let north_pacific = view(-170.0, 10.0, -160.0, 20.0);
    settle(&mut surface, &north_pacific).await;

    let root = TileId::new(0, 0, 0).unwrap();
    let child = TileId::new(1, 0, 1).unwrap();
    let grandchild = TileId::new(2, 0, 2).unwrap();
    assert_eq!(child.pos_code(), "02");
    assert_eq!(surface.len(), 3);
    assert_eq!(surface.tile(root).unwrap().state(), TileState::Loaded);
    assert_eq!(surface.tile(child).unwrap().state(), TileState::Loaded);
    assert_eq!(
        surface.tile(grandchild).unwrap().state(),
        TileState::OutsideOfResolution
    );

    let renderable = surface.renderable(TileId::new(6, 2, 35).unwrap()).unwrap();
    assert_eq!(renderable.id(), child);
    assert_eq!(renderable.payload().unwrap().get(1, 1), Some(200.0));

    // tiles outside of the pyramid are never fetched
    assert_eq!(server.hits("files/elev/0.bin"), 1);
    assert_eq!(server.hits("files/elev/02.bin"), 1);
    assert_eq!(server.accesses(), 2);

    // panning to the other hemisphere replaces the working set
    let indian_ocean = view(60.0, -30.0, 70.0, -20.0);
    let stats = surface.update(&indian_ocean);
    assert_eq!(stats.dropped, 3);
    settle(&mut surface, &indian_ocean).await;
    assert_eq!(surface.len(), 1);
    assert_eq!(
        surface.tile(TileId::roots()[1]).unwrap().state(),
        TileState::OutsideOfResolution
    );
    assert_eq!(server.hits("files/elev/1.bin"), 1);
}
