//! Fetching documents and tiles through the cache.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use globecache_service::config::Config;
use globecache_service::services::GlobeServices;
use globecache_service::tiles::{
    DeliveryReceiver, ElevationGrid, MAX_LEVEL, PyramidSource, TextureImage, TileDecoder, TileId,
    TileLoader, TileOutcome, TileSource,
};
use url::Url;

use crate::cli::TileKind;

/// The edge length of the tiles served by tile pyramids, in samples.
const TILE_SIZE: u32 = 256;

/// Fetches the document at `url` and writes it to `output`, or stdout.
pub async fn fetch_document(config: Config, url: &Url, output: Option<&Path>) -> Result<()> {
    let services = GlobeServices::new(config)?;
    let contents = services
        .documents
        .load(url, |stream| {
            let mut contents = Vec::new();
            stream.read_to_end(&mut contents)?;
            Ok(contents)
        })
        .await?;

    match output {
        Some(path) => std::fs::write(path, &contents)
            .with_context(|| format!("failed to write `{}`", path.display()))?,
        None => std::io::stdout().lock().write_all(&contents)?,
    }
    Ok(())
}

/// Loads the tiles with the given position codes and reports their outcome.
pub async fn load_tiles(
    config: Config,
    base: Url,
    kind: TileKind,
    suffix: &str,
    codes: &[String],
) -> Result<()> {
    let ids = codes
        .iter()
        .map(|code| {
            TileId::from_pos_code(code).ok_or_else(|| anyhow!("invalid position code `{code}`"))
        })
        .collect::<Result<Vec<_>>>()?;

    let services = GlobeServices::new(config)?;
    let source: Arc<dyn TileSource> = Arc::new(PyramidSource::new(base, suffix, TILE_SIZE));

    let failed = match kind {
        TileKind::Elevation => {
            let (loader, deliveries) = services.elevation_loader(source);
            load_all(loader, deliveries, &ids, describe_elevation).await
        }
        TileKind::Texture => {
            let (loader, deliveries) = services.texture_loader(source);
            load_all(loader, deliveries, &ids, describe_texture).await
        }
    };

    if failed > 0 {
        bail!("{failed} of {} tiles could not be loaded", ids.len());
    }
    Ok(())
}

/// Requests all `ids` and waits for one delivery per tile.
///
/// Returns the number of aborted tiles.
async fn load_all<D: TileDecoder>(
    loader: TileLoader<D>,
    mut deliveries: DeliveryReceiver<D::Payload>,
    ids: &[TileId],
    describe: fn(&D::Payload) -> String,
) -> usize {
    let mut pending = 0;
    for &id in ids {
        let tile = loader.new_tile(id);
        if loader.request(&tile, i32::from(MAX_LEVEL - id.level())) {
            pending += 1;
        }
    }

    let mut failed = 0;
    while pending > 0 {
        let Some(delivery) = deliveries.recv().await else {
            break;
        };
        pending -= 1;
        let code = delivery.tile.id().pos_code();
        match delivery.result {
            Ok(payload) => println!("{code}: {}", describe(&payload)),
            Err(TileOutcome::OutsideOfResolution) => println!("{code}: outside of resolution"),
            Err(TileOutcome::Aborted) => {
                println!("{code}: aborted");
                failed += 1;
            }
        }
    }

    loader.shutdown();
    failed + pending
}

fn describe_elevation(grid: &ElevationGrid) -> String {
    let (min, max) = grid
        .samples
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(min, max), &v| {
            (min.min(v), max.max(v))
        });
    format!(
        "{}x{} elevation samples, {min} to {max} metres",
        grid.width, grid.height
    )
}

fn describe_texture(image: &TextureImage) -> String {
    let (width, height) = image.dimensions();
    match image {
        TextureImage::Compressed(dds) => format!(
            "{width}x{height} {} texture, {} mip levels",
            String::from_utf8_lossy(&dds.fourcc),
            dds.mip_count
        ),
        TextureImage::Rgba8 { .. } => format!("{width}x{height} RGBA texture"),
    }
}
