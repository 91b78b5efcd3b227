use std::fmt;
use std::sync::{PoisonError, RwLock};

use url::Url;

use crate::caching::ResourceRequest;

use super::id::{GeoRect, TileId};

/// Resolves tiles to the remote resource holding their data.
pub trait TileSource: fmt::Debug + Send + Sync {
    /// Returns the request for `tile`, or `None` if the source has no data at this
    /// resolution.
    fn resolve(&self, tile: TileId, pixel_size: f64) -> Option<ResourceRequest>;

    /// The number of pixels of one tile in each direction.
    fn tile_size(&self) -> u32;
}

/// A static tile pyramid, where every tile is a file named after its position path.
///
/// The tile `1031221` of a pyramid at `http://example.com/elevation/` with suffix `bin` is
/// found at `http://example.com/elevation/103/122/1.bin`.
#[derive(Debug, Clone)]
pub struct PyramidSource {
    base: Url,
    suffix: String,
    tile_size: u32,
    max_level: Option<u8>,
}

impl PyramidSource {
    pub fn new(mut base: Url, suffix: impl Into<String>, tile_size: u32) -> Self {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self {
            base,
            suffix: suffix.into(),
            tile_size,
            max_level: None,
        }
    }

    /// Limits the pyramid to tiles up to `level`.
    pub fn with_max_level(mut self, level: u8) -> Self {
        self.max_level = Some(level);
        self
    }

    pub fn base(&self) -> &Url {
        &self.base
    }
}

impl TileSource for PyramidSource {
    fn resolve(&self, tile: TileId, _pixel_size: f64) -> Option<ResourceRequest> {
        if self.max_level.is_some_and(|max| tile.level() > max) {
            return None;
        }
        let mut path = tile.pos_path();
        if !self.suffix.is_empty() {
            path.push('.');
            path.push_str(&self.suffix);
        }
        let url = self.base.join(&path).ok()?;
        Some(ResourceRequest::new(url))
    }

    fn tile_size(&self) -> u32 {
        self.tile_size
    }
}

/// A layer offered by a WMS server.
#[derive(Debug, Clone, PartialEq)]
pub struct WmsLayer {
    pub name: String,
    pub style: String,
    /// The finest pixel size in degrees this layer is shown at.
    pub min_pixel_size: Option<f64>,
    /// The coarsest pixel size in degrees this layer is shown at.
    pub max_pixel_size: Option<f64>,
    pub visible: bool,
}

impl WmsLayer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            style: String::new(),
            min_pixel_size: None,
            max_pixel_size: None,
            visible: true,
        }
    }

    fn shown_at(&self, pixel_size: f64) -> bool {
        self.visible
            && self.min_pixel_size.is_none_or(|min| pixel_size >= min)
            && self.max_pixel_size.is_none_or(|max| pixel_size <= max)
    }
}

/// Textures rendered on demand by a WMS server, composed from a set of toggleable layers.
///
/// Every combination of visible layers yields different requests, and thus different cache
/// entries.
#[derive(Debug)]
pub struct WmsSource {
    base: Url,
    layers: RwLock<Vec<WmsLayer>>,
    tile_size: u32,
    format: String,
    transparent: bool,
}

impl WmsSource {
    pub fn new(
        base: Url,
        layers: Vec<WmsLayer>,
        tile_size: u32,
        format: impl Into<String>,
    ) -> Self {
        Self {
            base,
            layers: RwLock::new(layers),
            tile_size,
            format: format.into(),
            transparent: false,
        }
    }

    pub fn with_transparency(mut self, transparent: bool) -> Self {
        self.transparent = transparent;
        self
    }

    /// Shows or hides the layer called `name`.
    ///
    /// Returns `false` if there is no such layer.
    pub fn set_layer_visible(&self, name: &str, visible: bool) -> bool {
        let mut layers = self.layers.write().unwrap_or_else(PoisonError::into_inner);
        match layers.iter_mut().find(|layer| layer.name == name) {
            Some(layer) => {
                layer.visible = visible;
                true
            }
            None => false,
        }
    }

    pub fn layers(&self) -> Vec<WmsLayer> {
        self.layers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl TileSource for WmsSource {
    fn resolve(&self, tile: TileId, pixel_size: f64) -> Option<ResourceRequest> {
        let (names, styles): (Vec<_>, Vec<_>) = self
            .layers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|layer| layer.shown_at(pixel_size))
            .map(|layer| (layer.name.clone(), layer.style.clone()))
            .unzip();
        if names.is_empty() {
            return None;
        }

        let size = self.tile_size.to_string();
        let params = vec![
            ("SERVICE".to_owned(), "WMS".to_owned()),
            ("VERSION".to_owned(), "1.1.1".to_owned()),
            ("REQUEST".to_owned(), "GetMap".to_owned()),
            ("LAYERS".to_owned(), names.join(",")),
            ("STYLES".to_owned(), styles.join(",")),
            ("SRS".to_owned(), "EPSG:4326".to_owned()),
            ("BBOX".to_owned(), format_bbox(&tile.bounds().to_degrees())),
            ("WIDTH".to_owned(), size.clone()),
            ("HEIGHT".to_owned(), size),
            ("FORMAT".to_owned(), self.format.clone()),
            (
                "TRANSPARENT".to_owned(),
                if self.transparent { "TRUE" } else { "FALSE" }.to_owned(),
            ),
        ];
        Some(ResourceRequest::with_params(self.base.clone(), params))
    }

    fn tile_size(&self) -> u32 {
        self.tile_size
    }
}

/// Formats a bounding box as `west,south,east,north`.
///
/// The western edge is wrapped into `[-180, 180)`, so equal tiles always produce equal strings.
fn format_bbox(rect: &GeoRect) -> String {
    let width = rect.width();
    let west = (rect.west + 180.0).rem_euclid(360.0) - 180.0;
    format!(
        "{:.9},{:.9},{:.9},{:.9}",
        west,
        rect.south,
        west + width,
        rect.north
    )
}
