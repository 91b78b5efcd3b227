use std::fmt;

/// The finest pyramid level.
pub const MAX_LEVEL: u8 = 24;

/// The extent of a root tile in integer units, corresponding to 180 degrees.
pub const ROOT_SPAN: u32 = 1 << 30;

const DEGREES_PER_UNIT: f64 = 180.0 / ROOT_SPAN as f64;

/// Identifies a tile in the global pyramid.
///
/// The globe is covered by two root tiles at level 0, the western and the eastern hemisphere.
/// Every tile has four children on the next level, so a level `L` has `2^(L+1)` columns and
/// `2^L` rows. Row `0` is the southernmost one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId {
    level: u8,
    x: u32,
    y: u32,
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}/{}/{}", self.level, self.x, self.y)
    }
}

impl TileId {
    /// Creates the tile at column `x` and row `y` of `level`, if it exists.
    pub fn new(level: u8, x: u32, y: u32) -> Option<Self> {
        if level > MAX_LEVEL || x >= 2 << level || y >= 1 << level {
            return None;
        }
        Some(Self { level, x, y })
    }

    /// The two level 0 tiles, west first.
    pub fn roots() -> [Self; 2] {
        [
            Self {
                level: 0,
                x: 0,
                y: 0,
            },
            Self {
                level: 0,
                x: 1,
                y: 0,
            },
        ]
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    /// The extent of this tile in integer units, in both directions.
    pub fn span(&self) -> u32 {
        ROOT_SPAN >> self.level
    }

    /// The integer bounding box of this tile.
    pub fn bounds(&self) -> TileBounds {
        let span = self.span();
        TileBounds {
            lon0: self.x * span,
            lat0: self.y * span,
            lon1: (self.x + 1) * span,
            lat1: (self.y + 1) * span,
        }
    }

    /// The size of one texel in degrees, for tiles of `tile_size` pixels.
    pub fn pixel_size(&self, tile_size: u32) -> f64 {
        self.span() as f64 * DEGREES_PER_UNIT / tile_size as f64
    }

    pub fn parent(&self) -> Option<Self> {
        if self.level == 0 {
            return None;
        }
        Some(Self {
            level: self.level - 1,
            x: self.x >> 1,
            y: self.y >> 1,
        })
    }

    /// The four children, ordered by their quadrant digit.
    pub fn children(&self) -> Option<[Self; 4]> {
        if self.level >= MAX_LEVEL {
            return None;
        }
        let child = |quadrant: u32| Self {
            level: self.level + 1,
            x: (self.x << 1) | (quadrant & 1),
            y: (self.y << 1) | (quadrant >> 1),
        };
        Some([child(0), child(1), child(2), child(3)])
    }

    /// The quadtree path of this tile.
    ///
    /// The first digit selects the root tile, every following digit the quadrant
    /// (`x_bit + 2 * y_bit`) on the next level.
    pub fn pos_code(&self) -> String {
        let mut code = String::with_capacity(self.level as usize + 1);
        code.push(digit(self.x >> self.level));
        for l in (0..self.level).rev() {
            let quadrant = ((self.x >> l) & 1) + 2 * ((self.y >> l) & 1);
            code.push(digit(quadrant));
        }
        code
    }

    /// The position code split into directories of three digits, e.g. `012/301/2`.
    pub fn pos_path(&self) -> String {
        let code = self.pos_code();
        let mut path = String::with_capacity(code.len() + code.len() / 3);
        for (i, c) in code.chars().enumerate() {
            if i > 0 && i % 3 == 0 {
                path.push('/');
            }
            path.push(c);
        }
        path
    }

    /// Parses a position code as returned by [`pos_code`](Self::pos_code).
    pub fn from_pos_code(code: &str) -> Option<Self> {
        let mut digits = code.bytes();
        let root = match digits.next()? {
            b'0' => 0,
            b'1' => 1,
            _ => return None,
        };
        let (mut x, mut y, mut level) = (root, 0u32, 0u8);
        for d in digits {
            let quadrant = match d {
                b'0'..=b'3' => (d - b'0') as u32,
                _ => return None,
            };
            if level >= MAX_LEVEL {
                return None;
            }
            x = (x << 1) | (quadrant & 1);
            y = (y << 1) | (quadrant >> 1);
            level += 1;
        }
        Some(Self { level, x, y })
    }
}

fn digit(n: u32) -> char {
    char::from(b'0' + n as u8)
}

/// The bounding box of a tile in integer lon/lat units.
///
/// Longitudes run from `0` (180° W) to `2 * ROOT_SPAN` (180° E), latitudes from `0` (90° S)
/// to `ROOT_SPAN` (90° N).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileBounds {
    pub lon0: u32,
    pub lat0: u32,
    pub lon1: u32,
    pub lat1: u32,
}

impl TileBounds {
    /// Converts the bounds to degrees.
    pub fn to_degrees(&self) -> GeoRect {
        GeoRect {
            west: self.lon0 as f64 * DEGREES_PER_UNIT - 180.0,
            south: self.lat0 as f64 * DEGREES_PER_UNIT - 90.0,
            east: self.lon1 as f64 * DEGREES_PER_UNIT - 180.0,
            north: self.lat1 as f64 * DEGREES_PER_UNIT - 90.0,
        }
    }
}

/// A geographic rectangle in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoRect {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl GeoRect {
    pub fn width(&self) -> f64 {
        self.east - self.west
    }

    pub fn height(&self) -> f64 {
        self.north - self.south
    }

    pub fn intersects(&self, other: &GeoRect) -> bool {
        self.west < other.east
            && other.west < self.east
            && self.south < other.north
            && other.south < self.north
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_ranges() {
        assert!(TileId::new(0, 1, 0).is_some());
        assert!(TileId::new(0, 2, 0).is_none());
        assert!(TileId::new(0, 0, 1).is_none());
        assert!(TileId::new(3, 15, 7).is_some());
        assert!(TileId::new(3, 16, 7).is_none());
        assert!(TileId::new(MAX_LEVEL, (2 << MAX_LEVEL) - 1, 0).is_some());
        assert!(TileId::new(MAX_LEVEL + 1, 0, 0).is_none());
    }

    #[test]
    fn test_pos_code() {
        let tile = TileId::new(6, 0b1011001, 0b010110).unwrap();
        let code = tile.pos_code();
        assert_eq!(code, "1031221");
        assert_eq!(tile.pos_path(), "103/122/1");
        assert_eq!(TileId::from_pos_code(&code), Some(tile));

        let [west, east] = TileId::roots();
        assert_eq!(west.pos_code(), "0");
        assert_eq!(east.pos_path(), "1");

        assert_eq!(TileId::from_pos_code(""), None);
        assert_eq!(TileId::from_pos_code("2"), None);
        assert_eq!(TileId::from_pos_code("014"), None);
    }

    #[test]
    fn test_hierarchy() {
        let tile = TileId::new(2, 5, 3).unwrap();
        let children = tile.children().unwrap();
        for (quadrant, child) in children.iter().enumerate() {
            assert_eq!(child.parent(), Some(tile));
            assert!(child.pos_code().starts_with(&tile.pos_code()));
            assert!(child.pos_code().ends_with(&quadrant.to_string()));
        }
        assert_eq!(TileId::roots()[0].parent(), None);

        let deepest = TileId::new(MAX_LEVEL, 0, 0).unwrap();
        assert!(deepest.children().is_none());
    }

    #[test]
    fn test_bounds() {
        let [west, east] = TileId::roots();
        let rect = west.bounds().to_degrees();
        assert_eq!(
            rect,
            GeoRect {
                west: -180.0,
                south: -90.0,
                east: 0.0,
                north: 90.0
            }
        );
        assert_eq!(east.bounds().to_degrees().east, 180.0);

        let tile = TileId::new(1, 3, 1).unwrap();
        let rect = tile.bounds().to_degrees();
        assert_eq!((rect.west, rect.south), (90.0, 0.0));
        assert_eq!((rect.width(), rect.height()), (90.0, 90.0));

        assert_eq!(west.pixel_size(180), 1.0);
        assert_eq!(tile.pixel_size(180), 0.5);
    }
}
