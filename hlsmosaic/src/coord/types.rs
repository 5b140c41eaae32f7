//! Types for the Sentinel-2 MGRS tiling grid.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::geometry::{BoundingBox, Point, Polygon};
use super::utm;

/// Southern limit of grid coverage (degrees).
pub const MIN_LAT: f64 = -80.0;
/// Northern limit of grid coverage (degrees).
pub const MAX_LAT: f64 = 84.0;
/// Side length of a Sentinel-2 tile in metres (100 km square plus 9.8 km overlap).
pub const TILE_EXTENT_M: f64 = 109_800.0;
/// Side length of an MGRS 100 km grid square in metres.
pub const SQUARE_SIZE_M: f64 = 100_000.0;
/// Native HLS pixel size in metres.
pub const DEFAULT_RESOLUTION: f64 = 30.0;
/// Lattice the published tile corners are snapped to (the coarsest Sentinel-2 band).
pub const GRID_SNAP_M: f64 = 60.0;

/// MGRS latitude band letters from 80S northwards, 8 degrees each (X spans 12).
pub(crate) const BAND_LETTERS: &str = "CDEFGHJKLMNPQRSTUVWX";

/// Errors from resolving geometries or identifiers onto the tiling grid.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GridResolutionError {
    #[error("invalid coordinate: lon={lon}, lat={lat}")]
    InvalidCoordinate { lon: f64, lat: f64 },

    #[error("geometry lies entirely outside grid coverage ({MIN_LAT}..{MAX_LAT} latitude)")]
    OutsideCoverage,

    #[error("geometry is empty or degenerate")]
    EmptyGeometry,

    #[error("malformed tile id '{0}'")]
    MalformedTileId(String),

    #[error("tile '{0}' does not exist in the grid")]
    NonexistentTile(String),

    #[error("invalid UTM zone {0} (expected 1..=60)")]
    InvalidZone(u8),

    #[error("resolution {0} m does not divide the {TILE_EXTENT_M} m tile extent")]
    InvalidResolution(f64),
}

/// A UTM zone and hemisphere on WGS84.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UtmZone {
    /// Zone number (1-60).
    pub zone: u8,
    /// True for the northern hemisphere (EPSG 326xx).
    pub north: bool,
}

impl UtmZone {
    /// Creates a zone, validating the zone number.
    pub fn new(zone: u8, north: bool) -> Result<Self, GridResolutionError> {
        if !(1..=60).contains(&zone) {
            return Err(GridResolutionError::InvalidZone(zone));
        }
        Ok(Self { zone, north })
    }

    /// Standard 6-degree zone containing a longitude.
    pub fn for_lon(lon: f64, north: bool) -> Self {
        let zone = (((lon + 180.0) / 6.0).floor() as i32).rem_euclid(60) + 1;
        Self {
            zone: zone as u8,
            north,
        }
    }

    /// Longitude of the central meridian in degrees.
    pub fn central_meridian(&self) -> f64 {
        (self.zone as f64 - 1.0) * 6.0 - 180.0 + 3.0
    }

    /// EPSG code of the WGS84 / UTM CRS.
    pub fn epsg(&self) -> u16 {
        if self.north {
            32600 + self.zone as u16
        } else {
            32700 + self.zone as u16
        }
    }

    /// Parses a WGS84 / UTM EPSG code (326xx or 327xx).
    pub fn from_epsg(code: u16) -> Option<Self> {
        let (north, zone) = match code {
            32601..=32660 => (true, code - 32600),
            32701..=32760 => (false, code - 32700),
            _ => return None,
        };
        Some(Self {
            zone: zone as u8,
            north,
        })
    }

    /// Neighbouring zone, wrapping across the antimeridian.
    pub(crate) fn offset(&self, delta: i32) -> Self {
        let zone = (self.zone as i32 - 1 + delta).rem_euclid(60) + 1;
        Self {
            zone: zone as u8,
            north: self.north,
        }
    }
}

impl fmt::Display for UtmZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

/// Identifier of a Sentinel-2 tile, e.g. `10SEG`.
///
/// Ordering matches the lexical order of the canonical string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileId {
    zone: u8,
    band: char,
    column: char,
    row: char,
}

impl TileId {
    pub(crate) fn from_parts(zone: u8, band: char, column: char, row: char) -> Self {
        Self {
            zone,
            band,
            column,
            row,
        }
    }

    /// UTM zone number.
    pub fn zone(&self) -> u8 {
        self.zone
    }

    /// Latitude band letter.
    pub fn band(&self) -> char {
        self.band
    }

    /// 100 km square column letter.
    pub fn column(&self) -> char {
        self.column
    }

    /// 100 km square row letter.
    pub fn row(&self) -> char {
        self.row
    }

    /// True if the latitude band lies in the northern hemisphere.
    pub fn is_north(&self) -> bool {
        self.band >= 'N'
    }
}

impl FromStr for TileId {
    type Err = GridResolutionError;

    /// Parses `10SEG`, `T10SEG` or `1CDE`; letters are case-insensitive.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || GridResolutionError::MalformedTileId(s.to_string());

        let trimmed = s.trim().to_ascii_uppercase();
        let body = match trimmed.strip_prefix('T') {
            Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => rest,
            _ => trimmed.as_str(),
        };

        let digits: String = body.chars().take_while(|c| c.is_ascii_digit()).collect();
        let letters: Vec<char> = body[digits.len()..].chars().collect();
        if digits.is_empty() || digits.len() > 2 || letters.len() != 3 {
            return Err(malformed());
        }

        let zone: u8 = digits.parse().map_err(|_| malformed())?;
        if !(1..=60).contains(&zone) {
            return Err(GridResolutionError::InvalidZone(zone));
        }

        let (band, column, row) = (letters[0], letters[1], letters[2]);
        if !BAND_LETTERS.contains(band) || !column.is_ascii_uppercase() || !row.is_ascii_uppercase()
        {
            return Err(malformed());
        }

        Ok(Self::from_parts(zone, band, column, row))
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}{}{}{}", self.zone, self.band, self.column, self.row)
    }
}

/// Projected extent in metres.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtmBounds {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl UtmBounds {
    /// Returns true if the point lies inside or on the boundary.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }
}

/// A resolved tile: identifier, CRS and pixel grid.
///
/// The grid origin is the upper-left corner; rows run south, columns east.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    pub id: TileId,
    pub crs: UtmZone,
    /// Pixel size in metres.
    pub resolution: f64,
    /// Upper-left corner easting.
    pub origin_x: f64,
    /// Upper-left corner northing.
    pub origin_y: f64,
    pub width: usize,
    pub height: usize,
}

impl Tile {
    /// EPSG code of the tile CRS.
    pub fn epsg(&self) -> u16 {
        self.crs.epsg()
    }

    /// Projected bounds of the tile.
    pub fn bounds(&self) -> UtmBounds {
        UtmBounds {
            min_x: self.origin_x,
            min_y: self.origin_y - self.height as f64 * self.resolution,
            max_x: self.origin_x + self.width as f64 * self.resolution,
            max_y: self.origin_y,
        }
    }

    /// Projected coordinate of a pixel centre.
    #[inline]
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.resolution,
            self.origin_y - (row as f64 + 0.5) * self.resolution,
        )
    }

    /// Pixel `(row, col)` containing a projected coordinate, if inside the grid.
    #[inline]
    pub fn pixel_at(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let col = ((x - self.origin_x) / self.resolution).floor();
        let row = ((self.origin_y - y) / self.resolution).floor();
        if col < 0.0 || row < 0.0 || col >= self.width as f64 || row >= self.height as f64 {
            return None;
        }
        Some((row as usize, col as usize))
    }

    /// Number of pixels in the tile grid.
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    /// Footprint as a geographic polygon (corners and edge midpoints).
    pub fn footprint(&self) -> Polygon {
        let b = self.bounds();
        let mid_x = (b.min_x + b.max_x) / 2.0;
        let mid_y = (b.min_y + b.max_y) / 2.0;
        let ring = [
            (b.min_x, b.max_y),
            (mid_x, b.max_y),
            (b.max_x, b.max_y),
            (b.max_x, mid_y),
            (b.max_x, b.min_y),
            (mid_x, b.min_y),
            (b.min_x, b.min_y),
            (b.min_x, mid_y),
        ]
        .iter()
        .map(|&(x, y)| {
            let (lat, lon) = utm::inverse(self.crs, x, y);
            Point::new(lon, lat)
        })
        .collect();
        Polygon::new(ring)
    }

    /// Geographic bounding box of the footprint.
    pub fn lonlat_bbox(&self) -> BoundingBox {
        self.footprint().bbox()
    }
}

impl fmt::Display for Tile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, {}x{} @ {} m)",
            self.id, self.crs, self.width, self.height, self.resolution
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tile_id() {
        let id: TileId = "10SEG".parse().unwrap();
        assert_eq!(id.zone(), 10);
        assert_eq!(id.band(), 'S');
        assert_eq!(id.column(), 'E');
        assert_eq!(id.row(), 'G');
        assert!(id.is_north());
        assert_eq!(id.to_string(), "10SEG");
    }

    #[test]
    fn test_parse_tile_id_with_prefix_and_lowercase() {
        let id: TileId = "t10seg".parse().unwrap();
        assert_eq!(id.to_string(), "10SEG");
    }

    #[test]
    fn test_parse_single_digit_zone_is_padded() {
        let id: TileId = "1CDE".parse().unwrap();
        assert_eq!(id.to_string(), "01CDE");
        assert!(!id.is_north());
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "10SE", "10SEGX", "ABCDE", "10IEG", "10S1G", "123ABC"] {
            assert!(bad.parse::<TileId>().is_err(), "{} should fail", bad);
        }
        assert_eq!(
            "61SEG".parse::<TileId>(),
            Err(GridResolutionError::InvalidZone(61))
        );
    }

    #[test]
    fn test_tile_id_ordering_matches_string() {
        let mut ids: Vec<TileId> = ["10SEG", "09SEG", "10SEF", "10TEG"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        ids.sort();
        let strings: Vec<String> = ids.iter().map(|i| i.to_string()).collect();
        let mut sorted = strings.clone();
        sorted.sort();
        assert_eq!(strings, sorted);
    }

    #[test]
    fn test_epsg_codes() {
        assert_eq!(UtmZone::new(10, true).unwrap().epsg(), 32610);
        assert_eq!(UtmZone::new(55, false).unwrap().epsg(), 32755);
        assert_eq!(UtmZone::from_epsg(32610), Some(UtmZone::new(10, true).unwrap()));
        assert_eq!(UtmZone::from_epsg(4326), None);
    }

    #[test]
    fn test_zone_for_lon() {
        assert_eq!(UtmZone::for_lon(-122.5, true).zone, 10);
        assert_eq!(UtmZone::for_lon(-180.0, true).zone, 1);
        assert_eq!(UtmZone::for_lon(179.9, true).zone, 60);
        assert_eq!(UtmZone::for_lon(180.0, true).zone, 1);
    }

    #[test]
    fn test_zone_offset_wraps() {
        let z = UtmZone::new(60, true).unwrap();
        assert_eq!(z.offset(1).zone, 1);
        assert_eq!(UtmZone::new(1, true).unwrap().offset(-1).zone, 60);
    }

    #[test]
    fn test_pixel_at() {
        let tile = Tile {
            id: "10SEG".parse().unwrap(),
            crs: UtmZone::new(10, true).unwrap(),
            resolution: 30.0,
            origin_x: 499_980.0,
            origin_y: 4_200_000.0,
            width: 4,
            height: 4,
        };
        assert_eq!(tile.pixel_at(499_980.0, 4_200_000.0), Some((0, 0)));
        assert_eq!(tile.pixel_at(500_095.0, 4_199_905.0), Some((3, 3)));
        assert_eq!(tile.pixel_at(500_100.0, 4_199_990.0), None);
        assert_eq!(tile.pixel_at(499_979.0, 4_199_990.0), None);
        let (x, y) = tile.pixel_center(2, 1);
        assert_eq!(tile.pixel_at(x, y), Some((2, 1)));
    }

    #[test]
    fn test_invalid_zone() {
        assert_eq!(UtmZone::new(0, true), Err(GridResolutionError::InvalidZone(0)));
    }
}
