//! Grid resolution on the Sentinel-2 MGRS tiling scheme
//!
//! HLS products are delivered on the Sentinel-2 tiling grid: 109.8 km
//! squares in the UTM zone of the tile, anchored on the MGRS 100 km grid and
//! overlapping their eastern and southern neighbours by 9.8 km. The
//! upper-left corner is snapped outward to a 60 m lattice, so 10SEG starts at
//! (499980, 4200000) rather than on the square boundary. This module
//! maps tile identifiers and query geometries onto that grid.
//!
//! # Example
//!
//! ```ignore
//! use hlsmosaic::coord::{resolve_geometry, resolve_tile, Geometry, Point};
//!
//! let tile = resolve_tile("10SEG", 30.0)?;
//! assert_eq!((tile.width, tile.height), (3660, 3660));
//!
//! let tiles = resolve_geometry(&Geometry::Point(Point::new(-122.8, 37.5)), 30.0)?;
//! ```

mod geometry;
mod types;
pub mod utm;

pub use geometry::{BoundingBox, Geometry, Point, Polygon};
pub use types::{
    GridResolutionError, Tile, TileId, UtmBounds, UtmZone, DEFAULT_RESOLUTION, GRID_SNAP_M,
    MAX_LAT, MIN_LAT, SQUARE_SIZE_M, TILE_EXTENT_M,
};

use std::collections::{BTreeMap, BTreeSet};

use geometry::ring_intersects_rect;
use types::BAND_LETTERS;

/// Column letter sets, cycling with the zone number.
const COLUMN_SETS: [&str; 3] = ["ABCDEFGH", "JKLMNPQR", "STUVWXYZ"];
/// Row letters; even zones start five letters in.
const ROW_LETTERS: &str = "ABCDEFGHJKLMNPQRSTUV";
/// Northing period of the row lettering.
const ROW_CYCLE_M: f64 = 2_000_000.0;
/// Tiles must reach within this many degrees of the zone's 6-degree span.
const ZONE_MARGIN_DEG: f64 = 0.25;
/// Spacing of the sample lattice used to seed candidates for areal geometries.
const SAMPLE_STEP_DEG: f64 = 0.5;

/// Builds a [`Tile`] from an identifier string.
///
/// # Arguments
///
/// * `id` - Tile identifier such as `10SEG` (an optional leading `T` is accepted)
/// * `resolution` - Pixel size in metres; must divide 109,800 m exactly
///
/// # Returns
///
/// The tile with its CRS and pixel grid, or a `GridResolutionError` when the
/// identifier is malformed or names a square that does not exist.
pub fn resolve_tile(id: &str, resolution: f64) -> Result<Tile, GridResolutionError> {
    let id: TileId = id.parse()?;
    tile_for_id(id, resolution)
}

/// Builds a [`Tile`] from a parsed identifier.
pub fn tile_for_id(id: TileId, resolution: f64) -> Result<Tile, GridResolutionError> {
    let pixels = pixels_per_side(resolution)?;
    let crs = UtmZone::new(id.zone(), id.is_north())?;
    let (easting, northing) = square_origin(&id, crs)?;
    let (origin_x, origin_y) = snap_corner(easting, northing + SQUARE_SIZE_M);

    Ok(Tile {
        id,
        crs,
        resolution,
        origin_x,
        origin_y,
        width: pixels,
        height: pixels,
    })
}

/// Returns every tile whose footprint intersects the geometry.
///
/// Tiles overlap their neighbours by 9.8 km, so a point may resolve to
/// several tiles. Squares straddling a latitude band boundary are returned
/// under both band letters. Output is sorted by tile id.
///
/// # Errors
///
/// * `InvalidCoordinate` / `EmptyGeometry` for malformed input
/// * `OutsideCoverage` when no part of the geometry lies within 80S..84N
/// * `InvalidResolution` when `resolution` does not divide the tile extent
pub fn resolve_geometry(
    geometry: &Geometry,
    resolution: f64,
) -> Result<Vec<Tile>, GridResolutionError> {
    geometry.validate()?;
    pixels_per_side(resolution)?;

    let bbox = geometry.bbox();
    if bbox.north < MIN_LAT || bbox.south > MAX_LAT {
        return Err(GridResolutionError::OutsideCoverage);
    }

    let vertices = geometry.vertices();
    let mut tiles: BTreeMap<TileId, Tile> = BTreeMap::new();

    for (zone, column, row) in candidate_squares(geometry) {
        for id in tile_ids_for_square(zone, column, row) {
            let Ok(tile) = tile_for_id(id, resolution) else {
                continue;
            };
            // Band letter must select the same square.
            let top = (row + 1) as f64 * SQUARE_SIZE_M;
            if (tile.origin_y - top).abs() >= GRID_SNAP_M {
                continue;
            }
            if intersects(&tile, geometry, &vertices) {
                tiles.insert(id, tile);
            }
        }
    }

    if tiles.is_empty() {
        return Err(GridResolutionError::OutsideCoverage);
    }

    Ok(tiles.into_values().collect())
}

/// Number of pixels per tile side at the given resolution.
fn pixels_per_side(resolution: f64) -> Result<usize, GridResolutionError> {
    if !resolution.is_finite() || resolution <= 0.0 {
        return Err(GridResolutionError::InvalidResolution(resolution));
    }
    let n = TILE_EXTENT_M / resolution;
    if n < 1.0 || (n - n.round()).abs() > 1e-6 {
        return Err(GridResolutionError::InvalidResolution(resolution));
    }
    Ok(n.round() as usize)
}

/// Upper-left corner snapped outward onto the published 60 m lattice.
fn snap_corner(x: f64, y: f64) -> (f64, f64) {
    (
        (x / GRID_SNAP_M).floor() * GRID_SNAP_M,
        (y / GRID_SNAP_M).ceil() * GRID_SNAP_M,
    )
}

/// Latitude range of an MGRS band letter.
fn band_range(band: char) -> Option<(f64, f64)> {
    let idx = BAND_LETTERS.find(band)?;
    let min = MIN_LAT + 8.0 * idx as f64;
    let max = if band == 'X' { MAX_LAT } else { min + 8.0 };
    Some((min, max))
}

fn row_offset(zone: u8) -> usize {
    if zone % 2 == 0 {
        5
    } else {
        0
    }
}

/// South-west corner of the 100 km square named by a tile id.
fn square_origin(id: &TileId, crs: UtmZone) -> Result<(f64, f64), GridResolutionError> {
    let nonexistent = || GridResolutionError::NonexistentTile(id.to_string());

    let set = COLUMN_SETS[(id.zone() as usize - 1) % 3];
    let column = set.find(id.column()).ok_or_else(nonexistent)?;
    let easting = (column as f64 + 1.0) * SQUARE_SIZE_M;

    let row_pos = ROW_LETTERS.find(id.row()).ok_or_else(nonexistent)?;
    let row_index = (row_pos + ROW_LETTERS.len() - row_offset(id.zone())) % ROW_LETTERS.len();

    let (lat_min, lat_max) = band_range(id.band()).ok_or_else(nonexistent)?;
    let cm = crs.central_meridian();
    let mut n_min = f64::INFINITY;
    let mut n_max = f64::NEG_INFINITY;
    for lat in [lat_min, lat_max] {
        for lon in [cm, cm + 3.0] {
            let (_, n) = utm::forward(crs, lat, lon);
            n_min = n_min.min(n);
            n_max = n_max.max(n);
        }
    }

    let northing = (0..6)
        .map(|k| row_index as f64 * SQUARE_SIZE_M + k as f64 * ROW_CYCLE_M)
        .find(|&n| n < n_max && n + SQUARE_SIZE_M > n_min)
        .ok_or_else(nonexistent)?;

    // Nearest footprint edge to the central meridian must fall inside the zone.
    let near_x = 500_000.0_f64.clamp(easting, easting + TILE_EXTENT_M);
    let (_, near_lon) = utm::inverse(crs, near_x, northing + SQUARE_SIZE_M / 2.0);
    let mut offset = (near_lon - cm).abs();
    if offset > 180.0 {
        offset = 360.0 - offset;
    }
    if offset > 3.0 + ZONE_MARGIN_DEG {
        return Err(nonexistent());
    }

    Ok((easting, northing))
}

/// Tile ids for a 100 km square, one per latitude band it touches.
fn tile_ids_for_square(zone: UtmZone, column: i64, row: i64) -> Vec<TileId> {
    if !(1..=8).contains(&column) || row < 0 {
        return Vec::new();
    }
    let set = COLUMN_SETS[(zone.zone as usize - 1) % 3];
    let Some(column_letter) = set.chars().nth(column as usize - 1) else {
        return Vec::new();
    };
    let row_idx = (row as usize + row_offset(zone.zone)) % ROW_LETTERS.len();
    let Some(row_letter) = ROW_LETTERS.chars().nth(row_idx) else {
        return Vec::new();
    };

    let e0 = column as f64 * SQUARE_SIZE_M;
    let n0 = row as f64 * SQUARE_SIZE_M;
    let mut lat_lo = f64::INFINITY;
    let mut lat_hi = f64::NEG_INFINITY;
    for &(x, y) in &[
        (e0, n0),
        (e0 + SQUARE_SIZE_M, n0),
        (e0, n0 + SQUARE_SIZE_M),
        (e0 + SQUARE_SIZE_M, n0 + SQUARE_SIZE_M),
        (500_000.0, n0),
        (500_000.0, n0 + SQUARE_SIZE_M),
    ] {
        let (lat, _) = utm::inverse(zone, x, y);
        lat_lo = lat_lo.min(lat);
        lat_hi = lat_hi.max(lat);
    }

    BAND_LETTERS
        .chars()
        .filter(|&band| (band >= 'N') == zone.north)
        .filter(|&band| {
            band_range(band)
                .map(|(min, max)| min < lat_hi && max > lat_lo)
                .unwrap_or(false)
        })
        .map(|band| TileId::from_parts(zone.zone, band, column_letter, row_letter))
        .collect()
}

/// Seeds candidate 100 km squares (zone, column, row) around the geometry.
fn candidate_squares(geometry: &Geometry) -> BTreeSet<(UtmZone, i64, i64)> {
    let mut samples = geometry.vertices();

    if geometry.is_areal() {
        let bbox = geometry.bbox();
        let south = bbox.south.max(MIN_LAT);
        let north = bbox.north.min(MAX_LAT);
        let lat_steps = ((north - south) / SAMPLE_STEP_DEG).ceil().max(0.0) as usize;
        let lon_steps = ((bbox.east - bbox.west) / SAMPLE_STEP_DEG).ceil().max(0.0) as usize;
        for i in 0..=lat_steps {
            let lat = (south + i as f64 * SAMPLE_STEP_DEG).min(north);
            for j in 0..=lon_steps {
                let lon = (bbox.west + j as f64 * SAMPLE_STEP_DEG).min(bbox.east);
                samples.push(Point::new(lon, lat));
            }
        }
    }

    let mut squares = BTreeSet::new();
    for p in samples {
        let lat = p.lat.clamp(MIN_LAT, MAX_LAT);
        let mut hemispheres = vec![lat >= 0.0];
        if lat.abs() < 1.0 {
            hemispheres.push(lat < 0.0);
        }
        for north in hemispheres {
            let base = UtmZone::for_lon(p.lon, north);
            for dz in -1..=1 {
                let zone = base.offset(dz);
                let (e, n) = utm::forward(zone, lat, p.lon);
                let column = (e / SQUARE_SIZE_M).floor() as i64;
                let row = (n / SQUARE_SIZE_M).floor() as i64;
                for dc in -1..=1 {
                    for dr in -1..=1 {
                        squares.insert((zone, column + dc, row + dr));
                    }
                }
            }
        }
    }
    squares
}

/// Exact intersection of the geometry with the tile footprint in tile CRS.
fn intersects(tile: &Tile, geometry: &Geometry, vertices: &[Point]) -> bool {
    let b = tile.bounds();
    let projected: Vec<(f64, f64)> = vertices
        .iter()
        .map(|p| utm::forward(tile.crs, p.lat, p.lon))
        .collect();

    if geometry.is_areal() {
        ring_intersects_rect(&projected, (b.min_x, b.min_y, b.max_x, b.max_y))
    } else {
        projected.iter().any(|&(x, y)| b.contains(x, y))
    }
}
