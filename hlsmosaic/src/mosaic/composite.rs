//! Cross-tile composites for areal queries
//!
//! A bounding box or polygon usually resolves to several overlapping tiles,
//! each mosaicked on its own grid and possibly in its own UTM zone. A
//! [`Composite`] resamples those per-tile mosaics onto a single
//! [`RegionGrid`] covering the query's bounding box and clips to it. Tiles
//! are visited in id order and the first valid pixel wins.

use chrono::NaiveDate;
use rayon::prelude::*;
use tracing::{debug, warn};

use super::{Mosaic, MOSAIC_NODATA, NO_SOURCE};
use crate::coord::{utm, BoundingBox, GridResolutionError, UtmZone};
use crate::raster::{self, GeoRaster, RasterError};

/// Points sampled along each bounding-box edge when projecting it.
const EDGE_SAMPLES: usize = 16;

/// North-up pixel grid over a geographic bounding box.
///
/// The CRS is the UTM zone of the box centre. Corners snap outward to
/// multiples of the resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionGrid {
    /// Clip extent.
    pub bbox: BoundingBox,
    pub crs: UtmZone,
    pub resolution: f64,
    pub origin_x: f64,
    pub origin_y: f64,
    pub width: usize,
    pub height: usize,
}

impl RegionGrid {
    /// Builds the grid covering `bbox` at `resolution` metres.
    pub fn for_bbox(bbox: BoundingBox, resolution: f64) -> Result<Self, GridResolutionError> {
        if !resolution.is_finite() || resolution <= 0.0 {
            return Err(GridResolutionError::InvalidResolution(resolution));
        }
        if !(bbox.east > bbox.west && bbox.north > bbox.south) {
            return Err(GridResolutionError::EmptyGeometry);
        }

        let centre_lat = (bbox.south + bbox.north) / 2.0;
        let centre_lon = (bbox.west + bbox.east) / 2.0;
        let crs = UtmZone::for_lon(centre_lon, centre_lat >= 0.0);

        let mut min_x = f64::INFINITY;
        let mut min_y = f64::INFINITY;
        let mut max_x = f64::NEG_INFINITY;
        let mut max_y = f64::NEG_INFINITY;
        for i in 0..=EDGE_SAMPLES {
            let t = i as f64 / EDGE_SAMPLES as f64;
            let lon = bbox.west + t * (bbox.east - bbox.west);
            let lat = bbox.south + t * (bbox.north - bbox.south);
            for (lat, lon) in [
                (bbox.south, lon),
                (bbox.north, lon),
                (lat, bbox.west),
                (lat, bbox.east),
            ] {
                let (x, y) = utm::forward(crs, lat, lon);
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }

        let origin_x = (min_x / resolution).floor() * resolution;
        let origin_y = (max_y / resolution).ceil() * resolution;
        let width = (((max_x - origin_x) / resolution).ceil() as usize).max(1);
        let height = (((origin_y - min_y) / resolution).ceil() as usize).max(1);

        Ok(Self {
            bbox,
            crs,
            resolution,
            origin_x,
            origin_y,
            width,
            height,
        })
    }

    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }

    #[inline]
    pub fn pixel_center(&self, row: usize, col: usize) -> (f64, f64) {
        (
            self.origin_x + (col as f64 + 0.5) * self.resolution,
            self.origin_y - (row as f64 + 0.5) * self.resolution,
        )
    }

    /// Returns true if a projected coordinate falls inside the clip extent.
    #[inline]
    pub fn clips_in(&self, x: f64, y: f64) -> bool {
        let (lat, lon) = utm::inverse(self.crs, x, y);
        lon >= self.bbox.west
            && lon <= self.bbox.east
            && lat >= self.bbox.south
            && lat <= self.bbox.north
    }
}

/// One (date, band) raster combining every tile of an areal query.
#[derive(Debug, Clone, PartialEq)]
pub struct Composite {
    pub grid: RegionGrid,
    pub date: NaiveDate,
    pub band: String,
    /// Pixel values, row-major on the region grid.
    pub data: Vec<f32>,
    /// Index into `sources` per pixel, or [`NO_SOURCE`].
    pub provenance: Vec<u16>,
    /// Contributor granule ids, grouped by tile in id order.
    pub sources: Vec<String>,
}

impl Composite {
    /// Resamples per-tile mosaics of one date and band onto `grid`.
    ///
    /// CPU-bound; call from a blocking context.
    pub fn build(grid: &RegionGrid, date: NaiveDate, band: &str, mosaics: &[&Mosaic]) -> Self {
        let mut ordered: Vec<&Mosaic> = mosaics.to_vec();
        ordered.sort_by_key(|m| m.tile.id);

        let mut layers: Vec<(&Mosaic, u16)> = Vec::with_capacity(ordered.len());
        let mut sources = Vec::new();
        for mosaic in ordered {
            if sources.len() + mosaic.sources.len() >= NO_SOURCE as usize {
                warn!(tile = %mosaic.tile.id, "Too many contributors, ignoring remaining tiles");
                break;
            }
            layers.push((mosaic, sources.len() as u16));
            sources.extend(mosaic.sources.iter().cloned());
        }

        let mut composite = Self {
            grid: grid.clone(),
            date,
            band: band.to_string(),
            data: vec![MOSAIC_NODATA; grid.pixel_count()],
            provenance: vec![NO_SOURCE; grid.pixel_count()],
            sources,
        };

        let width = grid.width;
        composite
            .data
            .par_chunks_mut(width)
            .zip(composite.provenance.par_chunks_mut(width))
            .enumerate()
            .for_each(|(row, (values, provenance))| {
                for col in 0..width {
                    let (x, y) = grid.pixel_center(row, col);
                    if !grid.clips_in(x, y) {
                        continue;
                    }
                    for (mosaic, offset) in &layers {
                        let tile = &mosaic.tile;
                        let (tx, ty) = if tile.crs == grid.crs {
                            (x, y)
                        } else {
                            utm::transform(grid.crs, tile.crs, x, y)
                        };
                        let Some((r, c)) = tile.pixel_at(tx, ty) else {
                            continue;
                        };
                        let i = r * tile.width + c;
                        let p = mosaic.provenance[i];
                        if p == NO_SOURCE {
                            continue;
                        }
                        values[col] = mosaic.data[i];
                        provenance[col] = offset + p;
                        break;
                    }
                }
            });

        debug!(
            date = %date,
            band,
            tiles = layers.len(),
            valid = composite.valid_pixels(),
            "Built cross-tile composite"
        );
        composite
    }

    /// Number of pixels with a value.
    pub fn valid_pixels(&self) -> usize {
        self.provenance.iter().filter(|&&p| p != NO_SOURCE).count()
    }

    /// Value at a pixel, `None` for nodata.
    pub fn value(&self, row: usize, col: usize) -> Option<f32> {
        let i = row * self.grid.width + col;
        (self.provenance.get(i).copied()? != NO_SOURCE).then(|| self.data[i])
    }

    /// Granule id that supplied a pixel.
    pub fn source_at(&self, row: usize, col: usize) -> Option<&str> {
        let p = *self.provenance.get(row * self.grid.width + col)?;
        self.sources.get(p as usize).map(String::as_str)
    }

    /// Output file name: `HLS_<band>_<YYYYMMDD>.tif`.
    pub fn file_name(&self) -> String {
        format!("HLS_{}_{}.tif", self.band, self.date.format("%Y%m%d"))
    }

    pub fn to_raster(&self) -> GeoRaster {
        GeoRaster {
            width: self.grid.width,
            height: self.grid.height,
            origin_x: self.grid.origin_x,
            origin_y: self.grid.origin_y,
            pixel_width: self.grid.resolution,
            pixel_height: self.grid.resolution,
            epsg: self.grid.crs.epsg(),
            nodata: Some(MOSAIC_NODATA as f64),
            data: self.data.clone(),
        }
    }

    /// Encodes the composite as a GeoTIFF.
    pub fn encode(&self) -> Result<Vec<u8>, RasterError> {
        raster::encode(&self.to_raster())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{resolve_tile, Tile};
    use crate::granule::{scaling_for, SourceCollection};
    use crate::mosaic::{Contributor, MosaicAssembler};
    use std::sync::Arc;

    const RESOLUTION: f64 = 1830.0;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 6, 1).unwrap()
    }

    /// Mosaic of a tile filled with one raw value from a single granule.
    fn uniform(tile: &Tile, granule: &str, value: f32) -> Mosaic {
        let raster = GeoRaster::new(
            tile.width,
            tile.height,
            (tile.origin_x, tile.origin_y),
            (tile.resolution, tile.resolution),
            tile.epsg(),
            Some(-9999.0),
            vec![value; tile.pixel_count()],
        )
        .unwrap();
        let contributor = Contributor::new(
            granule,
            SourceCollection::S30,
            Arc::new(raster),
            None,
            scaling_for("B04", SourceCollection::S30),
        )
        .unwrap();
        MosaicAssembler::new()
            .with_apply_scale(false)
            .assemble(tile, date(), "red", &[contributor])
    }

    /// Spans 10SEG and 10SFG; the eastern part lies only in 10SFG.
    fn bbox() -> BoundingBox {
        BoundingBox::new(-122.5, 37.3, -121.0, 37.6)
    }

    #[test]
    fn test_region_grid_covers_bbox() {
        let grid = RegionGrid::for_bbox(bbox(), 30.0).unwrap();
        assert_eq!(grid.crs.epsg(), 32610);
        assert_eq!(grid.origin_x % 30.0, 0.0);
        assert_eq!(grid.origin_y % 30.0, 0.0);

        let max_x = grid.origin_x + grid.width as f64 * 30.0;
        let min_y = grid.origin_y - grid.height as f64 * 30.0;
        for (lon, lat) in [(-122.5, 37.3), (-121.0, 37.3), (-121.0, 37.6), (-122.5, 37.6)] {
            let (x, y) = utm::forward(grid.crs, lat, lon);
            assert!(x >= grid.origin_x && x <= max_x, "{} {}", lon, lat);
            assert!(y >= min_y && y <= grid.origin_y, "{} {}", lon, lat);
        }
        assert!(grid.width > grid.height);
    }

    #[test]
    fn test_region_grid_rejects_degenerate_bbox() {
        let flat = BoundingBox::new(-122.0, 37.0, -122.0, 37.5);
        assert_eq!(
            RegionGrid::for_bbox(flat, 30.0),
            Err(GridResolutionError::EmptyGeometry)
        );
        assert!(RegionGrid::for_bbox(bbox(), 0.0).is_err());
    }

    #[test]
    fn test_tiles_fill_region_in_id_order() {
        let seg = resolve_tile("10SEG", RESOLUTION).unwrap();
        let sfg = resolve_tile("10SFG", RESOLUTION).unwrap();
        let west = uniform(&seg, "west", 100.0);
        let east = uniform(&sfg, "east", 200.0);
        let grid = RegionGrid::for_bbox(bbox(), RESOLUTION).unwrap();

        // Input order must not matter.
        let composite = Composite::build(&grid, date(), "red", &[&east, &west]);

        assert_eq!(composite.sources, vec!["west", "east"]);
        let row = grid.height / 2;
        let first = (0..grid.width).find(|&c| composite.value(row, c).is_some()).unwrap();
        let last = (0..grid.width).rev().find(|&c| composite.value(row, c).is_some()).unwrap();
        assert_eq!(composite.source_at(row, first), Some("west"));
        assert_eq!(composite.value(row, first), Some(100.0));
        assert_eq!(composite.source_at(row, last), Some("east"));

        // Overlap strip goes to the lower tile id.
        let overlap_col = (0..grid.width)
            .find(|&c| {
                let (x, _) = grid.pixel_center(row, c);
                x > sfg.origin_x + RESOLUTION && x < seg.bounds().max_x - RESOLUTION
            })
            .unwrap();
        assert_eq!(composite.source_at(row, overlap_col), Some("west"));
    }

    #[test]
    fn test_pixels_outside_bbox_are_clipped() {
        let seg = resolve_tile("10SEG", RESOLUTION).unwrap();
        let small = BoundingBox::new(-122.6, 37.4, -122.4, 37.5);
        let grid = RegionGrid::for_bbox(small, RESOLUTION).unwrap();
        let composite = Composite::build(&grid, date(), "red", &[&uniform(&seg, "g", 1.0)]);

        for row in 0..grid.height {
            for col in 0..grid.width {
                let (x, y) = grid.pixel_center(row, col);
                assert_eq!(composite.value(row, col).is_some(), grid.clips_in(x, y));
            }
        }
        assert!(composite.valid_pixels() > 0);
    }

    #[test]
    fn test_file_name_has_no_tile() {
        let grid = RegionGrid::for_bbox(bbox(), RESOLUTION).unwrap();
        let composite = Composite::build(&grid, date(), "NIR", &[]);
        assert_eq!(composite.file_name(), "HLS_NIR_20210601.tif");
        assert_eq!(composite.valid_pixels(), 0);
        assert_eq!(composite.to_raster().epsg, 32610);
    }
}
