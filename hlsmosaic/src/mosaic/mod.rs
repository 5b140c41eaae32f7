//! Mosaic assembly onto the tile grid
//!
//! A [`Mosaic`] is one raster per (tile, date, band). Each contributor's band
//! raster is reprojected onto the tile grid by mapping tile pixel centres into
//! the contributor's CRS and sampling there. Pixels are composited
//! best-available-first: a pixel takes the value of the first contributor, in
//! priority order, whose sample is valid; there is no blending. The
//! provenance map records which contributor supplied each pixel.
//!
//! Areal queries additionally combine their per-tile mosaics into one
//! [`Composite`] per date and band on a [`RegionGrid`].
//!
//! # Example
//!
//! ```ignore
//! use hlsmosaic::mosaic::{Contributor, MosaicAssembler};
//!
//! let assembler = MosaicAssembler::new().with_resampling(Resampling::Bilinear);
//! let mosaic = assembler.assemble(&tile, date, "red", &contributors);
//! if let Err(e) = mosaic.completeness() {
//!     tracing::warn!("{}", e);
//! }
//! ```

mod composite;

pub use composite::{Composite, RegionGrid};

use std::sync::Arc;

use chrono::NaiveDate;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, warn};

use crate::coord::{utm, Tile, TileId, UtmZone};
use crate::granule::{BandScaling, SourceCollection, SOURCE_NODATA};
use crate::raster::{self, GeoRaster, RasterError, Resampling};

/// Provenance value for pixels no contributor supplied.
pub const NO_SOURCE: u16 = u16::MAX;

/// Nodata value of mosaic pixels.
pub const MOSAIC_NODATA: f32 = SOURCE_NODATA as f32;

/// Default Fmask bits treated as unusable: cirrus, cloud, adjacent cloud,
/// cloud shadow.
pub const DEFAULT_MASK_BITS: u8 = 0b0000_1111;

/// Fmask fill value.
const FMASK_FILL: u8 = 255;

/// A mosaic had no valid pixel at all.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("no valid pixels for {band} on {tile} {date} from {contributors} contributor(s)")]
pub struct IncompleteMosaicError {
    pub tile: TileId,
    pub date: NaiveDate,
    pub band: String,
    pub contributors: usize,
}

/// Fmask bits that invalidate a pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityMask {
    pub bits: u8,
}

impl Default for QualityMask {
    fn default() -> Self {
        Self {
            bits: DEFAULT_MASK_BITS,
        }
    }
}

impl QualityMask {
    pub fn new(bits: u8) -> Self {
        Self { bits }
    }

    /// Returns true if a raw Fmask value marks the pixel usable.
    #[inline]
    pub fn is_clear(&self, value: f32) -> bool {
        if !(0.0..=255.0).contains(&value) {
            return false;
        }
        let flags = value as u8;
        flags != FMASK_FILL && flags & self.bits == 0
    }
}

/// One granule's input to a mosaic.
#[derive(Debug, Clone)]
pub struct Contributor {
    pub granule: String,
    pub source: SourceCollection,
    pub raster: Arc<GeoRaster>,
    pub quality: Option<Arc<GeoRaster>>,
    pub scaling: BandScaling,
    zone: UtmZone,
}

impl Contributor {
    /// Creates a contributor, checking that its rasters are in a supported
    /// and common CRS.
    pub fn new(
        granule: impl Into<String>,
        source: SourceCollection,
        raster: Arc<GeoRaster>,
        quality: Option<Arc<GeoRaster>>,
        scaling: BandScaling,
    ) -> Result<Self, RasterError> {
        let zone = raster.zone()?;
        if let Some(q) = &quality {
            if q.epsg != raster.epsg {
                return Err(RasterError::Invalid(format!(
                    "quality mask CRS EPSG:{} differs from band CRS EPSG:{}",
                    q.epsg, raster.epsg
                )));
            }
        }
        Ok(Self {
            granule: granule.into(),
            source,
            raster,
            quality,
            scaling,
            zone,
        })
    }

    /// Native CRS zone.
    pub fn zone(&self) -> UtmZone {
        self.zone
    }
}

/// Output raster for one (tile, date, band).
#[derive(Debug, Clone, PartialEq)]
pub struct Mosaic {
    pub tile: Tile,
    pub date: NaiveDate,
    pub band: String,
    /// Pixel values, row-major on the tile grid.
    pub data: Vec<f32>,
    /// Index into `sources` per pixel, or [`NO_SOURCE`].
    pub provenance: Vec<u16>,
    /// Contributor granule ids in priority order.
    pub sources: Vec<String>,
}

impl Mosaic {
    fn empty(tile: &Tile, date: NaiveDate, band: &str, sources: Vec<String>) -> Self {
        Self {
            tile: tile.clone(),
            date,
            band: band.to_string(),
            data: vec![MOSAIC_NODATA; tile.pixel_count()],
            provenance: vec![NO_SOURCE; tile.pixel_count()],
            sources,
        }
    }

    /// Number of pixels with a value.
    pub fn valid_pixels(&self) -> usize {
        self.provenance.iter().filter(|&&p| p != NO_SOURCE).count()
    }

    /// Value at a pixel, `None` for nodata.
    pub fn value(&self, row: usize, col: usize) -> Option<f32> {
        let i = row * self.tile.width + col;
        (self.provenance.get(i).copied()? != NO_SOURCE).then(|| self.data[i])
    }

    /// Granule id that supplied a pixel.
    pub fn source_at(&self, row: usize, col: usize) -> Option<&str> {
        let p = *self.provenance.get(row * self.tile.width + col)?;
        self.sources.get(p as usize).map(String::as_str)
    }

    /// `Err` when no pixel is valid.
    pub fn completeness(&self) -> Result<(), IncompleteMosaicError> {
        if self.valid_pixels() > 0 {
            return Ok(());
        }
        Err(IncompleteMosaicError {
            tile: self.tile.id,
            date: self.date,
            band: self.band.clone(),
            contributors: self.sources.len(),
        })
    }

    /// Output file name: `HLS_<band>_<tile>_<YYYYMMDD>.tif`.
    pub fn file_name(&self) -> String {
        format!(
            "HLS_{}_{}_{}.tif",
            self.band,
            self.tile.id,
            self.date.format("%Y%m%d")
        )
    }

    /// Georeferenced raster of the mosaic values.
    pub fn to_raster(&self) -> GeoRaster {
        GeoRaster {
            width: self.tile.width,
            height: self.tile.height,
            origin_x: self.tile.origin_x,
            origin_y: self.tile.origin_y,
            pixel_width: self.tile.resolution,
            pixel_height: self.tile.resolution,
            epsg: self.tile.epsg(),
            nodata: Some(MOSAIC_NODATA as f64),
            data: self.data.clone(),
        }
    }

    /// Encodes the mosaic as a GeoTIFF.
    pub fn encode(&self) -> Result<Vec<u8>, RasterError> {
        raster::encode(&self.to_raster())
    }
}

/// Composites contributors onto a tile grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MosaicAssembler {
    resampling: Resampling,
    quality_mask: QualityMask,
    apply_scale: bool,
}

impl Default for MosaicAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl MosaicAssembler {
    /// Nearest-neighbour sampling, default Fmask bits, scaled output.
    pub fn new() -> Self {
        Self {
            resampling: Resampling::Nearest,
            quality_mask: QualityMask::default(),
            apply_scale: true,
        }
    }

    pub fn with_resampling(mut self, resampling: Resampling) -> Self {
        self.resampling = resampling;
        self
    }

    pub fn with_quality_mask(mut self, mask: QualityMask) -> Self {
        self.quality_mask = mask;
        self
    }

    /// Write physical values (true) or raw digital numbers (false).
    pub fn with_apply_scale(mut self, apply: bool) -> Self {
        self.apply_scale = apply;
        self
    }

    /// Builds the mosaic for `band` on `date` from contributors in priority
    /// order.
    ///
    /// CPU-bound; call from a blocking context. Rows are processed in
    /// parallel.
    pub fn assemble(
        &self,
        tile: &Tile,
        date: NaiveDate,
        band: &str,
        contributors: &[Contributor],
    ) -> Mosaic {
        let contributors = if contributors.len() >= NO_SOURCE as usize {
            warn!(
                count = contributors.len(),
                "Too many contributors, ignoring the lowest priority ones"
            );
            &contributors[..NO_SOURCE as usize - 1]
        } else {
            contributors
        };

        let sources = contributors.iter().map(|c| c.granule.clone()).collect();
        let mut mosaic = Mosaic::empty(tile, date, band, sources);
        if contributors.is_empty() {
            return mosaic;
        }

        let width = tile.width;
        mosaic
            .data
            .par_chunks_mut(width)
            .zip(mosaic.provenance.par_chunks_mut(width))
            .enumerate()
            .for_each(|(row, (values, provenance))| {
                for col in 0..width {
                    let (x, y) = tile.pixel_center(row, col);
                    for (index, contributor) in contributors.iter().enumerate() {
                        if let Some(value) = self.sample(contributor, tile.crs, x, y) {
                            values[col] = value;
                            provenance[col] = index as u16;
                            break;
                        }
                    }
                }
            });

        debug!(
            tile = %tile.id,
            date = %date,
            band,
            contributors = contributors.len(),
            valid = mosaic.valid_pixels(),
            "Assembled mosaic"
        );
        mosaic
    }

    /// Valid output value of one contributor at a tile-CRS coordinate.
    #[inline]
    fn sample(&self, c: &Contributor, crs: UtmZone, x: f64, y: f64) -> Option<f32> {
        let (sx, sy) = if c.zone == crs {
            (x, y)
        } else {
            utm::transform(crs, c.zone, x, y)
        };

        if let Some(quality) = &c.quality {
            let flags = raster::sample(quality, sx, sy, Resampling::Nearest, |_| true)?;
            if !self.quality_mask.is_clear(flags) {
                return None;
            }
        }

        let scaling = c.scaling;
        let raw = raster::sample(&c.raster, sx, sy, self.resampling, |v| {
            scaling.apply(v as f64).is_some()
        })?;
        if self.apply_scale {
            scaling.apply(raw as f64).map(|v| v as f32)
        } else {
            Some(raw)
        }
    }
}
