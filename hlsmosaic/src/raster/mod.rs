//! Georeferenced single-band rasters
//!
//! [`GeoRaster`] is the in-memory form of one band asset: a north-up pixel
//! grid with an upper-left origin, pixel size, projected CRS and optional
//! nodata value. [`geotiff`] reads and writes it; [`resample`] samples it at
//! arbitrary projected coordinates.

pub mod geotiff;
pub mod resample;

pub use geotiff::{decode, encode, read};
pub use resample::{sample, Resampling};

use thiserror::Error;

use crate::coord::UtmZone;

/// Errors decoding or encoding rasters.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("missing georeference: {0}")]
    MissingGeoreference(&'static str),

    #[error("unsupported CRS: {0}")]
    UnsupportedCrs(String),

    #[error("invalid raster: {0}")]
    Invalid(String),
}

/// Result type for raster operations.
pub type Result<T> = std::result::Result<T, RasterError>;

/// A north-up single-band raster in a projected CRS.
///
/// Values are stored row-major, north to south and west to east.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoRaster {
    pub width: usize,
    pub height: usize,
    /// Easting of the upper-left corner.
    pub origin_x: f64,
    /// Northing of the upper-left corner.
    pub origin_y: f64,
    /// Pixel width in CRS units.
    pub pixel_width: f64,
    /// Pixel height in CRS units (positive, rows run south).
    pub pixel_height: f64,
    pub epsg: u16,
    pub nodata: Option<f64>,
    pub data: Vec<f32>,
}

impl GeoRaster {
    /// Creates a raster, checking that the data fills the grid.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        width: usize,
        height: usize,
        origin: (f64, f64),
        pixel_size: (f64, f64),
        epsg: u16,
        nodata: Option<f64>,
        data: Vec<f32>,
    ) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(RasterError::Invalid("empty raster".into()));
        }
        if data.len() != width * height {
            return Err(RasterError::Invalid(format!(
                "expected {} values for {}x{}, got {}",
                width * height,
                width,
                height,
                data.len()
            )));
        }
        if !(pixel_size.0 > 0.0 && pixel_size.1 > 0.0) {
            return Err(RasterError::Invalid(format!(
                "non-positive pixel size {:?}",
                pixel_size
            )));
        }
        Ok(Self {
            width,
            height,
            origin_x: origin.0,
            origin_y: origin.1,
            pixel_width: pixel_size.0,
            pixel_height: pixel_size.1,
            epsg,
            nodata,
            data,
        })
    }

    /// UTM zone of the raster CRS.
    pub fn zone(&self) -> Result<UtmZone> {
        UtmZone::from_epsg(self.epsg)
            .ok_or_else(|| RasterError::UnsupportedCrs(format!("EPSG:{}", self.epsg)))
    }

    /// Value at a pixel, or `None` outside the grid.
    #[inline]
    pub fn get(&self, row: isize, col: isize) -> Option<f32> {
        if row < 0 || col < 0 || row as usize >= self.height || col as usize >= self.width {
            return None;
        }
        Some(self.data[row as usize * self.width + col as usize])
    }

    /// Continuous pixel coordinates of a projected point.
    ///
    /// `(0.0, 0.0)` is the upper-left corner of the first pixel, so pixel
    /// `(r, c)` covers `[r, r+1) x [c, c+1)`.
    #[inline]
    pub fn to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        (
            (self.origin_y - y) / self.pixel_height,
            (x - self.origin_x) / self.pixel_width,
        )
    }

    /// Returns true if `value` is a fill value for this raster.
    #[inline]
    pub fn is_nodata(&self, value: f32) -> bool {
        value.is_nan() || self.nodata.is_some_and(|n| value as f64 == n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raster() -> GeoRaster {
        GeoRaster::new(
            3,
            2,
            (500_000.0, 4_200_000.0),
            (30.0, 30.0),
            32610,
            Some(-9999.0),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, -9999.0],
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_wrong_length() {
        let err = GeoRaster::new(2, 2, (0.0, 0.0), (30.0, 30.0), 32610, None, vec![0.0; 3]);
        assert!(matches!(err, Err(RasterError::Invalid(_))));
    }

    #[test]
    fn test_get_and_bounds() {
        let r = raster();
        assert_eq!(r.get(0, 0), Some(1.0));
        assert_eq!(r.get(1, 2), Some(-9999.0));
        assert_eq!(r.get(2, 0), None);
        assert_eq!(r.get(0, -1), None);
    }

    #[test]
    fn test_to_pixel() {
        let r = raster();
        let (row, col) = r.to_pixel(500_045.0, 4_199_985.0);
        assert!((row - 0.5).abs() < 1e-9);
        assert!((col - 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_zone_and_nodata() {
        let r = raster();
        assert_eq!(r.zone().unwrap().epsg(), 32610);
        assert!(r.is_nodata(-9999.0));
        assert!(r.is_nodata(f32::NAN));
        assert!(!r.is_nodata(0.0));
    }
}
