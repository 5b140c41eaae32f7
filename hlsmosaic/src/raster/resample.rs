//! Point sampling of rasters at projected coordinates.

use std::fmt;
use std::str::FromStr;

use super::GeoRaster;

/// Resampling method used when reprojecting onto the tile grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Resampling {
    /// Value of the pixel containing the point.
    #[default]
    Nearest,
    /// Distance-weighted mean of the four surrounding pixel centres.
    Bilinear,
}

impl FromStr for Resampling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nearest" => Ok(Self::Nearest),
            "bilinear" => Ok(Self::Bilinear),
            other => Err(format!(
                "unknown resampling method '{}' (expected nearest or bilinear)",
                other
            )),
        }
    }
}

impl fmt::Display for Resampling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nearest => write!(f, "nearest"),
            Self::Bilinear => write!(f, "bilinear"),
        }
    }
}

/// Samples `raster` at projected coordinate `(x, y)`.
///
/// `valid` decides whether a raw pixel value may be used; raster nodata is
/// always invalid. Bilinear sampling needs all four neighbours valid and
/// otherwise falls back to the nearest pixel.
///
/// # Returns
///
/// `None` when the point is outside the raster or no valid value exists.
#[inline]
pub fn sample<F>(raster: &GeoRaster, x: f64, y: f64, method: Resampling, valid: F) -> Option<f32>
where
    F: Fn(f32) -> bool,
{
    let (row, col) = raster.to_pixel(x, y);
    let usable = |v: f32| !raster.is_nodata(v) && valid(v);

    let nearest = || {
        raster
            .get(row.floor() as isize, col.floor() as isize)
            .filter(|&v| usable(v))
    };

    match method {
        Resampling::Nearest => nearest(),
        Resampling::Bilinear => {
            // Centre-based coordinates.
            let fy = row - 0.5;
            let fx = col - 0.5;
            let r0 = fy.floor();
            let c0 = fx.floor();
            let dy = fy - r0;
            let dx = fx - c0;
            let (r0, c0) = (r0 as isize, c0 as isize);

            // Clamp at the raster edge so border pixels keep their value.
            let clamp_r = |r: isize| r.clamp(0, raster.height as isize - 1);
            let clamp_c = |c: isize| c.clamp(0, raster.width as isize - 1);
            if nearest().is_none() {
                return None;
            }

            let corners = [
                raster.get(clamp_r(r0), clamp_c(c0)),
                raster.get(clamp_r(r0), clamp_c(c0 + 1)),
                raster.get(clamp_r(r0 + 1), clamp_c(c0)),
                raster.get(clamp_r(r0 + 1), clamp_c(c0 + 1)),
            ];
            match corners {
                [Some(v00), Some(v01), Some(v10), Some(v11)]
                    if usable(v00) && usable(v01) && usable(v10) && usable(v11) =>
                {
                    let value = v00 as f64 * (1.0 - dx) * (1.0 - dy)
                        + v01 as f64 * dx * (1.0 - dy)
                        + v10 as f64 * (1.0 - dx) * dy
                        + v11 as f64 * dx * dy;
                    Some(value as f32)
                }
                _ => nearest(),
            }
        }
    }
}
