//! Band naming and radiometric scaling.
//!
//! Callers request bands either by common name (`red`, `NIR`, `SWIR1`, ...)
//! or by product band id (`B04`, `B8A`, `Fmask`). Common names map onto
//! different product bands for the Sentinel and Landsat products.

use super::id::SourceCollection;

/// Quality assessment band carrying the Fmask bit flags.
pub const QUALITY_BAND: &str = "Fmask";

/// Bands produced when a query names none.
pub const DEFAULT_BANDS: [&str; 6] = ["red", "green", "blue", "NIR", "SWIR1", "SWIR2"];

/// Fill value of the HLS integer products.
pub const SOURCE_NODATA: f64 = -9999.0;

/// Reflectance scale factor for surface reflectance bands.
pub const REFLECTANCE_SCALE: f64 = 0.0001;

/// Scale factor for the Landsat thermal brightness temperature bands.
pub const THERMAL_SCALE: f64 = 0.01;

const S30_BANDS: &[&str] = &[
    "B01", "B02", "B03", "B04", "B05", "B06", "B07", "B08", "B8A", "B09", "B10", "B11", "B12",
    "Fmask", "SAA", "SZA", "VAA", "VZA",
];

const L30_BANDS: &[&str] = &[
    "B01", "B02", "B03", "B04", "B05", "B06", "B07", "B09", "B10", "B11", "Fmask", "SAA", "SZA",
    "VAA", "VZA",
];

/// Normalises a requested band name.
///
/// Common names are returned in their canonical spelling (`nir` -> `NIR`),
/// band ids are upper-cased (`b8a` -> `B8A`). Returns `None` for names that
/// are neither.
pub fn canonical_band(name: &str) -> Option<String> {
    let lower = name.trim().to_ascii_lowercase();
    let canonical = match lower.as_str() {
        "coastal" => "coastal",
        "blue" => "blue",
        "green" => "green",
        "red" => "red",
        "nir" => "NIR",
        "swir1" => "SWIR1",
        "swir2" => "SWIR2",
        "fmask" => QUALITY_BAND,
        _ => {
            let upper = lower.to_ascii_uppercase();
            let known = S30_BANDS.iter().chain(L30_BANDS).any(|b| *b == upper);
            return known.then_some(upper);
        }
    };
    Some(canonical.to_string())
}

/// Maps a canonical band name to the product band id for a source.
///
/// Returns `None` when the source does not carry the band (e.g. `B8A` for
/// Landsat).
pub fn asset_band(band: &str, source: SourceCollection) -> Option<&'static str> {
    let mapped = match (band, source) {
        ("coastal", _) => "B01",
        ("blue", _) => "B02",
        ("green", _) => "B03",
        ("red", _) => "B04",
        ("NIR", SourceCollection::S30) => "B8A",
        ("NIR", SourceCollection::L30) => "B05",
        ("SWIR1", SourceCollection::S30) => "B11",
        ("SWIR1", SourceCollection::L30) => "B06",
        ("SWIR2", SourceCollection::S30) => "B12",
        ("SWIR2", SourceCollection::L30) => "B07",
        (raw, source) => {
            let bands = match source {
                SourceCollection::S30 => S30_BANDS,
                SourceCollection::L30 => L30_BANDS,
            };
            return bands.iter().copied().find(|b| *b == raw);
        }
    };
    Some(mapped)
}

/// How raw digital numbers convert to physical values.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandScaling {
    /// Multiplier applied to valid values.
    pub scale: f64,
    /// Treat negative scaled values as invalid.
    pub mask_negative: bool,
    /// Raw fill value, if the band has one.
    pub nodata: Option<f64>,
}

impl BandScaling {
    /// Raw values, nothing masked.
    pub const IDENTITY: BandScaling = BandScaling {
        scale: 1.0,
        mask_negative: false,
        nodata: None,
    };

    /// Applies the scaling to one raw value; `None` marks it invalid.
    #[inline]
    pub fn apply(&self, raw: f64) -> Option<f64> {
        if raw.is_nan() || self.nodata == Some(raw) {
            return None;
        }
        let value = raw * self.scale;
        if self.mask_negative && value < 0.0 {
            return None;
        }
        Some(value)
    }
}

/// Scaling for a product band id.
///
/// Surface reflectance bands scale by 0.0001 with -9999 fill and negative
/// values masked. Landsat thermal bands scale by 0.01. Fmask and angle bands
/// are passed through unscaled.
pub fn scaling_for(asset_band: &str, source: SourceCollection) -> BandScaling {
    match (asset_band, source) {
        (QUALITY_BAND, _) => BandScaling::IDENTITY,
        ("SAA" | "SZA" | "VAA" | "VZA", _) => BandScaling {
            scale: 0.01,
            mask_negative: false,
            nodata: Some(SOURCE_NODATA),
        },
        ("B10" | "B11", SourceCollection::L30) => BandScaling {
            scale: THERMAL_SCALE,
            mask_negative: false,
            nodata: Some(SOURCE_NODATA),
        },
        _ => BandScaling {
            scale: REFLECTANCE_SCALE,
            mask_negative: true,
            nodata: Some(SOURCE_NODATA),
        },
    }
}
