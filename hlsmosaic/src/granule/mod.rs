//! HLS granules and their band assets
//!
//! A [`Granule`] is one validated catalog record: a Sentinel- or
//! Landsat-derived product on a single tile and acquisition, with a mapping
//! from product band id to remote asset.

mod bands;
mod id;

pub use bands::{
    asset_band, canonical_band, scaling_for, BandScaling, DEFAULT_BANDS, QUALITY_BAND,
    REFLECTANCE_SCALE, SOURCE_NODATA, THERMAL_SCALE,
};
pub use id::{GranuleId, GranuleIdError, SourceCollection};

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};

use crate::coord::Polygon;

/// Reference to one downloadable band file.
#[derive(Debug, Clone, PartialEq)]
pub struct AssetRef {
    pub href: String,
    /// Advertised size in bytes.
    pub size: Option<u64>,
    /// Advertised SHA-256 (lowercase hex).
    pub checksum: Option<String>,
}

impl AssetRef {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: href.into(),
            size: None,
            checksum: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into().to_ascii_lowercase());
        self
    }
}

/// One validated HLS product instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Granule {
    pub id: GranuleId,
    /// Catalog collection the record came from, e.g. `HLSS30_2.0`.
    pub collection: String,
    /// Acquisition time from the record.
    pub acquired: DateTime<Utc>,
    /// Last catalog update, when published.
    pub updated: Option<DateTime<Utc>>,
    /// Cloud cover estimate in percent.
    pub cloud_cover: f64,
    pub footprint: Option<Polygon>,
    /// Assets keyed by product band id (`B04`, `Fmask`, ...).
    pub assets: BTreeMap<String, AssetRef>,
}

impl Granule {
    /// Satellite source of the product.
    pub fn source(&self) -> SourceCollection {
        self.id.source
    }

    /// Acquisition date (UTC).
    pub fn date(&self) -> NaiveDate {
        self.acquired.date_naive()
    }

    /// Deduplication key: the id without its version suffix.
    pub fn stable_key(&self) -> &str {
        self.id.stable_key()
    }

    /// Resolves a canonical band name to this granule's asset.
    ///
    /// # Returns
    ///
    /// The product band id and asset, or `None` if the source does not carry
    /// the band or the record lacks the asset.
    pub fn asset_for(&self, band: &str) -> Option<(&'static str, &AssetRef)> {
        let product_band = asset_band(band, self.source())?;
        self.assets.get(product_band).map(|a| (product_band, a))
    }

    /// Quality mask asset, if the record carries one.
    pub fn quality_asset(&self) -> Option<&AssetRef> {
        self.assets.get(QUALITY_BAND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn granule(id: &str) -> Granule {
        let mut assets = BTreeMap::new();
        assets.insert("B04".to_string(), AssetRef::new("https://x/B04.tif"));
        assets.insert("B8A".to_string(), AssetRef::new("https://x/B8A.tif"));
        assets.insert("B05".to_string(), AssetRef::new("https://x/B05.tif"));
        assets.insert("Fmask".to_string(), AssetRef::new("https://x/Fmask.tif"));
        Granule {
            id: id.parse().unwrap(),
            collection: "HLSS30_2.0".into(),
            acquired: Utc.with_ymd_and_hms(2021, 6, 1, 18, 49, 19).unwrap(),
            updated: None,
            cloud_cover: 5.0,
            footprint: None,
            assets,
        }
    }

    #[test]
    fn test_asset_for_resolves_sensor_alias() {
        let s30 = granule("HLS.S30.T10SEG.2021152T184919.v2.0");
        assert_eq!(s30.asset_for("NIR").map(|(b, _)| b), Some("B8A"));

        let l30 = granule("HLS.L30.T10SEG.2021152T184919.v2.0");
        assert_eq!(l30.asset_for("NIR").map(|(b, _)| b), Some("B05"));
        assert!(l30.asset_for("B8A").is_none());
    }

    #[test]
    fn test_missing_asset() {
        let g = granule("HLS.S30.T10SEG.2021152T184919.v2.0");
        assert!(g.asset_for("SWIR1").is_none());
        assert!(g.quality_asset().is_some());
    }

    #[test]
    fn test_checksum_normalised_lowercase() {
        let a = AssetRef::new("h").with_checksum("ABCDEF");
        assert_eq!(a.checksum.as_deref(), Some("abcdef"));
    }
}
