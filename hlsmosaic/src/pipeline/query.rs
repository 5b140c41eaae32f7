//! Query description.

use std::time::Duration;

use chrono::NaiveDate;

use super::diagnostics::PipelineError;
use crate::coord::Geometry;
use crate::granule::{canonical_band, DEFAULT_BANDS};

/// What a query covers.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryTarget {
    /// A single tile id such as `10SEG`.
    Tile(String),
    /// Every tile intersecting a point or polygon.
    Geometry(Geometry),
}

/// A search-retrieve-assemble request.
///
/// Dates are inclusive. Bands default to red, green, blue, NIR, SWIR1 and
/// SWIR2.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub target: QueryTarget,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub bands: Vec<String>,
    /// Maximum cloud cover in percent; granules above it are excluded.
    pub cloud_threshold: Option<f64>,
    /// Time allowed from the start of resolution.
    pub deadline: Option<Duration>,
    /// Output pixel size in metres; the pipeline default when unset.
    pub resolution: Option<f64>,
}

impl Query {
    fn new(target: QueryTarget, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            target,
            start,
            end,
            bands: DEFAULT_BANDS.iter().map(|b| b.to_string()).collect(),
            cloud_threshold: None,
            deadline: None,
            resolution: None,
        }
    }

    pub fn for_tile(tile: impl Into<String>, start: NaiveDate, end: NaiveDate) -> Self {
        Self::new(QueryTarget::Tile(tile.into()), start, end)
    }

    pub fn for_geometry(geometry: impl Into<Geometry>, start: NaiveDate, end: NaiveDate) -> Self {
        Self::new(QueryTarget::Geometry(geometry.into()), start, end)
    }

    /// Replaces the band list. Common names (`red`, `NIR`) and product band
    /// ids (`B04`, `Fmask`) are accepted.
    pub fn with_bands<I, S>(mut self, bands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.bands = bands.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_cloud_threshold(mut self, percent: f64) -> Self {
        self.cloud_threshold = Some(percent);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_resolution(mut self, metres: f64) -> Self {
        self.resolution = Some(metres);
        self
    }

    /// Checks the query and returns its bands in canonical form, deduplicated
    /// and in request order.
    pub(crate) fn validate(&self) -> Result<Vec<String>, PipelineError> {
        if self.start > self.end {
            return Err(PipelineError::InvalidQuery(format!(
                "start date {} is after end date {}",
                self.start, self.end
            )));
        }
        if let Some(t) = self.cloud_threshold {
            if !(0.0..=100.0).contains(&t) {
                return Err(PipelineError::InvalidQuery(format!(
                    "cloud threshold {} is outside 0..100",
                    t
                )));
            }
        }
        if self.bands.is_empty() {
            return Err(PipelineError::InvalidQuery("no bands requested".into()));
        }

        let mut bands: Vec<String> = Vec::with_capacity(self.bands.len());
        for name in &self.bands {
            let band = canonical_band(name)
                .ok_or_else(|| PipelineError::InvalidQuery(format!("unknown band '{}'", name)))?;
            if !bands.contains(&band) {
                bands.push(band);
            }
        }
        Ok(bands)
    }
}
