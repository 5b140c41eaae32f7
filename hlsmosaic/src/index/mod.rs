//! Granule index: validation, deduplication, filtering and ranking
//!
//! Catalog results arrive from several collections and pages and may repeat
//! the same product under different collection aliases or processing
//! versions. The index collapses those aliases onto one [`Granule`] per
//! stable id and produces the contributor order used by the mosaic
//! assembler.
//!
//! # Ordering
//!
//! 1. Acquisition date ascending
//! 2. Source priority ([`SourcePriority`])
//! 3. Cloud cover ascending
//! 4. Acquisition time ascending
//! 5. Granule id

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::catalog::{validate_record, RawRecord};
use crate::coord::TileId;
use crate::granule::{Granule, SourceCollection};

/// Which source wins when granules share a date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourcePriority {
    /// Sentinel-derived (S30) granules first.
    #[default]
    Sentinel,
    /// Landsat-derived (L30) granules first.
    Landsat,
    /// No source preference; cloud cover decides.
    Equal,
}

impl SourcePriority {
    fn rank(&self, source: SourceCollection) -> u8 {
        match (self, source) {
            (Self::Equal, _) => 0,
            (Self::Sentinel, SourceCollection::S30) | (Self::Landsat, SourceCollection::L30) => 0,
            _ => 1,
        }
    }
}

impl FromStr for SourcePriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sentinel" | "s30" => Ok(Self::Sentinel),
            "landsat" | "l30" => Ok(Self::Landsat),
            "equal" | "none" => Ok(Self::Equal),
            other => Err(format!(
                "unknown source priority '{}' (expected sentinel, landsat or equal)",
                other
            )),
        }
    }
}

impl fmt::Display for SourcePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sentinel => "sentinel",
            Self::Landsat => "landsat",
            Self::Equal => "equal",
        })
    }
}

/// Compares two granules in contributor order.
pub fn compare_granules(a: &Granule, b: &Granule, priority: SourcePriority) -> Ordering {
    a.date()
        .cmp(&b.date())
        .then_with(|| priority.rank(a.source()).cmp(&priority.rank(b.source())))
        .then_with(|| a.cloud_cover.total_cmp(&b.cloud_cover))
        .then_with(|| a.acquired.cmp(&b.acquired))
        .then_with(|| a.id.as_str().cmp(b.id.as_str()))
}

/// Returns true if `candidate` should replace `current` for the same stable id.
fn supersedes(candidate: &Granule, current: &Granule) -> bool {
    candidate
        .assets
        .len()
        .cmp(&current.assets.len())
        .then_with(|| {
            candidate
                .id
                .version_parts()
                .cmp(&current.id.version_parts())
        })
        .then_with(|| candidate.updated.cmp(&current.updated))
        // Smaller collection alias wins, so compare reversed.
        .then_with(|| current.collection.cmp(&candidate.collection))
        .then_with(|| current.cloud_cover.total_cmp(&candidate.cloud_cover))
        == Ordering::Greater
}

/// Output of the index.
#[derive(Debug, Clone, Default)]
pub struct IndexedGranules {
    /// Granules passing the cloud filter, in contributor order.
    pub granules: Vec<Granule>,
    /// Granules dropped by the cloud-cover threshold, in contributor order.
    pub cloud_filtered: Vec<Granule>,
    /// Records failing validation.
    pub rejected: usize,
    /// Valid records for other tiles.
    pub off_tile: usize,
    /// Records collapsed into an existing granule.
    pub duplicates: usize,
}

impl IndexedGranules {
    /// Contributors grouped by acquisition date, in order.
    pub fn by_date(&self) -> BTreeMap<NaiveDate, Vec<&Granule>> {
        let mut dates: BTreeMap<NaiveDate, Vec<&Granule>> = BTreeMap::new();
        for g in &self.granules {
            dates.entry(g.date()).or_default().push(g);
        }
        dates
    }

    /// Every date with a candidate granule, including cloud-filtered ones.
    pub fn candidate_dates(&self) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self
            .granules
            .iter()
            .chain(&self.cloud_filtered)
            .map(Granule::date)
            .collect();
        dates.sort();
        dates.dedup();
        dates
    }
}

/// Accumulates catalog records and produces ranked granules.
pub struct GranuleIndex {
    priority: SourcePriority,
    cloud_threshold: Option<f64>,
    tile: Option<TileId>,
    entries: HashMap<String, Granule>,
    rejected: usize,
    off_tile: usize,
    duplicates: usize,
}

impl GranuleIndex {
    pub fn new(priority: SourcePriority) -> Self {
        Self {
            priority,
            cloud_threshold: None,
            tile: None,
            entries: HashMap::new(),
            rejected: 0,
            off_tile: 0,
            duplicates: 0,
        }
    }

    /// Drops granules whose cloud cover exceeds `threshold` percent.
    pub fn with_cloud_threshold(mut self, threshold: Option<f64>) -> Self {
        self.cloud_threshold = threshold;
        self
    }

    /// Keeps only granules on this tile.
    pub fn with_tile(mut self, tile: TileId) -> Self {
        self.tile = Some(tile);
        self
    }

    /// Validates and adds a raw record. Invalid records are logged and
    /// counted.
    pub fn ingest(&mut self, raw: &RawRecord) {
        match validate_record(raw) {
            Ok(granule) => self.insert(granule),
            Err(e) => {
                self.rejected += 1;
                let id = raw
                    .item
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("<no id>");
                warn!(record = id, error = %e, "Rejected catalog record");
            }
        }
    }

    /// Adds a validated granule, collapsing aliases of the same product.
    pub fn insert(&mut self, granule: Granule) {
        if let Some(tile) = self.tile {
            if granule.id.tile != tile {
                self.off_tile += 1;
                debug!(granule = %granule.id, tile = %tile, "Skipping granule for another tile");
                return;
            }
        }

        let key = granule.stable_key().to_string();
        match self.entries.get_mut(&key) {
            Some(existing) => {
                self.duplicates += 1;
                if supersedes(&granule, existing) {
                    debug!(
                        kept = %granule.id,
                        kept_collection = %granule.collection,
                        dropped = %existing.id,
                        dropped_collection = %existing.collection,
                        "Replacing duplicate granule"
                    );
                    *existing = granule;
                } else {
                    debug!(kept = %existing.id, dropped = %granule.id, "Dropping duplicate granule");
                }
            }
            None => {
                self.entries.insert(key, granule);
            }
        }
    }

    /// Number of distinct granules held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies the cloud filter and returns granules in contributor order.
    pub fn finish(self) -> IndexedGranules {
        let priority = self.priority;
        let threshold = self.cloud_threshold;

        let (mut granules, mut cloud_filtered): (Vec<Granule>, Vec<Granule>) = self
            .entries
            .into_values()
            .partition(|g| threshold.map(|t| g.cloud_cover <= t).unwrap_or(true));

        granules.sort_by(|a, b| compare_granules(a, b, priority));
        cloud_filtered.sort_by(|a, b| compare_granules(a, b, priority));

        for g in &cloud_filtered {
            debug!(
                granule = %g.id,
                cloud_cover = g.cloud_cover,
                threshold = threshold.unwrap_or_default(),
                "Granule exceeds cloud threshold"
            );
        }

        IndexedGranules {
            granules,
            cloud_filtered,
            rejected: self.rejected,
            off_tile: self.off_tile,
            duplicates: self.duplicates,
        }
    }
}
