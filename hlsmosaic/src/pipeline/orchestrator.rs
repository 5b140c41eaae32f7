//! Query resolution: search, index, retrieve, assemble.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::StreamExt;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::diagnostics::{Diagnostic, PipelineError, Stage};
use super::query::{Query, QueryTarget};
use super::{HlsPipeline, QueryResult};
use crate::cache::{CachedAsset, RetrievalError, RetrievalReason};
use crate::catalog::CatalogError;
use crate::coord::{resolve_geometry, resolve_tile, Tile, TileId};
use crate::granule::{asset_band, scaling_for, Granule, SourceCollection, QUALITY_BAND};
use crate::index::{GranuleIndex, IndexedGranules};
use crate::mosaic::{Composite, Contributor, Mosaic, MosaicAssembler, RegionGrid};
use crate::raster::{self, GeoRaster};

/// Retrieved assets keyed by (granule id, product band).
type AssetMap = HashMap<(String, &'static str), CachedAsset>;

/// Granules available on one acquisition date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRow {
    pub date: NaiveDate,
    /// Sentinel-derived (S30) granule id.
    pub sentinel: Option<String>,
    /// Landsat-derived (L30) granule id.
    pub landsat: Option<String>,
}

/// Dates of a listing, ascending.
pub fn dates_listed(rows: &[ListingRow]) -> Vec<NaiveDate> {
    rows.iter().map(|r| r.date).collect()
}

/// Deadline timer; aborted when the query finishes.
struct DeadlineGuard(JoinHandle<()>);

impl Drop for DeadlineGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn arm_deadline(deadline: Duration, cancel: CancellationToken) -> DeadlineGuard {
    DeadlineGuard(tokio::spawn(async move {
        tokio::time::sleep(deadline).await;
        warn!(deadline_ms = deadline.as_millis() as u64, "Query deadline reached, cancelling");
        cancel.cancel();
    }))
}

impl HlsPipeline {
    /// Resolves a query into mosaics.
    ///
    /// # Arguments
    ///
    /// * `query` - Target, date range, bands and options
    /// * `cancel` - Cancels outstanding work; finished mosaics are still returned
    ///
    /// # Returns
    ///
    /// One mosaic per (tile, date with candidate granules, band), sorted by
    /// that key, plus diagnostics. Bounding-box and polygon targets also get
    /// one composite per (date, band) across all their tiles. Fails only on
    /// an invalid query, a grid resolution error or an unavailable catalog.
    #[instrument(skip(self, query, cancel), fields(start = %query.start, end = %query.end))]
    pub async fn resolve(
        &self,
        query: &Query,
        cancel: CancellationToken,
    ) -> Result<QueryResult, PipelineError> {
        let bands = query.validate()?;
        let resolution = query.resolution.unwrap_or(self.config.resolution);
        let (tiles, region) = resolve_target(&query.target, resolution)?;
        let threshold = query.cloud_threshold.or(self.config.cloud_threshold);

        let cancel = cancel.child_token();
        let _deadline = query.deadline.map(|d| arm_deadline(d, cancel.clone()));

        info!(
            tiles = tiles.len(),
            bands = ?bands,
            cloud_threshold = ?threshold,
            "Resolving query"
        );

        let mut result = QueryResult {
            tiles: tiles.iter().map(|t| t.id).collect(),
            ..Default::default()
        };

        for tile in &tiles {
            let Some(indexed) = self
                .search_tile(tile, query.start, query.end, threshold, &cancel, &mut result.diagnostics)
                .await?
            else {
                continue;
            };
            if indexed.granules.is_empty() && indexed.cloud_filtered.is_empty() {
                info!(tile = %tile.id, "No granules found");
                continue;
            }

            let assets = self
                .retrieve(tile, &indexed, &bands, &cancel, &mut result.diagnostics)
                .await;
            let mosaics = self
                .assemble(tile, &indexed, &bands, assets, &cancel, &mut result.diagnostics)
                .await;
            result.mosaics.extend(mosaics);
        }

        result
            .mosaics
            .sort_by(|a, b| (a.tile.id, a.date, &a.band).cmp(&(b.tile.id, b.date, &b.band)));

        if let Some(grid) = region {
            self.composite(grid, &mut result, &cancel).await;
        }

        info!(
            mosaics = result.mosaics.len(),
            composites = result.composites.len(),
            diagnostics = result.diagnostics.len(),
            cancelled = result.was_cancelled(),
            "Query resolved"
        );
        Ok(result)
    }

    /// Combines the per-tile mosaics of an areal query on one grid.
    async fn composite(
        &self,
        grid: RegionGrid,
        result: &mut QueryResult,
        cancel: &CancellationToken,
    ) {
        if result.mosaics.is_empty() {
            return;
        }
        let mosaics = Arc::new(std::mem::take(&mut result.mosaics));
        let job = {
            let mosaics = Arc::clone(&mosaics);
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || build_composites(&grid, &mosaics, &cancel))
        };
        let outcome = job.await;
        result.mosaics = Arc::try_unwrap(mosaics).unwrap_or_else(|shared| (*shared).clone());

        match outcome {
            Ok((composites, diagnostics)) => {
                info!(composites = composites.len(), "Built cross-tile composites");
                result.composites = composites;
                result.diagnostics.extend(diagnostics);
            }
            Err(e) => result.diagnostics.push(Diagnostic::TaskFailed {
                stage: Stage::Composite,
                reason: e.to_string(),
            }),
        }
    }

    /// Lists the granules available per date for a tile.
    ///
    /// No cloud filter is applied. A cancelled listing is empty.
    #[instrument(skip(self, cancel))]
    pub async fn listing(
        &self,
        tile: &str,
        start: NaiveDate,
        end: NaiveDate,
        cancel: CancellationToken,
    ) -> Result<Vec<ListingRow>, PipelineError> {
        if start > end {
            return Err(PipelineError::InvalidQuery(format!(
                "start date {} is after end date {}",
                start, end
            )));
        }
        let tile = resolve_tile(tile, self.config.resolution)?;

        let mut diagnostics = Vec::new();
        let Some(indexed) = self
            .search_tile(&tile, start, end, None, &cancel, &mut diagnostics)
            .await?
        else {
            return Ok(Vec::new());
        };

        let first_of = |granules: &[&Granule], source: SourceCollection| {
            granules
                .iter()
                .find(|g| g.source() == source)
                .map(|g| g.id.to_string())
        };

        Ok(indexed
            .by_date()
            .into_iter()
            .map(|(date, granules)| ListingRow {
                date,
                sentinel: first_of(&granules, SourceCollection::S30),
                landsat: first_of(&granules, SourceCollection::L30),
            })
            .collect())
    }

    /// Searches the catalog for one tile and indexes the results.
    ///
    /// Returns `Ok(None)` when the search was cancelled.
    async fn search_tile(
        &self,
        tile: &Tile,
        start: NaiveDate,
        end: NaiveDate,
        threshold: Option<f64>,
        cancel: &CancellationToken,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<Option<IndexedGranules>, PipelineError> {
        let mut index = GranuleIndex::new(self.config.priority)
            .with_cloud_threshold(threshold)
            .with_tile(tile.id);

        let mut records = self
            .catalog
            .search(tile.lonlat_bbox(), start, end, cancel.clone());
        while let Some(record) = records.next().await {
            match record {
                Ok(raw) => index.ingest(&raw),
                Err(CatalogError::Unavailable(e)) => {
                    warn!(tile = %tile.id, error = %e, "Catalog unavailable");
                    return Err(e.into());
                }
                Err(CatalogError::Cancelled) => {
                    diagnostics.push(Diagnostic::Cancelled {
                        tile: tile.id,
                        stage: Stage::Search,
                        date: None,
                    });
                    return Ok(None);
                }
            }
        }

        let indexed = index.finish();
        info!(
            tile = %tile.id,
            granules = indexed.granules.len(),
            cloud_filtered = indexed.cloud_filtered.len(),
            duplicates = indexed.duplicates,
            rejected = indexed.rejected,
            off_tile = indexed.off_tile,
            "Indexed catalog results"
        );

        if indexed.rejected > 0 {
            diagnostics.push(Diagnostic::RejectedRecords {
                tile: tile.id,
                count: indexed.rejected,
            });
        }
        let threshold = threshold.unwrap_or_default();
        diagnostics.extend(indexed.cloud_filtered.iter().map(|g| Diagnostic::CloudFiltered {
            granule: g.id.to_string(),
            cloud_cover: g.cloud_cover,
            threshold,
        }));

        Ok(Some(indexed))
    }

    /// Fetches every band and quality asset the contributors need.
    async fn retrieve(
        &self,
        tile: &Tile,
        indexed: &IndexedGranules,
        bands: &[String],
        cancel: &CancellationToken,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> AssetMap {
        let needs_quality = bands.iter().any(|b| b != QUALITY_BAND);
        let mut failures: Vec<RetrievalError> = Vec::new();
        let mut tasks = JoinSet::new();

        for granule in &indexed.granules {
            let granule_id = granule.id.as_str();
            let mut product_bands = BTreeSet::new();
            let mut missing = BTreeSet::new();
            for band in bands {
                match granule.asset_for(band) {
                    Some((product_band, _)) => {
                        product_bands.insert(product_band);
                    }
                    None => {
                        missing.insert(asset_band(band, granule.source()).unwrap_or(band.as_str()));
                    }
                }
            }
            if needs_quality {
                if granule.quality_asset().is_some() {
                    product_bands.insert(QUALITY_BAND);
                } else {
                    missing.insert(QUALITY_BAND);
                }
            }
            failures.extend(missing.into_iter().map(|band| {
                RetrievalError::new(granule_id, band, 0, RetrievalReason::MissingAsset)
            }));

            let shared = Arc::new(granule.clone());
            for product_band in product_bands {
                let granule = Arc::clone(&shared);
                let cache = Arc::clone(&self.cache);
                let limiter = Arc::clone(&self.downloads);
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    let outcome = match limiter.acquire(&cancel).await {
                        Some(_permit) => cache.get_or_fetch(&granule, product_band, &cancel).await,
                        None => Err(RetrievalError::new(
                            granule.id.as_str(),
                            product_band,
                            0,
                            RetrievalReason::Cancelled,
                        )),
                    };
                    ((granule.id.as_str().to_string(), product_band), outcome)
                });
            }
        }

        debug!(tile = %tile.id, tasks = tasks.len(), "Retrieving assets");

        let mut assets = AssetMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, Ok(asset))) => {
                    assets.insert(key, asset);
                }
                Ok((_, Err(e))) => failures.push(e),
                Err(e) => diagnostics.push(Diagnostic::TaskFailed {
                    stage: Stage::Retrieval,
                    reason: e.to_string(),
                }),
            }
        }

        let (cancelled, mut failures): (Vec<_>, Vec<_>) =
            failures.into_iter().partition(RetrievalError::is_cancelled);
        failures.sort_by(|a, b| (&a.granule, &a.band).cmp(&(&b.granule, &b.band)));
        for failure in &failures {
            warn!(error = %failure, "Asset retrieval failed");
        }
        diagnostics.extend(failures.into_iter().map(Diagnostic::Retrieval));
        if !cancelled.is_empty() {
            diagnostics.push(Diagnostic::Cancelled {
                tile: tile.id,
                stage: Stage::Retrieval,
                date: None,
            });
        }

        assets
    }

    /// Assembles every (date, band) mosaic of a tile.
    async fn assemble(
        &self,
        tile: &Tile,
        indexed: &IndexedGranules,
        bands: &[String],
        assets: AssetMap,
        cancel: &CancellationToken,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Vec<Mosaic> {
        let assets = Arc::new(assets);
        let by_date = indexed.by_date();
        let mut tasks = JoinSet::new();

        for date in indexed.candidate_dates() {
            let job = DateJob {
                tile: tile.clone(),
                date,
                bands: bands.to_vec(),
                granules: by_date
                    .get(&date)
                    .map(|gs| gs.iter().map(|g| (*g).clone()).collect())
                    .unwrap_or_default(),
                assets: Arc::clone(&assets),
                assembler: self.assembler,
                cancel: cancel.clone(),
            };
            let limiter = Arc::clone(&self.assembly);
            let cancel = cancel.clone();
            let tile_id = tile.id;

            tasks.spawn(async move {
                let Some(_permit) = limiter.acquire(&cancel).await else {
                    return DateOutcome::cancelled(tile_id, date);
                };
                match tokio::task::spawn_blocking(move || job.run()).await {
                    Ok(outcome) => outcome,
                    Err(e) => DateOutcome {
                        date,
                        mosaics: Vec::new(),
                        diagnostics: vec![Diagnostic::TaskFailed {
                            stage: Stage::Assembly,
                            reason: e.to_string(),
                        }],
                    },
                }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => diagnostics.push(Diagnostic::TaskFailed {
                    stage: Stage::Assembly,
                    reason: e.to_string(),
                }),
            }
        }
        outcomes.sort_by_key(|o| o.date);

        let mut mosaics = Vec::new();
        for outcome in outcomes {
            mosaics.extend(outcome.mosaics);
            diagnostics.extend(outcome.diagnostics);
        }
        mosaics
    }
}

/// Tiles of a target, plus the composite grid for areal geometries.
fn resolve_target(
    target: &QueryTarget,
    resolution: f64,
) -> Result<(Vec<Tile>, Option<RegionGrid>), PipelineError> {
    Ok(match target {
        QueryTarget::Tile(id) => (vec![resolve_tile(id, resolution)?], None),
        QueryTarget::Geometry(geometry) => {
            let tiles = resolve_geometry(geometry, resolution)?;
            let region = if geometry.is_areal() {
                Some(RegionGrid::for_bbox(geometry.bbox(), resolution)?)
            } else {
                None
            };
            (tiles, region)
        }
    })
}

/// Builds every (date, band) composite from finished mosaics.
fn build_composites(
    grid: &RegionGrid,
    mosaics: &[Mosaic],
    cancel: &CancellationToken,
) -> (Vec<Composite>, Vec<Diagnostic>) {
    let mut groups: BTreeMap<(NaiveDate, &str), Vec<&Mosaic>> = BTreeMap::new();
    for mosaic in mosaics {
        groups
            .entry((mosaic.date, mosaic.band.as_str()))
            .or_default()
            .push(mosaic);
    }

    let mut composites = Vec::with_capacity(groups.len());
    let mut diagnostics = Vec::new();
    for ((date, band), group) in groups {
        if cancel.is_cancelled() {
            diagnostics.push(Diagnostic::Cancelled {
                tile: group[0].tile.id,
                stage: Stage::Composite,
                date: Some(date),
            });
            continue;
        }
        composites.push(Composite::build(grid, date, band, &group));
    }
    (composites, diagnostics)
}

struct DateOutcome {
    date: NaiveDate,
    mosaics: Vec<Mosaic>,
    diagnostics: Vec<Diagnostic>,
}

impl DateOutcome {
    fn cancelled(tile: TileId, date: NaiveDate) -> Self {
        Self {
            date,
            mosaics: Vec::new(),
            diagnostics: vec![Diagnostic::Cancelled {
                tile,
                stage: Stage::Assembly,
                date: Some(date),
            }],
        }
    }
}

/// Blocking assembly of all bands for one date.
struct DateJob {
    tile: Tile,
    date: NaiveDate,
    bands: Vec<String>,
    /// Contributors in index order.
    granules: Vec<Granule>,
    assets: Arc<AssetMap>,
    assembler: MosaicAssembler,
    cancel: CancellationToken,
}

impl DateJob {
    fn run(self) -> DateOutcome {
        let mut diagnostics = Vec::new();
        let mut mosaics = Vec::new();

        let needs_quality = self.bands.iter().any(|b| b != QUALITY_BAND);
        let mut quality: HashMap<String, Arc<GeoRaster>> = HashMap::new();
        if needs_quality {
            for granule in &self.granules {
                if let Some(raster) = self.decode(granule, QUALITY_BAND, &mut diagnostics) {
                    quality.insert(granule.id.as_str().to_string(), raster);
                }
            }
        }

        for band in &self.bands {
            if self.cancel.is_cancelled() {
                diagnostics.push(Diagnostic::Cancelled {
                    tile: self.tile.id,
                    stage: Stage::Assembly,
                    date: Some(self.date),
                });
                break;
            }

            let mut contributors = Vec::with_capacity(self.granules.len());
            for granule in &self.granules {
                let Some(product_band) = asset_band(band, granule.source()) else {
                    continue;
                };
                let quality_raster = if band == QUALITY_BAND {
                    None
                } else {
                    match quality.get(granule.id.as_str()) {
                        Some(q) => Some(Arc::clone(q)),
                        None => {
                            debug!(granule = %granule.id, "No quality mask, granule excluded");
                            continue;
                        }
                    }
                };
                let Some(raster) = self.decode(granule, product_band, &mut diagnostics) else {
                    continue;
                };

                match Contributor::new(
                    granule.id.as_str(),
                    granule.source(),
                    raster,
                    quality_raster,
                    scaling_for(product_band, granule.source()),
                ) {
                    Ok(c) => contributors.push(c),
                    Err(e) => diagnostics.push(self.unreadable(granule, product_band, e.to_string())),
                }
            }

            let mosaic = self
                .assembler
                .assemble(&self.tile, self.date, band, &contributors);
            if let Err(e) = mosaic.completeness() {
                warn!(error = %e, "Incomplete mosaic");
                diagnostics.push(e.into());
            }
            mosaics.push(mosaic);
        }

        DateOutcome {
            date: self.date,
            mosaics,
            diagnostics,
        }
    }

    /// Decodes a retrieved asset; `None` if it was not retrieved or is
    /// unreadable.
    fn decode(
        &self,
        granule: &Granule,
        product_band: &'static str,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Option<Arc<GeoRaster>> {
        let asset = self
            .assets
            .get(&(granule.id.as_str().to_string(), product_band))?;
        match raster::read(&asset.path) {
            Ok(r) => Some(Arc::new(r)),
            Err(e) => {
                warn!(
                    granule = %granule.id,
                    band = product_band,
                    path = %asset.path.display(),
                    error = %e,
                    "Unreadable asset"
                );
                diagnostics.push(self.unreadable(granule, product_band, e.to_string()));
                None
            }
        }
    }

    fn unreadable(&self, granule: &Granule, band: &'static str, reason: String) -> Diagnostic {
        let path = self
            .assets
            .get(&(granule.id.as_str().to_string(), band))
            .map(|a| a.path.clone())
            .unwrap_or_default();
        Diagnostic::UnreadableAsset {
            granule: granule.id.to_string(),
            band: band.to_string(),
            path,
            reason,
        }
    }
}
