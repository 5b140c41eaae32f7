//! Search-retrieve-assemble pipeline
//!
//! [`HlsPipeline`] ties the components together. For each tile of a
//! [`Query`] it searches the catalog, indexes and ranks the granules,
//! retrieves the needed band and quality assets through the cache, and
//! assembles one [`Mosaic`] per date and band. Bounding-box and polygon
//! queries also get one cross-tile [`Composite`] per date and band, clipped
//! to the query's bounding box.
//!
//! Only grid resolution and catalog failures abort a query. Every other
//! problem becomes a [`Diagnostic`] on the [`QueryResult`] next to whatever
//! mosaics could be produced.
//!
//! # Example
//!
//! ```ignore
//! use hlsmosaic::pipeline::{write_mosaic, HlsPipeline, PipelineConfig, Query};
//!
//! let pipeline = HlsPipeline::from_config(PipelineConfig::default(), token)?;
//! let query = Query::for_tile("10SEG", start, end)
//!     .with_bands(["red"])
//!     .with_cloud_threshold(20.0);
//!
//! let result = pipeline.resolve(&query, CancellationToken::new()).await?;
//! for mosaic in &result.mosaics {
//!     write_mosaic(Path::new("out"), mosaic)?;
//! }
//! ```

mod diagnostics;
mod limiter;
mod orchestrator;
mod query;

pub use diagnostics::{Diagnostic, OutputError, PipelineError, SetupError, Stage};
pub use limiter::{default_cpu_permits, ConcurrencyLimiter, LimiterPermit};
pub use orchestrator::{dates_listed, ListingRow};
pub use query::{Query, QueryTarget};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{write_atomic, AssetCache, CacheConfig, CacheError};
use crate::catalog::{CatalogConfig, StacCatalog};
use crate::config::{
    default_cache_directory, ConfigFile, DEFAULT_PARALLEL_DOWNLOADS, DEFAULT_TIMEOUT_SECS,
};
use crate::coord::{TileId, DEFAULT_RESOLUTION};
use crate::index::SourcePriority;
use crate::mosaic::{Composite, Mosaic, MosaicAssembler, QualityMask};
use crate::provider::{AsyncHttpClient, ReqwestClient};
use crate::raster::Resampling;
use crate::retry::RetryPolicy;

/// Runtime configuration of the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub catalog: CatalogConfig,
    pub cache: CacheConfig,
    /// Shared by catalog search and asset download.
    pub retry: RetryPolicy,
    pub timeout_secs: u64,
    pub parallel_downloads: usize,
    pub assembly_workers: usize,
    pub resolution: f64,
    pub priority: SourcePriority,
    /// Applied to queries that do not set their own threshold.
    pub cloud_threshold: Option<f64>,
    pub resampling: Resampling,
    pub quality_mask: QualityMask,
    pub apply_scale: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            catalog: CatalogConfig::default(),
            cache: CacheConfig::new(default_cache_directory()),
            retry: RetryPolicy::default(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            parallel_downloads: DEFAULT_PARALLEL_DOWNLOADS,
            assembly_workers: default_cpu_permits(),
            resolution: DEFAULT_RESOLUTION,
            priority: SourcePriority::default(),
            cloud_threshold: None,
            resampling: Resampling::default(),
            quality_mask: QualityMask::default(),
            apply_scale: true,
        }
    }
}

impl PipelineConfig {
    /// Builds the runtime configuration from the configuration file.
    pub fn from_config_file(file: &ConfigFile) -> Self {
        let retry = RetryPolicy::exponential_with_delay(
            file.download.max_attempts,
            Duration::from_millis(file.download.initial_backoff_ms),
        );
        Self {
            catalog: CatalogConfig::default()
                .with_endpoint(file.catalog.endpoint.clone())
                .with_collections(file.catalog.collections.clone())
                .with_page_size(file.catalog.page_size)
                .with_max_days_per_request(file.catalog.max_days_per_request),
            cache: CacheConfig::new(file.cache.directory.clone())
                .with_verify_checksums(file.cache.verify_checksums),
            retry,
            timeout_secs: file.download.timeout_secs,
            parallel_downloads: file.download.parallel,
            assembly_workers: default_cpu_permits(),
            resolution: file.mosaic.resolution,
            priority: file.mosaic.source_priority,
            cloud_threshold: file.mosaic.cloud_threshold,
            resampling: file.mosaic.resampling,
            quality_mask: QualityMask::new(file.mosaic.cloud_mask_bits),
            apply_scale: file.mosaic.apply_scale,
        }
    }

    pub fn with_catalog(mut self, catalog: CatalogConfig) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache.directory = dir.into();
        self
    }

    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.cache.verify_checksums = verify;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_parallel_downloads(mut self, parallel: usize) -> Self {
        self.parallel_downloads = parallel;
        self
    }

    pub fn with_assembly_workers(mut self, workers: usize) -> Self {
        self.assembly_workers = workers;
        self
    }

    pub fn with_resolution(mut self, metres: f64) -> Self {
        self.resolution = metres;
        self
    }

    pub fn with_priority(mut self, priority: SourcePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cloud_threshold(mut self, percent: Option<f64>) -> Self {
        self.cloud_threshold = percent;
        self
    }

    pub fn with_resampling(mut self, resampling: Resampling) -> Self {
        self.resampling = resampling;
        self
    }

    pub fn with_quality_mask(mut self, mask: QualityMask) -> Self {
        self.quality_mask = mask;
        self
    }

    pub fn with_apply_scale(mut self, apply: bool) -> Self {
        self.apply_scale = apply;
        self
    }
}

/// Output of [`HlsPipeline::resolve`].
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    /// Tiles the query resolved to, sorted.
    pub tiles: Vec<TileId>,
    /// One mosaic per (tile, date, band), sorted by that key.
    pub mosaics: Vec<Mosaic>,
    /// Cross-tile composites per (date, band) for areal targets, sorted.
    pub composites: Vec<Composite>,
    pub diagnostics: Vec<Diagnostic>,
}

impl QueryResult {
    /// Returns true if any work was cut short by cancellation.
    pub fn was_cancelled(&self) -> bool {
        self.diagnostics.iter().any(Diagnostic::is_cancelled)
    }

    /// Returns true when mosaics were produced but not one pixel is valid.
    pub fn is_empty_output(&self) -> bool {
        !self.mosaics.is_empty() && self.mosaics.iter().all(|m| m.valid_pixels() == 0)
    }

    /// Asset retrieval failures other than cancellation.
    pub fn retrieval_failures(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| matches!(d, Diagnostic::Retrieval(e) if !e.is_cancelled()))
            .count()
    }

    /// Returns true when there are no diagnostics at all.
    pub fn is_clean(&self) -> bool {
        self.diagnostics.is_empty()
    }
}

/// The search-retrieve-assemble pipeline.
pub struct HlsPipeline {
    config: PipelineConfig,
    catalog: StacCatalog,
    cache: Arc<AssetCache>,
    downloads: Arc<ConcurrencyLimiter>,
    assembly: Arc<ConcurrencyLimiter>,
    assembler: MosaicAssembler,
}

impl HlsPipeline {
    /// Creates a pipeline with explicit HTTP clients for the catalog and for
    /// asset downloads.
    pub fn new(
        config: PipelineConfig,
        catalog_client: Arc<dyn AsyncHttpClient>,
        asset_client: Arc<dyn AsyncHttpClient>,
    ) -> Result<Self, SetupError> {
        let catalog = StacCatalog::new(catalog_client, config.catalog.clone(), config.retry.clone());
        let cache_config = config.cache.clone().with_retry(config.retry.clone());
        let cache = Arc::new(AssetCache::open(cache_config, asset_client)?);
        Ok(Self::with_cache(config, catalog, cache))
    }

    /// Creates a pipeline over an existing catalog and cache.
    pub fn with_cache(config: PipelineConfig, catalog: StacCatalog, cache: Arc<AssetCache>) -> Self {
        let assembler = MosaicAssembler::new()
            .with_resampling(config.resampling)
            .with_quality_mask(config.quality_mask)
            .with_apply_scale(config.apply_scale);
        Self {
            downloads: Arc::new(ConcurrencyLimiter::new(config.parallel_downloads, "downloads")),
            assembly: Arc::new(ConcurrencyLimiter::new(config.assembly_workers, "assembly")),
            config,
            catalog,
            cache,
            assembler,
        }
    }

    /// Creates a pipeline using HTTP, with an optional Earthdata bearer token
    /// for asset downloads.
    pub fn from_config(config: PipelineConfig, token: Option<String>) -> Result<Self, SetupError> {
        let client: Arc<dyn AsyncHttpClient> =
            Arc::new(ReqwestClient::new(config.timeout_secs, token)?);
        Self::new(config, Arc::clone(&client), client)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// The shared asset cache.
    pub fn cache(&self) -> &Arc<AssetCache> {
        &self.cache
    }
}

/// Writes a mosaic as `<dir>/HLS_<band>_<tile>_<YYYYMMDD>.tif`.
///
/// The file is written to a temporary name and renamed into place.
pub fn write_mosaic(dir: &Path, mosaic: &Mosaic) -> Result<PathBuf, OutputError> {
    write_output(dir, &mosaic.file_name(), mosaic.encode()?)
}

/// Writes a composite as `<dir>/HLS_<band>_<YYYYMMDD>.tif`, atomically.
pub fn write_composite(dir: &Path, composite: &Composite) -> Result<PathBuf, OutputError> {
    write_output(dir, &composite.file_name(), composite.encode()?)
}

fn write_output(dir: &Path, name: &str, bytes: Vec<u8>) -> Result<PathBuf, OutputError> {
    std::fs::create_dir_all(dir).map_err(|e| OutputError::Write(CacheError::io(dir, e)))?;
    let path = dir.join(name);
    write_atomic(dir, &path, &bytes)?;
    Ok(path)
}
