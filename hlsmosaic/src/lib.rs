//! HLS Mosaic - Harmonized Landsat-Sentinel search, cache and mosaic
//!
//! This library locates Harmonized Landsat-Sentinel (HLS) surface reflectance
//! granules for a tile and date range, caches the downloaded band assets
//! locally and composites them into one raster per tile, date and band on the
//! Sentinel-2 MGRS tiling grid.
//!
//! # High-Level API
//!
//! The [`pipeline`] module drives the whole search-retrieve-assemble flow:
//!
//! ```ignore
//! use hlsmosaic::config::ConfigFile;
//! use hlsmosaic::pipeline::{HlsPipeline, PipelineConfig, Query};
//! use tokio_util::sync::CancellationToken;
//!
//! let config = PipelineConfig::from_config_file(&ConfigFile::load()?);
//! let pipeline = HlsPipeline::from_config(config, std::env::var("EARTHDATA_TOKEN").ok())?;
//!
//! let query = Query::for_tile("10SEG", start, end).with_bands(["red", "NIR"]);
//! let result = pipeline.resolve(&query, CancellationToken::new()).await?;
//! for diagnostic in &result.diagnostics {
//!     eprintln!("{}", diagnostic);
//! }
//! ```

pub mod cache;
pub mod catalog;
pub mod config;
pub mod coord;
pub mod granule;
pub mod index;
pub mod logging;
pub mod mosaic;
pub mod pipeline;
pub mod provider;
pub mod raster;
pub mod retry;

/// Version of the HLS Mosaic library and CLI.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_not_empty() {
        assert!(!VERSION.is_empty(), "Version should not be empty");
    }
}
