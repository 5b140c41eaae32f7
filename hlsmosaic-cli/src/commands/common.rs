//! Common types and utilities shared across CLI commands.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Args, ValueEnum};
use hlsmosaic::config::ConfigFile;
use hlsmosaic::coord::{BoundingBox, Geometry, Point};
use hlsmosaic::index::SourcePriority;
use hlsmosaic::pipeline::{PipelineConfig, QueryTarget};
use hlsmosaic::raster::Resampling;

use crate::error::CliError;

/// Source priority selection for CLI arguments.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum PriorityArg {
    /// Sentinel-derived (S30) granules win ties
    Sentinel,
    /// Landsat-derived (L30) granules win ties
    Landsat,
    /// No preference; the least cloudy granule wins
    Equal,
}

impl From<PriorityArg> for SourcePriority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Sentinel => SourcePriority::Sentinel,
            PriorityArg::Landsat => SourcePriority::Landsat,
            PriorityArg::Equal => SourcePriority::Equal,
        }
    }
}

/// Resampling selection for CLI arguments.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq)]
pub enum ResamplingArg {
    Nearest,
    Bilinear,
}

impl From<ResamplingArg> for Resampling {
    fn from(arg: ResamplingArg) -> Self {
        match arg {
            ResamplingArg::Nearest => Resampling::Nearest,
            ResamplingArg::Bilinear => Resampling::Bilinear,
        }
    }
}

/// Where a query applies: exactly one of tile, point or bounding box.
#[derive(Debug, Clone, Args)]
#[group(required = true, multiple = false)]
pub struct TargetArgs {
    /// Tile identifier (e.g. 10SEG)
    #[arg(long)]
    pub tile: Option<String>,

    /// Point as LON,LAT; every tile containing it is processed
    #[arg(long, value_name = "LON,LAT", allow_hyphen_values = true)]
    pub point: Option<String>,

    /// Bounding box as WEST,SOUTH,EAST,NORTH
    #[arg(long, value_name = "W,S,E,N", allow_hyphen_values = true)]
    pub bbox: Option<String>,
}

impl TargetArgs {
    pub fn to_target(&self) -> Result<QueryTarget, CliError> {
        if let Some(tile) = &self.tile {
            return Ok(QueryTarget::Tile(tile.clone()));
        }
        if let Some(point) = &self.point {
            return parse_point(point).map(|p| QueryTarget::Geometry(Geometry::Point(p)));
        }
        if let Some(bbox) = &self.bbox {
            let bbox: BoundingBox = bbox
                .parse()
                .map_err(|e| CliError::Config(format!("Invalid --bbox '{}': {}", bbox, e)))?;
            return Ok(QueryTarget::Geometry(Geometry::BoundingBox(bbox)));
        }
        Err(CliError::Config(
            "One of --tile, --point or --bbox is required".to_string(),
        ))
    }
}

/// Pipeline overrides shared by the query commands.
#[derive(Debug, Clone, Default, Args)]
pub struct PipelineArgs {
    /// HTTP timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Maximum concurrent downloads
    #[arg(long)]
    pub parallel: Option<usize>,

    /// Asset cache directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// STAC API root
    #[arg(long)]
    pub endpoint: Option<String>,
}

/// Parses a `YYYY-MM-DD` date.
pub fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .map_err(|e| format!("'{}' is not a YYYY-MM-DD date: {}", s, e))
}

/// Parses `LON,LAT`.
pub fn parse_point(s: &str) -> Result<Point, CliError> {
    let invalid = || CliError::Config(format!("Invalid --point '{}', expected LON,LAT", s));
    let (lon, lat) = s.split_once(',').ok_or_else(invalid)?;
    let lon: f64 = lon.trim().parse().map_err(|_| invalid())?;
    let lat: f64 = lat.trim().parse().map_err(|_| invalid())?;
    Ok(Point::new(lon, lat))
}

/// Builds the pipeline configuration: CLI overrides, then config file.
pub fn resolve_pipeline_config(args: &PipelineArgs, config: &ConfigFile) -> PipelineConfig {
    let mut pipeline = PipelineConfig::from_config_file(config);
    if let Some(timeout) = args.timeout {
        pipeline = pipeline.with_timeout_secs(timeout);
    }
    if let Some(parallel) = args.parallel {
        pipeline = pipeline.with_parallel_downloads(parallel);
    }
    if let Some(dir) = &args.cache_dir {
        pipeline = pipeline.with_cache_dir(dir);
    }
    if let Some(endpoint) = &args.endpoint {
        let catalog = pipeline.catalog.clone().with_endpoint(endpoint.clone());
        pipeline = pipeline.with_catalog(catalog);
    }
    pipeline
}
