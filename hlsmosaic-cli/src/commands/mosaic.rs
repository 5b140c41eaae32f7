//! Mosaic command - search, retrieve and composite HLS granules into GeoTIFFs.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use clap::Args;
use console::style;
use hlsmosaic::mosaic::QualityMask;
use hlsmosaic::pipeline::{
    write_composite, write_mosaic, HlsPipeline, Query, QueryResult, QueryTarget,
};

use super::common::{
    parse_date, resolve_pipeline_config, PipelineArgs, PriorityArg, ResamplingArg, TargetArgs,
};
use crate::error::CliError;
use crate::runner::{earthdata_token, CliRunner};

/// Arguments for the mosaic command.
#[derive(Debug, Args)]
pub struct MosaicArgs {
    #[command(flatten)]
    pub target: TargetArgs,

    /// First acquisition date (YYYY-MM-DD, inclusive)
    #[arg(long, value_parser = parse_date)]
    pub start: NaiveDate,

    /// Last acquisition date (YYYY-MM-DD, inclusive)
    #[arg(long, value_parser = parse_date)]
    pub end: NaiveDate,

    /// Bands to produce, by common name (red, NIR) or band id (B04, Fmask)
    #[arg(long, value_delimiter = ',')]
    pub bands: Vec<String>,

    /// Exclude granules with more cloud cover than this (percent)
    #[arg(long)]
    pub cloud_threshold: Option<f64>,

    /// Give up on unfinished work after this many seconds
    #[arg(long, value_name = "SECONDS")]
    pub deadline: Option<u64>,

    /// Output pixel size in metres
    #[arg(long)]
    pub resolution: Option<f64>,

    /// Which source wins when granules share a date
    #[arg(long, value_enum)]
    pub priority: Option<PriorityArg>,

    #[arg(long, value_enum)]
    pub resampling: Option<ResamplingArg>,

    /// Fmask bits treated as contaminated (default 15: cirrus, cloud, adjacent, shadow)
    #[arg(long)]
    pub mask_bits: Option<u8>,

    /// Write raw digital numbers instead of scaled reflectance
    #[arg(long)]
    pub raw: bool,

    /// Output directory for the GeoTIFFs
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Do not write mosaics without any valid pixel
    #[arg(long)]
    pub skip_empty: bool,

    /// For --bbox targets, also write the per-tile mosaics next to the
    /// combined rasters
    #[arg(long)]
    pub per_tile: bool,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

/// Run the mosaic command.
pub fn run(args: MosaicArgs) -> Result<(), CliError> {
    let runner = CliRunner::new()?;
    runner.log_startup("mosaic");
    let config = runner.config();

    let mut pipeline_config = resolve_pipeline_config(&args.pipeline, config);
    if let Some(priority) = args.priority {
        pipeline_config = pipeline_config.with_priority(priority.into());
    }
    if let Some(resampling) = args.resampling {
        pipeline_config = pipeline_config.with_resampling(resampling.into());
    }
    if let Some(bits) = args.mask_bits {
        pipeline_config = pipeline_config.with_quality_mask(QualityMask::new(bits));
    }
    if args.raw {
        pipeline_config = pipeline_config.with_apply_scale(false);
    }
    let output_dir = args
        .output
        .clone()
        .unwrap_or_else(|| config.mosaic.output_directory.clone());

    let mut query = match args.target.to_target()? {
        QueryTarget::Tile(tile) => Query::for_tile(tile, args.start, args.end),
        QueryTarget::Geometry(g) => Query::for_geometry(g, args.start, args.end),
    };
    if !args.bands.is_empty() {
        query = query.with_bands(args.bands.iter().cloned());
    }
    if let Some(threshold) = args.cloud_threshold {
        query = query.with_cloud_threshold(threshold);
    }
    if let Some(secs) = args.deadline {
        query = query.with_deadline(Duration::from_secs(secs));
    }
    if let Some(resolution) = args.resolution {
        query = query.with_resolution(resolution);
    }

    let token = earthdata_token();
    if token.is_none() {
        eprintln!(
            "{} EARTHDATA_TOKEN is not set; protected assets will fail to download",
            style("warning:").yellow().bold()
        );
    }

    println!("HLS Mosaic v{}", hlsmosaic::VERSION);
    println!("Dates:     {} to {}", args.start, args.end);
    println!("Output:    {}", output_dir.display());
    println!("Cache:     {}", pipeline_config.cache.directory.display());
    println!();

    let cancel = runner.cancel_on_ctrlc()?;
    let pipeline = HlsPipeline::from_config(pipeline_config, token)?;
    let result = runner.block_on(pipeline.resolve(&query, cancel))?;

    if let Err(e) = check_downloads(&result) {
        report(&result, &[], &pipeline);
        return Err(e);
    }

    let written = write_outputs(&output_dir, &result, args.skip_empty, args.per_tile)?;
    report(&result, &written, &pipeline);
    Ok(())
}

/// Fails when mosaics exist but every one is empty because downloads failed.
fn check_downloads(result: &QueryResult) -> Result<(), CliError> {
    let failures = result.retrieval_failures();
    if result.is_empty_output() && failures > 0 {
        return Err(CliError::NoData { failures });
    }
    Ok(())
}

/// Writes composites for areal targets and per-tile mosaics otherwise.
fn write_outputs(
    dir: &std::path::Path,
    result: &QueryResult,
    skip_empty: bool,
    per_tile: bool,
) -> Result<Vec<PathBuf>, CliError> {
    let mut written = Vec::with_capacity(result.mosaics.len() + result.composites.len());
    for composite in &result.composites {
        if skip_empty && composite.valid_pixels() == 0 {
            continue;
        }
        written.push(write_composite(dir, composite)?);
    }
    if !result.composites.is_empty() && !per_tile {
        return Ok(written);
    }
    for mosaic in &result.mosaics {
        if skip_empty && mosaic.valid_pixels() == 0 {
            continue;
        }
        written.push(write_mosaic(dir, mosaic)?);
    }
    Ok(written)
}

fn report(result: &QueryResult, written: &[PathBuf], pipeline: &HlsPipeline) {
    let tiles: Vec<String> = result.tiles.iter().map(|t| t.to_string()).collect();
    println!("Tiles:     {}", tiles.join(", "));

    if result.mosaics.is_empty() {
        println!("No mosaics produced.");
    }
    for path in written {
        println!("  {} {}", style("wrote").green(), path.display());
    }

    if !result.diagnostics.is_empty() {
        println!();
        println!("Diagnostics ({}):", result.diagnostics.len());
        for diagnostic in &result.diagnostics {
            println!("  {} {}", style(diagnostic.kind()).yellow(), diagnostic);
        }
    }

    let stats = pipeline.cache().stats();
    println!();
    println!(
        "Cache: {} hits, {} downloads ({})",
        stats.hits,
        stats.downloads,
        hlsmosaic::config::format_size(stats.downloaded_bytes)
    );
    if result.was_cancelled() {
        println!("{}", style("Query was cancelled; results are partial.").yellow());
    }
}
