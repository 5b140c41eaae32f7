//! List command - show which granules exist per date for a tile.

use chrono::NaiveDate;
use clap::Args;
use console::style;
use hlsmosaic::pipeline::{HlsPipeline, ListingRow};

use super::common::{parse_date, resolve_pipeline_config, PipelineArgs};
use crate::error::CliError;
use crate::runner::{earthdata_token, CliRunner};

/// Arguments for the list command.
#[derive(Debug, Args)]
pub struct ListArgs {
    /// Tile identifier (e.g. 10SEG)
    pub tile: String,

    /// First acquisition date (YYYY-MM-DD, inclusive)
    #[arg(long, value_parser = parse_date)]
    pub start: NaiveDate,

    /// Last acquisition date (YYYY-MM-DD, inclusive)
    #[arg(long, value_parser = parse_date)]
    pub end: NaiveDate,

    /// Print only the dates
    #[arg(long)]
    pub dates_only: bool,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

/// Run the list command.
pub fn run(args: ListArgs) -> Result<(), CliError> {
    let runner = CliRunner::new()?;
    runner.log_startup("list");

    let config = resolve_pipeline_config(&args.pipeline, runner.config());
    let cancel = runner.cancel_on_ctrlc()?;
    let pipeline = HlsPipeline::from_config(config, earthdata_token())?;
    let rows = runner.block_on(pipeline.listing(&args.tile, args.start, args.end, cancel))?;

    if args.dates_only {
        for date in hlsmosaic::pipeline::dates_listed(&rows) {
            println!("{}", date);
        }
        return Ok(());
    }

    if rows.is_empty() {
        println!("No granules found for {} between {} and {}", args.tile, args.start, args.end);
        return Ok(());
    }
    println!("{}", style(format!("{:<12} {:<40} {}", "DATE", "S30", "L30")).bold());
    for row in &rows {
        println!("{}", format_row(row));
    }
    println!();
    println!("{} date(s)", rows.len());
    Ok(())
}

fn format_row(row: &ListingRow) -> String {
    format!(
        "{:<12} {:<40} {}",
        row.date.to_string(),
        row.sentinel.as_deref().unwrap_or("-"),
        row.landsat.as_deref().unwrap_or("-")
    )
}
