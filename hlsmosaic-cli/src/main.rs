//! HLS Mosaic CLI - Command-line interface
//!
//! Searches the HLS catalog, caches band assets and writes one GeoTIFF per
//! tile, date and band.

mod commands;
mod error;
mod runner;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::style;
use hlsmosaic::logging::{init_logging, LoggingConfig};

use commands::cache::CacheAction;
use commands::config::ConfigCommands;
use commands::list::ListArgs;
use commands::mosaic::MosaicArgs;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "hlsmosaic", version, about = "Harmonized Landsat-Sentinel search, cache and mosaic")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write daily-rolling log files to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Search, download and composite granules into GeoTIFF mosaics
    Mosaic(MosaicArgs),

    /// List available granules per date for a tile
    List(ListArgs),

    /// Manage the asset cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// View or initialise the configuration file
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

fn run(cli: Cli) -> Result<(), CliError> {
    let mut logging = LoggingConfig::default()
        .verbose(cli.verbose)
        .with_ansi(console::colors_enabled_stderr());
    if let Some(dir) = cli.log_dir {
        logging = logging.with_log_dir(dir);
    }
    let _guard = init_logging(logging)?;

    match cli.command {
        Commands::Mosaic(args) => commands::mosaic::run(args),
        Commands::List(args) => commands::list::run(args),
        Commands::Cache { action } => commands::cache::run(action),
        Commands::Config { command } => commands::config::run(command),
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("{} {}", style("error:").red().bold(), e);
        std::process::exit(e.exit_code());
    }
}
