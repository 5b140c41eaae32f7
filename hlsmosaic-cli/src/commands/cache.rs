//! Cache management CLI commands.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Subcommand;
use hlsmosaic::cache::{AssetCache, CacheConfig};
use hlsmosaic::config::{format_size, ConfigFile};
use hlsmosaic::provider::{AsyncHttpClient, ReqwestClient};

use crate::error::CliError;
use crate::runner::CliRunner;

/// Cache action subcommands.
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Remove every cached asset
    Clear {
        /// Cache directory (defaults to the configured one)
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
    /// Show cache statistics
    Stats {
        /// Cache directory (defaults to the configured one)
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
}

fn open_cache(config: &ConfigFile, dir: Option<PathBuf>) -> Result<AssetCache, String> {
    let cache_config = CacheConfig::new(dir.unwrap_or_else(|| config.cache.directory.clone()))
        .with_verify_checksums(config.cache.verify_checksums);
    let client: Arc<dyn AsyncHttpClient> = Arc::new(
        ReqwestClient::new(config.download.timeout_secs, None).map_err(|e| e.to_string())?,
    );
    AssetCache::open(cache_config, client).map_err(|e| e.to_string())
}

/// Run a cache subcommand.
pub fn run(action: CacheAction) -> Result<(), CliError> {
    let runner = CliRunner::new()?;

    match action {
        CacheAction::Clear { cache_dir } => {
            let cache = open_cache(runner.config(), cache_dir).map_err(CliError::CacheClear)?;
            println!("Clearing asset cache at: {}", cache.root().display());

            match runner.block_on(cache.clear()) {
                Ok(removed) => {
                    println!(
                        "Deleted {} assets, freed {}",
                        removed.entries,
                        format_size(removed.total_bytes)
                    );
                    Ok(())
                }
                Err(e) => Err(CliError::CacheClear(e.to_string())),
            }
        }
        CacheAction::Stats { cache_dir } => {
            let cache = open_cache(runner.config(), cache_dir).map_err(CliError::CacheStats)?;
            let stats = cache.stats();
            println!("Asset cache: {}", cache.root().display());
            println!("  Assets: {}", stats.entries);
            println!("  Size:   {}", format_size(stats.total_bytes));
            Ok(())
        }
    }
}
