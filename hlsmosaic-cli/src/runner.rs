//! Shared command setup: configuration, async runtime and Ctrl+C handling.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hlsmosaic::config::{config_file_path, ConfigFile};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::CliError;

/// Environment variable holding the Earthdata bearer token.
pub const TOKEN_ENV: &str = "EARTHDATA_TOKEN";

/// Per-invocation context for commands that talk to the pipeline.
pub struct CliRunner {
    config: ConfigFile,
    runtime: Runtime,
}

impl CliRunner {
    /// Loads the configuration file and starts a multi-threaded runtime.
    pub fn new() -> Result<Self, CliError> {
        let config = ConfigFile::load()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("hlsmosaic-worker")
            .build()
            .map_err(|e| CliError::Runtime(format!("Failed to start async runtime: {}", e)))?;
        Ok(Self { config, runtime })
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    pub fn log_startup(&self, command: &str) {
        info!(
            version = hlsmosaic::VERSION,
            command,
            config = %config_file_path().display(),
            "Starting hlsmosaic"
        );
    }

    /// Runs a future to completion on the runtime.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Returns a token cancelled on the first Ctrl+C.
    ///
    /// A second Ctrl+C exits immediately.
    pub fn cancel_on_ctrlc(&self) -> Result<CancellationToken, CliError> {
        let cancel = CancellationToken::new();
        let handler_token = cancel.clone();
        let interrupted = Arc::new(AtomicBool::new(false));

        ctrlc::set_handler(move || {
            if interrupted.swap(true, Ordering::SeqCst) {
                std::process::exit(130);
            }
            eprintln!();
            eprintln!("Interrupted, finishing up (press Ctrl+C again to abort)...");
            handler_token.cancel();
        })
        .map_err(|e| CliError::Runtime(format!("Failed to set signal handler: {}", e)))?;

        Ok(cancel)
    }
}

/// Earthdata token from the environment, if set and non-empty.
pub fn earthdata_token() -> Option<String> {
    std::env::var(TOKEN_ENV)
        .ok()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}
