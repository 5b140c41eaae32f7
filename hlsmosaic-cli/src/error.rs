//! CLI error type and exit codes.

use std::fmt;

use hlsmosaic::config::ConfigFileError;
use hlsmosaic::logging::LoggingError;
use hlsmosaic::pipeline::{OutputError, PipelineError, SetupError};

/// Exit code for failed queries and runtime errors.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for invalid arguments or configuration.
pub const EXIT_USAGE: i32 = 2;

/// Errors surfaced by CLI commands.
#[derive(Debug)]
pub enum CliError {
    /// Invalid configuration file or argument combination.
    Config(String),
    /// The query could not be resolved at all.
    Query(PipelineError),
    /// The pipeline could not be constructed.
    Setup(SetupError),
    /// A mosaic could not be written.
    Output(OutputError),
    /// Every asset download failed; the mosaics hold no valid pixel.
    NoData { failures: usize },
    CacheClear(String),
    CacheStats(String),
    /// Tokio runtime, signal handler or logging setup failed.
    Runtime(String),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Config(_) => EXIT_USAGE,
            CliError::Query(PipelineError::InvalidQuery(_)) => EXIT_USAGE,
            CliError::Query(PipelineError::GridResolution(_)) => EXIT_USAGE,
            _ => EXIT_FAILURE,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Query(e) => write!(f, "Query failed: {}", e),
            CliError::Setup(e) => write!(f, "Setup failed: {}", e),
            CliError::Output(e) => write!(f, "{}", e),
            CliError::NoData { failures } => write!(
                f,
                "No valid pixels: {} asset download(s) failed (is EARTHDATA_TOKEN set?)",
                failures
            ),
            CliError::CacheClear(msg) => write!(f, "Failed to clear cache: {}", msg),
            CliError::CacheStats(msg) => write!(f, "Failed to read cache statistics: {}", msg),
            CliError::Runtime(msg) => write!(f, "Runtime error: {}", msg),
        }
    }
}

impl std::error::Error for CliError {}

impl From<ConfigFileError> for CliError {
    fn from(e: ConfigFileError) -> Self {
        CliError::Config(e.to_string())
    }
}

impl From<PipelineError> for CliError {
    fn from(e: PipelineError) -> Self {
        CliError::Query(e)
    }
}

impl From<SetupError> for CliError {
    fn from(e: SetupError) -> Self {
        CliError::Setup(e)
    }
}

impl From<OutputError> for CliError {
    fn from(e: OutputError) -> Self {
        CliError::Output(e)
    }
}

impl From<LoggingError> for CliError {
    fn from(e: LoggingError) -> Self {
        CliError::Runtime(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Config("bad".into()).exit_code(), EXIT_USAGE);
        assert_eq!(
            CliError::Query(PipelineError::InvalidQuery("start after end".into())).exit_code(),
            EXIT_USAGE
        );
        assert_eq!(CliError::CacheClear("denied".into()).exit_code(), EXIT_FAILURE);
        assert_eq!(CliError::Runtime("no runtime".into()).exit_code(), EXIT_FAILURE);
        assert_eq!(CliError::NoData { failures: 3 }.exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn test_display() {
        let e = CliError::CacheStats("missing".into());
        assert_eq!(e.to_string(), "Failed to read cache statistics: missing");
    }
}
