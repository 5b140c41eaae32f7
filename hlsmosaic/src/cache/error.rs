//! Cache and retrieval errors.

use std::path::PathBuf;

use thiserror::Error;

use crate::provider::HttpError;
use crate::retry::{RetryError, Retryable};

/// Errors opening or maintaining the cache directory.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode cache manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("cache task failed: {0}")]
    Task(String),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure of one download attempt.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DownloadError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("truncated payload: expected {expected} bytes, got {actual}")]
    Truncated { expected: u64, actual: u64 },

    #[error("oversized payload: expected {expected} bytes, got {actual}")]
    Oversized { expected: u64, actual: u64 },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

impl Retryable for DownloadError {
    /// A short or corrupted transfer is retried from scratch. An oversized
    /// payload means the advertised metadata is wrong and will not improve.
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_retryable(),
            Self::Truncated { .. } | Self::ChecksumMismatch { .. } => true,
            Self::Oversized { .. } => false,
        }
    }
}

/// Why an asset could not be made available locally.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RetrievalReason {
    #[error("{0}")]
    Download(DownloadError),

    #[error("granule has no asset for this band")]
    MissingAsset,

    #[error("failed to store asset: {0}")]
    Storage(String),

    #[error("cancelled")]
    Cancelled,
}

/// An asset could not be retrieved. Never fatal to a query.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("failed to retrieve {band} of {granule} after {attempts} attempt(s): {reason}")]
pub struct RetrievalError {
    pub granule: String,
    pub band: String,
    pub attempts: u32,
    pub reason: RetrievalReason,
}

impl RetrievalError {
    pub(crate) fn new(
        granule: impl Into<String>,
        band: impl Into<String>,
        attempts: u32,
        reason: RetrievalReason,
    ) -> Self {
        Self {
            granule: granule.into(),
            band: band.into(),
            attempts,
            reason,
        }
    }

    pub(crate) fn from_retry(granule: &str, band: &str, error: RetryError<DownloadError>) -> Self {
        let attempts = error.attempts();
        let reason = match error {
            RetryError::Cancelled { .. } => RetrievalReason::Cancelled,
            RetryError::Exhausted { last_error, .. } => RetrievalReason::Download(last_error),
            RetryError::Permanent { error, .. } => RetrievalReason::Download(error),
        };
        Self::new(granule, band, attempts, reason)
    }

    /// Returns true if the retrieval was aborted by cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.reason == RetrievalReason::Cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_retryability() {
        assert!(DownloadError::Truncated {
            expected: 10,
            actual: 5
        }
        .is_retryable());
        assert!(!DownloadError::Oversized {
            expected: 5,
            actual: 10
        }
        .is_retryable());
        assert!(!DownloadError::Http(HttpError::Status {
            status: 404,
            url: "u".into()
        })
        .is_retryable());
        assert!(DownloadError::Http(HttpError::Status {
            status: 429,
            url: "u".into()
        })
        .is_retryable());
    }

    #[test]
    fn test_retrieval_error_display() {
        let err = RetrievalError::new(
            "HLS.S30.T10SEG.2021152T184919.v2.0",
            "B04",
            3,
            RetrievalReason::Download(DownloadError::Truncated {
                expected: 10,
                actual: 5,
            }),
        );
        let text = err.to_string();
        assert!(text.contains("B04"));
        assert!(text.contains("3 attempt"));
        assert!(text.contains("truncated"));
    }

    #[test]
    fn test_from_retry_cancelled() {
        let err = RetrievalError::from_retry("g", "B04", RetryError::Cancelled { attempts: 1 });
        assert!(err.is_cancelled());
    }
}
