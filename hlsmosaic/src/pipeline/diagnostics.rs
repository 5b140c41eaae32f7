//! Pipeline errors and non-fatal diagnostics.

use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDate;
use thiserror::Error;

use crate::cache::{CacheError, RetrievalError};
use crate::catalog::CatalogUnavailableError;
use crate::coord::{GridResolutionError, TileId};
use crate::mosaic::IncompleteMosaicError;
use crate::provider::HttpError;
use crate::raster::RasterError;

/// Failures that abort a query. Everything else is a [`Diagnostic`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PipelineError {
    #[error(transparent)]
    GridResolution(#[from] GridResolutionError),

    #[error(transparent)]
    CatalogUnavailable(#[from] CatalogUnavailableError),

    #[error("invalid query: {0}")]
    InvalidQuery(String),
}

/// Failures building a pipeline.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("failed to create HTTP client: {0}")]
    Http(#[from] HttpError),

    #[error("failed to open asset cache: {0}")]
    Cache(#[from] CacheError),
}

/// Failures writing a mosaic to disk.
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("failed to encode mosaic: {0}")]
    Encode(#[from] RasterError),

    #[error("failed to write mosaic: {0}")]
    Write(#[from] CacheError),
}

/// Pipeline stage, for cancellation reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Search,
    Retrieval,
    Assembly,
    Composite,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Search => "search",
            Self::Retrieval => "retrieval",
            Self::Assembly => "assembly",
            Self::Composite => "composite",
        })
    }
}

/// A problem that did not abort the query.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// A band asset could not be made available locally.
    Retrieval(RetrievalError),

    /// A cached asset could not be decoded; the granule did not contribute.
    UnreadableAsset {
        granule: String,
        band: String,
        path: PathBuf,
        reason: String,
    },

    /// A mosaic has no valid pixel.
    IncompleteMosaic(IncompleteMosaicError),

    /// Work not finished before cancellation or the deadline.
    Cancelled {
        tile: TileId,
        stage: Stage,
        date: Option<NaiveDate>,
    },

    /// A granule exceeded the cloud-cover threshold.
    CloudFiltered {
        granule: String,
        cloud_cover: f64,
        threshold: f64,
    },

    /// Catalog records failed validation.
    RejectedRecords { tile: TileId, count: usize },

    /// A worker task panicked or was aborted.
    TaskFailed { stage: Stage, reason: String },
}

impl Diagnostic {
    /// Returns true for diagnostics caused by cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::Retrieval(e) => e.is_cancelled(),
            _ => false,
        }
    }

    /// Short machine-friendly kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Retrieval(_) => "retrieval",
            Self::UnreadableAsset { .. } => "unreadable_asset",
            Self::IncompleteMosaic(_) => "incomplete_mosaic",
            Self::Cancelled { .. } => "cancelled",
            Self::CloudFiltered { .. } => "cloud_filtered",
            Self::RejectedRecords { .. } => "rejected_records",
            Self::TaskFailed { .. } => "task_failed",
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retrieval(e) => write!(f, "{}", e),
            Self::UnreadableAsset {
                granule,
                band,
                path,
                reason,
            } => write!(
                f,
                "unreadable {} asset of {} at {}: {}",
                band,
                granule,
                path.display(),
                reason
            ),
            Self::IncompleteMosaic(e) => write!(f, "{}", e),
            Self::Cancelled { tile, stage, date } => match date {
                Some(date) => write!(f, "{} cancelled for {} {}", stage, tile, date),
                None => write!(f, "{} cancelled for {}", stage, tile),
            },
            Self::CloudFiltered {
                granule,
                cloud_cover,
                threshold,
            } => write!(
                f,
                "{} excluded: cloud cover {:.1}% above {:.1}%",
                granule, cloud_cover, threshold
            ),
            Self::RejectedRecords { tile, count } => {
                write!(f, "{} catalog record(s) for {} failed validation", count, tile)
            }
            Self::TaskFailed { stage, reason } => write!(f, "{} task failed: {}", stage, reason),
        }
    }
}

impl From<RetrievalError> for Diagnostic {
    fn from(e: RetrievalError) -> Self {
        Self::Retrieval(e)
    }
}

impl From<IncompleteMosaicError> for Diagnostic {
    fn from(e: IncompleteMosaicError) -> Self {
        Self::IncompleteMosaic(e)
    }
}
