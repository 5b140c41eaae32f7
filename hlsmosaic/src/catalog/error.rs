//! Catalog error types.

use thiserror::Error;

use crate::provider::HttpError;
use crate::retry::{RetryError, Retryable};

/// Failure of a single catalog page request.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RequestError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("malformed search response: {0}")]
    Decode(String),

    #[error("invalid search URL: {0}")]
    InvalidUrl(String),
}

impl Retryable for RequestError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_retryable(),
            Self::Decode(_) | Self::InvalidUrl(_) => false,
        }
    }
}

impl RequestError {
    /// Returns true for authentication and authorisation failures.
    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Http(e) if e.is_auth())
    }
}

/// The remote catalog could not be searched.
///
/// Raised after the retry policy is exhausted or on a non-retryable failure.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("catalog unavailable for {collection} after {attempts} attempt(s): {reason}")]
pub struct CatalogUnavailableError {
    pub collection: String,
    pub attempts: u32,
    pub reason: RequestError,
}

impl CatalogUnavailableError {
    /// Returns true when the catalog rejected the credentials.
    pub fn is_auth(&self) -> bool {
        self.reason.is_auth()
    }
}

/// Error item of a catalog search stream.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CatalogError {
    #[error(transparent)]
    Unavailable(#[from] CatalogUnavailableError),

    #[error("catalog search cancelled")]
    Cancelled,
}

impl CatalogError {
    pub(crate) fn from_retry(collection: &str, error: RetryError<RequestError>) -> Self {
        match error {
            RetryError::Cancelled { .. } => Self::Cancelled,
            RetryError::Exhausted {
                attempts,
                last_error,
            } => Self::Unavailable(CatalogUnavailableError {
                collection: collection.to_string(),
                attempts,
                reason: last_error,
            }),
            RetryError::Permanent { attempts, error } => {
                Self::Unavailable(CatalogUnavailableError {
                    collection: collection.to_string(),
                    attempts,
                    reason: error,
                })
            }
        }
    }
}

/// Reasons a catalog record is rejected during validation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RecordError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl RecordError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}
