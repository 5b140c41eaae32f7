//! HTTP client abstraction for testability

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use crate::retry::Retryable;

/// Boxed future used by dyn-compatible async traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors from an HTTP exchange.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum HttpError {
    /// The server answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    /// The request did not complete within the client timeout.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Connection could not be established or was reset.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The response body could not be read to completion.
    #[error("failed to read response body: {0}")]
    Body(String),

    /// The client itself could not be constructed.
    #[error("failed to create HTTP client: {0}")]
    Client(String),
}

impl HttpError {
    /// HTTP status code, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns true for 401 and 403 responses.
    pub fn is_auth(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }
}

impl Retryable for HttpError {
    /// Rate limiting, server errors and transport failures are transient.
    /// Any other 4xx is a permanent rejection of the request.
    fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == 429 || (500..600).contains(status),
            Self::Timeout(_) | Self::Connection(_) | Self::Body(_) => true,
            Self::Client(_) => false,
        }
    }
}

/// Trait for asynchronous HTTP GET operations.
///
/// Implementations must be shareable across tasks. Returns a boxed future so
/// that the trait can be used as `Arc<dyn AsyncHttpClient>`.
pub trait AsyncHttpClient: Send + Sync {
    /// Performs an HTTP GET request.
    ///
    /// # Arguments
    ///
    /// * `url` - The URL to request
    ///
    /// # Returns
    ///
    /// The full response body, or an error for non-success statuses and
    /// transport failures.
    fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>, HttpError>>;
}

/// Real HTTP client implementation using reqwest.
///
/// When a bearer token is configured it is attached to every request.
pub struct ReqwestClient {
    client: reqwest::Client,
    bearer_token: Option<String>,
}

impl ReqwestClient {
    /// Creates a client with the given timeout and optional bearer token.
    pub fn new(timeout_secs: u64, bearer_token: Option<String>) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .user_agent(concat!("hlsmosaic/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HttpError::Client(e.to_string()))?;

        Ok(Self {
            client,
            bearer_token: bearer_token.filter(|t| !t.trim().is_empty()),
        })
    }

    /// Returns true if requests carry an Authorization header.
    pub fn has_token(&self) -> bool {
        self.bearer_token.is_some()
    }

    fn classify(error: reqwest::Error) -> HttpError {
        if error.is_timeout() {
            HttpError::Timeout(error.to_string())
        } else if error.is_body() || error.is_decode() {
            HttpError::Body(error.to_string())
        } else {
            HttpError::Connection(error.to_string())
        }
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>, HttpError> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(Self::classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        response
            .bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(Self::classify)
    }
}

impl AsyncHttpClient for ReqwestClient {
    fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>, HttpError>> {
        Box::pin(self.fetch(url))
    }
}
