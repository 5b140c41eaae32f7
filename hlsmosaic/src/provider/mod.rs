//! Remote access abstraction
//!
//! Catalog search and asset download both go through the [`AsyncHttpClient`]
//! trait so that every network consumer can be exercised against a mock in
//! tests.
//!
//! ```ignore
//! use hlsmosaic::provider::{AsyncHttpClient, ReqwestClient};
//!
//! let client = ReqwestClient::new(60, std::env::var("EARTHDATA_TOKEN").ok())?;
//! let body = client.get("https://example.com/item.json").await?;
//! ```

mod http;

pub use http::{AsyncHttpClient, BoxFuture, HttpError, ReqwestClient};

#[cfg(test)]
pub use http::tests::MockHttpClient;
