//! Remote catalog search
//!
//! Turns a tile footprint, date range and collection list into STAC item
//! searches and exposes the results as a lazy stream of raw records. Pages
//! are fetched only as the stream is polled.
//!
//! # Example
//!
//! ```ignore
//! use futures::StreamExt;
//! use hlsmosaic::catalog::{CatalogConfig, StacCatalog};
//!
//! let catalog = StacCatalog::new(client, CatalogConfig::default(), RetryPolicy::default());
//! let mut records = catalog.search(tile.lonlat_bbox(), start, end, cancel.clone());
//! while let Some(record) = records.next().await {
//!     let record = record?;
//!     // validate, index, ...
//! }
//! ```

mod error;
mod record;
mod request;
mod stac;

pub use error::{CatalogError, CatalogUnavailableError, RecordError, RequestError};
pub use record::validate_record;
pub use request::{build_requests, partition_dates, SearchRequest};
pub use stac::{RawRecord, SearchPage};

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::NaiveDate;
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::coord::BoundingBox;
use crate::provider::AsyncHttpClient;
use crate::retry::RetryPolicy;

/// Default STAC endpoint (NASA CMR-STAC, LP DAAC cloud provider).
pub const DEFAULT_STAC_ENDPOINT: &str = "https://cmr.earthdata.nasa.gov/stac/LPCLOUD";

/// Default HLS collections searched.
pub const DEFAULT_COLLECTIONS: [&str; 2] = ["HLSL30_2.0", "HLSS30_2.0"];

/// Default page size.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Catalog search configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogConfig {
    /// STAC API root.
    pub endpoint: String,
    /// Collections searched, one request each.
    pub collections: Vec<String>,
    /// Items per page.
    pub page_size: usize,
    /// Maximum days per request; 0 disables date partitioning.
    pub max_days_per_request: u32,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_STAC_ENDPOINT.to_string(),
            collections: DEFAULT_COLLECTIONS.iter().map(|c| c.to_string()).collect(),
            page_size: DEFAULT_PAGE_SIZE,
            max_days_per_request: 0,
        }
    }
}

impl CatalogConfig {
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = collections.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_max_days_per_request(mut self, days: u32) -> Self {
        self.max_days_per_request = days;
        self
    }
}

/// STAC item-search client.
pub struct StacCatalog {
    client: Arc<dyn AsyncHttpClient>,
    config: CatalogConfig,
    retry: RetryPolicy,
}

/// Stream state: outstanding requests, the page cursor, buffered items.
struct SearchState {
    client: Arc<dyn AsyncHttpClient>,
    retry: RetryPolicy,
    endpoint: String,
    cancel: CancellationToken,
    requests: VecDeque<SearchRequest>,
    current: Option<(String, String)>,
    buffered: VecDeque<RawRecord>,
    pages: usize,
    finished: bool,
}

impl StacCatalog {
    pub fn new(client: Arc<dyn AsyncHttpClient>, config: CatalogConfig, retry: RetryPolicy) -> Self {
        Self {
            client,
            config,
            retry,
        }
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// Searches all configured collections.
    ///
    /// # Arguments
    ///
    /// * `bbox` - Geographic search window
    /// * `start`, `end` - Inclusive UTC date range
    /// * `cancel` - Aborts outstanding page requests
    ///
    /// # Returns
    ///
    /// A lazy stream of raw records. An empty result is an empty stream. The
    /// stream ends after the first error item.
    pub fn search(
        &self,
        bbox: BoundingBox,
        start: NaiveDate,
        end: NaiveDate,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<RawRecord, CatalogError>> {
        let requests = build_requests(
            &self.config.collections,
            bbox,
            start,
            end,
            self.config.max_days_per_request,
            self.config.page_size,
        );

        debug!(
            requests = requests.len(),
            bbox = %bbox,
            start = %start,
            end = %end,
            "Starting catalog search"
        );

        let state = SearchState {
            client: Arc::clone(&self.client),
            retry: self.retry.clone(),
            endpoint: self.config.endpoint.clone(),
            cancel,
            requests: requests.into(),
            current: None,
            buffered: VecDeque::new(),
            pages: 0,
            finished: false,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if state.finished {
                    return None;
                }
                if let Some(record) = state.buffered.pop_front() {
                    return Some((Ok(record), state));
                }

                // Next page of the current request, or the first page of the next one.
                let (collection, url) = match state.current.take() {
                    Some(cursor) => cursor,
                    None => {
                        let Some(request) = state.requests.pop_front() else {
                            info!(pages = state.pages, "Catalog search complete");
                            return None;
                        };
                        match request.url(&state.endpoint) {
                            Ok(url) => (request.collection, url),
                            Err(e) => {
                                state.finished = true;
                                let error = CatalogUnavailableError {
                                    collection: request.collection,
                                    attempts: 0,
                                    reason: e,
                                };
                                return Some((Err(error.into()), state));
                            }
                        }
                    }
                };

                match state.fetch_page(&collection, &url).await {
                    Ok(page) => {
                        state.pages += 1;
                        debug!(
                            collection = %collection,
                            items = page.items.len(),
                            has_next = page.next.is_some(),
                            "Fetched catalog page"
                        );
                        let has_items = !page.items.is_empty();
                        state
                            .buffered
                            .extend(page.items.into_iter().map(|item| RawRecord {
                                searched_collection: collection.clone(),
                                item,
                            }));
                        // An empty page ends the request even if it links onwards.
                        if let Some(next) = page.next.filter(|n| has_items && *n != url) {
                            state.current = Some((collection, next));
                        }
                    }
                    Err(e) => {
                        state.finished = true;
                        return Some((Err(e), state));
                    }
                }
            }
        })
        .boxed()
    }
}

impl SearchState {
    async fn fetch_page(&self, collection: &str, url: &str) -> Result<SearchPage, CatalogError> {
        let client = &self.client;
        self.retry
            .run(&self.cancel, |attempt| async move {
                debug!(url, attempt, "Requesting catalog page");
                let body = client.get(url).await?;
                SearchPage::parse(&body)
            })
            .await
            .map_err(|e| CatalogError::from_retry(collection, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{HttpError, MockHttpClient};
    use serde_json::json;
    use std::time::Duration;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 6, d).unwrap()
    }

    fn bbox() -> BoundingBox {
        BoundingBox::new(-123.0, 37.0, -122.0, 38.0)
    }

    fn config() -> CatalogConfig {
        CatalogConfig::default()
            .with_endpoint("https://stac.test")
            .with_collections(["HLSS30_2.0"])
    }

    fn first_url() -> String {
        SearchRequest {
            collection: "HLSS30_2.0".into(),
            bbox: bbox(),
            start: date(1),
            end: date(3),
            limit: DEFAULT_PAGE_SIZE,
        }
        .url("https://stac.test")
        .unwrap()
    }

    fn page(ids: &[&str], next: Option<&str>) -> Vec<u8> {
        let features: Vec<_> = ids.iter().map(|id| json!({ "id": id })).collect();
        let mut links = vec![];
        if let Some(n) = next {
            links.push(json!({"rel": "next", "href": n}));
        }
        json!({"type": "FeatureCollection", "features": features, "links": links})
            .to_string()
            .into_bytes()
    }

    fn catalog(mock: Arc<MockHttpClient>) -> StacCatalog {
        StacCatalog::new(
            mock,
            config(),
            RetryPolicy::fixed(3, Duration::from_millis(1)),
        )
    }

    async fn collect(catalog: &StacCatalog) -> Vec<Result<RawRecord, CatalogError>> {
        catalog
            .search(bbox(), date(1), date(3), CancellationToken::new())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_pages_through_next_links() {
        let mock = Arc::new(MockHttpClient::new());
        mock.respond(&first_url(), Ok(page(&["a", "b"], Some("https://stac.test/p2"))));
        mock.respond("https://stac.test/p2", Ok(page(&["c"], None)));

        let results = collect(&catalog(Arc::clone(&mock))).await;
        let ids: Vec<String> = results
            .into_iter()
            .map(|r| r.unwrap().item["id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_empty_result_is_empty_stream() {
        let mock = Arc::new(MockHttpClient::new());
        mock.respond(&first_url(), Ok(page(&[], None)));
        assert!(collect(&catalog(mock)).await.is_empty());
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let mock = Arc::new(MockHttpClient::new());
        mock.respond(
            &first_url(),
            Err(HttpError::Status {
                status: 503,
                url: first_url(),
            }),
        );
        mock.respond(&first_url(), Ok(page(&["a"], None)));

        let results = collect(&catalog(Arc::clone(&mock))).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
        assert_eq!(mock.request_count(&first_url()), 2);
    }

    #[tokio::test]
    async fn test_auth_error_not_retried() {
        let mock = Arc::new(MockHttpClient::new());
        mock.respond(
            &first_url(),
            Err(HttpError::Status {
                status: 401,
                url: first_url(),
            }),
        );

        let results = collect(&catalog(Arc::clone(&mock))).await;
        assert_eq!(results.len(), 1);
        match &results[0] {
            Err(CatalogError::Unavailable(e)) => {
                assert!(e.is_auth());
                assert_eq!(e.attempts, 1);
            }
            other => panic!("Expected Unavailable, got {:?}", other),
        }
        assert_eq!(mock.request_count(&first_url()), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_yield_unavailable() {
        let mock = Arc::new(MockHttpClient::new());
        mock.respond(&first_url(), Err(HttpError::Timeout("slow".into())));

        let results = collect(&catalog(Arc::clone(&mock))).await;
        assert!(matches!(
            &results[..],
            [Err(CatalogError::Unavailable(CatalogUnavailableError { attempts: 3, .. }))]
        ));
    }

    #[tokio::test]
    async fn test_stream_is_lazy() {
        let mock = Arc::new(MockHttpClient::new());
        mock.respond(&first_url(), Ok(page(&["a"], Some("https://stac.test/p2"))));
        mock.respond("https://stac.test/p2", Ok(page(&["b"], None)));

        let catalog = catalog(Arc::clone(&mock));
        let mut stream = catalog.search(bbox(), date(1), date(3), CancellationToken::new());
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.item["id"], "a");
        assert_eq!(mock.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_search() {
        let mock = Arc::new(MockHttpClient::new());
        mock.respond(&first_url(), Ok(page(&["a"], None)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let results: Vec<_> = catalog(mock)
            .search(bbox(), date(1), date(3), cancel)
            .collect()
            .await;
        assert_eq!(results, vec![Err(CatalogError::Cancelled)]);
    }

    #[tokio::test]
    async fn test_partitioned_requests_all_issued() {
        let mock = Arc::new(MockHttpClient::new());
        let config = config().with_max_days_per_request(1);
        let requests = build_requests(
            &config.collections,
            bbox(),
            date(1),
            date(3),
            1,
            config.page_size,
        );
        for (i, r) in requests.iter().enumerate() {
            let id = format!("item{}", i);
            mock.respond(&r.url("https://stac.test").unwrap(), Ok(page(&[id.as_str()], None)));
        }

        let catalog = StacCatalog::new(
            Arc::clone(&mock) as Arc<dyn AsyncHttpClient>,
            config,
            RetryPolicy::None,
        );
        let results: Vec<_> = catalog
            .search(bbox(), date(1), date(3), CancellationToken::new())
            .collect()
            .await;
        assert_eq!(results.len(), 3);
        assert_eq!(mock.requests().len(), 3);
    }
}
