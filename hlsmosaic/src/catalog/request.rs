//! Search request construction.

use chrono::{Days, NaiveDate};

use super::error::RequestError;
use crate::coord::BoundingBox;

/// One STAC item search for a collection over a date window.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub collection: String,
    pub bbox: BoundingBox,
    /// First day of the window (inclusive).
    pub start: NaiveDate,
    /// Last day of the window (inclusive).
    pub end: NaiveDate,
    /// Page size.
    pub limit: usize,
}

impl SearchRequest {
    /// RFC 3339 interval covering whole UTC days.
    pub fn datetime_param(&self) -> String {
        format!(
            "{}T00:00:00Z/{}T23:59:59Z",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }

    /// Builds the GET URL for the first page.
    ///
    /// # Arguments
    ///
    /// * `endpoint` - STAC API root, e.g. `https://cmr.earthdata.nasa.gov/stac/LPCLOUD`
    pub fn url(&self, endpoint: &str) -> Result<String, RequestError> {
        let base = format!("{}/search", endpoint.trim_end_matches('/'));
        let limit = self.limit.to_string();
        let bbox = self.bbox.to_query_string();
        let datetime = self.datetime_param();
        let url = reqwest::Url::parse_with_params(
            &base,
            &[
                ("collections", self.collection.as_str()),
                ("bbox", bbox.as_str()),
                ("datetime", datetime.as_str()),
                ("limit", limit.as_str()),
            ],
        )
        .map_err(|e| RequestError::InvalidUrl(format!("{}: {}", base, e)))?;
        Ok(url.to_string())
    }
}

/// Splits an inclusive date range into windows of at most `max_days` days.
///
/// `max_days == 0` disables partitioning. An inverted range yields nothing.
pub fn partition_dates(
    start: NaiveDate,
    end: NaiveDate,
    max_days: u32,
) -> Vec<(NaiveDate, NaiveDate)> {
    if start > end {
        return Vec::new();
    }
    if max_days == 0 {
        return vec![(start, end)];
    }

    let mut windows = Vec::new();
    let mut window_start = start;
    while window_start <= end {
        let window_end = window_start
            .checked_add_days(Days::new(max_days as u64 - 1))
            .map(|d| d.min(end))
            .unwrap_or(end);
        windows.push((window_start, window_end));
        match window_end.succ_opt() {
            Some(next) => window_start = next,
            None => break,
        }
    }
    windows
}

/// Expands a search into one request per collection per date window.
pub fn build_requests(
    collections: &[String],
    bbox: BoundingBox,
    start: NaiveDate,
    end: NaiveDate,
    max_days: u32,
    limit: usize,
) -> Vec<SearchRequest> {
    let windows = partition_dates(start, end, max_days);
    collections
        .iter()
        .flat_map(|collection| {
            windows.iter().map(move |&(s, e)| SearchRequest {
                collection: collection.clone(),
                bbox,
                start: s,
                end: e,
                limit,
            })
        })
        .collect()
}
