//! STAC item-search response pages.

use serde::Deserialize;
use serde_json::Value;

use super::error::RequestError;

/// An unvalidated catalog record.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    /// Collection the search was issued against.
    pub searched_collection: String,
    /// The STAC item as returned.
    pub item: Value,
}

#[derive(Debug, Deserialize)]
struct Link {
    rel: String,
    href: String,
    #[serde(default)]
    method: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemCollection {
    #[serde(default)]
    features: Vec<Value>,
    #[serde(default)]
    links: Vec<Link>,
}

/// One decoded result page.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub items: Vec<Value>,
    /// URL of the next page, if any.
    pub next: Option<String>,
}

impl SearchPage {
    /// Decodes a STAC `FeatureCollection` body.
    ///
    /// Only GET `next` links are followed.
    pub fn parse(body: &[u8]) -> Result<Self, RequestError> {
        let collection: ItemCollection =
            serde_json::from_slice(body).map_err(|e| RequestError::Decode(e.to_string()))?;

        let next = collection
            .links
            .into_iter()
            .find(|l| {
                l.rel == "next"
                    && l.method
                        .as_deref()
                        .map(|m| m.eq_ignore_ascii_case("GET"))
                        .unwrap_or(true)
            })
            .map(|l| l.href);

        Ok(Self {
            items: collection.features,
            next,
        })
    }
}
