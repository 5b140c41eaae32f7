//! HLS product identifiers.
//!
//! Identifiers follow `HLS.<sensor>.T<tile>.<yyyydddThhmmss>.v<major>.<minor>`,
//! for example `HLS.S30.T10SEG.2021152T184919.v2.0`. The identifier without
//! its version suffix is stable across reprocessing and across catalog
//! collection aliases, and is used as the deduplication key.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use thiserror::Error;

use crate::coord::TileId;

/// Errors parsing a granule identifier.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GranuleIdError {
    #[error("'{0}' is not an HLS granule id")]
    InvalidPattern(String),
    #[error("invalid tile in granule id '{0}'")]
    InvalidTile(String),
    #[error("invalid acquisition timestamp in granule id '{0}'")]
    InvalidTimestamp(String),
}

/// The satellite source of an HLS product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceCollection {
    /// Sentinel-2 derived (`HLSS30`).
    S30,
    /// Landsat derived (`HLSL30`).
    L30,
}

impl SourceCollection {
    /// Short sensor code used in granule ids.
    pub fn code(&self) -> &'static str {
        match self {
            Self::S30 => "S30",
            Self::L30 => "L30",
        }
    }

    /// Infers the source from a collection id or alias such as
    /// `HLSS30_2.0`, `HLSS30.v2.0` or `hlsl30`.
    pub fn from_collection(collection: &str) -> Option<Self> {
        let upper = collection.to_ascii_uppercase();
        if upper.starts_with("HLSS30") {
            Some(Self::S30)
        } else if upper.starts_with("HLSL30") {
            Some(Self::L30)
        } else {
            None
        }
    }

    /// Parses a bare sensor code (`S30` / `L30`).
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "S30" => Some(Self::S30),
            "L30" => Some(Self::L30),
            _ => None,
        }
    }
}

impl fmt::Display for SourceCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Parsed HLS granule identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GranuleId {
    raw: String,
    pub source: SourceCollection,
    pub tile: TileId,
    /// Acquisition start encoded in the id (UTC).
    pub acquired: NaiveDateTime,
    /// Processing version, e.g. `2.0`.
    pub version: String,
}

fn granule_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^HLS\.(S30|L30)\.T(\d{2}[A-Z]{3})\.(\d{4})(\d{3})T(\d{2})(\d{2})(\d{2})\.v(\d+(?:\.\d+)*)$")
            .expect("granule id pattern is valid")
    })
}

impl GranuleId {
    /// The full identifier as published.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Identifier without the version suffix.
    pub fn stable_key(&self) -> &str {
        self.raw
            .rsplit_once(".v")
            .map(|(key, _)| key)
            .unwrap_or(&self.raw)
    }

    /// Acquisition date (UTC).
    pub fn date(&self) -> NaiveDate {
        self.acquired.date()
    }

    /// Version components for ordering (`2.0` -> `[2, 0]`).
    pub fn version_parts(&self) -> Vec<u32> {
        self.version
            .split('.')
            .filter_map(|p| p.parse().ok())
            .collect()
    }
}

impl FromStr for GranuleId {
    type Err = GranuleIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = granule_pattern()
            .captures(s.trim())
            .ok_or_else(|| GranuleIdError::InvalidPattern(s.to_string()))?;

        let group = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or_default();
        let bad_time = || GranuleIdError::InvalidTimestamp(s.to_string());

        let source = SourceCollection::from_code(group(1))
            .ok_or_else(|| GranuleIdError::InvalidPattern(s.to_string()))?;
        let tile: TileId = group(2)
            .parse()
            .map_err(|_| GranuleIdError::InvalidTile(s.to_string()))?;

        let year: i32 = group(3).parse().map_err(|_| bad_time())?;
        let ordinal: u32 = group(4).parse().map_err(|_| bad_time())?;
        let hour: u32 = group(5).parse().map_err(|_| bad_time())?;
        let minute: u32 = group(6).parse().map_err(|_| bad_time())?;
        let second: u32 = group(7).parse().map_err(|_| bad_time())?;

        let date = NaiveDate::from_yo_opt(year, ordinal).ok_or_else(bad_time)?;
        let time = NaiveTime::from_hms_opt(hour, minute, second).ok_or_else(bad_time)?;

        Ok(Self {
            raw: s.trim().to_string(),
            source,
            tile,
            acquired: date.and_time(time),
            version: group(8).to_string(),
        })
    }
}

impl fmt::Display for GranuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sentinel_id() {
        let id: GranuleId = "HLS.S30.T10SEG.2021152T184919.v2.0".parse().unwrap();
        assert_eq!(id.source, SourceCollection::S30);
        assert_eq!(id.tile.to_string(), "10SEG");
        assert_eq!(id.date(), NaiveDate::from_ymd_opt(2021, 6, 1).unwrap());
        assert_eq!(id.acquired.time(), NaiveTime::from_hms_opt(18, 49, 19).unwrap());
        assert_eq!(id.version, "2.0");
        assert_eq!(id.stable_key(), "HLS.S30.T10SEG.2021152T184919");
    }

    #[test]
    fn test_parse_landsat_id() {
        let id: GranuleId = "HLS.L30.T56HLH.2020366T235959.v1.5".parse().unwrap();
        assert_eq!(id.source, SourceCollection::L30);
        assert_eq!(id.date(), NaiveDate::from_ymd_opt(2020, 12, 31).unwrap());
        assert_eq!(id.version_parts(), vec![1, 5]);
    }

    #[test]
    fn test_versions_share_stable_key() {
        let a: GranuleId = "HLS.S30.T10SEG.2021152T184919.v1.5".parse().unwrap();
        let b: GranuleId = "HLS.S30.T10SEG.2021152T184919.v2.0".parse().unwrap();
        assert_eq!(a.stable_key(), b.stable_key());
        assert_ne!(a, b);
    }

    #[test]
    fn test_rejects_bad_ids() {
        assert!(matches!(
            "HLS.X30.T10SEG.2021152T184919.v2.0".parse::<GranuleId>(),
            Err(GranuleIdError::InvalidPattern(_))
        ));
        assert!(matches!(
            "HLS.S30.T10SEG.2021400T184919.v2.0".parse::<GranuleId>(),
            Err(GranuleIdError::InvalidTimestamp(_))
        ));
        assert!(matches!(
            "HLS.S30.T10SEG.2021152T250000.v2.0".parse::<GranuleId>(),
            Err(GranuleIdError::InvalidTimestamp(_))
        ));
        assert!("random".parse::<GranuleId>().is_err());
    }

    #[test]
    fn test_source_from_collection_aliases() {
        assert_eq!(
            SourceCollection::from_collection("HLSS30_2.0"),
            Some(SourceCollection::S30)
        );
        assert_eq!(
            SourceCollection::from_collection("HLSL30.v2.0"),
            Some(SourceCollection::L30)
        );
        assert_eq!(SourceCollection::from_collection("hlsl30"), Some(SourceCollection::L30));
        assert_eq!(SourceCollection::from_collection("MOD09GA"), None);
    }
}
