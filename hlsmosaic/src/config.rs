//! Configuration file handling
//!
//! Settings live in an INI file at `~/.hlsmosaic/config.ini`. A missing file
//! means defaults; missing keys fall back to their defaults individually.
//! Command-line arguments override values from the file.
//!
//! ```ini
//! [catalog]
//! endpoint = https://cmr.earthdata.nasa.gov/stac/LPCLOUD
//! collections = HLSL30_2.0, HLSS30_2.0
//! page_size = 100
//! max_days_per_request = 0
//!
//! [download]
//! timeout = 60
//! max_attempts = 3
//! initial_backoff_ms = 500
//! parallel = 8
//!
//! [cache]
//! directory = ~/.cache/hlsmosaic
//! verify_checksums = true
//!
//! [mosaic]
//! resolution = 30
//! resampling = nearest
//! source_priority = sentinel
//! cloud_mask_bits = 15
//! apply_scale = true
//! output_directory = .
//! ```

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use ini::{Ini, Properties};
use thiserror::Error;

use crate::catalog::{DEFAULT_COLLECTIONS, DEFAULT_PAGE_SIZE, DEFAULT_STAC_ENDPOINT};
use crate::coord::DEFAULT_RESOLUTION;
use crate::index::SourcePriority;
use crate::mosaic::DEFAULT_MASK_BITS;
use crate::raster::Resampling;
use crate::retry::{DEFAULT_INITIAL_DELAY_MS, DEFAULT_MAX_ATTEMPTS};

const CONFIG_DIR_NAME: &str = ".hlsmosaic";
const CONFIG_FILE_NAME: &str = "config.ini";

/// Default HTTP timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Default number of concurrent downloads.
pub const DEFAULT_PARALLEL_DOWNLOADS: usize = 8;

/// Errors loading or saving the configuration file.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    #[error("failed to read config file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value '{value}' for [{section}] {key}: {reason}")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Directory holding the configuration file.
pub fn config_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

/// Path of the configuration file.
pub fn config_file_path() -> PathBuf {
    config_directory().join(CONFIG_FILE_NAME)
}

/// Default asset cache directory (`~/.cache/hlsmosaic` on Linux).
pub fn default_cache_directory() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("hlsmosaic"))
        .unwrap_or_else(|| config_directory().join("cache"))
}

/// `[catalog]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogSettings {
    pub endpoint: String,
    pub collections: Vec<String>,
    pub page_size: usize,
    /// Split searches into windows of this many days (0 = no split).
    pub max_days_per_request: u32,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_STAC_ENDPOINT.to_string(),
            collections: DEFAULT_COLLECTIONS.iter().map(|c| c.to_string()).collect(),
            page_size: DEFAULT_PAGE_SIZE,
            max_days_per_request: 0,
        }
    }
}

/// `[download]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadSettings {
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub parallel: usize,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_DELAY_MS,
            parallel: DEFAULT_PARALLEL_DOWNLOADS,
        }
    }
}

/// `[cache]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheSettings {
    pub directory: PathBuf,
    pub verify_checksums: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            directory: default_cache_directory(),
            verify_checksums: true,
        }
    }
}

/// `[mosaic]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct MosaicSettings {
    pub resolution: f64,
    pub resampling: Resampling,
    pub source_priority: SourcePriority,
    pub cloud_mask_bits: u8,
    /// Default cloud-cover threshold in percent, if any.
    pub cloud_threshold: Option<f64>,
    pub apply_scale: bool,
    pub output_directory: PathBuf,
}

impl Default for MosaicSettings {
    fn default() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION,
            resampling: Resampling::default(),
            source_priority: SourcePriority::default(),
            cloud_mask_bits: DEFAULT_MASK_BITS,
            cloud_threshold: None,
            apply_scale: true,
            output_directory: PathBuf::from("."),
        }
    }
}

/// Parsed configuration file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFile {
    pub catalog: CatalogSettings,
    pub download: DownloadSettings,
    pub cache: CacheSettings,
    pub mosaic: MosaicSettings,
}

impl ConfigFile {
    /// Loads `~/.hlsmosaic/config.ini`, or defaults if it does not exist.
    pub fn load() -> Result<Self, ConfigFileError> {
        let path = config_file_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Loads a configuration file from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigFileError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    /// Parses configuration from INI text.
    pub fn parse(text: &str) -> Result<Self, ConfigFileError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigFileError::Read {
            path: PathBuf::from("<string>"),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigFileError> {
        let defaults = Self::default();
        let empty = Properties::new();
        let section = |name: &str| ini.section(Some(name)).unwrap_or(&empty);

        let s = section("catalog");
        let catalog = CatalogSettings {
            endpoint: s
                .get("endpoint")
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .unwrap_or(defaults.catalog.endpoint),
            collections: match s.get("collections") {
                Some(list) => list
                    .split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(String::from)
                    .collect(),
                None => defaults.catalog.collections,
            },
            page_size: parse_key(s, "catalog", "page_size", defaults.catalog.page_size)?,
            max_days_per_request: parse_key(
                s,
                "catalog",
                "max_days_per_request",
                defaults.catalog.max_days_per_request,
            )?,
        };

        let s = section("download");
        let download = DownloadSettings {
            timeout_secs: parse_key(s, "download", "timeout", defaults.download.timeout_secs)?,
            max_attempts: parse_key(s, "download", "max_attempts", defaults.download.max_attempts)?,
            initial_backoff_ms: parse_key(
                s,
                "download",
                "initial_backoff_ms",
                defaults.download.initial_backoff_ms,
            )?,
            parallel: parse_key(s, "download", "parallel", defaults.download.parallel)?,
        };

        let s = section("cache");
        let cache = CacheSettings {
            directory: s
                .get("directory")
                .map(expand_tilde)
                .unwrap_or(defaults.cache.directory),
            verify_checksums: parse_key(
                s,
                "cache",
                "verify_checksums",
                defaults.cache.verify_checksums,
            )?,
        };

        let s = section("mosaic");
        let mosaic = MosaicSettings {
            resolution: parse_key(s, "mosaic", "resolution", defaults.mosaic.resolution)?,
            resampling: parse_key(s, "mosaic", "resampling", defaults.mosaic.resampling)?,
            source_priority: parse_key(
                s,
                "mosaic",
                "source_priority",
                defaults.mosaic.source_priority,
            )?,
            cloud_mask_bits: parse_key(
                s,
                "mosaic",
                "cloud_mask_bits",
                defaults.mosaic.cloud_mask_bits,
            )?,
            cloud_threshold: match s.get("cloud_threshold").map(str::trim) {
                None | Some("") => None,
                Some(_) => Some(parse_key(s, "mosaic", "cloud_threshold", 0.0)?),
            },
            apply_scale: parse_key(s, "mosaic", "apply_scale", defaults.mosaic.apply_scale)?,
            output_directory: s
                .get("output_directory")
                .map(expand_tilde)
                .unwrap_or(defaults.mosaic.output_directory),
        };

        Ok(Self {
            catalog,
            download,
            cache,
            mosaic,
        })
    }

    /// Renders the configuration as INI.
    pub fn to_ini(&self) -> Ini {
        let mut ini = Ini::new();
        ini.with_section(Some("catalog"))
            .set("endpoint", self.catalog.endpoint.as_str())
            .set("collections", self.catalog.collections.join(", "))
            .set("page_size", self.catalog.page_size.to_string())
            .set(
                "max_days_per_request",
                self.catalog.max_days_per_request.to_string(),
            );
        ini.with_section(Some("download"))
            .set("timeout", self.download.timeout_secs.to_string())
            .set("max_attempts", self.download.max_attempts.to_string())
            .set(
                "initial_backoff_ms",
                self.download.initial_backoff_ms.to_string(),
            )
            .set("parallel", self.download.parallel.to_string());
        ini.with_section(Some("cache"))
            .set("directory", self.cache.directory.display().to_string())
            .set("verify_checksums", self.cache.verify_checksums.to_string());
        ini.with_section(Some("mosaic"))
            .set("resolution", self.mosaic.resolution.to_string())
            .set("resampling", self.mosaic.resampling.to_string())
            .set("source_priority", self.mosaic.source_priority.to_string())
            .set("cloud_mask_bits", self.mosaic.cloud_mask_bits.to_string())
            .set(
                "cloud_threshold",
                self.mosaic
                    .cloud_threshold
                    .map(|t| t.to_string())
                    .unwrap_or_default(),
            )
            .set("apply_scale", self.mosaic.apply_scale.to_string())
            .set(
                "output_directory",
                self.mosaic.output_directory.display().to_string(),
            );
        ini
    }

    /// Writes the configuration to `~/.hlsmosaic/config.ini`.
    pub fn save(&self) -> Result<(), ConfigFileError> {
        self.save_to(&config_file_path())
    }

    /// Writes the configuration to an explicit path, creating parent
    /// directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigFileError> {
        let write_err = |source| ConfigFileError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        self.to_ini().write_to_file(path).map_err(write_err)
    }
}

fn parse_key<T>(
    section: &Properties,
    section_name: &'static str,
    key: &'static str,
    default: T,
) -> Result<T, ConfigFileError>
where
    T: FromStr,
    T::Err: Display,
{
    match section.get(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigFileError::InvalidValue {
                section: section_name,
                key,
                value: value.to_string(),
                reason: e.to_string(),
            }),
    }
}

fn expand_tilde(value: &str) -> PathBuf {
    let value = value.trim();
    match value.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(value)),
        None => PathBuf::from(value),
    }
}

/// Formats a byte count for display (`1.5 GB`).
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}
