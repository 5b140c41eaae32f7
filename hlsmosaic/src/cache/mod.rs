//! Retrieval and local cache of granule band assets
//!
//! Assets are stored as `<root>/<granule id>/<granule id>.<band>.tif` and
//! described by a JSON manifest. A cached file is reused only when it still
//! matches the manifest (and the remote asset's advertised size and checksum
//! when those are known); otherwise it is downloaded again.
//!
//! At most one download per (granule, band) runs at a time. Concurrent
//! callers for the same key wait on a per-key lock and then find the freshly
//! installed file as a cache hit.
//!
//! # Example
//!
//! ```ignore
//! use hlsmosaic::cache::{AssetCache, CacheConfig};
//!
//! let cache = Arc::new(AssetCache::open(CacheConfig::new(dir), client)?);
//! let asset = cache.get_or_fetch(&granule, "B04", &cancel).await?;
//! println!("{} ({} bytes)", asset.path.display(), asset.size);
//! ```

mod checksum;
mod error;
mod manifest;

pub use checksum::{file_matches, file_sha256, sha256_hex};
pub use error::{CacheError, DownloadError, RetrievalError, RetrievalReason};
pub use manifest::{Manifest, ManifestEntry, MANIFEST_FILE};

pub(crate) use manifest::write_atomic;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::granule::{AssetRef, Granule};
use crate::provider::AsyncHttpClient;
use crate::retry::RetryPolicy;

/// Cache key: one band of one granule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub granule: String,
    pub band: String,
}

impl CacheKey {
    pub fn new(granule: impl Into<String>, band: impl Into<String>) -> Self {
        Self {
            granule: granule.into(),
            band: band.into(),
        }
    }

    /// Path of the asset relative to the cache root.
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(&self.granule).join(format!("{}.{}.tif", self.granule, self.band))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.granule, self.band)
    }
}

/// A locally available asset.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAsset {
    pub key: CacheKey,
    /// Absolute path of the cached file.
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    pub href: String,
    pub retrieved_at: DateTime<Utc>,
}

/// Cache configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub directory: PathBuf,
    /// Re-hash cached files on every hit.
    pub verify_checksums: bool,
    /// Retry policy for downloads.
    pub retry: RetryPolicy,
}

impl CacheConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            verify_checksums: true,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_verify_checksums(mut self, verify: bool) -> Self {
        self.verify_checksums = verify;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Cache statistics: contents plus session counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Assets recorded in the manifest.
    pub entries: usize,
    /// Total bytes of recorded assets.
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub downloads: u64,
    pub downloaded_bytes: u64,
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} assets, {} bytes ({} hits, {} misses, {} downloads, {} bytes downloaded)",
            self.entries,
            self.total_bytes,
            self.hits,
            self.misses,
            self.downloads,
            self.downloaded_bytes
        )
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    downloads: AtomicU64,
    downloaded_bytes: AtomicU64,
}

/// Handle to the on-disk asset cache.
///
/// Shared between tasks as `Arc<AssetCache>`.
pub struct AssetCache {
    root: PathBuf,
    verify_checksums: bool,
    retry: RetryPolicy,
    client: Arc<dyn AsyncHttpClient>,
    manifest: Mutex<Manifest>,
    /// Serialises manifest writes so each save contains all earlier installs.
    persist_lock: tokio::sync::Mutex<()>,
    key_locks: DashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>,
    counters: Counters,
}

impl AssetCache {
    /// Opens (creating if needed) the cache at `config.directory`.
    pub fn open(config: CacheConfig, client: Arc<dyn AsyncHttpClient>) -> Result<Self, CacheError> {
        std::fs::create_dir_all(&config.directory)
            .map_err(|e| CacheError::io(&config.directory, e))?;
        let manifest = Manifest::load(&config.directory);

        info!(
            directory = %config.directory.display(),
            entries = manifest.entries.len(),
            verify_checksums = config.verify_checksums,
            "Opened asset cache"
        );

        Ok(Self {
            root: config.directory,
            verify_checksums: config.verify_checksums,
            retry: config.retry,
            client,
            manifest: Mutex::new(manifest),
            persist_lock: tokio::sync::Mutex::new(()),
            key_locks: DashMap::new(),
            counters: Counters::default(),
        })
    }

    /// Cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the local copy of one band of a granule, downloading it when
    /// absent or stale.
    ///
    /// # Arguments
    ///
    /// * `granule` - The granule owning the asset
    /// * `band` - Product band id (`B04`, `Fmask`, ...)
    /// * `cancel` - Aborts waiting and in-flight downloads
    #[instrument(skip(self, granule, cancel), fields(granule = %granule.id))]
    pub async fn get_or_fetch(
        &self,
        granule: &Granule,
        band: &str,
        cancel: &CancellationToken,
    ) -> Result<CachedAsset, RetrievalError> {
        let granule_id = granule.id.as_str();
        let asset = granule.assets.get(band).ok_or_else(|| {
            RetrievalError::new(granule_id, band, 0, RetrievalReason::MissingAsset)
        })?;
        let key = CacheKey::new(granule_id, band);

        let lock = Arc::clone(
            self.key_locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .value(),
        );

        let outcome = self.fetch_locked(&lock, &key, granule_id, asset, cancel).await;
        // Only the map and this task still hold the lock: nobody is waiting.
        self.key_locks
            .remove_if(&key, |_, l| Arc::strong_count(l) == 2);
        outcome
    }

    /// Serves one key under its per-key lock: cache hit or download.
    async fn fetch_locked(
        &self,
        lock: &tokio::sync::Mutex<()>,
        key: &CacheKey,
        granule_id: &str,
        asset: &AssetRef,
        cancel: &CancellationToken,
    ) -> Result<CachedAsset, RetrievalError> {
        let band = key.band.as_str();
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(RetrievalError::new(granule_id, band, 0, RetrievalReason::Cancelled));
            }
            guard = lock.lock() => guard,
        };

        if let Some(hit) = self.lookup(key, asset).await {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "Cache hit");
            return Ok(hit);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, href = %asset.href, "Cache miss, downloading");

        let client = &self.client;
        let bytes = self
            .retry
            .run(cancel, |attempt| async move {
                debug!(href = %asset.href, attempt, "Downloading asset");
                let bytes = client.get(&asset.href).await?;
                verify_payload(asset, &bytes)?;
                Ok::<_, DownloadError>(bytes)
            })
            .await
            .map_err(|e| RetrievalError::from_retry(granule_id, band, e))?;

        let cached = self.install(key, asset, bytes).await.map_err(|e| {
            RetrievalError::new(granule_id, band, 1, RetrievalReason::Storage(e.to_string()))
        })?;

        self.counters.downloads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .downloaded_bytes
            .fetch_add(cached.size, Ordering::Relaxed);
        info!(key = %key, bytes = cached.size, "Cached asset");

        Ok(cached)
    }

    /// Validates a manifest entry against the file on disk and the remote
    /// asset metadata.
    async fn lookup(&self, key: &CacheKey, asset: &AssetRef) -> Option<CachedAsset> {
        let entry = self.manifest.lock().entries.get(&key.to_string()).cloned()?;
        let path = self.root.join(&entry.path);

        let stale = |reason: &str| {
            debug!(key = %key, reason, "Cached asset is stale");
            None
        };

        let size_on_disk = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => return stale("file missing"),
        };
        if size_on_disk != entry.size {
            return stale("size differs from manifest");
        }
        if asset.size.is_some_and(|s| s != entry.size) {
            return stale("remote size changed");
        }
        if asset
            .checksum
            .as_deref()
            .is_some_and(|c| !c.eq_ignore_ascii_case(&entry.sha256))
        {
            return stale("remote checksum changed");
        }
        if self.verify_checksums {
            let check_path = path.clone();
            let expected = entry.sha256.clone();
            let matches = tokio::task::spawn_blocking(move || file_matches(&check_path, &expected))
                .await
                .unwrap_or(false);
            if !matches {
                return stale("checksum differs from manifest");
            }
        }

        Some(CachedAsset {
            key: key.clone(),
            path,
            size: entry.size,
            sha256: entry.sha256,
            href: entry.href,
            retrieved_at: entry.retrieved_at,
        })
    }

    /// Installs a verified payload and records it in the manifest.
    async fn install(
        &self,
        key: &CacheKey,
        asset: &AssetRef,
        bytes: Vec<u8>,
    ) -> Result<CachedAsset, CacheError> {
        let relative = key.relative_path();
        let path = self.root.join(&relative);
        let size = bytes.len() as u64;

        let target = path.clone();
        let sha256 = tokio::task::spawn_blocking(move || -> Result<String, CacheError> {
            let dir = target
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| target.clone());
            std::fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;
            let sha256 = sha256_hex(&bytes);
            write_atomic(&dir, &target, &bytes)?;
            Ok(sha256)
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))??;

        let entry = ManifestEntry {
            path: relative.to_string_lossy().replace('\\', "/"),
            size,
            sha256: sha256.clone(),
            href: asset.href.clone(),
            retrieved_at: Utc::now(),
        };

        self.persist_entry(key.to_string(), entry.clone()).await?;

        Ok(CachedAsset {
            key: key.clone(),
            path,
            size,
            sha256,
            href: entry.href,
            retrieved_at: entry.retrieved_at,
        })
    }

    async fn persist_entry(&self, key: String, entry: ManifestEntry) -> Result<(), CacheError> {
        let _persist = self.persist_lock.lock().await;
        let snapshot = {
            let mut manifest = self.manifest.lock();
            manifest.entries.insert(key, entry);
            manifest.clone()
        };
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || snapshot.save(&root))
            .await
            .map_err(|e| CacheError::Task(e.to_string()))?
    }

    /// Contents and session counters.
    pub fn stats(&self) -> CacheStats {
        let manifest = self.manifest.lock();
        CacheStats {
            entries: manifest.entries.len(),
            total_bytes: manifest.entries.values().map(|e| e.size).sum(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            downloads: self.counters.downloads.load(Ordering::Relaxed),
            downloaded_bytes: self.counters.downloaded_bytes.load(Ordering::Relaxed),
        }
    }

    /// Removes every cached asset and the manifest.
    ///
    /// # Returns
    ///
    /// The statistics of what was removed.
    pub async fn clear(&self) -> Result<CacheStats, CacheError> {
        let _persist = self.persist_lock.lock().await;
        let removed = self.stats();
        let entries = std::mem::take(&mut self.manifest.lock().entries);

        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<(), CacheError> {
            for entry in entries.values() {
                let path = root.join(&entry.path);
                match std::fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(CacheError::io(path, e)),
                }
                if let Some(dir) = path.parent() {
                    // Leaves directories that still hold other files.
                    let _ = std::fs::remove_dir(dir);
                }
            }
            Manifest::default().save(&root)
        })
        .await
        .map_err(|e| CacheError::Task(e.to_string()))??;

        warn!(
            entries = removed.entries,
            bytes = removed.total_bytes,
            "Cleared asset cache"
        );
        Ok(removed)
    }
}

/// Checks a downloaded payload against the advertised size and checksum.
fn verify_payload(asset: &AssetRef, bytes: &[u8]) -> Result<(), DownloadError> {
    let actual = bytes.len() as u64;
    if let Some(expected) = asset.size {
        if actual < expected {
            return Err(DownloadError::Truncated { expected, actual });
        }
        if actual > expected {
            return Err(DownloadError::Oversized { expected, actual });
        }
    }
    if let Some(expected) = &asset.checksum {
        let actual = sha256_hex(bytes);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(DownloadError::ChecksumMismatch {
                expected: expected.clone(),
                actual,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{HttpError, MockHttpClient};
    use chrono::TimeZone;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::TempDir;

    const GRANULE: &str = "HLS.S30.T10SEG.2021152T184919.v2.0";
    const HREF: &str = "https://data.test/HLS.S30.T10SEG.2021152T184919.v2.0.B04.tif";

    fn granule(asset: AssetRef) -> Granule {
        let mut assets = BTreeMap::new();
        assets.insert("B04".to_string(), asset);
        Granule {
            id: GRANULE.parse().unwrap(),
            collection: "HLSS30_2.0".into(),
            acquired: Utc.with_ymd_and_hms(2021, 6, 1, 18, 49, 19).unwrap(),
            updated: None,
            cloud_cover: 5.0,
            footprint: None,
            assets,
        }
    }

    fn open(temp: &TempDir, mock: &Arc<MockHttpClient>) -> AssetCache {
        let config = CacheConfig::new(temp.path())
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(1)));
        AssetCache::open(config, Arc::clone(mock) as Arc<dyn AsyncHttpClient>).unwrap()
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let temp = TempDir::new().unwrap();
        let mock = Arc::new(MockHttpClient::new());
        mock.respond(HREF, Ok(b"tiff bytes".to_vec()));
        let cache = open(&temp, &mock);
        let g = granule(AssetRef::new(HREF));
        let cancel = CancellationToken::new();

        let first = cache.get_or_fetch(&g, "B04", &cancel).await.unwrap();
        let second = cache.get_or_fetch(&g, "B04", &cancel).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read(&first.path).unwrap(), b"tiff bytes");
        assert!(first
            .path
            .ends_with(format!("{}/{}.B04.tif", GRANULE, GRANULE)));
        assert_eq!(mock.request_count(HREF), 1);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.downloads), (1, 1, 1));
        assert_eq!(stats.downloaded_bytes, 10);
    }

    #[tokio::test]
    async fn test_manifest_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let mock = Arc::new(MockHttpClient::new());
        mock.respond(HREF, Ok(b"payload".to_vec()));
        let g = granule(AssetRef::new(HREF));
        let cancel = CancellationToken::new();

        open(&temp, &mock).get_or_fetch(&g, "B04", &cancel).await.unwrap();
        let reopened = open(&temp, &mock);
        reopened.get_or_fetch(&g, "B04", &cancel).await.unwrap();

        assert_eq!(mock.request_count(HREF), 1);
        assert_eq!(reopened.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_corrupted_file_is_refetched() {
        let temp = TempDir::new().unwrap();
        let mock = Arc::new(MockHttpClient::new());
        mock.respond(HREF, Ok(b"payload".to_vec()));
        let cache = open(&temp, &mock);
        let g = granule(AssetRef::new(HREF));
        let cancel = CancellationToken::new();

        let asset = cache.get_or_fetch(&g, "B04", &cancel).await.unwrap();
        // Same size, different content.
        std::fs::write(&asset.path, b"PAYLOAD").unwrap();

        let again = cache.get_or_fetch(&g, "B04", &cancel).await.unwrap();
        assert_eq!(std::fs::read(&again.path).unwrap(), b"payload");
        assert_eq!(mock.request_count(HREF), 2);
    }

    #[tokio::test]
    async fn test_remote_checksum_change_forces_refetch() {
        let temp = TempDir::new().unwrap();
        let mock = Arc::new(MockHttpClient::new());
        mock.respond(HREF, Ok(b"v1".to_vec()));
        mock.respond(HREF, Ok(b"v2".to_vec()));
        let cache = open(&temp, &mock);
        let cancel = CancellationToken::new();

        cache
            .get_or_fetch(&granule(AssetRef::new(HREF)), "B04", &cancel)
            .await
            .unwrap();
        let updated = granule(AssetRef::new(HREF).with_checksum(sha256_hex(b"v2")));
        let asset = cache.get_or_fetch(&updated, "B04", &cancel).await.unwrap();

        assert_eq!(asset.sha256, sha256_hex(b"v2"));
        assert_eq!(mock.request_count(HREF), 2);
    }

    #[tokio::test]
    async fn test_truncated_payload_retried() {
        let temp = TempDir::new().unwrap();
        let mock = Arc::new(MockHttpClient::new());
        mock.respond(HREF, Ok(b"par".to_vec()));
        mock.respond(HREF, Ok(b"payload".to_vec()));
        let cache = open(&temp, &mock);
        let g = granule(AssetRef::new(HREF).with_size(7));

        let asset = cache
            .get_or_fetch(&g, "B04", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(asset.size, 7);
        assert_eq!(mock.request_count(HREF), 2);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let temp = TempDir::new().unwrap();
        let mock = Arc::new(MockHttpClient::new());
        mock.respond(
            HREF,
            Err(HttpError::Status {
                status: 404,
                url: HREF.into(),
            }),
        );
        let cache = open(&temp, &mock);

        let err = cache
            .get_or_fetch(&granule(AssetRef::new(HREF)), "B04", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 1);
        assert_eq!(err.band, "B04");
        assert_eq!(mock.request_count(HREF), 1);
        assert_eq!(cache.stats().entries, 0);
        assert!(cache.key_locks.is_empty());
    }

    #[tokio::test]
    async fn test_missing_asset() {
        let temp = TempDir::new().unwrap();
        let mock = Arc::new(MockHttpClient::new());
        let cache = open(&temp, &mock);

        let err = cache
            .get_or_fetch(&granule(AssetRef::new(HREF)), "B05", &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.reason, RetrievalReason::MissingAsset);
    }

    #[tokio::test]
    async fn test_cancelled_before_download() {
        let temp = TempDir::new().unwrap();
        let mock = Arc::new(MockHttpClient::new());
        mock.respond(HREF, Ok(b"payload".to_vec()));
        let cache = open(&temp, &mock);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = cache
            .get_or_fetch(&granule(AssetRef::new(HREF)), "B04", &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_requests_download_once() {
        let temp = TempDir::new().unwrap();
        let mock = Arc::new(MockHttpClient::new());
        mock.respond(HREF, Ok(b"payload".to_vec()));
        let cache = Arc::new(open(&temp, &mock));
        let g = Arc::new(granule(AssetRef::new(HREF)));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let g = Arc::clone(&g);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(&g, "B04", &CancellationToken::new())
                    .await
                    .unwrap()
            }));
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }

        assert_eq!(mock.request_count(HREF), 1);
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cache.stats().downloads, 1);
        assert!(cache.key_locks.is_empty());
    }

    #[tokio::test]
    async fn test_key_locks_released_after_each_outcome() {
        let temp = TempDir::new().unwrap();
        let mock = Arc::new(MockHttpClient::new());
        mock.respond(HREF, Ok(b"payload".to_vec()));
        let cache = open(&temp, &mock);
        let g = granule(AssetRef::new(HREF));

        cache.get_or_fetch(&g, "B04", &CancellationToken::new()).await.unwrap();
        assert!(cache.key_locks.is_empty());

        cache.get_or_fetch(&g, "B04", &CancellationToken::new()).await.unwrap();
        assert!(cache.key_locks.is_empty());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = cache.get_or_fetch(&g, "B04", &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(cache.key_locks.is_empty());
    }

    #[tokio::test]
    async fn test_clear_removes_files() {
        let temp = TempDir::new().unwrap();
        let mock = Arc::new(MockHttpClient::new());
        mock.respond(HREF, Ok(b"payload".to_vec()));
        let cache = open(&temp, &mock);
        let asset = cache
            .get_or_fetch(&granule(AssetRef::new(HREF)), "B04", &CancellationToken::new())
            .await
            .unwrap();

        let removed = cache.clear().await.unwrap();
        assert_eq!(removed.entries, 1);
        assert_eq!(removed.total_bytes, 7);
        assert!(!asset.path.exists());
        assert_eq!(cache.stats().entries, 0);
        assert!(Manifest::load(temp.path()).entries.is_empty());
    }

    #[test]
    fn test_verify_payload() {
        let asset = AssetRef::new(HREF).with_size(3);
        assert!(verify_payload(&asset, b"abc").is_ok());
        assert!(matches!(
            verify_payload(&asset, b"ab"),
            Err(DownloadError::Truncated { .. })
        ));
        assert!(matches!(
            verify_payload(&asset, b"abcd"),
            Err(DownloadError::Oversized { .. })
        ));
        let asset = AssetRef::new(HREF).with_checksum(sha256_hex(b"abc"));
        assert!(matches!(
            verify_payload(&asset, b"abd"),
            Err(DownloadError::ChecksumMismatch { .. })
        ));
    }
}
