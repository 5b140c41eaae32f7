//! End-to-end pipeline tests against an in-memory STAC catalog and asset host.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use hlsmosaic::cache::{sha256_hex, DownloadError, RetrievalReason};
use hlsmosaic::catalog::CatalogConfig;
use hlsmosaic::coord::{resolve_tile, BoundingBox, Tile};
use hlsmosaic::index::SourcePriority;
use hlsmosaic::pipeline::{
    dates_listed, write_composite, write_mosaic, Diagnostic, HlsPipeline, PipelineConfig,
    PipelineError, Query,
};
use hlsmosaic::provider::{AsyncHttpClient, BoxFuture, HttpError};
use hlsmosaic::raster::{self, encode, GeoRaster};
use hlsmosaic::retry::RetryPolicy;

const ENDPOINT: &str = "https://stac.test";
const DATA: &str = "https://data.test";
const TILE: &str = "10SEG";
/// Coarse grid so every tile is 30 x 30 pixels.
const RESOLUTION: f64 = 3660.0;

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2021, 6, d).unwrap()
}

fn tile() -> Tile {
    tile_on(TILE)
}

fn tile_on(id: &str) -> Tile {
    resolve_tile(id, RESOLUTION).unwrap()
}

/// Granule id for a June 2021 acquisition.
fn granule_id(source: &str, d: u32) -> String {
    granule_on(TILE, source, d)
}

fn granule_on(tile: &str, source: &str, d: u32) -> String {
    format!("HLS.{}.T{}.2021{:03}T184919.v2.0", source, tile, 151 + d)
}

fn asset_href(granule: &str, band: &str) -> String {
    format!("{}/{}.{}.tif", DATA, granule, band)
}

/// In-memory catalog and asset host.
#[derive(Default)]
struct FakeHls {
    /// Items served per collection short name (`HLSS30`, `HLSL30`).
    items: Mutex<HashMap<&'static str, Vec<Value>>>,
    assets: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
    catalog_status: Mutex<Option<u16>>,
    asset_delay: Mutex<Option<Duration>>,
}

impl FakeHls {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publishes a granule on the default tile.
    fn publish(&self, source: &'static str, d: u32, cloud_cover: f64, bands: &[(&str, f32)], fmask: Vec<f32>) {
        self.publish_on(TILE, source, d, cloud_cover, bands, fmask);
    }

    /// Publishes a granule with uniform band values and an Fmask raster.
    fn publish_on(
        &self,
        tile_id: &str,
        source: &'static str,
        d: u32,
        cloud_cover: f64,
        bands: &[(&str, f32)],
        fmask: Vec<f32>,
    ) {
        let id = granule_on(tile_id, source, d);
        let tile = tile_on(tile_id);
        let mut assets = serde_json::Map::new();

        let mut rasters: Vec<(String, Vec<f32>)> = bands
            .iter()
            .map(|(band, value)| (band.to_string(), vec![*value; tile.pixel_count()]))
            .collect();
        rasters.push(("Fmask".to_string(), fmask));

        for (band, data) in rasters {
            let raster = GeoRaster::new(
                tile.width,
                tile.height,
                (tile.origin_x, tile.origin_y),
                (tile.resolution, tile.resolution),
                tile.epsg(),
                Some(-9999.0),
                data,
            )
            .unwrap();
            let bytes = encode(&raster).unwrap();
            let href = asset_href(&id, &band);
            assets.insert(
                band.clone(),
                json!({
                    "href": href,
                    "file:size": bytes.len(),
                    "file:checksum": format!("1220{}", sha256_hex(&bytes)),
                }),
            );
            self.assets.lock().insert(href, bytes);
        }

        let item = json!({
            "type": "Feature",
            "id": id,
            "geometry": null,
            "properties": {
                "datetime": format!("2021-06-{:02}T18:49:19Z", d),
                "eo:cloud_cover": cloud_cover,
            },
            "assets": Value::Object(assets),
        });
        let collection = if source == "S30" { "HLSS30" } else { "HLSL30" };
        self.items.lock().entry(collection).or_default().push(item);
    }

    /// Makes an asset answer 404 while its catalog record still lists it.
    fn withdraw(&self, granule: &str, band: &str) {
        self.assets.lock().remove(&asset_href(granule, band));
    }

    fn asset_requests(&self) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|u| u.starts_with(DATA))
            .count()
    }

    fn requests_for(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|u| *u == url).count()
    }

    fn search_page(&self, url: &str) -> Result<Vec<u8>, HttpError> {
        if let Some(status) = *self.catalog_status.lock() {
            return Err(HttpError::Status {
                status,
                url: url.to_string(),
            });
        }
        let parsed = reqwest::Url::parse(url).map_err(|e| HttpError::Connection(e.to_string()))?;
        let collection = parsed
            .query_pairs()
            .find(|(k, _)| k == "collections")
            .map(|(_, v)| v.to_ascii_uppercase())
            .unwrap_or_default();

        let items = self.items.lock();
        let features: Vec<Value> = items
            .iter()
            .filter(|(name, _)| collection.starts_with(*name))
            .flat_map(|(_, items)| items.iter().cloned())
            .collect();
        Ok(serde_json::to_vec(&json!({
            "type": "FeatureCollection",
            "features": features,
            "links": [],
        }))
        .unwrap())
    }
}

impl AsyncHttpClient for FakeHls {
    fn get<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Vec<u8>, HttpError>> {
        Box::pin(async move {
            self.requests.lock().push(url.to_string());
            if url.starts_with(ENDPOINT) {
                return self.search_page(url);
            }

            let delay = *self.asset_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.assets
                .lock()
                .get(url)
                .cloned()
                .ok_or_else(|| HttpError::Status {
                    status: 404,
                    url: url.to_string(),
                })
        })
    }
}

fn config(cache_dir: &std::path::Path) -> PipelineConfig {
    PipelineConfig::default()
        .with_catalog(CatalogConfig::default().with_endpoint(ENDPOINT))
        .with_cache_dir(cache_dir)
        .with_retry(RetryPolicy::fixed(2, Duration::from_millis(1)))
        .with_resolution(RESOLUTION)
        .with_parallel_downloads(4)
        .with_assembly_workers(2)
}

fn pipeline(fake: &Arc<FakeHls>, config: PipelineConfig) -> HlsPipeline {
    let client: Arc<dyn AsyncHttpClient> = Arc::clone(fake) as Arc<dyn AsyncHttpClient>;
    HlsPipeline::new(config, Arc::clone(&client), client).unwrap()
}

fn clear_fmask() -> Vec<f32> {
    vec![0.0; tile().pixel_count()]
}

fn red_query(start: u32, end: u32) -> Query {
    Query::for_tile(TILE, day(start), day(end)).with_bands(["red"])
}

#[tokio::test]
async fn test_cloud_threshold_leaves_nodata_mosaic() {
    let temp = TempDir::new().unwrap();
    let fake = FakeHls::new();
    fake.publish("S30", 1, 5.0, &[("B04", 1000.0)], clear_fmask());
    fake.publish("S30", 2, 30.0, &[("B04", 2000.0)], clear_fmask());
    fake.publish("S30", 3, 10.0, &[("B04", 3000.0)], clear_fmask());
    let pipeline = pipeline(&fake, config(temp.path()));

    let result = pipeline
        .resolve(&red_query(1, 3).with_cloud_threshold(20.0), CancellationToken::new())
        .await
        .unwrap();

    let dates: Vec<NaiveDate> = result.mosaics.iter().map(|m| m.date).collect();
    assert_eq!(dates, vec![day(1), day(2), day(3)]);
    assert!(result.mosaics.iter().all(|m| m.band == "red"));

    let first = &result.mosaics[0];
    assert_eq!(first.valid_pixels(), tile().pixel_count());
    assert!((first.value(0, 0).unwrap() - 0.1).abs() < 1e-6);
    assert_eq!(first.source_at(15, 15), Some(granule_id("S30", 1).as_str()));

    let filtered = &result.mosaics[1];
    assert_eq!(filtered.valid_pixels(), 0);
    assert!(filtered.sources.is_empty());

    assert!((result.mosaics[2].value(29, 29).unwrap() - 0.3).abs() < 1e-6);

    assert!(result.diagnostics.iter().any(|d| matches!(
        d,
        Diagnostic::CloudFiltered { granule, .. } if *granule == granule_id("S30", 2)
    )));
    assert!(result.diagnostics.iter().any(|d| matches!(
        d,
        Diagnostic::IncompleteMosaic(e) if e.date == day(2) && e.band == "red"
    )));
    assert!(!result.was_cancelled());

    // The filtered granule is never downloaded.
    assert_eq!(fake.requests_for(&asset_href(&granule_id("S30", 2), "B04")), 0);
}

#[tokio::test]
async fn test_warm_cache_skips_downloads_and_reproduces_output() {
    let temp = TempDir::new().unwrap();
    let fake = FakeHls::new();
    fake.publish("S30", 1, 5.0, &[("B04", 1200.0), ("B8A", 3100.0)], clear_fmask());
    fake.publish("L30", 2, 15.0, &[("B04", 900.0), ("B05", 2800.0)], clear_fmask());
    let query = Query::for_tile(TILE, day(1), day(2)).with_bands(["red", "NIR"]);

    let first = pipeline(&fake, config(temp.path()))
        .resolve(&query, CancellationToken::new())
        .await
        .unwrap();
    let cold_downloads = fake.asset_requests();
    assert_eq!(cold_downloads, 6);
    assert_eq!(first.mosaics.len(), 4);
    assert!(first.is_clean());

    // A fresh pipeline over the same cache directory.
    let second = pipeline(&fake, config(temp.path()))
        .resolve(&query, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fake.asset_requests(), cold_downloads);

    let encoded = |r: &hlsmosaic::pipeline::QueryResult| -> Vec<Vec<u8>> {
        r.mosaics.iter().map(|m| m.encode().unwrap()).collect()
    };
    assert_eq!(encoded(&first), encoded(&second));

    let out = temp.path().join("out");
    let path = write_mosaic(&out, &second.mosaics[0]).unwrap();
    assert_eq!(path.file_name().unwrap(), "HLS_NIR_10SEG_20210601.tif");
}

#[tokio::test]
async fn test_collection_aliases_collapse_to_one_contributor() {
    let temp = TempDir::new().unwrap();
    let fake = FakeHls::new();
    fake.publish("S30", 1, 5.0, &[("B04", 1000.0)], clear_fmask());
    let config = config(temp.path()).with_catalog(
        CatalogConfig::default()
            .with_endpoint(ENDPOINT)
            .with_collections(["HLSS30_2.0", "HLSS30.v2.0"]),
    );

    let result = pipeline(&fake, config)
        .resolve(&red_query(1, 1), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.mosaics.len(), 1);
    assert_eq!(result.mosaics[0].sources.len(), 1);
    // One band and one Fmask download, not two of each.
    assert_eq!(fake.asset_requests(), 2);
}

#[tokio::test]
async fn test_source_priority_and_cloud_fall_through() {
    let temp = TempDir::new().unwrap();
    let fake = FakeHls::new();
    let tile = tile();

    // Sentinel is cloudy (bit 1) over the northern half.
    let mut fmask = clear_fmask();
    for v in fmask.iter_mut().take(tile.pixel_count() / 2) {
        *v = 2.0;
    }
    fake.publish("S30", 1, 40.0, &[("B04", 1000.0)], fmask);
    fake.publish("L30", 1, 1.0, &[("B04", 2000.0)], clear_fmask());

    let sentinel_first = pipeline(&fake, config(temp.path()))
        .resolve(&red_query(1, 1), CancellationToken::new())
        .await
        .unwrap();
    let mosaic = &sentinel_first.mosaics[0];
    assert_eq!(mosaic.sources, vec![granule_id("S30", 1), granule_id("L30", 1)]);
    assert!((mosaic.value(0, 0).unwrap() - 0.2).abs() < 1e-6);
    assert_eq!(mosaic.source_at(0, 0), Some(granule_id("L30", 1).as_str()));
    assert!((mosaic.value(29, 0).unwrap() - 0.1).abs() < 1e-6);
    assert_eq!(mosaic.source_at(29, 0), Some(granule_id("S30", 1).as_str()));

    let landsat_first = pipeline(
        &fake,
        config(temp.path()).with_priority(SourcePriority::Landsat),
    )
    .resolve(&red_query(1, 1), CancellationToken::new())
    .await
    .unwrap();
    let mosaic = &landsat_first.mosaics[0];
    assert_eq!(mosaic.sources[0], granule_id("L30", 1));
    assert!((mosaic.value(29, 0).unwrap() - 0.2).abs() < 1e-6);
}

#[tokio::test]
async fn test_failed_band_download_leaves_other_granules_contributing() {
    let temp = TempDir::new().unwrap();
    let fake = FakeHls::new();
    fake.publish("S30", 1, 5.0, &[("B04", 1000.0)], clear_fmask());
    fake.publish("L30", 1, 10.0, &[("B04", 2000.0)], clear_fmask());
    let sentinel = granule_id("S30", 1);
    let landsat = granule_id("L30", 1);
    fake.withdraw(&sentinel, "B04");

    let result = pipeline(&fake, config(temp.path()))
        .resolve(&red_query(1, 1), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.mosaics.len(), 1);
    let mosaic = &result.mosaics[0];
    assert_eq!(mosaic.valid_pixels(), tile().pixel_count());
    assert_eq!(mosaic.source_at(0, 0), Some(landsat.as_str()));
    assert_eq!(mosaic.source_at(29, 29), Some(landsat.as_str()));
    assert!((mosaic.value(15, 15).unwrap() - 0.2).abs() < 1e-6);

    let failures: Vec<_> = result
        .diagnostics
        .iter()
        .filter_map(|d| match d {
            Diagnostic::Retrieval(e) => Some(e),
            _ => None,
        })
        .collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].granule, sentinel);
    assert_eq!(failures[0].band, "B04");
    assert!(matches!(
        &failures[0].reason,
        RetrievalReason::Download(DownloadError::Http(HttpError::Status { status: 404, .. }))
    ));
    assert!(!result.was_cancelled());
    assert_eq!(result.retrieval_failures(), 1);
    assert!(!result.is_empty_output());

    // A 404 is permanent: one request despite the retry policy.
    assert_eq!(fake.requests_for(&asset_href(&sentinel, "B04")), 1);
}

#[tokio::test]
async fn test_all_downloads_failing_leaves_only_empty_mosaics() {
    let temp = TempDir::new().unwrap();
    let fake = FakeHls::new();
    fake.publish("S30", 1, 5.0, &[("B04", 1000.0)], clear_fmask());
    let id = granule_id("S30", 1);
    fake.withdraw(&id, "B04");
    fake.withdraw(&id, "Fmask");

    let result = pipeline(&fake, config(temp.path()))
        .resolve(&red_query(1, 1), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.mosaics.len(), 1);
    assert!(result.is_empty_output());
    assert_eq!(result.retrieval_failures(), 2);
}

#[tokio::test]
async fn test_bbox_query_combines_tiles_into_one_raster() {
    let temp = TempDir::new().unwrap();
    let fake = FakeHls::new();
    fake.publish_on("10SEG", "S30", 1, 5.0, &[("B04", 1000.0)], clear_fmask());
    fake.publish_on("10SFG", "S30", 1, 5.0, &[("B04", 2000.0)], clear_fmask());
    let west = granule_on("10SEG", "S30", 1);
    let east = granule_on("10SFG", "S30", 1);

    // Western part only in 10SEG, eastern part only in 10SFG.
    let bbox = BoundingBox::new(-122.5, 37.3, -121.0, 37.6);
    let query = Query::for_geometry(bbox, day(1), day(1)).with_bands(["red"]);
    let result = pipeline(&fake, config(temp.path()))
        .resolve(&query, CancellationToken::new())
        .await
        .unwrap();

    let tiles: Vec<String> = result.mosaics.iter().map(|m| m.tile.id.to_string()).collect();
    assert_eq!(tiles, vec!["10SEG", "10SFG"]);
    assert_eq!(result.composites.len(), 1);

    let composite = &result.composites[0];
    assert_eq!(composite.band, "red");
    assert_eq!(composite.date, day(1));
    assert_eq!(composite.sources, vec![west.clone(), east.clone()]);

    let grid = &composite.grid;
    let row = grid.height / 2;
    let first = (0..grid.width).find(|&c| composite.value(row, c).is_some()).unwrap();
    let last = (0..grid.width).rev().find(|&c| composite.value(row, c).is_some()).unwrap();
    assert_eq!(composite.source_at(row, first), Some(west.as_str()));
    assert!((composite.value(row, first).unwrap() - 0.1).abs() < 1e-6);
    assert_eq!(composite.source_at(row, last), Some(east.as_str()));
    assert!((composite.value(row, last).unwrap() - 0.2).abs() < 1e-6);

    let out = temp.path().join("out");
    let path = write_composite(&out, composite).unwrap();
    assert_eq!(path.file_name().unwrap(), "HLS_red_20210601.tif");
    let written = raster::read(&path).unwrap();
    assert_eq!((written.width, written.height), (grid.width, grid.height));
    assert_eq!(written.epsg, 32610);
}

#[tokio::test]
async fn test_tile_query_has_no_composite() {
    let temp = TempDir::new().unwrap();
    let fake = FakeHls::new();
    fake.publish("S30", 1, 5.0, &[("B04", 1000.0)], clear_fmask());

    let result = pipeline(&fake, config(temp.path()))
        .resolve(&red_query(1, 1), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.mosaics.len(), 1);
    assert!(result.composites.is_empty());
}

#[tokio::test]
async fn test_concurrent_queries_download_each_asset_once() {
    let temp = TempDir::new().unwrap();
    let fake = FakeHls::new();
    fake.publish("S30", 1, 5.0, &[("B04", 1000.0)], clear_fmask());
    fake.publish("S30", 2, 5.0, &[("B04", 1100.0)], clear_fmask());
    *fake.asset_delay.lock() = Some(Duration::from_millis(50));
    let pipeline = pipeline(&fake, config(temp.path()));
    let query = red_query(1, 2);

    let (a, b) = tokio::join!(
        pipeline.resolve(&query, CancellationToken::new()),
        pipeline.resolve(&query, CancellationToken::new())
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.mosaics.len(), 2);
    assert_eq!(a.mosaics, b.mosaics);
    assert_eq!(fake.asset_requests(), 4);
    assert_eq!(pipeline.cache().stats().downloads, 4);
}

#[tokio::test]
async fn test_deadline_cancels_promptly() {
    let temp = TempDir::new().unwrap();
    let fake = FakeHls::new();
    fake.publish("S30", 1, 5.0, &[("B04", 1000.0)], clear_fmask());
    *fake.asset_delay.lock() = Some(Duration::from_secs(30));
    let pipeline = pipeline(&fake, config(temp.path()));

    let started = Instant::now();
    let result = pipeline
        .resolve(
            &red_query(1, 1).with_deadline(Duration::from_millis(100)),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(result.was_cancelled());
    assert!(result.mosaics.is_empty());
}

#[tokio::test]
async fn test_external_cancellation_before_start() {
    let temp = TempDir::new().unwrap();
    let fake = FakeHls::new();
    fake.publish("S30", 1, 5.0, &[("B04", 1000.0)], clear_fmask());
    let pipeline = pipeline(&fake, config(temp.path()));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = pipeline.resolve(&red_query(1, 1), cancel).await.unwrap();
    assert!(result.was_cancelled());
    assert!(result.mosaics.is_empty());
    assert_eq!(fake.asset_requests(), 0);
}

#[tokio::test]
async fn test_catalog_auth_failure_is_fatal() {
    let temp = TempDir::new().unwrap();
    let fake = FakeHls::new();
    *fake.catalog_status.lock() = Some(401);

    let err = pipeline(&fake, config(temp.path()))
        .resolve(&red_query(1, 3), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::CatalogUnavailable(_)));
    // Auth failures are not retried.
    assert_eq!(fake.requests.lock().len(), 1);
}

#[tokio::test]
async fn test_invalid_query_is_rejected() {
    let temp = TempDir::new().unwrap();
    let fake = FakeHls::new();
    let pipeline = pipeline(&fake, config(temp.path()));

    let err = pipeline
        .resolve(&red_query(3, 1), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidQuery(_)));

    let err = pipeline
        .resolve(&Query::for_tile("10SZZ", day(1), day(1)), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::GridResolution(_)));
    assert!(fake.requests.lock().is_empty());
}

#[tokio::test]
async fn test_listing_groups_granules_by_date() {
    let temp = TempDir::new().unwrap();
    let fake = FakeHls::new();
    fake.publish("S30", 1, 80.0, &[("B04", 1000.0)], clear_fmask());
    fake.publish("L30", 1, 10.0, &[("B04", 1000.0)], clear_fmask());
    fake.publish("L30", 3, 10.0, &[("B04", 1000.0)], clear_fmask());
    let config = config(temp.path()).with_resolution(30.0);
    let pipeline = pipeline(&fake, config);

    let rows = pipeline
        .listing(TILE, day(1), day(3), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(dates_listed(&rows), vec![day(1), day(3)]);
    assert_eq!(rows[0].sentinel.as_deref(), Some(granule_id("S30", 1).as_str()));
    assert_eq!(rows[0].landsat.as_deref(), Some(granule_id("L30", 1).as_str()));
    assert_eq!(rows[1].sentinel, None);
    assert_eq!(fake.asset_requests(), 0);
}
