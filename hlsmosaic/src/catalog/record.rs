//! Validation of raw STAC items into [`Granule`]s.
//!
//! Records are accepted only when every required field is present and well
//! formed. Anything else is rejected with a [`RecordError`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::error::RecordError;
use super::stac::RawRecord;
use crate::coord::{Point, Polygon};
use crate::granule::{asset_band, AssetRef, Granule, GranuleId, SourceCollection};

/// Multihash prefix for SHA2-256 digests (`0x12`, length `0x20`).
const SHA256_MULTIHASH_PREFIX: &str = "1220";

/// Validates one raw record.
pub fn validate_record(raw: &RawRecord) -> Result<Granule, RecordError> {
    let item = &raw.item;

    let id_str = item
        .get("id")
        .and_then(Value::as_str)
        .ok_or(RecordError::MissingField("id"))?;
    let id: GranuleId = id_str
        .parse()
        .map_err(|e: crate::granule::GranuleIdError| RecordError::invalid("id", e.to_string()))?;

    let collection = item
        .get("collection")
        .and_then(Value::as_str)
        .unwrap_or(&raw.searched_collection)
        .to_string();
    match SourceCollection::from_collection(&collection) {
        Some(source) if source == id.source => {}
        Some(source) => {
            return Err(RecordError::invalid(
                "collection",
                format!("{} record in {} collection", id.source, source),
            ))
        }
        None => {
            return Err(RecordError::invalid(
                "collection",
                format!("unknown collection '{}'", collection),
            ))
        }
    }

    let properties = item
        .get("properties")
        .and_then(Value::as_object)
        .ok_or(RecordError::MissingField("properties"))?;

    let acquired = properties
        .get("datetime")
        .and_then(Value::as_str)
        .ok_or(RecordError::MissingField("properties.datetime"))
        .and_then(|s| parse_timestamp(s, "properties.datetime"))?;

    let updated = match properties.get("updated") {
        None | Some(Value::Null) => None,
        Some(v) => Some(
            v.as_str()
                .ok_or_else(|| RecordError::invalid("properties.updated", "not a string"))
                .and_then(|s| parse_timestamp(s, "properties.updated"))?,
        ),
    };

    let cloud_cover = properties
        .get("eo:cloud_cover")
        .ok_or(RecordError::MissingField("properties.eo:cloud_cover"))?
        .as_f64()
        .filter(|c| (0.0..=100.0).contains(c))
        .ok_or_else(|| {
            RecordError::invalid("properties.eo:cloud_cover", "not a percentage in 0..=100")
        })?;

    let footprint = match item.get("geometry") {
        None | Some(Value::Null) => None,
        Some(geometry) => Some(parse_polygon(geometry)?),
    };

    let assets = parse_assets(item, id.source)?;

    Ok(Granule {
        id,
        collection,
        acquired,
        updated,
        cloud_cover,
        footprint,
        assets,
    })
}

fn parse_timestamp(s: &str, field: &'static str) -> Result<DateTime<Utc>, RecordError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RecordError::invalid(field, e.to_string()))
}

fn parse_ring(ring: &Value) -> Result<Polygon, RecordError> {
    let coords = ring
        .as_array()
        .ok_or_else(|| RecordError::invalid("geometry", "ring is not an array"))?;
    let points = coords
        .iter()
        .map(|pair| match pair.as_array().map(Vec::as_slice) {
            Some([lon, lat, ..]) => match (lon.as_f64(), lat.as_f64()) {
                (Some(lon), Some(lat)) => Ok(Point::new(lon, lat)),
                _ => Err(RecordError::invalid("geometry", "non-numeric coordinate")),
            },
            _ => Err(RecordError::invalid("geometry", "malformed position")),
        })
        .collect::<Result<Vec<_>, _>>()?;
    let polygon = Polygon::new(points);
    if polygon.vertices().len() < 3 {
        return Err(RecordError::invalid("geometry", "degenerate ring"));
    }
    Ok(polygon)
}

/// Outer ring of a Polygon, or of the first part of a MultiPolygon.
fn parse_polygon(geometry: &Value) -> Result<Polygon, RecordError> {
    let kind = geometry
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| RecordError::invalid("geometry", "missing type"))?;
    let coordinates = geometry
        .get("coordinates")
        .ok_or_else(|| RecordError::invalid("geometry", "missing coordinates"))?;

    let outer = match kind {
        "Polygon" => coordinates.get(0),
        "MultiPolygon" => coordinates.get(0).and_then(|p| p.get(0)),
        other => {
            return Err(RecordError::invalid(
                "geometry",
                format!("unsupported type '{}'", other),
            ))
        }
    };
    outer
        .ok_or_else(|| RecordError::invalid("geometry", "empty coordinates"))
        .and_then(parse_ring)
}

fn parse_checksum(value: &Value) -> Result<String, RecordError> {
    let raw = value
        .as_str()
        .ok_or_else(|| RecordError::invalid("assets.file:checksum", "not a string"))?
        .to_ascii_lowercase();
    let digest = raw.strip_prefix(SHA256_MULTIHASH_PREFIX).unwrap_or(&raw);
    if digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(digest.to_string())
    } else {
        Err(RecordError::invalid(
            "assets.file:checksum",
            format!("not a SHA-256 multihash: '{}'", raw),
        ))
    }
}

/// Band assets keyed by product band id. Non-band assets (browse images,
/// metadata) are ignored.
fn parse_assets(
    item: &Value,
    source: SourceCollection,
) -> Result<BTreeMap<String, AssetRef>, RecordError> {
    let assets = item
        .get("assets")
        .and_then(Value::as_object)
        .ok_or(RecordError::MissingField("assets"))?;

    let mut bands = BTreeMap::new();
    for (key, asset) in assets {
        let Some(band) = asset_band(key, source) else {
            continue;
        };
        let href = asset
            .get("href")
            .and_then(Value::as_str)
            .filter(|h| !h.is_empty())
            .ok_or(RecordError::MissingField("assets.href"))?;

        let mut asset_ref = AssetRef::new(href);
        if let Some(size) = asset.get("file:size") {
            let size = size
                .as_u64()
                .ok_or_else(|| RecordError::invalid("assets.file:size", "not an integer"))?;
            asset_ref = asset_ref.with_size(size);
        }
        if let Some(checksum) = asset.get("file:checksum") {
            asset_ref = asset_ref.with_checksum(parse_checksum(checksum)?);
        }
        bands.insert(band.to_string(), asset_ref);
    }

    if bands.is_empty() {
        return Err(RecordError::MissingField("assets"));
    }
    Ok(bands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item() -> Value {
        json!({
            "type": "Feature",
            "id": "HLS.S30.T10SEG.2021152T184919.v2.0",
            "collection": "HLSS30_2.0",
            "geometry": {
                "type": "Polygon",
                "coordinates": [[[-123.0, 37.0], [-121.8, 37.0], [-121.8, 38.0], [-123.0, 38.0], [-123.0, 37.0]]]
            },
            "properties": {
                "datetime": "2021-06-01T18:49:19.024Z",
                "eo:cloud_cover": 12.0
            },
            "assets": {
                "B04": {"href": "https://data/HLS.S30.T10SEG.2021152T184919.v2.0.B04.tif"},
                "Fmask": {"href": "https://data/HLS.S30.T10SEG.2021152T184919.v2.0.Fmask.tif", "file:size": 1024},
                "browse": {"href": "https://data/browse.jpg"},
                "metadata": {"href": "https://data/meta.xml"}
            }
        })
    }

    fn raw(item: Value) -> RawRecord {
        RawRecord {
            searched_collection: "HLSS30_2.0".into(),
            item,
        }
    }

    #[test]
    fn test_valid_record() {
        let granule = validate_record(&raw(item())).unwrap();
        assert_eq!(granule.id.as_str(), "HLS.S30.T10SEG.2021152T184919.v2.0");
        assert_eq!(granule.cloud_cover, 12.0);
        assert_eq!(granule.assets.len(), 2);
        assert_eq!(granule.assets["Fmask"].size, Some(1024));
        assert_eq!(granule.footprint.as_ref().unwrap().vertices().len(), 4);
        assert_eq!(granule.date().to_string(), "2021-06-01");
    }

    #[test]
    fn test_missing_cloud_cover_rejected() {
        let mut v = item();
        v["properties"].as_object_mut().unwrap().remove("eo:cloud_cover");
        assert_eq!(
            validate_record(&raw(v)),
            Err(RecordError::MissingField("properties.eo:cloud_cover"))
        );
    }

    #[test]
    fn test_out_of_range_cloud_cover_rejected() {
        let mut v = item();
        v["properties"]["eo:cloud_cover"] = json!(140);
        assert!(matches!(
            validate_record(&raw(v)),
            Err(RecordError::InvalidField { field: "properties.eo:cloud_cover", .. })
        ));
    }

    #[test]
    fn test_bad_id_rejected() {
        let mut v = item();
        v["id"] = json!("G1234-LPCLOUD");
        assert!(matches!(
            validate_record(&raw(v)),
            Err(RecordError::InvalidField { field: "id", .. })
        ));
    }

    #[test]
    fn test_collection_mismatch_rejected() {
        let mut v = item();
        v["collection"] = json!("HLSL30_2.0");
        assert!(matches!(
            validate_record(&raw(v)),
            Err(RecordError::InvalidField { field: "collection", .. })
        ));
    }

    #[test]
    fn test_missing_collection_falls_back_to_search() {
        let mut v = item();
        v.as_object_mut().unwrap().remove("collection");
        let granule = validate_record(&raw(v)).unwrap();
        assert_eq!(granule.collection, "HLSS30_2.0");
    }

    #[test]
    fn test_asset_without_href_rejected() {
        let mut v = item();
        v["assets"]["B04"] = json!({"title": "red"});
        assert_eq!(
            validate_record(&raw(v)),
            Err(RecordError::MissingField("assets.href"))
        );
    }

    #[test]
    fn test_no_band_assets_rejected() {
        let mut v = item();
        v["assets"] = json!({"browse": {"href": "https://data/browse.jpg"}});
        assert_eq!(
            validate_record(&raw(v)),
            Err(RecordError::MissingField("assets"))
        );
    }

    #[test]
    fn test_multihash_checksum_stripped() {
        let digest = "ab".repeat(32);
        let mut v = item();
        v["assets"]["B04"]["file:checksum"] = json!(format!("1220{}", digest));
        let granule = validate_record(&raw(v)).unwrap();
        assert_eq!(granule.assets["B04"].checksum.as_deref(), Some(digest.as_str()));
    }

    #[test]
    fn test_bad_checksum_rejected() {
        let mut v = item();
        v["assets"]["B04"]["file:checksum"] = json!("d41d8cd98f00b204e9800998ecf8427e");
        assert!(validate_record(&raw(v)).is_err());
    }

    #[test]
    fn test_updated_timestamp_parsed() {
        let mut v = item();
        v["properties"]["updated"] = json!("2023-01-05T10:00:00Z");
        let granule = validate_record(&raw(v)).unwrap();
        assert!(granule.updated.is_some());
    }

    #[test]
    fn test_unsupported_geometry_rejected() {
        let mut v = item();
        v["geometry"] = json!({"type": "Point", "coordinates": [0.0, 0.0]});
        assert!(validate_record(&raw(v)).is_err());
    }
}
