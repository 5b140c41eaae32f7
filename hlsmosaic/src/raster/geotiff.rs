//! Minimal GeoTIFF reader and writer.
//!
//! Reads the georeference from ModelTiepoint (33922), ModelPixelScale
//! (33550), the GeoKey directory (34735, projected CRS key 3072) and the
//! GDAL_NODATA tag (42113). Writes single-band f32 images carrying the same
//! tags.

use std::io::{Cursor, Read, Seek};
use std::path::Path;

use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use super::{GeoRaster, RasterError, Result};

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GDAL_NODATA: u16 = 42113;

const KEY_MODEL_TYPE: u16 = 1024;
const KEY_RASTER_TYPE: u16 = 1025;
const KEY_PROJECTED_CRS: u16 = 3072;
const MODEL_TYPE_PROJECTED: u16 = 1;
const RASTER_PIXEL_IS_AREA: u16 = 1;

/// Decodes a GeoTIFF from memory.
pub fn decode(bytes: &[u8]) -> Result<GeoRaster> {
    let mut decoder = Decoder::new(Cursor::new(bytes))?;

    // A full 3660x3660 tile of f64 is ~107 MB.
    let mut limits = Limits::default();
    limits.decoding_buffer_size = 1024 * 1024 * 1024;
    limits.intermediate_buffer_size = 1024 * 1024 * 1024;
    decoder = decoder.with_limits(limits);

    let (width, height) = decoder.dimensions()?;
    let (origin, pixel_size) = read_transform(&mut decoder)?;
    let epsg = read_epsg(&mut decoder)?;
    let nodata = read_nodata(&mut decoder);
    let data = decode_values(&mut decoder)?;

    GeoRaster::new(
        width as usize,
        height as usize,
        origin,
        pixel_size,
        epsg,
        nodata,
        data,
    )
}

/// Reads and decodes a GeoTIFF file.
pub fn read(path: &Path) -> Result<GeoRaster> {
    let bytes = std::fs::read(path)?;
    decode(&bytes)
}

/// Encodes a raster as a single-band f32 GeoTIFF.
///
/// Output is deterministic: equal rasters encode to equal bytes.
pub fn encode(raster: &GeoRaster) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    {
        let mut encoder = TiffEncoder::new(&mut buffer)?;
        let mut image =
            encoder.new_image::<colortype::Gray32Float>(raster.width as u32, raster.height as u32)?;

        let scale = [raster.pixel_width, raster.pixel_height, 0.0];
        let tiepoint = [0.0, 0.0, 0.0, raster.origin_x, raster.origin_y, 0.0];
        let geokeys = [
            1,
            1,
            0,
            3,
            KEY_MODEL_TYPE,
            0,
            1,
            MODEL_TYPE_PROJECTED,
            KEY_RASTER_TYPE,
            0,
            1,
            RASTER_PIXEL_IS_AREA,
            KEY_PROJECTED_CRS,
            0,
            1,
            raster.epsg,
        ];

        let dir = image.encoder();
        dir.write_tag(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE), &scale[..])?;
        dir.write_tag(Tag::from_u16_exhaustive(MODEL_TIEPOINT), &tiepoint[..])?;
        dir.write_tag(Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY), &geokeys[..])?;
        if let Some(nodata) = raster.nodata {
            dir.write_tag(Tag::from_u16_exhaustive(GDAL_NODATA), nodata.to_string().as_str())?;
        }

        image.write_data(&raster.data)?;
    }
    Ok(buffer.into_inner())
}

fn read_transform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<((f64, f64), (f64, f64))> {
    let tiepoint = decoder
        .get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_TIEPOINT))
        .map_err(|_| RasterError::MissingGeoreference("ModelTiepoint"))?;
    let scale = decoder
        .get_tag_f64_vec(Tag::from_u16_exhaustive(MODEL_PIXEL_SCALE))
        .map_err(|_| RasterError::MissingGeoreference("ModelPixelScale"))?;

    if tiepoint.len() < 6 || scale.len() < 2 {
        return Err(RasterError::MissingGeoreference("short tiepoint or pixel scale"));
    }

    // Tiepoint [i, j, k, x, y, z] maps raster (i, j) to model (x, y).
    let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
    let origin_y = tiepoint[4] + tiepoint[1] * scale[1];
    Ok(((origin_x, origin_y), (scale[0], scale[1])))
}

fn read_epsg<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<u16> {
    let keys = decoder
        .get_tag_u16_vec(Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY))
        .map_err(|_| RasterError::MissingGeoreference("GeoKeyDirectory"))?;

    // Header is [version, revision, minor, count], then 4 shorts per key.
    keys.get(4..)
        .unwrap_or_default()
        .chunks_exact(4)
        .find(|entry| entry[0] == KEY_PROJECTED_CRS && entry[1] == 0)
        .map(|entry| entry[3])
        .ok_or(RasterError::MissingGeoreference("ProjectedCRS geokey"))
}

fn read_nodata<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<f64> {
    decoder
        .get_tag_ascii_string(Tag::from_u16_exhaustive(GDAL_NODATA))
        .ok()
        .and_then(|s| s.trim_matches(|c: char| c == '\0' || c.is_whitespace()).parse().ok())
}

fn decode_values<R: Read + Seek>(decoder: &mut Decoder<R>) -> Result<Vec<f32>> {
    let values = match decoder.read_image()? {
        DecodingResult::F32(data) => data,
        DecodingResult::F64(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I8(data) => data.into_iter().map(f32::from).collect(),
        DecodingResult::I16(data) => data.into_iter().map(f32::from).collect(),
        DecodingResult::I32(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I64(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U8(data) => data.into_iter().map(f32::from).collect(),
        DecodingResult::U16(data) => data.into_iter().map(f32::from).collect(),
        DecodingResult::U32(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U64(data) => data.into_iter().map(|v| v as f32).collect(),
    };
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_raster() -> GeoRaster {
        GeoRaster::new(
            4,
            3,
            (399_960.0, 4_200_000.0),
            (30.0, 30.0),
            32610,
            Some(-9999.0),
            (0..12).map(|v| v as f32 * 10.0).collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_encode_decode_preserves_georeference() {
        let raster = sample_raster();
        let decoded = decode(&encode(&raster).unwrap()).unwrap();
        assert_eq!(decoded, raster);
    }

    #[test]
    fn test_encode_is_deterministic() {
        let raster = sample_raster();
        assert_eq!(encode(&raster).unwrap(), encode(&raster).unwrap());
    }

    #[test]
    fn test_decode_plain_tiff_is_missing_georeference() {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut encoder = TiffEncoder::new(&mut buffer).unwrap();
            encoder
                .write_image::<colortype::Gray8>(2, 2, &[1, 2, 3, 4])
                .unwrap();
        }
        let err = decode(&buffer.into_inner()).unwrap_err();
        assert!(matches!(err, RasterError::MissingGeoreference(_)));
    }

    #[test]
    fn test_decode_garbage_is_error() {
        assert!(decode(b"definitely not a tiff").is_err());
    }

    #[test]
    fn test_read_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("band.tif");
        std::fs::write(&path, encode(&sample_raster()).unwrap()).unwrap();
        assert_eq!(read(&path).unwrap().width, 4);
    }
}
