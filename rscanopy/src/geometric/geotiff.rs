//! Single-band Float32 GeoTIFF reading and writing.
//!
//! Georeferencing uses ModelPixelScale (33550) and ModelTiepoint (33922);
//! undefined cells are written as NaN and declared through GDAL_NODATA
//! (42113) so GDAL-based tools pick them up.

use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufReader, Cursor};
use std::path::Path;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use crate::geo_core::GridSpec;
use crate::geometric::raster::Raster;

const MODEL_PIXEL_SCALE: Tag = Tag::ModelPixelScaleTag;
const MODEL_TIEPOINT: Tag = Tag::ModelTiepointTag;
const GEO_KEY_DIRECTORY: Tag = Tag::GeoKeyDirectoryTag;
const GDAL_NODATA: Tag = Tag::GdalNodata;

/// GeoKey directory: raster type PixelIsArea, plus the projected CRS when known
fn geo_keys(epsg: Option<u16>) -> Vec<u16> {
    match epsg {
        Some(code) => vec![
            1, 1, 0, 3, //
            1024, 0, 1, 1, // GTModelType = projected
            1025, 0, 1, 1, // GTRasterType = PixelIsArea
            3072, 0, 1, code, // ProjectedCSType
        ],
        None => vec![
            1, 1, 0, 1, //
            1025, 0, 1, 1,
        ],
    }
}

/// Write `raster` as a Float32 GeoTIFF
pub fn write_geotiff(raster: &Raster, path: &Path, epsg: Option<u16>) -> Result<()> {
    let grid = raster.grid();
    let width = u32::try_from(grid.cols).context("Raster too wide for TIFF")?;
    let height = u32::try_from(grid.rows).context("Raster too tall for TIFF")?;

    let scale = [grid.resolution, grid.resolution, 0.0];
    let tiepoint = [0.0, 0.0, 0.0, grid.origin_x, grid.origin_y, 0.0];
    let keys = geo_keys(epsg);
    let data: Vec<f32> = raster.data().iter().map(|&v| v as f32).collect();

    let mut buffer = Cursor::new(Vec::new());
    {
        let mut encoder = TiffEncoder::new(&mut buffer).context("Failed to start TIFF encoder")?;
        let mut image = encoder
            .new_image::<colortype::Gray32Float>(width, height)
            .context("Failed to create TIFF image")?;

        image
            .encoder()
            .write_tag(MODEL_PIXEL_SCALE, &scale[..])
            .context("Failed to write ModelPixelScale")?;
        image
            .encoder()
            .write_tag(MODEL_TIEPOINT, &tiepoint[..])
            .context("Failed to write ModelTiepoint")?;
        image
            .encoder()
            .write_tag(GEO_KEY_DIRECTORY, &keys[..])
            .context("Failed to write GeoKeyDirectory")?;
        image
            .encoder()
            .write_tag(GDAL_NODATA, "nan")
            .context("Failed to write GDAL_NODATA")?;

        image
            .write_data(&data)
            .with_context(|| format!("Failed to encode pixels for {:?}", path))?;
    }

    std::fs::write(path, buffer.into_inner())
        .with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}

/// Read a single-band GeoTIFF. Cells equal to the GDAL_NODATA value become
/// undefined.
pub fn read_geotiff(path: &Path) -> Result<Raster> {
    let file = File::open(path).with_context(|| format!("Failed to open {:?}", path))?;
    let mut decoder = Decoder::new(BufReader::new(file))
        .with_context(|| format!("Failed to decode TIFF {:?}", path))?;

    let (width, height) = decoder.dimensions()?;
    let scale = decoder
        .get_tag_f64_vec(MODEL_PIXEL_SCALE)
        .with_context(|| format!("Missing ModelPixelScale in {:?}", path))?;
    let tiepoint = decoder
        .get_tag_f64_vec(MODEL_TIEPOINT)
        .with_context(|| format!("Missing ModelTiepoint in {:?}", path))?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        bail!("Malformed georeferencing tags in {:?}", path);
    }
    if (scale[0] - scale[1]).abs() > f64::EPSILON * scale[0].abs().max(1.0) {
        bail!(
            "Non-square pixels ({} x {}) are not supported in {:?}",
            scale[0],
            scale[1],
            path
        );
    }

    // Tiepoint maps raster (i, j) to model (x, y)
    let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
    let origin_y = tiepoint[4] + tiepoint[1] * scale[1];
    let grid = GridSpec::new(
        origin_x,
        origin_y,
        scale[0],
        width as usize,
        height as usize,
    );

    let nodata = match decoder.get_tag_ascii_string(GDAL_NODATA).ok() {
        Some(text) => text.trim_end_matches('\0').trim().parse::<f64>().ok(),
        None => {
            tracing::debug!(path = %path.display(), "no GDAL_NODATA tag, only NaN cells are undefined");
            None
        }
    };

    let values: Vec<f64> = match decoder.read_image()? {
        DecodingResult::F32(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::F64(data) => data,
        DecodingResult::I16(data) => data.into_iter().map(f64::from).collect(),
        DecodingResult::U16(data) => data.into_iter().map(f64::from).collect(),
        _ => bail!("Unsupported sample type in {:?}", path),
    };

    let values = match nodata {
        Some(nd) if !nd.is_nan() => values
            .into_iter()
            .map(|v| if v == nd { f64::NAN } else { v })
            .collect(),
        _ => values,
    };

    Raster::from_vec(grid, values)
        .with_context(|| format!("{:?} is not a single-band raster", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_keeps_georeferencing_and_holes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dsm.tif");
        let grid = GridSpec::new(1000.0, 2010.0, 0.5, 4, 3);
        let mut raster = Raster::filled(grid, 112.25);
        raster.set(2, 3, f64::NAN);

        write_geotiff(&raster, &path, Some(2154)).unwrap();
        let back = read_geotiff(&path).unwrap();

        assert_eq!(*back.grid(), grid);
        assert_eq!(back.get(0, 0), 112.25);
        assert!(back.get(2, 3).is_nan());
        assert_eq!(back.valid_count(), 11);
    }

    #[test]
    fn test_georeferencing_tags_use_registered_codes() {
        assert_eq!(MODEL_PIXEL_SCALE.to_u16(), 33550);
        assert_eq!(MODEL_TIEPOINT.to_u16(), 33922);
        assert_eq!(GEO_KEY_DIRECTORY.to_u16(), 34735);
        assert_eq!(GDAL_NODATA.to_u16(), 42113);
    }

    #[test]
    fn test_read_honours_numeric_nodata() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("geoid.tif");
        {
            let mut encoder = TiffEncoder::new(File::create(&path).unwrap()).unwrap();
            let mut image = encoder
                .new_image::<colortype::Gray32Float>(2, 2)
                .unwrap();
            image
                .encoder()
                .write_tag(MODEL_PIXEL_SCALE, &[10.0, 10.0, 0.0][..])
                .unwrap();
            image
                .encoder()
                .write_tag(MODEL_TIEPOINT, &[0.0, 0.0, 0.0, 500.0, 720.0, 0.0][..])
                .unwrap();
            image.encoder().write_tag(GDAL_NODATA, "-9999").unwrap();
            image.write_data(&[44.5f32, -9999.0, 45.0, 45.5]).unwrap();
        }

        let back = read_geotiff(&path).unwrap();
        assert_eq!(*back.grid(), GridSpec::new(500.0, 720.0, 10.0, 2, 2));
        assert_eq!(back.get(0, 0), 44.5);
        assert!(back.get(0, 1).is_nan());
        assert_eq!(back.valid_count(), 3);
    }

    #[test]
    fn test_read_without_nodata_keeps_every_value() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("plain_geo.tif");
        {
            let mut encoder = TiffEncoder::new(File::create(&path).unwrap()).unwrap();
            let mut image = encoder
                .new_image::<colortype::Gray32Float>(2, 1)
                .unwrap();
            image
                .encoder()
                .write_tag(MODEL_PIXEL_SCALE, &[1.0, 1.0, 0.0][..])
                .unwrap();
            image
                .encoder()
                .write_tag(MODEL_TIEPOINT, &[0.0, 0.0, 0.0, 0.0, 1.0, 0.0][..])
                .unwrap();
            image.write_data(&[-9999.0f32, 3.0]).unwrap();
        }

        let back = read_geotiff(&path).unwrap();
        assert_eq!(back.get(0, 0), -9999.0);
        assert_eq!(back.valid_count(), 2);
    }

    #[test]
    fn test_read_rejects_plain_tiff() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("plain.tif");
        {
            let file = File::create(&path).unwrap();
            let mut encoder = TiffEncoder::new(std::io::BufWriter::new(file)).unwrap();
            encoder
                .write_image::<colortype::Gray32Float>(2, 2, &[1.0, 2.0, 3.0, 4.0])
                .unwrap();
        }
        assert!(read_geotiff(&path).is_err());
    }
}
