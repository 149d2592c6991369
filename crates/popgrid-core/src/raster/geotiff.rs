//! Single-band GeoTIFF reader with block-wise windowed reads.
//!
//! Only the strips or tiles intersecting a requested window are decoded, so
//! memory stays proportional to the window, not the file. Georeferencing
//! comes from the GeoTIFF tags GDAL writes:
//!
//! | Tag   | Name                 | Use                                  |
//! |-------|----------------------|--------------------------------------|
//! | 33550 | ModelPixelScale      | pixel size                           |
//! | 33922 | ModelTiepoint        | raster origin                        |
//! | 34264 | ModelTransformation  | origin + size when no tiepoint       |
//! | 34735 | GeoKeyDirectory      | EPSG code, PixelIsPoint              |
//! | 42113 | GDAL_NODATA          | nodata sentinel (ASCII)              |

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use log::debug;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::tags::Tag;
use tiff::ColorType;

use super::{GeoTransform, PixelWindow, RasterGrid, RasterSource, RasterWindow};
use crate::error::RasterError;

const TAG_PIXEL_SCALE: u16 = 33550;
const TAG_TIEPOINT: u16 = 33922;
const TAG_TRANSFORMATION: u16 = 34264;
const TAG_GEO_KEYS: u16 = 34735;
const TAG_GDAL_NODATA: u16 = 42113;

const KEY_RASTER_TYPE: u32 = 1025;
const KEY_GEOGRAPHIC_TYPE: u32 = 2048;
const KEY_PROJECTED_TYPE: u32 = 3072;
const RASTER_PIXEL_IS_POINT: u32 = 2;
const USER_DEFINED: u32 = 32767;

/// A GeoTIFF opened for windowed reads.
pub struct GeoTiffRaster {
    path: PathBuf,
    decoder: Decoder<BufReader<File>>,
    grid: RasterGrid,
    chunk_width: usize,
    chunk_height: usize,
    chunks_across: usize,
}

impl GeoTiffRaster {
    pub fn open(path: &Path) -> Result<Self, RasterError> {
        let file = File::open(path).map_err(|source| RasterError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut decoder = Decoder::new(BufReader::new(file))?;

        match decoder.colortype()? {
            ColorType::Gray(_) => {}
            other => return Err(RasterError::SampleFormat(format!("{other:?}, expected one band"))),
        }

        let (width, height) = decoder.dimensions()?;
        let geo_keys = read_geo_keys(&mut decoder)?;
        let transform = read_transform(&mut decoder, &geo_keys)?;
        let nodata = read_nodata(&mut decoder)?;
        let epsg = epsg_from_keys(&geo_keys);

        let (cw, ch) = decoder.chunk_dimensions();
        let chunk_width = (cw as usize).max(1);
        let chunk_height = (ch as usize).max(1);
        let width = width as usize;

        debug!(
            "opened {}: {width}x{height}, blocks {chunk_width}x{chunk_height}, nodata {nodata:?}, EPSG {epsg:?}",
            path.display()
        );

        Ok(Self {
            path: path.to_path_buf(),
            decoder,
            grid: RasterGrid { width, height: height as usize, transform, nodata, epsg },
            chunk_width,
            chunk_height,
            chunks_across: width.div_ceil(chunk_width),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decode block (`bx`, `by`) and return its pixels with their row stride.
    fn read_block(&mut self, bx: usize, by: usize) -> Result<(Vec<f32>, usize), RasterError> {
        let index = (by * self.chunks_across + bx) as u32;
        let data = to_f32(self.decoder.read_chunk(index)?)?;

        // Edge blocks may come back cropped to the image or padded to full
        // block size depending on layout.
        let cols = self.chunk_width.min(self.grid.width - bx * self.chunk_width);
        let rows = self.chunk_height.min(self.grid.height - by * self.chunk_height);
        let stride = if data.len() == cols * rows {
            cols
        } else if data.len() >= self.chunk_width * rows {
            self.chunk_width
        } else {
            return Err(RasterError::SampleFormat(format!(
                "block {index} holds {} samples, expected {}",
                data.len(),
                cols * rows
            )));
        };
        Ok((data, stride))
    }
}

impl RasterSource for GeoTiffRaster {
    fn grid(&self) -> &RasterGrid {
        &self.grid
    }

    fn read_window(&mut self, window: PixelWindow) -> Result<RasterWindow, RasterError> {
        self.grid.check_window(&window)?;
        let mut data = vec![0.0f32; window.pixel_count()];
        if window.pixel_count() == 0 {
            return Ok(RasterWindow { window, data });
        }

        let (x0, y0) = (window.col_off, window.row_off);
        let (x1, y1) = (x0 + window.width, y0 + window.height);

        for by in y0 / self.chunk_height..=(y1 - 1) / self.chunk_height {
            for bx in x0 / self.chunk_width..=(x1 - 1) / self.chunk_width {
                let (block, stride) = self.read_block(bx, by)?;
                let bx0 = bx * self.chunk_width;
                let by0 = by * self.chunk_height;

                let cols = x0.max(bx0)..x1.min(bx0 + self.chunk_width);
                for row in y0.max(by0)..y1.min(by0 + self.chunk_height) {
                    let src = (row - by0) * stride + (cols.start - bx0);
                    let dst = (row - y0) * window.width + (cols.start - x0);
                    let n = cols.end - cols.start;
                    data[dst..dst + n].copy_from_slice(&block[src..src + n]);
                }
            }
        }
        Ok(RasterWindow { window, data })
    }
}

// ── Tag parsing ───────────────────────────────────────────────────────────────

fn find_f64s(decoder: &mut Decoder<BufReader<File>>, code: u16) -> Result<Option<Vec<f64>>, RasterError> {
    match decoder.find_tag(Tag::from_u16_exhaustive(code))? {
        Some(v) => Ok(Some(v.into_f64_vec()?)),
        None => Ok(None),
    }
}

fn read_geo_keys(decoder: &mut Decoder<BufReader<File>>) -> Result<Vec<(u32, u32)>, RasterError> {
    let Some(raw) = decoder.find_tag(Tag::from_u16_exhaustive(TAG_GEO_KEYS))? else {
        return Ok(Vec::new());
    };
    Ok(parse_geo_keys(&raw.into_u32_vec()?))
}

/// Inline (key, value) pairs from a GeoKeyDirectory. Keys stored in other
/// tags (location ≠ 0) are not needed here and are dropped.
fn parse_geo_keys(dir: &[u32]) -> Vec<(u32, u32)> {
    let Some(&n) = dir.get(3) else {
        return Vec::new();
    };
    dir[4..]
        .chunks_exact(4)
        .take(n as usize)
        .filter(|e| e[1] == 0 && e[2] == 1)
        .map(|e| (e[0], e[3]))
        .collect()
}

fn geo_key(keys: &[(u32, u32)], id: u32) -> Option<u32> {
    keys.iter().find(|(k, _)| *k == id).map(|(_, v)| *v)
}

fn epsg_from_keys(keys: &[(u32, u32)]) -> Option<u32> {
    geo_key(keys, KEY_PROJECTED_TYPE)
        .filter(|&v| v != USER_DEFINED)
        .or_else(|| geo_key(keys, KEY_GEOGRAPHIC_TYPE).filter(|&v| v != USER_DEFINED))
}

fn read_transform(
    decoder: &mut Decoder<BufReader<File>>,
    geo_keys: &[(u32, u32)],
) -> Result<GeoTransform, RasterError> {
    let mut t = match (find_f64s(decoder, TAG_PIXEL_SCALE)?, find_f64s(decoder, TAG_TIEPOINT)?) {
        (Some(scale), Some(tie)) if scale.len() >= 2 && tie.len() >= 6 => {
            let (sx, sy) = (scale[0], scale[1]);
            let (i, j, x, y) = (tie[0], tie[1], tie[3], tie[4]);
            GeoTransform::new(x - i * sx, sx, y + j * sy, -sy)
        }
        _ => {
            let Some(m) = find_f64s(decoder, TAG_TRANSFORMATION)? else {
                return Err(RasterError::MissingGeoreference("no pixel scale/tiepoint or transformation"));
            };
            if m.len() < 16 {
                return Err(RasterError::MissingGeoreference("short ModelTransformation"));
            }
            if m[1] != 0.0 || m[4] != 0.0 {
                return Err(RasterError::Rotated);
            }
            GeoTransform::new(m[3], m[0], m[7], m[5])
        }
    };
    if geo_key(geo_keys, KEY_RASTER_TYPE) == Some(RASTER_PIXEL_IS_POINT) {
        // Tiepoint refers to the first pixel's centre.
        t.origin_x -= t.pixel_width / 2.0;
        t.origin_y -= t.pixel_height / 2.0;
    }
    Ok(t)
}

fn read_nodata(decoder: &mut Decoder<BufReader<File>>) -> Result<Option<f64>, RasterError> {
    let Some(v) = decoder.find_tag(Tag::from_u16_exhaustive(TAG_GDAL_NODATA))? else {
        return Ok(None);
    };
    let text = v.into_string()?;
    Ok(parse_nodata(&text))
}

fn parse_nodata(text: &str) -> Option<f64> {
    text.trim_matches(|c: char| c == '\0' || c.is_whitespace()).parse::<f64>().ok()
}

fn to_f32(result: DecodingResult) -> Result<Vec<f32>, RasterError> {
    Ok(match result {
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
        #[allow(unreachable_patterns)]
        _ => return Err(RasterError::SampleFormat("unrecognised sample type".into())),
    })
}

/// Write a north-up Float32 GeoTIFF for tests.
#[cfg(test)]
pub(crate) fn write_test_geotiff(
    path: &Path,
    width: u32,
    height: u32,
    data: &[f32],
    origin: (f64, f64),
    pixel_size: f64,
    nodata: Option<&str>,
    epsg: u16,
) {
    use tiff::encoder::{colortype, TiffEncoder};

    let file = File::create(path).unwrap();
    let mut encoder = TiffEncoder::new(file).unwrap();
    let mut image = encoder.new_image::<colortype::Gray32Float>(width, height).unwrap();
    image.rows_per_strip(2).unwrap();
    let dir = image.encoder();
    dir.write_tag(Tag::from_u16_exhaustive(TAG_PIXEL_SCALE), &[pixel_size, pixel_size, 0.0][..])
        .unwrap();
    dir.write_tag(Tag::from_u16_exhaustive(TAG_TIEPOINT), &[0.0, 0.0, 0.0, origin.0, origin.1, 0.0][..])
        .unwrap();
    let keys: [u16; 12] = [1, 1, 0, 2, 1024, 0, 1, 2, KEY_GEOGRAPHIC_TYPE as u16, 0, 1, epsg];
    dir.write_tag(Tag::from_u16_exhaustive(TAG_GEO_KEYS), &keys[..]).unwrap();
    if let Some(nd) = nodata {
        dir.write_tag(Tag::from_u16_exhaustive(TAG_GDAL_NODATA), nd).unwrap();
    }
    image.write_data(data).unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(width: u32, height: u32) -> Vec<f32> {
        (0..width * height).map(|i| i as f32).collect()
    }

    #[test]
    fn opens_grid_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zzz.tif");
        write_test_geotiff(&path, 7, 5, &sample(7, 5), (10.0, 50.0), 0.5, Some("-99999"), 4326);

        let raster = GeoTiffRaster::open(&path).unwrap();
        let grid = raster.grid();
        assert_eq!((grid.width, grid.height), (7, 5));
        assert_eq!(grid.transform, GeoTransform::new(10.0, 0.5, 50.0, -0.5));
        assert_eq!(grid.nodata, Some(-99999.0));
        assert_eq!(grid.epsg, Some(4326));
        assert_eq!(raster.path(), path.as_path());
    }

    #[test]
    fn window_spanning_several_strips_matches_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zzz.tif");
        let data = sample(9, 7);
        write_test_geotiff(&path, 9, 7, &data, (0.0, 7.0), 1.0, None, 4326);

        let mut raster = GeoTiffRaster::open(&path).unwrap();
        let w = raster
            .read_window(PixelWindow { col_off: 2, row_off: 1, width: 4, height: 5 })
            .unwrap();
        for r in 0..5 {
            for c in 0..4 {
                assert_eq!(w.get(r, c), data[(r + 1) * 9 + c + 2]);
            }
        }
    }

    #[test]
    fn missing_file_is_open_error() {
        let err = GeoTiffRaster::open(Path::new("/nonexistent/zzz.tif")).err().unwrap();
        assert!(matches!(err, RasterError::Open { .. }));
    }

    #[test]
    fn geo_key_parsing() {
        let dir = [1, 1, 0, 3, 1024, 0, 1, 2, 1025, 0, 1, 2, 3072, 0, 1, 32633];
        let keys = parse_geo_keys(&dir);
        assert_eq!(keys.len(), 3);
        assert_eq!(epsg_from_keys(&keys), Some(32633));
        assert_eq!(geo_key(&keys, KEY_RASTER_TYPE), Some(RASTER_PIXEL_IS_POINT));
        assert_eq!(epsg_from_keys(&parse_geo_keys(&[1, 1, 0, 1, 3072, 0, 1, 32767])), None);
    }

    #[test]
    fn nodata_text_variants() {
        assert_eq!(parse_nodata("-99999\0"), Some(-99999.0));
        assert!(parse_nodata("nan").unwrap().is_nan());
        assert_eq!(parse_nodata(""), None);
    }
}
