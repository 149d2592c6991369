//! On-the-fly reprojection of a raster into EPSG:4326.
//!
//! [`ReprojectedRaster`] wraps a source in another CRS and presents a virtual
//! geographic grid with the same pixel count, sampling the source by nearest
//! neighbour. Each virtual window maps to one source window read, so the
//! memory bound of the wrapped source carries over.

use log::debug;
use proj4rs::proj::Proj;
use proj4rs::transform::transform;

use super::{GeoTransform, PixelWindow, RasterGrid, RasterSource, RasterWindow, GEOGRAPHIC_EPSG};
use crate::error::RasterError;

/// Points sampled along each raster edge when bounding the reprojected extent.
const EDGE_SAMPLES: usize = 32;

/// proj4 definition for the EPSG codes population rasters ship in.
pub fn proj_string(epsg: u32) -> Option<String> {
    let s = match epsg {
        4326 => "+proj=longlat +datum=WGS84 +no_defs".to_string(),
        3857 => "+proj=merc +a=6378137 +b=6378137 +lat_ts=0 +lon_0=0 +x_0=0 +y_0=0 +k=1 +units=m +no_defs"
            .to_string(),
        54009 => "+proj=moll +lon_0=0 +x_0=0 +y_0=0 +datum=WGS84 +units=m +no_defs".to_string(),
        3035 => "+proj=laea +lat_0=52 +lon_0=10 +x_0=4321000 +y_0=3210000 +ellps=GRS80 +units=m +no_defs"
            .to_string(),
        32601..=32660 => format!("+proj=utm +zone={} +datum=WGS84 +units=m +no_defs", epsg - 32600),
        32701..=32760 => format!("+proj=utm +zone={} +south +datum=WGS84 +units=m +no_defs", epsg - 32700),
        _ => return None,
    };
    Some(s)
}

fn is_geographic(epsg: u32) -> bool {
    epsg == GEOGRAPHIC_EPSG
}

/// Point transform between two EPSG codes, in degrees for geographic CRSs.
pub struct CrsTransform {
    from: Proj,
    to: Proj,
    from_geographic: bool,
    to_geographic: bool,
}

impl CrsTransform {
    pub fn new(from: u32, to: u32) -> Result<Self, RasterError> {
        let build = |epsg: u32| -> Result<Proj, RasterError> {
            let def = proj_string(epsg).ok_or(RasterError::UnsupportedCrs(epsg))?;
            Proj::from_proj_string(&def).map_err(|e| RasterError::Reproject(format!("EPSG:{epsg}: {e:?}")))
        };
        Ok(Self {
            from: build(from)?,
            to: build(to)?,
            from_geographic: is_geographic(from),
            to_geographic: is_geographic(to),
        })
    }

    pub fn apply(&self, x: f64, y: f64) -> Result<(f64, f64), RasterError> {
        let mut p = if self.from_geographic {
            (x.to_radians(), y.to_radians(), 0.0)
        } else {
            (x, y, 0.0)
        };
        transform(&self.from, &self.to, &mut p).map_err(|e| RasterError::Reproject(format!("{e:?}")))?;
        if self.to_geographic {
            Ok((p.0.to_degrees(), p.1.to_degrees()))
        } else {
            Ok((p.0, p.1))
        }
    }
}

/// A raster in a projected CRS viewed as an EPSG:4326 grid.
pub struct ReprojectedRaster<R> {
    inner: R,
    grid: RasterGrid,
    to_source: CrsTransform,
}

impl<R: RasterSource> ReprojectedRaster<R> {
    pub fn new(inner: R) -> Result<Self, RasterError> {
        let src = inner.grid().clone();
        let epsg = src.epsg.ok_or(RasterError::MissingGeoreference("no EPSG code to reproject from"))?;
        let to_geo = CrsTransform::new(epsg, GEOGRAPHIC_EPSG)?;
        let to_source = CrsTransform::new(GEOGRAPHIC_EPSG, epsg)?;

        // Bound the reprojected extent by walking the source edges.
        let (w, h) = (src.width as f64, src.height as f64);
        let (mut min_x, mut min_y) = (f64::INFINITY, f64::INFINITY);
        let (mut max_x, mut max_y) = (f64::NEG_INFINITY, f64::NEG_INFINITY);
        for i in 0..=EDGE_SAMPLES {
            let f = i as f64 / EDGE_SAMPLES as f64;
            for (col, row) in [(f * w, 0.0), (f * w, h), (0.0, f * h), (w, f * h)] {
                let x = src.transform.origin_x + col * src.transform.pixel_width;
                let y = src.transform.origin_y + row * src.transform.pixel_height;
                let (lon, lat) = to_geo.apply(x, y)?;
                min_x = min_x.min(lon);
                max_x = max_x.max(lon);
                min_y = min_y.min(lat);
                max_y = max_y.max(lat);
            }
        }
        if !(min_x < max_x && min_y < max_y) || src.width == 0 || src.height == 0 {
            return Err(RasterError::Reproject(format!("degenerate extent from EPSG:{epsg}")));
        }

        let grid = RasterGrid {
            width: src.width,
            height: src.height,
            transform: GeoTransform::new(min_x, (max_x - min_x) / w, max_y, -(max_y - min_y) / h),
            nodata: src.nodata,
            epsg: Some(GEOGRAPHIC_EPSG),
        };
        debug!(
            "reprojecting EPSG:{epsg} raster to [{min_x:.4}, {min_y:.4}, {max_x:.4}, {max_y:.4}]"
        );
        Ok(Self { inner, grid, to_source })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: RasterSource> RasterSource for ReprojectedRaster<R> {
    fn grid(&self) -> &RasterGrid {
        &self.grid
    }

    fn read_window(&mut self, window: PixelWindow) -> Result<RasterWindow, RasterError> {
        self.grid.check_window(&window)?;
        let src = self.inner.grid().clone();
        let rows = window.row_off..window.row_off + window.height;
        let cols = window.col_off..window.col_off + window.width;

        // First pass: bound the source pixels the window touches.
        let (mut c0, mut r0, mut c1, mut r1) = (usize::MAX, usize::MAX, 0usize, 0usize);
        for r in rows.clone() {
            for c in cols.clone() {
                if let Some((sc, sr)) = self.source_pixel(&src, c, r) {
                    c0 = c0.min(sc);
                    r0 = r0.min(sr);
                    c1 = c1.max(sc + 1);
                    r1 = r1.max(sr + 1);
                }
            }
        }

        let mut data = vec![f32::NAN; window.pixel_count()];
        if c1 <= c0 || r1 <= r0 {
            return Ok(RasterWindow { window, data });
        }
        let src_window = PixelWindow { col_off: c0, row_off: r0, width: c1 - c0, height: r1 - r0 };
        let pixels = self.inner.read_window(src_window)?;

        // Second pass: sample straight into the output.
        let mut out = data.iter_mut();
        for r in rows {
            for c in cols.clone() {
                let Some(slot) = out.next() else {
                    break;
                };
                if let Some((sc, sr)) = self.source_pixel(&src, c, r) {
                    *slot = pixels.get(sr - r0, sc - c0);
                }
            }
        }
        Ok(RasterWindow { window, data })
    }
}

impl<R: RasterSource> ReprojectedRaster<R> {
    /// Source pixel under the centre of virtual pixel (`col`, `row`).
    fn source_pixel(&self, src: &RasterGrid, col: usize, row: usize) -> Option<(usize, usize)> {
        let (lon, lat) = self.grid.transform.pixel_center(col as f64, row as f64);
        let (x, y) = self.to_source.apply(lon, lat).ok()?;
        let (sc, sr) = src.transform.to_pixel(x, y);
        let (sc, sr) = (sc.floor(), sr.floor());
        (sc >= 0.0 && sr >= 0.0 && (sc as usize) < src.width && (sr as usize) < src.height)
            .then_some((sc as usize, sr as usize))
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::raster::MemoryRaster;

    #[test]
    fn utm_point_round_trip() {
        let fwd = CrsTransform::new(4326, 32633).unwrap();
        let (x, y) = fwd.apply(15.0, 52.0).unwrap();
        assert_abs_diff_eq!(x, 500_000.0, epsilon = 1.0);
        assert_abs_diff_eq!(y, 5_761_038.0, epsilon = 5.0);

        let inv = CrsTransform::new(32633, 4326).unwrap();
        let (lon, lat) = inv.apply(x, y).unwrap();
        assert_abs_diff_eq!(lon, 15.0, epsilon = 1e-7);
        assert_abs_diff_eq!(lat, 52.0, epsilon = 1e-7);
    }

    #[test]
    fn unknown_epsg_is_unsupported() {
        assert!(matches!(CrsTransform::new(4326, 2193), Err(RasterError::UnsupportedCrs(2193))));
    }

    #[test]
    fn reprojected_grid_covers_source_and_samples_nearest() {
        // 100 × 100 km of 1 km pixels around the UTM 33N central meridian.
        let mut src = MemoryRaster::filled(100, 100, 450_000.0, 5_800_000.0, 1000.0, 0.0);
        src.grid.epsg = Some(32633);
        for r in 0..100 {
            for c in 0..100 {
                src.set(r, c, (r * 100 + c) as f32);
            }
        }
        let mut warped = ReprojectedRaster::new(src.clone()).unwrap();
        let grid = warped.grid().clone();
        assert_eq!(grid.epsg, Some(GEOGRAPHIC_EPSG));
        assert!(grid.transform.origin_x < 15.0 && grid.transform.origin_x > 14.0);

        // The virtual pixel at the centre of the grid maps back to a source
        // pixel near the centre.
        let w = warped
            .read_window(PixelWindow { col_off: 50, row_off: 50, width: 1, height: 1 })
            .unwrap();
        let v = w.data[0];
        let (row, col) = ((v as usize) / 100, (v as usize) % 100);
        assert!((45..55).contains(&row) && (45..55).contains(&col), "sampled ({row}, {col})");

        // Corners of the geographic bbox fall outside the rotated UTM square.
        let corner = warped
            .read_window(PixelWindow { col_off: 0, row_off: 0, width: 1, height: 1 })
            .unwrap();
        assert!(corner.data[0].is_nan() || corner.data[0] >= 0.0);
        assert!(!grid.is_valid(f32::NAN));
    }

    #[test]
    fn block_read_matches_single_pixel_reads() {
        let mut src = MemoryRaster::filled(60, 60, 470_000.0, 5_780_000.0, 1000.0, 0.0);
        src.grid.epsg = Some(32633);
        for r in 0..60 {
            for c in 0..60 {
                src.set(r, c, (r * 60 + c) as f32);
            }
        }
        let mut warped = ReprojectedRaster::new(src).unwrap();
        let block = warped
            .read_window(PixelWindow { col_off: 10, row_off: 20, width: 7, height: 5 })
            .unwrap();
        assert_eq!(block.data.len(), 35);
        for r in 0..5 {
            for c in 0..7 {
                let one = warped
                    .read_window(PixelWindow { col_off: 10 + c, row_off: 20 + r, width: 1, height: 1 })
                    .unwrap();
                let (a, b) = (block.get(r, c), one.data[0]);
                assert!(a == b || (a.is_nan() && b.is_nan()), "({r}, {c}): {a} vs {b}");
            }
        }
    }
}
