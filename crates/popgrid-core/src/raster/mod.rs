//! Raster grids and windowed reads.
//!
//! Pixel values are f32 (the population grids are Float32); coordinates and
//! sums use f64.

pub mod geotiff;
pub mod locate;
pub mod warp;

use crate::error::RasterError;
use crate::geometry::Bounds;

/// EPSG code of the geographic CRS every stored geometry uses.
pub const GEOGRAPHIC_EPSG: u32 = 4326;

// ── Affine transform ──────────────────────────────────────────────────────────

/// North-up affine transform: pixel (col, row) → geographic (x, y) of the
/// pixel's top-left corner. `pixel_height` is negative for north-up rasters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub origin_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn new(origin_x: f64, pixel_width: f64, origin_y: f64, pixel_height: f64) -> Self {
        Self { origin_x, pixel_width, origin_y, pixel_height }
    }

    /// Geographic centre of pixel (col, row).
    #[inline]
    pub fn pixel_center(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.origin_x + (col + 0.5) * self.pixel_width,
            self.origin_y + (row + 0.5) * self.pixel_height,
        )
    }

    /// Fractional (col, row) of a geographic point.
    #[inline]
    pub fn to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        ((x - self.origin_x) / self.pixel_width, (y - self.origin_y) / self.pixel_height)
    }

    /// Pixel-aligned column/row span `[start, end)` covering `bounds`, not
    /// clamped to any raster extent.
    pub fn pixel_span(&self, bounds: &Bounds) -> (i64, i64, i64, i64) {
        let (c0, r0) = self.to_pixel(bounds.min_x, bounds.max_y);
        let (c1, r1) = self.to_pixel(bounds.max_x, bounds.min_y);
        let (c0, c1) = (c0.min(c1), c0.max(c1));
        let (r0, r1) = (r0.min(r1), r0.max(r1));
        (c0.floor() as i64, r0.floor() as i64, c1.ceil() as i64, r1.ceil() as i64)
    }

    /// Geographic bounds of a pixel span.
    pub fn span_bounds(&self, col0: i64, row0: i64, col1: i64, row1: i64) -> Bounds {
        let xa = self.origin_x + col0 as f64 * self.pixel_width;
        let xb = self.origin_x + col1 as f64 * self.pixel_width;
        let ya = self.origin_y + row0 as f64 * self.pixel_height;
        let yb = self.origin_y + row1 as f64 * self.pixel_height;
        Bounds::new(xa.min(xb), ya.min(yb), xa.max(xb), ya.max(yb))
    }
}

// ── Grid metadata ─────────────────────────────────────────────────────────────

/// Everything about a raster except its pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterGrid {
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    pub nodata: Option<f64>,
    /// EPSG code of the raster's CRS, when the file declares one.
    pub epsg: Option<u32>,
}

impl RasterGrid {
    /// A cell counts towards a sum unless it is NaN or equals the nodata
    /// sentinel.
    #[inline]
    pub fn is_valid(&self, v: f32) -> bool {
        if v.is_nan() {
            return false;
        }
        match self.nodata {
            Some(nd) if !nd.is_nan() => f64::from(v) != nd,
            _ => true,
        }
    }

    /// The in-raster pixel window covering `bounds`, or `None` when the two
    /// do not overlap.
    pub fn window_for(&self, bounds: &Bounds) -> Option<PixelWindow> {
        let (c0, r0, c1, r1) = self.transform.pixel_span(bounds);
        self.clamp_span(c0, r0, c1, r1)
    }

    /// Clamp a pixel span to the raster extent.
    pub fn clamp_span(&self, c0: i64, r0: i64, c1: i64, r1: i64) -> Option<PixelWindow> {
        let c0 = c0.clamp(0, self.width as i64);
        let c1 = c1.clamp(0, self.width as i64);
        let r0 = r0.clamp(0, self.height as i64);
        let r1 = r1.clamp(0, self.height as i64);
        if c1 <= c0 || r1 <= r0 {
            return None;
        }
        Some(PixelWindow {
            col_off: c0 as usize,
            row_off: r0 as usize,
            width: (c1 - c0) as usize,
            height: (r1 - r0) as usize,
        })
    }

    pub fn check_window(&self, window: &PixelWindow) -> Result<(), RasterError> {
        if window.col_off + window.width > self.width || window.row_off + window.height > self.height {
            return Err(RasterError::WindowOutOfBounds {
                col_off: window.col_off,
                row_off: window.row_off,
                width: window.width,
                height: window.height,
                raster_width: self.width,
                raster_height: self.height,
            });
        }
        Ok(())
    }
}

/// A rectangle of pixels inside a raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWindow {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

impl PixelWindow {
    pub fn pixel_count(&self) -> usize {
        self.width * self.height
    }
}

/// Pixels of one window, row-major, row 0 = northernmost.
#[derive(Debug, Clone)]
pub struct RasterWindow {
    pub window: PixelWindow,
    pub data: Vec<f32>,
}

impl RasterWindow {
    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.window.width + col]
    }
}

// ── Source trait ──────────────────────────────────────────────────────────────

/// A georeferenced single-band raster that can be read one window at a time.
pub trait RasterSource {
    fn grid(&self) -> &RasterGrid;

    /// Read the pixels of `window`. Implementations must not load more of the
    /// raster than the blocks intersecting the window.
    fn read_window(&mut self, window: PixelWindow) -> Result<RasterWindow, RasterError>;
}

impl<R: RasterSource + ?Sized> RasterSource for Box<R> {
    fn grid(&self) -> &RasterGrid {
        (**self).grid()
    }

    fn read_window(&mut self, window: PixelWindow) -> Result<RasterWindow, RasterError> {
        (**self).read_window(window)
    }
}

// ── In-memory raster ──────────────────────────────────────────────────────────

/// A fully materialized raster, row-major with row 0 = northernmost.
#[derive(Debug, Clone)]
pub struct MemoryRaster {
    pub grid: RasterGrid,
    pub data: Vec<f32>,
}

impl MemoryRaster {
    pub fn new(grid: RasterGrid, data: Vec<f32>) -> Self {
        assert_eq!(data.len(), grid.width * grid.height, "raster data does not match grid size");
        Self { grid, data }
    }

    /// A raster filled with `fill`, origin at (`origin_x`, `origin_y`),
    /// square pixels of `pixel_size`.
    pub fn filled(width: usize, height: usize, origin_x: f64, origin_y: f64, pixel_size: f64, fill: f32) -> Self {
        let grid = RasterGrid {
            width,
            height,
            transform: GeoTransform::new(origin_x, pixel_size, origin_y, -pixel_size),
            nodata: None,
            epsg: Some(GEOGRAPHIC_EPSG),
        };
        Self::new(grid, vec![fill; width * height])
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, val: f32) {
        self.data[row * self.grid.width + col] = val;
    }
}

impl RasterSource for MemoryRaster {
    fn grid(&self) -> &RasterGrid {
        &self.grid
    }

    fn read_window(&mut self, window: PixelWindow) -> Result<RasterWindow, RasterError> {
        self.grid.check_window(&window)?;
        let mut data = Vec::with_capacity(window.pixel_count());
        for row in window.row_off..window.row_off + window.height {
            let start = row * self.grid.width + window.col_off;
            data.extend_from_slice(&self.data[start..start + window.width]);
        }
        Ok(RasterWindow { window, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_for_clamps_to_extent() {
        let raster = MemoryRaster::filled(10, 10, 0.0, 10.0, 1.0, 1.0);
        let w = raster.grid.window_for(&Bounds::new(-3.0, 7.5, 2.5, 12.0)).unwrap();
        assert_eq!(w, PixelWindow { col_off: 0, row_off: 0, width: 3, height: 3 });
        assert!(raster.grid.window_for(&Bounds::new(20.0, 0.0, 30.0, 5.0)).is_none());
    }

    #[test]
    fn read_window_returns_row_major_subgrid() {
        let mut raster = MemoryRaster::filled(4, 3, 0.0, 3.0, 1.0, 0.0);
        for r in 0..3 {
            for c in 0..4 {
                raster.set(r, c, (r * 10 + c) as f32);
            }
        }
        let w = raster
            .read_window(PixelWindow { col_off: 1, row_off: 1, width: 2, height: 2 })
            .unwrap();
        assert_eq!(w.data, vec![11.0, 12.0, 21.0, 22.0]);
        assert_eq!(w.get(1, 0), 21.0);
    }

    #[test]
    fn out_of_bounds_window_is_an_error() {
        let mut raster = MemoryRaster::filled(4, 4, 0.0, 4.0, 1.0, 0.0);
        let err = raster
            .read_window(PixelWindow { col_off: 3, row_off: 0, width: 2, height: 1 })
            .unwrap_err();
        assert!(matches!(err, RasterError::WindowOutOfBounds { .. }));
    }

    #[test]
    fn validity_excludes_nan_and_nodata() {
        let mut grid = MemoryRaster::filled(1, 1, 0.0, 1.0, 1.0, 0.0).grid;
        grid.nodata = Some(-99999.0);
        assert!(grid.is_valid(3.0));
        assert!(!grid.is_valid(-99999.0));
        assert!(!grid.is_valid(f32::NAN));
        grid.nodata = Some(f64::NAN);
        assert!(grid.is_valid(-99999.0));
    }
}
