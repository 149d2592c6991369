//! Bounding-box footprint estimate and path routing.

use geo::MultiPolygon;

use crate::geometry::Bounds;
use crate::raster::RasterGrid;

/// Which aggregation path a polygon takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Standard,
    Tiled,
}

/// Pixel count of the raster window covering `bounds`:
/// `ceil(width / |pixel_width|) * ceil(height / |pixel_height|)`.
///
/// A zero or non-finite pixel size yields 0 so the polygon stays on the
/// standard path.
pub fn bbox_pixel_area(bounds: &Bounds, pixel_width: f64, pixel_height: f64) -> u64 {
    let pw = pixel_width.abs();
    let ph = pixel_height.abs();
    if pw == 0.0 || ph == 0.0 || !pw.is_finite() || !ph.is_finite() {
        return 0;
    }
    let cols = (bounds.width() / pw).ceil().max(0.0) as u64;
    let rows = (bounds.height() / ph).ceil().max(0.0) as u64;
    cols.saturating_mul(rows)
}

/// Estimates at or above `threshold` go to the tiled path.
#[inline]
pub fn route_for(estimate: u64, threshold: u64) -> Route {
    if estimate >= threshold {
        Route::Tiled
    } else {
        Route::Standard
    }
}

/// Route a decoded geometry against `grid`. Returns the estimate alongside
/// the route so callers can log it.
pub fn classify(geom: &MultiPolygon<f64>, grid: &RasterGrid, threshold: u64) -> (Route, u64) {
    let estimate = Bounds::of(geom)
        .map(|b| bbox_pixel_area(&b, grid.transform.pixel_width, grid.transform.pixel_height))
        .unwrap_or(0);
    (route_for(estimate, threshold), estimate)
}
