//! Scanline zonal sum: the sum of valid cells whose centres fall inside a
//! polygon.
//!
//! Each window row is sampled at its pixel-centre latitude. Ring crossings
//! are collected from an active edge list and paired even-odd, so holes and
//! multipolygon parts need no special casing. A span `[xa, xb)` covers the
//! pixels whose centre x lies in it; a centre exactly on a right-hand edge
//! belongs to the neighbouring span, which keeps adjacent polygons from
//! counting a shared pixel twice.

use geo::{Coord, MultiPolygon};

use crate::raster::{GeoTransform, RasterGrid, RasterWindow};

struct Edge {
    a: Coord<f64>,
    b: Coord<f64>,
    last_row: usize,
}

/// Fractional row index whose pixel centre sits at latitude `y`.
#[inline]
fn row_of(t: &GeoTransform, y: f64) -> f64 {
    (y - t.origin_y) / t.pixel_height - 0.5
}

/// First column whose pixel centre is at or east of `x`.
#[inline]
fn col_at_or_after(t: &GeoTransform, x: f64) -> i64 {
    ((x - t.origin_x) / t.pixel_width - 0.5).ceil() as i64
}

/// Sum of valid cells in `pixels` whose centres lie inside `geom`.
///
/// Cells are valid per [`RasterGrid::is_valid`]. Assumes a positive pixel
/// width, which every supported source guarantees.
pub fn zonal_sum(geom: &MultiPolygon<f64>, grid: &RasterGrid, pixels: &RasterWindow) -> f64 {
    let win = pixels.window;
    if win.width == 0 || win.height == 0 {
        return 0.0;
    }
    let t = &grid.transform;
    let rows = win.height as i64;

    // Bucket every non-horizontal edge by the first window row it may cross.
    let mut buckets: Vec<Vec<Edge>> = (0..win.height).map(|_| Vec::new()).collect();
    let rings = geom
        .0
        .iter()
        .flat_map(|p| std::iter::once(p.exterior()).chain(p.interiors()));
    for ring in rings {
        for line in ring.lines() {
            let (a, b) = (line.start, line.end);
            if a.y == b.y || !a.y.is_finite() || !b.y.is_finite() {
                continue;
            }
            let (ra, rb) = (row_of(t, a.y), row_of(t, b.y));
            let lo = ra.min(rb).floor() as i64 - win.row_off as i64;
            let hi = ra.max(rb).ceil() as i64 - win.row_off as i64;
            if hi < 0 || lo >= rows {
                continue;
            }
            let first = lo.max(0) as usize;
            buckets[first].push(Edge { a, b, last_row: hi.min(rows - 1) as usize });
        }
    }

    let mut active: Vec<Edge> = Vec::new();
    let mut crossings: Vec<f64> = Vec::new();
    let mut sum = 0.0f64;
    let col_off = win.col_off as i64;
    let width = win.width as i64;

    for r in 0..win.height {
        active.retain(|e| e.last_row >= r);
        active.append(&mut buckets[r]);
        if active.is_empty() {
            continue;
        }

        let (_, y) = t.pixel_center(0.0, (win.row_off + r) as f64);
        crossings.clear();
        for e in &active {
            if (e.a.y > y) != (e.b.y > y) {
                crossings.push(e.a.x + (y - e.a.y) * (e.b.x - e.a.x) / (e.b.y - e.a.y));
            }
        }
        crossings.sort_by(f64::total_cmp);

        let row_base = r * win.width;
        for span in crossings.chunks_exact(2) {
            let c0 = (col_at_or_after(t, span[0]) - col_off).clamp(0, width) as usize;
            let c1 = (col_at_or_after(t, span[1]) - col_off).clamp(0, width) as usize;
            for &v in &pixels.data[row_base + c0..row_base + c1] {
                if grid.is_valid(v) {
                    sum += f64::from(v);
                }
            }
        }
    }
    sum
}
