//! Windowed-tile aggregation for polygons whose bounding box is too large to
//! read in one window.
//!
//! The bbox is snapped outward to the raster's pixel grid and cut into
//! `tile_pixels`-square tiles. Tile edges are pixel edges, so a pixel centre
//! falls in exactly one tile and the per-tile sums add up to the whole. Only
//! one tile window is held at a time.

use geo::{BooleanOps, MultiPolygon};
use log::{debug, warn};

use super::population_value;
use crate::geometry::Bounds;
use crate::raster::RasterSource;
use crate::rasterize::zonal_sum;

/// Read failures logged individually before the rest go to `debug`.
const LOGGED_TILE_FAILURES: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TiledOutcome {
    pub value: u64,
    pub tiles_read: usize,
    pub tiles_empty: usize,
    pub tiles_failed: usize,
    pub tiles_total: usize,
}

/// Sum `geom` against `raster` one tile at a time.
///
/// Tiles where the clipped geometry is empty are skipped without a read.
/// A failed tile read is counted and skipped; the remaining tiles still
/// contribute.
pub fn aggregate_tiled<R: RasterSource + ?Sized>(
    id: &str,
    geom: &MultiPolygon<f64>,
    raster: &mut R,
    tile_pixels: usize,
) -> TiledOutcome {
    let mut out = TiledOutcome::default();
    let Some(bounds) = Bounds::of(geom) else {
        return out;
    };
    let grid = raster.grid().clone();
    let Some(span) = grid.window_for(&bounds) else {
        return out;
    };

    let tile = tile_pixels.max(1);
    let n_cols = span.width.div_ceil(tile);
    let n_rows = span.height.div_ceil(tile);
    out.tiles_total = n_cols * n_rows;
    debug!("{id}: {}x{} px bbox in {n_cols}x{n_rows} tiles", span.width, span.height);

    let mut total = 0.0f64;
    for tr in 0..n_rows {
        let r0 = span.row_off + tr * tile;
        let r1 = (r0 + tile).min(span.row_off + span.height);
        for tc in 0..n_cols {
            let c0 = span.col_off + tc * tile;
            let c1 = (c0 + tile).min(span.col_off + span.width);

            let tile_bounds = grid.transform.span_bounds(c0 as i64, r0 as i64, c1 as i64, r1 as i64);
            let clipped = geom.intersection(&MultiPolygon::new(vec![tile_bounds.to_polygon()]));
            let Some(clip_bounds) = Bounds::of(&clipped) else {
                out.tiles_empty += 1;
                continue;
            };
            let Some(window) = grid.window_for(&clip_bounds) else {
                out.tiles_empty += 1;
                continue;
            };

            match raster.read_window(window) {
                Ok(pixels) => {
                    total += zonal_sum(&clipped, &grid, &pixels);
                    out.tiles_read += 1;
                }
                Err(e) => {
                    out.tiles_failed += 1;
                    if out.tiles_failed <= LOGGED_TILE_FAILURES {
                        warn!("{id}: tile ({tr}, {tc}) read failed: {e}");
                    } else {
                        debug!("{id}: tile ({tr}, {tc}) read failed: {e}");
                    }
                }
            }
        }
    }

    out.value = population_value(total);
    if out.tiles_failed > 0 {
        warn!(
            "{id}: {} of {} tiles failed, value {} is a lower bound",
            out.tiles_failed, out.tiles_total, out.value
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use geo::{LineString, Polygon};

    use super::*;
    use crate::aggregate::{aggregate_standard, Feature};
    use crate::raster::MemoryRaster;
    use crate::test_support::{rect, FnRaster};

    fn ragged_raster() -> MemoryRaster {
        let mut raster = MemoryRaster::filled(50, 40, 0.0, 40.0, 1.0, 0.0);
        for r in 0..40 {
            for c in 0..50 {
                raster.set(r, c, ((r * 13 + c * 5) % 17) as f32 * 1.37);
            }
        }
        raster
    }

    fn ragged_polygon() -> MultiPolygon<f64> {
        let exterior = LineString::from(vec![
            (2.3, 1.7),
            (47.9, 6.2),
            (41.1, 38.4),
            (24.6, 21.3),
            (6.8, 35.9),
            (2.3, 1.7),
        ]);
        let hole = LineString::from(vec![(15.2, 10.1), (30.7, 9.6), (22.4, 17.9), (15.2, 10.1)]);
        MultiPolygon::new(vec![Polygon::new(exterior, vec![hole])])
    }

    #[test]
    fn tile_sum_matches_single_window_sum() {
        let geom = ragged_polygon();
        let mut raster = ragged_raster();
        let whole = aggregate_standard(&[Feature { id: "g".into(), geom: geom.clone() }], &mut raster, 50);

        for tile in [7, 16, 1000] {
            let tiled = aggregate_tiled("g", &geom, &mut raster, tile);
            assert_eq!(tiled.tiles_failed, 0);
            let diff = tiled.value.abs_diff(whole.values["g"]);
            assert!(diff <= 1, "tile {tile}: {} vs {}", tiled.value, whole.values["g"]);
        }
    }

    #[test]
    fn single_tile_when_bbox_fits() {
        let geom = MultiPolygon::new(vec![rect(1.0, 1.0, 4.0, 4.0)]);
        let mut raster = MemoryRaster::filled(10, 10, 0.0, 10.0, 1.0, 1.0);
        let out = aggregate_tiled("s", &geom, &mut raster, 5000);
        assert_eq!(out, TiledOutcome { value: 9, tiles_read: 1, tiles_empty: 0, tiles_failed: 0, tiles_total: 1 });
    }

    #[test]
    fn failed_tiles_are_counted_and_skipped() {
        let geom = MultiPolygon::new(vec![rect(0.0, 0.0, 20.0, 10.0)]);
        let mut raster = FnRaster::new(20, 10, |_, _| 1.0).failing_when(|w| w.col_off >= 10);
        let out = aggregate_tiled("f", &geom, &mut raster, 10);
        assert_eq!(out.tiles_total, 2);
        assert_eq!(out.tiles_read, 1);
        assert_eq!(out.tiles_failed, 1);
        assert_eq!(out.value, 100);
    }

    #[test]
    fn polygon_off_raster_reads_nothing() {
        let geom = MultiPolygon::new(vec![rect(500.0, 500.0, 600.0, 600.0)]);
        let mut raster = FnRaster::new(20, 10, |_, _| 1.0);
        let out = aggregate_tiled("o", &geom, &mut raster, 10);
        assert_eq!(out, TiledOutcome::default());
        assert!(raster.reads.borrow().is_empty());
    }
}
