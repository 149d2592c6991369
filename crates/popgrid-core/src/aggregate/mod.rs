//! Per-chunk aggregation: decode, route by footprint, sum, merge.

pub mod standard;
pub mod tiled;

use std::collections::BTreeMap;

use geo::MultiPolygon;
use log::{debug, warn};

use crate::config::AggregationConfig;
use crate::footprint::{classify, Route};
use crate::geometry::decode_wkb;
use crate::raster::RasterSource;
use crate::store::ChunkRow;

pub use standard::{aggregate_standard, BatchFailure, StandardOutcome};
pub use tiled::{aggregate_tiled, TiledOutcome};

/// A decoded polygon ready for aggregation.
#[derive(Debug, Clone)]
pub struct Feature {
    pub id: String,
    pub geom: MultiPolygon<f64>,
}

/// Convert a raw zonal sum into a stored population: rounded, never
/// negative, and 0 when the sum is not finite.
#[inline]
pub fn population_value(sum: f64) -> u64 {
    if !sum.is_finite() || sum <= 0.0 {
        return 0;
    }
    sum.round() as u64
}

/// Everything one chunk produced. Skip-and-continue failures are counted
/// here; only the pipeline decides whether a unit aborts.
#[derive(Debug, Clone, Default)]
pub struct ChunkOutcome {
    pub values: BTreeMap<String, u64>,
    pub decode_failures: usize,
    pub standard: usize,
    pub tiled: usize,
    pub batch_failures: Vec<BatchFailure>,
    pub tiles_read: usize,
    pub tiles_empty: usize,
    pub tiles_failed: usize,
}

impl ChunkOutcome {
    /// Polygons that were written as 0 because their sub-batch failed.
    pub fn zeroed(&self) -> usize {
        self.batch_failures.iter().map(|f| f.zeroed).sum()
    }
}

/// Aggregate one chunk of stored rows against `raster`.
///
/// Rows whose geometry fails to decode are skipped and counted. The rest are
/// routed by bounding-box footprint: small ones go through
/// [`aggregate_standard`] in sub-batches, oversized ones one at a time
/// through [`aggregate_tiled`].
pub fn aggregate_chunk<R: RasterSource + ?Sized>(
    rows: &[ChunkRow],
    raster: &mut R,
    config: &AggregationConfig,
) -> ChunkOutcome {
    let mut out = ChunkOutcome::default();
    let mut standard = Vec::new();
    let mut oversized = Vec::new();

    for row in rows {
        let geom = match decode_wkb(&row.wkb) {
            Ok(g) => g,
            Err(e) => {
                warn!("skipping {}: {e}", row.id);
                out.decode_failures += 1;
                continue;
            }
        };
        let (route, estimate) = classify(&geom, raster.grid(), config.max_bbox_pixels);
        let feature = Feature { id: row.id.clone(), geom };
        match route {
            Route::Standard => standard.push(feature),
            Route::Tiled => {
                debug!("{} footprint ~{estimate} px, using tiled path", row.id);
                oversized.push(feature);
            }
        }
    }

    out.standard = standard.len();
    out.tiled = oversized.len();

    if !standard.is_empty() {
        let result = aggregate_standard(&standard, raster, config.batch_size);
        out.values.extend(result.values);
        out.batch_failures = result.failures;
    }

    for feature in &oversized {
        let t = aggregate_tiled(&feature.id, &feature.geom, raster, config.tile_pixels);
        out.tiles_read += t.tiles_read;
        out.tiles_empty += t.tiles_empty;
        out.tiles_failed += t.tiles_failed;
        out.values.insert(feature.id.clone(), t.value);
    }

    out
}
