//! Direct zonal sums, one window read per polygon, in fixed-size sub-batches.

use std::collections::BTreeMap;

use log::warn;

use super::{population_value, Feature};
use crate::error::RasterError;
use crate::geometry::Bounds;
use crate::raster::RasterSource;
use crate::rasterize::zonal_sum;

/// A sub-batch that stopped at a read failure.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    /// Zero-based sub-batch index within the call.
    pub batch: usize,
    pub message: String,
    /// The failing polygon plus every polygon after it in the sub-batch.
    pub zeroed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct StandardOutcome {
    /// One entry for every input id.
    pub values: BTreeMap<String, u64>,
    pub failures: Vec<BatchFailure>,
}

fn polygon_value<R: RasterSource + ?Sized>(feature: &Feature, raster: &mut R) -> Result<u64, RasterError> {
    let Some(bounds) = Bounds::of(&feature.geom) else {
        return Ok(0);
    };
    // Entirely outside the raster: nothing to count.
    let Some(window) = raster.grid().window_for(&bounds) else {
        return Ok(0);
    };
    let pixels = raster.read_window(window)?;
    Ok(population_value(zonal_sum(&feature.geom, raster.grid(), &pixels)))
}

/// Sum `features` against `raster` in sub-batches of `batch_size`.
///
/// A read failure zeroes the failing polygon and the rest of its sub-batch;
/// earlier sub-batches keep their values and later ones still run.
pub fn aggregate_standard<R: RasterSource + ?Sized>(
    features: &[Feature],
    raster: &mut R,
    batch_size: usize,
) -> StandardOutcome {
    let mut out = StandardOutcome::default();

    for (batch, group) in features.chunks(batch_size.max(1)).enumerate() {
        for (i, feature) in group.iter().enumerate() {
            match polygon_value(feature, raster) {
                Ok(v) => {
                    out.values.insert(feature.id.clone(), v);
                }
                Err(e) => {
                    let rest = &group[i..];
                    warn!(
                        "sub-batch {batch} failed at {}: {e}; writing 0 for {} polygons",
                        feature.id,
                        rest.len()
                    );
                    for f in rest {
                        out.values.insert(f.id.clone(), 0);
                    }
                    out.failures.push(BatchFailure {
                        batch,
                        message: e.to_string(),
                        zeroed: rest.len(),
                    });
                    break;
                }
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::MemoryRaster;
    use crate::test_support::{square, FnRaster};

    fn features(n: usize) -> Vec<Feature> {
        (0..n)
            .map(|i| Feature { id: format!("p{i}"), geom: square(i as f64 * 2.0, 0.0, 1.0) })
            .collect()
    }

    #[test]
    fn every_input_gets_a_value() {
        let mut raster = MemoryRaster::filled(20, 2, 0.0, 2.0, 1.0, 3.0);
        let out = aggregate_standard(&features(7), &mut raster, 3);
        assert_eq!(out.values.len(), 7);
        assert!(out.values.values().all(|&v| v == 3));
        assert!(out.failures.is_empty());
    }

    #[test]
    fn read_failure_zeroes_rest_of_sub_batch_only() {
        // Polygon p4 sits at column 8; sub-batches of 3 are [p0 p1 p2] [p3 p4 p5] [p6].
        let mut raster = FnRaster::new(20, 2, |_, _| 5.0).failing_when(|w| w.col_off == 8);
        let out = aggregate_standard(&features(7), &mut raster, 3);

        assert_eq!(out.values.len(), 7);
        assert_eq!(out.values["p3"], 5);
        assert_eq!(out.values["p4"], 0);
        assert_eq!(out.values["p5"], 0);
        assert_eq!(out.values["p6"], 5);
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].batch, 1);
        assert_eq!(out.failures[0].zeroed, 2);
        // p5 was never read.
        assert!(raster.reads.borrow().iter().all(|w| w.col_off != 10));
    }

    #[test]
    fn polygon_outside_raster_is_zero_without_read() {
        let mut raster = FnRaster::new(4, 4, |_, _| 1.0);
        let outside = vec![Feature { id: "far".into(), geom: square(100.0, 100.0, 1.0) }];
        let out = aggregate_standard(&outside, &mut raster, 50);
        assert_eq!(out.values["far"], 0);
        assert!(raster.reads.borrow().is_empty());
    }

    #[test]
    fn negative_sums_clamp_to_zero() {
        let mut raster = MemoryRaster::filled(4, 4, 0.0, 4.0, 1.0, -2.0);
        let out = aggregate_standard(&features(1), &mut raster, 50);
        assert_eq!(out.values["p0"], 0);
    }
}
