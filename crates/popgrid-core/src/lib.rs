//! Population raster aggregation onto administrative polygons.
//!
//! Polygons are streamed from the store one chunk at a time, routed by their
//! bounding-box footprint to either a direct zonal sum or a tiled windowed
//! read, written back in one bulk update per chunk, and checkpointed so an
//! interrupted run resumes at the next unfinished chunk.

pub mod aggregate;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod footprint;
pub mod geometry;
pub mod pipeline;
pub mod raster;
pub mod rasterize;
pub mod rebuild;
pub mod rollup;
pub mod store;
pub mod summary;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{AggregationConfig, RasterLayout};
pub use error::{CountryError, GeometryError, RasterError, StoreError};
pub use pipeline::Pipeline;
pub use summary::RunSummary;
