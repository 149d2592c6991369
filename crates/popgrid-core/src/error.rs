use std::path::PathBuf;

use thiserror::Error;

/// Failures reading raster metadata or pixel windows.
#[derive(Debug, Error)]
pub enum RasterError {
    #[error("cannot open raster {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("TIFF decoding failed: {0}")]
    Tiff(#[from] tiff::TiffError),
    #[error("raster has no georeferencing ({0})")]
    MissingGeoreference(&'static str),
    #[error("rotated or sheared rasters are not supported")]
    Rotated,
    #[error("unsupported sample format in raster: {0}")]
    SampleFormat(String),
    #[error("window {col_off},{row_off} {width}x{height} lies outside the {raster_width}x{raster_height} raster")]
    WindowOutOfBounds {
        col_off: usize,
        row_off: usize,
        width: usize,
        height: usize,
        raster_width: usize,
        raster_height: usize,
    },
    #[error("coordinate transform failed: {0}")]
    Reproject(String),
    #[error("unsupported CRS EPSG:{0}")]
    UnsupportedCrs(u32),
}

/// Failures decoding a stored polygon.
#[derive(Debug, Error, PartialEq)]
pub enum GeometryError {
    #[error("WKB truncated at byte {0}")]
    Truncated(usize),
    #[error("invalid WKB byte order marker {0:#04x}")]
    ByteOrder(u8),
    #[error("unsupported WKB geometry type {0}")]
    UnsupportedType(u32),
    #[error("geometry has no coordinates")]
    Empty,
}

/// Failures talking to the geometry store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("population value {0} does not fit the store's integer column")]
    Overflow(u64),
}

/// Failures loading or persisting the progress document.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("progress file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("progress document is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Invalid configuration values.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("validation_tolerance must be a finite non-negative fraction, got {0}")]
    Tolerance(f64),
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config is malformed: {0}")]
    Json(#[from] serde_json::Error),
}

/// A failure that abandons the current country. The pipeline records it and
/// moves on to the next country.
#[derive(Debug, Error)]
pub enum CountryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Raster(#[from] RasterError),
}
