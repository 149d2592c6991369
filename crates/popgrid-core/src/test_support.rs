//! Shared fixtures for unit tests.

use std::cell::RefCell;
use std::rc::Rc;

use geo::{Coord, MultiPolygon, Polygon, Rect};
use rusqlite::params;

use crate::error::RasterError;
use crate::geometry::encode_wkb;
use crate::raster::{GeoTransform, PixelWindow, RasterGrid, RasterSource, RasterWindow, GEOGRAPHIC_EPSG};
use crate::store::SqliteStore;

pub(crate) fn rect(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Polygon<f64> {
    Rect::new(Coord { x: min_x, y: min_y }, Coord { x: max_x, y: max_y }).to_polygon()
}

pub(crate) fn square(min_x: f64, min_y: f64, size: f64) -> MultiPolygon<f64> {
    MultiPolygon::new(vec![rect(min_x, min_y, min_x + size, min_y + size)])
}

// ── Store rows ────────────────────────────────────────────────────────────────

pub(crate) struct Row<'a> {
    pub id: &'a str,
    pub iso: &'a str,
    pub level: u8,
    pub parent: Option<&'a str>,
    pub source: &'a str,
    pub geom: Option<Vec<u8>>,
    pub deleted: bool,
}

impl<'a> Row<'a> {
    pub fn new(id: &'a str, iso: &'a str, level: u8, geom: &MultiPolygon<f64>) -> Self {
        Self {
            id,
            iso,
            level,
            parent: None,
            source: "geoboundaries",
            geom: Some(encode_wkb(geom)),
            deleted: false,
        }
    }
}

pub(crate) fn insert(store: &SqliteStore, row: Row<'_>) {
    store
        .conn
        .execute(
            "INSERT INTO jurisdictions (id, iso_code, adm_level, parent_id, source, geom, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                row.id,
                row.iso,
                row.level,
                row.parent,
                row.source,
                row.geom,
                row.deleted.then_some("2024-01-01T00:00:00Z"),
            ],
        )
        .unwrap();
}

pub(crate) fn population(store: &SqliteStore, id: &str) -> Option<i64> {
    store
        .conn
        .query_row("SELECT population FROM jurisdictions WHERE id = ?1", params![id], |r| r.get(0))
        .unwrap()
}

// ── Rasters ───────────────────────────────────────────────────────────────────

pub(crate) type ReadLog = Rc<RefCell<Vec<PixelWindow>>>;

/// A raster whose pixels are computed on demand, so tests can describe
/// country-sized grids without allocating them. Every read is logged.
pub(crate) struct FnRaster {
    pub grid: RasterGrid,
    value: Box<dyn Fn(usize, usize) -> f32>,
    fail: Box<dyn Fn(&PixelWindow) -> bool>,
    pub reads: ReadLog,
}

impl FnRaster {
    /// North-up grid with 1-unit pixels and its top-left corner at
    /// (0, `height`), so pixel (c, r) spans x ∈ [c, c+1].
    pub fn new(width: usize, height: usize, value: impl Fn(usize, usize) -> f32 + 'static) -> Self {
        Self {
            grid: RasterGrid {
                width,
                height,
                transform: GeoTransform::new(0.0, 1.0, height as f64, -1.0),
                nodata: None,
                epsg: Some(GEOGRAPHIC_EPSG),
            },
            value: Box::new(value),
            fail: Box::new(|_| false),
            reads: Rc::new(RefCell::new(Vec::new())),
        }
    }

    pub fn failing_when(mut self, fail: impl Fn(&PixelWindow) -> bool + 'static) -> Self {
        self.fail = Box::new(fail);
        self
    }

    pub fn read_log(&self) -> ReadLog {
        Rc::clone(&self.reads)
    }
}

impl RasterSource for FnRaster {
    fn grid(&self) -> &RasterGrid {
        &self.grid
    }

    fn read_window(&mut self, window: PixelWindow) -> Result<RasterWindow, RasterError> {
        self.grid.check_window(&window)?;
        self.reads.borrow_mut().push(window);
        if (self.fail)(&window) {
            return Err(RasterError::Tiff(tiff::TiffError::IoError(std::io::Error::other("injected read failure"))));
        }
        let mut data = Vec::with_capacity(window.pixel_count());
        for r in window.row_off..window.row_off + window.height {
            for c in window.col_off..window.col_off + window.width {
                data.push((self.value)(c, r));
            }
        }
        Ok(RasterWindow { window, data })
    }
}

/// Wraps any raster and logs the windows read through it.
pub(crate) struct CountingRaster<R> {
    inner: R,
    reads: ReadLog,
}

impl<R: RasterSource> CountingRaster<R> {
    pub fn new(inner: R, reads: ReadLog) -> Self {
        Self { inner, reads }
    }
}

impl<R: RasterSource> RasterSource for CountingRaster<R> {
    fn grid(&self) -> &RasterGrid {
        self.inner.grid()
    }

    fn read_window(&mut self, window: PixelWindow) -> Result<RasterWindow, RasterError> {
        self.reads.borrow_mut().push(window);
        self.inner.read_window(window)
    }
}
