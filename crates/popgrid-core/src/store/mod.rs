//! Geometry store access: chunked polygon reads, bulk population writes and
//! the parent/child queries used by rollup.

pub mod sqlite;

use std::collections::BTreeMap;

use crate::error::StoreError;

pub use sqlite::SqliteStore;

/// Default number of polygons per fetched chunk.
pub const DEFAULT_CHUNK_LIMIT: usize = 2000;

/// One polygon as stored: opaque id plus WKB geometry.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRow {
    pub id: String,
    pub wkb: Vec<u8>,
}

/// Deterministic, paginated access to live polygons.
///
/// Rows are ordered by id so chunk `k` always names the same polygons
/// between runs. A page shorter than `limit` means the level is exhausted.
pub trait ChunkSource {
    /// Distinct ISO3 codes with at least one live polygon.
    fn countries(&self) -> Result<Vec<String>, StoreError>;

    /// Distinct administrative levels (≥ 1) with a geometry, ascending.
    fn levels(&self, country: &str) -> Result<Vec<u8>, StoreError>;

    fn count(&self, country: &str, level: u8) -> Result<u64, StoreError>;

    fn fetch(&self, country: &str, level: u8, offset: u64, limit: usize) -> Result<Vec<ChunkRow>, StoreError>;
}

/// Writes aggregated values back to the store.
pub trait PopulationWriter {
    /// Overwrite `population` for every id in `values` in one transaction,
    /// stamping `population_year` and `updated_at`. Ids missing from the
    /// store are ignored. Returns the number of rows changed.
    fn write_populations(&mut self, values: &BTreeMap<String, u64>, year: i32) -> Result<usize, StoreError>;
}

/// A polygon's stored population, if it has one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub id: String,
    pub population: Option<u64>,
}

/// Aggregate over a parent's immediate children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildTotals {
    pub children: u64,
    /// Children whose population is set.
    pub populated: u64,
    pub sum: u64,
}

/// Parent/child queries over the jurisdiction hierarchy.
pub trait Hierarchy {
    /// Live polygons of `country` at `level`, ordered by id.
    fn units(&self, country: &str, level: u8) -> Result<Vec<Unit>, StoreError>;

    fn child_totals(&self, parent_id: &str) -> Result<ChildTotals, StoreError>;
}

/// Populated rows and their total for one (country, level).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelTotals {
    pub country: String,
    pub level: u8,
    pub rows: u64,
    pub population: u64,
}
