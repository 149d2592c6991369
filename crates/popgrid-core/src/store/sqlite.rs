use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};

use super::{ChildTotals, ChunkRow, ChunkSource, Hierarchy, LevelTotals, PopulationWriter, Unit};
use crate::error::StoreError;

/// Rows per `UPDATE … FROM (VALUES …)` statement. Two bound parameters per
/// row keeps a page under SQLite's 32 766 variable limit.
pub const WRITE_PAGE_ROWS: usize = 10_000;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS jurisdictions (
        id              TEXT PRIMARY KEY,
        iso_code        TEXT NOT NULL,
        adm_level       INTEGER NOT NULL,
        parent_id       TEXT,
        source          TEXT NOT NULL,
        geom            BLOB,
        population      INTEGER,
        population_year INTEGER,
        updated_at      TEXT,
        deleted_at      TEXT
    );
    CREATE INDEX IF NOT EXISTS jurisdictions_iso_level ON jurisdictions (iso_code, adm_level, id);
    CREATE INDEX IF NOT EXISTS jurisdictions_parent ON jurisdictions (parent_id);";

// ── Store ────────────────────────────────────────────────────────────────────

/// `jurisdictions` table in a SQLite database.
pub struct SqliteStore {
    pub(crate) conn: Connection,
    /// Only rows whose `source` is listed are visible. Empty = all sources.
    sources: Vec<String>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, sources: Vec::new() })
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }

    /// `" AND source IN (?, …)"` for the configured sources, or nothing.
    fn source_clause(&self) -> String {
        if self.sources.is_empty() {
            return String::new();
        }
        let marks = vec!["?"; self.sources.len()].join(", ");
        format!(" AND source IN ({marks})")
    }

    fn with_source_params(&self, mut head: Vec<Value>) -> Vec<Value> {
        head.extend(self.sources.iter().map(|s| Value::Text(s.clone())));
        head
    }

    /// Populated row count and population total per (country, level).
    pub fn level_totals(&self) -> Result<Vec<LevelTotals>, StoreError> {
        let sql = format!(
            "SELECT iso_code, adm_level, COUNT(*), COALESCE(SUM(population), 0)
             FROM jurisdictions
             WHERE deleted_at IS NULL AND population IS NOT NULL AND adm_level >= 1{}
             GROUP BY iso_code, adm_level
             ORDER BY iso_code, adm_level",
            self.source_clause()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(self.with_source_params(Vec::new())), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?, row.get::<_, i64>(3)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (country, level, count, total) = row?;
            out.push(LevelTotals {
                country,
                level: level.clamp(0, u8::MAX as i64) as u8,
                rows: count.max(0) as u64,
                population: total.max(0) as u64,
            });
        }
        Ok(out)
    }
}

// ── Chunk source ─────────────────────────────────────────────────────────────

impl ChunkSource for SqliteStore {
    fn countries(&self) -> Result<Vec<String>, StoreError> {
        let sql = format!(
            "SELECT DISTINCT iso_code FROM jurisdictions
             WHERE deleted_at IS NULL AND geom IS NOT NULL{}
             ORDER BY iso_code",
            self.source_clause()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(self.with_source_params(Vec::new())), |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<String>, _>>()?)
    }

    fn levels(&self, country: &str) -> Result<Vec<u8>, StoreError> {
        let sql = format!(
            "SELECT DISTINCT adm_level FROM jurisdictions
             WHERE iso_code = ? AND adm_level >= 1 AND deleted_at IS NULL AND geom IS NOT NULL{}
             ORDER BY adm_level",
            self.source_clause()
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let params = self.with_source_params(vec![Value::Text(country.to_string())]);
        let rows = stmt.query_map(params_from_iter(params), |row| row.get::<_, i64>(0))?;
        let mut levels = Vec::new();
        for level in rows {
            let level = level?;
            if let Ok(level) = u8::try_from(level) {
                levels.push(level);
            }
        }
        Ok(levels)
    }

    fn count(&self, country: &str, level: u8) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT COUNT(*) FROM jurisdictions
             WHERE iso_code = ? AND adm_level = ? AND deleted_at IS NULL AND geom IS NOT NULL{}",
            self.source_clause()
        );
        let params = self.with_source_params(vec![
            Value::Text(country.to_string()),
            Value::Integer(i64::from(level)),
        ]);
        let n: i64 = self.conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?;
        Ok(n.max(0) as u64)
    }

    fn fetch(&self, country: &str, level: u8, offset: u64, limit: usize) -> Result<Vec<ChunkRow>, StoreError> {
        let sql = format!(
            "SELECT id, geom FROM jurisdictions
             WHERE iso_code = ? AND adm_level = ? AND deleted_at IS NULL AND geom IS NOT NULL{}
             ORDER BY id
             LIMIT ? OFFSET ?",
            self.source_clause()
        );
        let mut params = self.with_source_params(vec![
            Value::Text(country.to_string()),
            Value::Integer(i64::from(level)),
        ]);
        params.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        params.push(Value::Integer(i64::try_from(offset).unwrap_or(i64::MAX)));
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |row| {
            Ok(ChunkRow { id: row.get(0)?, wkb: row.get(1)? })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

impl PopulationWriter for SqliteStore {
    fn write_populations(&mut self, values: &BTreeMap<String, u64>, year: i32) -> Result<usize, StoreError> {
        if values.is_empty() {
            return Ok(0);
        }
        let updated_at = Utc::now().to_rfc3339();
        let entries: Vec<(&String, &u64)> = values.iter().collect();

        let tx = self.conn.transaction()?;
        let mut changed = 0usize;
        for page in entries.chunks(WRITE_PAGE_ROWS) {
            let rows = vec!["(?, ?)"; page.len()].join(", ");
            let sql = format!(
                "UPDATE jurisdictions AS j
                 SET population = v.column2, population_year = ?, updated_at = ?
                 FROM (VALUES {rows}) AS v
                 WHERE j.id = v.column1"
            );
            let mut params = Vec::with_capacity(2 + page.len() * 2);
            params.push(Value::Integer(i64::from(year)));
            params.push(Value::Text(updated_at.clone()));
            for (id, pop) in page {
                let pop = i64::try_from(**pop).map_err(|_| StoreError::Overflow(**pop))?;
                params.push(Value::Text((*id).clone()));
                params.push(Value::Integer(pop));
            }
            changed += tx.execute(&sql, params_from_iter(params))?;
        }
        tx.commit()?;
        Ok(changed)
    }
}

// ── Hierarchy ────────────────────────────────────────────────────────────────

impl Hierarchy for SqliteStore {
    fn units(&self, country: &str, level: u8) -> Result<Vec<Unit>, StoreError> {
        let sql = format!(
            "SELECT id, population FROM jurisdictions
             WHERE iso_code = ? AND adm_level = ? AND deleted_at IS NULL{}
             ORDER BY id",
            self.source_clause()
        );
        let params = self.with_source_params(vec![
            Value::Text(country.to_string()),
            Value::Integer(i64::from(level)),
        ]);
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |row| {
            Ok(Unit {
                id: row.get(0)?,
                population: row.get::<_, Option<i64>>(1)?.map(|p| p.max(0) as u64),
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn child_totals(&self, parent_id: &str) -> Result<ChildTotals, StoreError> {
        let (children, populated, sum): (i64, i64, i64) = self.conn.query_row(
            "SELECT COUNT(*), COUNT(population), COALESCE(SUM(population), 0)
             FROM jurisdictions
             WHERE parent_id = ?1 AND deleted_at IS NULL",
            params![parent_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(ChildTotals {
            children: children.max(0) as u64,
            populated: populated.max(0) as u64,
            sum: sum.max(0) as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use geo::MultiPolygon;

    use super::*;
    use crate::test_support::{insert, rect, Row};

    fn seeded() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        let square = MultiPolygon::new(vec![rect(0.0, 0.0, 1.0, 1.0)]);
        insert(&store, Row::new("b", "ZZZ", 2, &square));
        insert(&store, Row::new("a", "ZZZ", 2, &square));
        insert(&store, Row::new("c", "ZZZ", 2, &square));
        insert(&store, Row::new("n", "ZZZ", 1, &square));
        insert(&store, Row { deleted: true, ..Row::new("d", "ZZZ", 2, &square) });
        insert(&store, Row { geom: None, ..Row::new("e", "ZZZ", 2, &square) });
        insert(&store, Row { source: "osm", ..Row::new("f", "ZZZ", 2, &square) });
        insert(&store, Row::new("y", "YYY", 3, &square));
        store.with_sources(vec!["geoboundaries".into(), "synthetic".into()])
    }

    #[test]
    fn only_live_rows_in_configured_sources_are_visible() {
        let store = seeded();
        assert_eq!(store.countries().unwrap(), vec!["YYY", "ZZZ"]);
        assert_eq!(store.levels("ZZZ").unwrap(), vec![1, 2]);
        assert_eq!(store.count("ZZZ", 2).unwrap(), 3);
    }

    #[test]
    fn fetch_pages_in_id_order() {
        let store = seeded();
        let first = store.fetch("ZZZ", 2, 0, 2).unwrap();
        let ids: Vec<&str> = first.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        let second = store.fetch("ZZZ", 2, 2, 2).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, "c");
        assert!(store.fetch("ZZZ", 2, 4, 2).unwrap().is_empty());
        assert!(crate::geometry::decode_wkb(&second[0].wkb).is_ok());
    }

    #[test]
    fn write_is_idempotent_and_ignores_unknown_ids() {
        let mut store = seeded();
        let values: BTreeMap<String, u64> =
            [("a".to_string(), 120), ("b".to_string(), 45), ("zz".to_string(), 9)].into_iter().collect();
        assert_eq!(store.write_populations(&values, 2023).unwrap(), 2);
        assert_eq!(store.write_populations(&values, 2023).unwrap(), 2);

        let (pop, year, stamped): (i64, i64, Option<String>) = store
            .conn
            .query_row(
                "SELECT population, population_year, updated_at FROM jurisdictions WHERE id = 'a'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!((pop, year), (120, 2023));
        assert!(stamped.is_some());

        let totals = store.level_totals().unwrap();
        assert_eq!(totals, vec![LevelTotals { country: "ZZZ".into(), level: 2, rows: 2, population: 165 }]);
    }

    #[test]
    fn write_spans_multiple_pages() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let square = MultiPolygon::new(vec![rect(0.0, 0.0, 1.0, 1.0)]);
        let n = WRITE_PAGE_ROWS + 5;
        let mut values = BTreeMap::new();
        for i in 0..n {
            let id = format!("p{i:06}");
            insert(&store, Row::new(&id, "ZZZ", 2, &square));
            values.insert(id, i as u64);
        }
        assert_eq!(store.write_populations(&values, 2020).unwrap(), n);
    }

    #[test]
    fn overflowing_value_is_rejected_before_commit() {
        let mut store = seeded();
        let values: BTreeMap<String, u64> =
            [("a".to_string(), 1), ("b".to_string(), u64::MAX)].into_iter().collect();
        assert!(matches!(store.write_populations(&values, 2023), Err(StoreError::Overflow(_))));
        let pop: Option<i64> = store
            .conn
            .query_row("SELECT population FROM jurisdictions WHERE id = 'a'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(pop, None);
    }

    #[test]
    fn child_totals_count_unpopulated_children() {
        let mut store = seeded();
        let square = MultiPolygon::new(vec![rect(0.0, 0.0, 1.0, 1.0)]);
        insert(&store, Row { parent: Some("n"), ..Row::new("k1", "ZZZ", 2, &square) });
        insert(&store, Row { parent: Some("n"), ..Row::new("k2", "ZZZ", 2, &square) });
        let values: BTreeMap<String, u64> = [("k1".to_string(), 30)].into_iter().collect();
        store.write_populations(&values, 2023).unwrap();
        let totals = store.child_totals("n").unwrap();
        assert_eq!(totals, ChildTotals { children: 2, populated: 1, sum: 30 });

        let units = store.units("ZZZ", 1).unwrap();
        assert_eq!(units, vec![Unit { id: "n".into(), population: None }]);
    }
}
