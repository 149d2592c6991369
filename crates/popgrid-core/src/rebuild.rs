//! Recovering progress from the store after the progress file was lost.

use log::info;

use crate::checkpoint::ProgressDocument;
use crate::error::StoreError;
use crate::store::{ChunkSource, SqliteStore};

/// What a rebuild recorded for one country.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuiltCountry {
    pub country: String,
    /// Levels newly marked done from populated rows.
    pub levels: Vec<u8>,
    pub rows: u64,
    /// Every level of the country is now done.
    pub complete: bool,
}

/// Merge populated (country, level) pairs from `store` into `doc`.
///
/// Levels already done are left alone, and so are existing skip and error
/// entries unless the country turns out complete. A country is marked done
/// only when every level it has in the store is done; the rest stay open for
/// the next run.
pub fn rebuild_progress(store: &SqliteStore, doc: &mut ProgressDocument) -> Result<Vec<RebuiltCountry>, StoreError> {
    let mut rebuilt: Vec<RebuiltCountry> = Vec::new();

    for t in store.level_totals()? {
        if rebuilt.last().map_or(true, |r| r.country != t.country) {
            rebuilt.push(RebuiltCountry { country: t.country.clone(), levels: Vec::new(), rows: 0, complete: false });
        }
        if doc.level_done(&t.country, t.level) {
            continue;
        }
        doc.mark_level_rebuilt(&t.country, t.level, usize::try_from(t.rows).unwrap_or(usize::MAX));
        info!("{} level {}: {} populated rows, total {}", t.country, t.level, t.rows, t.population);
        if let Some(entry) = rebuilt.last_mut() {
            entry.levels.push(t.level);
            entry.rows += t.rows;
        }
    }

    for entry in &mut rebuilt {
        let levels = store.levels(&entry.country)?;
        entry.complete = doc.levels_done(&entry.country, &levels);
        if entry.complete {
            let total = doc.country_rows(&entry.country);
            doc.finish_country(&entry.country, total);
        }
    }
    Ok(rebuilt)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::checkpoint::Status;
    use crate::store::PopulationWriter;
    use crate::test_support::{insert, square, Row};

    fn store_with(rows: &[(&str, &str, u8, &str)]) -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        let geom = square(0.0, 0.0, 1.0);
        for &(id, iso, level, source) in rows {
            insert(&store, Row { source, ..Row::new(id, iso, level, &geom) });
        }
        store
    }

    fn populate(store: &mut SqliteStore, ids: &[&str]) {
        let values: BTreeMap<String, u64> = ids.iter().map(|id| (id.to_string(), 10)).collect();
        store.write_populations(&values, 2023).unwrap();
    }

    #[test]
    fn only_populated_levels_are_marked() {
        let mut store = store_with(&[
            ("n", "ZZZ", 1, "geoboundaries"),
            ("a", "ZZZ", 2, "geoboundaries"),
            ("b", "ZZZ", 2, "geoboundaries"),
            ("y", "YYY", 1, "geoboundaries"),
        ]);
        populate(&mut store, &["n", "y"]);

        let mut doc = ProgressDocument::default();
        let out = rebuild_progress(&store, &mut doc).unwrap();

        assert_eq!(out.len(), 2);
        let zzz = out.iter().find(|r| r.country == "ZZZ").unwrap();
        assert_eq!(zzz.levels, vec![1]);
        assert!(!zzz.complete);
        assert!(doc.level_done("ZZZ", 1));
        assert!(!doc.level_done("ZZZ", 2));
        assert_ne!(doc.country_status("ZZZ"), Some(Status::Done));

        assert!(out.iter().find(|r| r.country == "YYY").unwrap().complete);
        assert_eq!(doc.country_status("YYY"), Some(Status::Done));
        assert_eq!(doc.country("YYY").unwrap().updated, 1);
    }

    #[test]
    fn other_sources_do_not_count() {
        let mut store = store_with(&[("n", "ZZZ", 1, "geoboundaries"), ("osm", "XXX", 1, "osm")])
            .with_sources(vec!["geoboundaries".into(), "synthetic".into()]);
        populate(&mut store, &["n", "osm"]);

        let mut doc = ProgressDocument::default();
        let out = rebuild_progress(&store, &mut doc).unwrap();
        assert_eq!(out.iter().map(|r| r.country.as_str()).collect::<Vec<_>>(), vec!["ZZZ"]);
        assert!(doc.country("XXX").is_none());
    }

    #[test]
    fn existing_history_is_kept() {
        let mut store = store_with(&[("a", "ZZZ", 2, "geoboundaries"), ("b", "ZZZ", 3, "geoboundaries")]);
        populate(&mut store, &["a"]);

        let mut doc = ProgressDocument::default();
        doc.skip_country("ATA", "no_coverage");
        doc.fail_country("ZZZ", "disk full");
        doc.mark_chunk_done("ZZZ", 3, 0, 0);

        rebuild_progress(&store, &mut doc).unwrap();
        assert_eq!(doc.country("ATA").unwrap().reason.as_deref(), Some("no_coverage"));
        assert_eq!(doc.country_status("ZZZ"), Some(Status::Error));
        assert!(doc.level_done("ZZZ", 2));
        assert!(doc.chunk_done("ZZZ", 3, 0));
    }

    #[test]
    fn levels_already_done_keep_their_chunks() {
        let mut store = store_with(&[("a", "ZZZ", 2, "geoboundaries")]);
        populate(&mut store, &["a"]);

        let mut doc = ProgressDocument::default();
        doc.mark_chunk_done("ZZZ", 2, 0, 1);
        doc.mark_level_done("ZZZ", 2);
        let out = rebuild_progress(&store, &mut doc).unwrap();

        assert!(out[0].levels.is_empty());
        assert!(out[0].complete);
        assert!(doc.chunk_done("ZZZ", 2, 0));
        assert_eq!(doc.country_status("ZZZ"), Some(Status::Done));
    }
}
