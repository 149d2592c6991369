//! End-of-run report.

use std::fmt;

use crate::aggregate::ChunkOutcome;
use crate::raster::locate::SkipReason;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountryStatus {
    Done,
    /// This run's levels finished but others are still pending.
    Partial,
    /// Finished in an earlier run; nothing was touched.
    AlreadyDone,
    Skipped(SkipReason),
    Error(String),
    Interrupted,
}

impl CountryStatus {
    pub fn label(&self) -> &str {
        match self {
            CountryStatus::Done => "done",
            CountryStatus::Partial => "partial",
            CountryStatus::AlreadyDone => "already_done",
            CountryStatus::Skipped(reason) => reason.as_str(),
            CountryStatus::Error(_) => "error",
            CountryStatus::Interrupted => "interrupted",
        }
    }
}

/// Counters for one country in this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountryReport {
    pub country: String,
    pub status: CountryStatus,
    pub rows_updated: usize,
    pub chunks_processed: usize,
    pub chunks_skipped: usize,
    pub levels_skipped: usize,
    pub decode_failures: usize,
    pub tiled_polygons: usize,
    pub tiles_failed: usize,
    pub zeroed: usize,
    pub rolled_up: usize,
    pub validation_warnings: usize,
}

impl CountryReport {
    pub fn new(country: &str, status: CountryStatus) -> Self {
        Self {
            country: country.to_string(),
            status,
            rows_updated: 0,
            chunks_processed: 0,
            chunks_skipped: 0,
            levels_skipped: 0,
            decode_failures: 0,
            tiled_polygons: 0,
            tiles_failed: 0,
            zeroed: 0,
            rolled_up: 0,
            validation_warnings: 0,
        }
    }

    pub(crate) fn absorb(&mut self, chunk: &ChunkOutcome, updated: usize) {
        self.rows_updated += updated;
        self.chunks_processed += 1;
        self.decode_failures += chunk.decode_failures;
        self.tiled_polygons += chunk.tiled;
        self.tiles_failed += chunk.tiles_failed;
        self.zeroed += chunk.zeroed();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub countries: Vec<CountryReport>,
    /// The run stopped early on an interruption signal.
    pub interrupted: bool,
}

impl RunSummary {
    pub fn rows_updated(&self) -> usize {
        self.countries.iter().map(|c| c.rows_updated).sum()
    }

    pub fn count(&self, pred: impl Fn(&CountryStatus) -> bool) -> usize {
        self.countries.iter().filter(|c| pred(&c.status)).count()
    }

    pub fn errors(&self) -> usize {
        self.count(|s| matches!(s, CountryStatus::Error(_)))
    }

    pub fn report(&self, country: &str) -> Option<&CountryReport> {
        self.countries.iter().find(|c| c.country == country)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<8} {:<16} {:>10} {:>7} {:>7} {:>7} {:>6} {:>6} {:>7}",
            "Country", "Status", "Rows", "Chunks", "Resumed", "BadGeom", "Tiled", "TileX", "Zeroed"
        )?;
        writeln!(f, "{}", "-".repeat(82))?;
        for c in &self.countries {
            writeln!(
                f,
                "{:<8} {:<16} {:>10} {:>7} {:>7} {:>7} {:>6} {:>6} {:>7}",
                c.country,
                c.status.label(),
                c.rows_updated,
                c.chunks_processed,
                c.chunks_skipped,
                c.decode_failures,
                c.tiled_polygons,
                c.tiles_failed,
                c.zeroed,
            )?;
            if let CountryStatus::Error(msg) = &c.status {
                writeln!(f, "  -> {msg}")?;
            }
        }
        writeln!(f, "{}", "-".repeat(82))?;
        write!(
            f,
            "{} countries: {} done, {} partial, {} already done, {} skipped, {} errors; {} rows updated",
            self.countries.len(),
            self.count(|s| *s == CountryStatus::Done),
            self.count(|s| *s == CountryStatus::Partial),
            self.count(|s| *s == CountryStatus::AlreadyDone),
            self.count(|s| matches!(s, CountryStatus::Skipped(_))),
            self.errors(),
            self.rows_updated(),
        )?;
        if self.interrupted {
            write!(f, " (interrupted, progress saved)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_and_table() {
        let mut done = CountryReport::new("ZZZ", CountryStatus::Done);
        done.rows_updated = 3;
        done.chunks_processed = 2;
        let summary = RunSummary {
            countries: vec![
                done,
                CountryReport::new("ATA", CountryStatus::Skipped(SkipReason::NoCoverage)),
                CountryReport::new("YYY", CountryStatus::Error("disk gone".into())),
            ],
            interrupted: false,
        };
        assert_eq!(summary.rows_updated(), 3);
        assert_eq!(summary.errors(), 1);

        let text = summary.to_string();
        assert!(text.contains("no_coverage"));
        assert!(text.contains("  -> disk gone"));
        assert!(text.ends_with("3 countries: 1 done, 0 partial, 0 already done, 1 skipped, 1 errors; 3 rows updated"));
    }
}
