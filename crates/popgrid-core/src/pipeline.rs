//! Country → level → chunk orchestration with resumable progress.
//!
//! Work is strictly sequential. After every committed chunk the progress
//! document is updated and handed to the [`CheckpointSink`], so an
//! interrupted run resumes at the first chunk not marked done. The
//! interruption flag is polled before each level and chunk; an in-flight
//! chunk always runs to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};

use crate::aggregate::aggregate_chunk;
use crate::checkpoint::{CheckpointSink, ProgressDocument, ProgressEvent, Status};
use crate::config::AggregationConfig;
use crate::error::CountryError;
use crate::raster::locate::{Opened, RasterProvider};
use crate::raster::{RasterSource, GEOGRAPHIC_EPSG};
use crate::rollup::{check_country, rollup_parent_level, Verdict};
use crate::store::{ChunkSource, Hierarchy, PopulationWriter};
use crate::summary::{CountryReport, CountryStatus, RunSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Finished,
    Interrupted,
}

/// Report a transition to the sink. A failed checkpoint write is logged and
/// the run carries on; the next event writes the whole document again.
fn record<K: CheckpointSink + ?Sized>(sink: &mut K, doc: &ProgressDocument, event: &ProgressEvent<'_>) {
    if let Err(e) = sink.record(doc, event) {
        error!("checkpoint write failed after {event:?}: {e}");
    }
}

/// The aggregation engine.
pub struct Pipeline {
    config: AggregationConfig,
    interrupt: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(config: AggregationConfig) -> Self {
        Self { config, interrupt: Arc::new(AtomicBool::new(false)) }
    }

    /// Share an externally owned interruption flag (set from a signal
    /// handler, for instance).
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn interrupt_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupt)
    }

    pub fn config(&self) -> &AggregationConfig {
        &self.config
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::SeqCst)
    }

    /// Process `countries` in order.
    ///
    /// Countries whose every level is done in `doc` are skipped. A country
    /// left partial by a level filter is revisited. A country-level failure
    /// marks that country as errored and the run moves on. On interruption
    /// the document is flushed and the summary comes back with
    /// `interrupted` set.
    pub fn run<S, P, K>(
        &self,
        store: &mut S,
        rasters: &mut P,
        sink: &mut K,
        doc: &mut ProgressDocument,
        countries: &[String],
    ) -> RunSummary
    where
        S: ChunkSource + PopulationWriter + Hierarchy,
        P: RasterProvider + ?Sized,
        K: CheckpointSink + ?Sized,
    {
        let mut summary = RunSummary::default();

        for (i, country) in countries.iter().enumerate() {
            if self.interrupted() {
                summary.interrupted = true;
                break;
            }
            if doc.country_status(country) == Some(Status::Done) {
                info!("{country}: already done, skipping");
                summary.countries.push(CountryReport::new(country, CountryStatus::AlreadyDone));
                continue;
            }

            info!("[{}/{}] {country}", i + 1, countries.len());
            let mut report = CountryReport::new(country, CountryStatus::Done);
            match self.run_country(country, store, rasters, sink, doc, &mut report) {
                Ok(Flow::Finished) => {}
                Ok(Flow::Interrupted) => {
                    report.status = CountryStatus::Interrupted;
                    summary.interrupted = true;
                }
                Err(e) => {
                    error!("{country}: {e}");
                    doc.fail_country(country, &e.to_string());
                    record(sink, doc, &ProgressEvent::CountryFinished { country, status: Status::Error });
                    report.status = CountryStatus::Error(e.to_string());
                }
            }
            summary.countries.push(report);
            if summary.interrupted {
                break;
            }
        }

        if summary.interrupted {
            warn!("interrupted; saving progress");
            if let Err(e) = sink.flush(doc) {
                error!("progress flush failed: {e}");
            }
        }
        summary
    }

    fn run_country<S, P, K>(
        &self,
        country: &str,
        store: &mut S,
        rasters: &mut P,
        sink: &mut K,
        doc: &mut ProgressDocument,
        report: &mut CountryReport,
    ) -> Result<Flow, CountryError>
    where
        S: ChunkSource + PopulationWriter + Hierarchy,
        P: RasterProvider + ?Sized,
        K: CheckpointSink + ?Sized,
    {
        let mut raster = match rasters.open(country)? {
            Opened::Raster(r) => r,
            Opened::Skipped(reason) => {
                warn!("{country}: skipped ({reason})");
                doc.skip_country(country, reason.as_str());
                record(sink, doc, &ProgressEvent::CountryFinished { country, status: Status::Skipped });
                report.status = CountryStatus::Skipped(reason);
                return Ok(Flow::Finished);
            }
        };
        if let Some(epsg) = raster.grid().epsg.filter(|&e| e != GEOGRAPHIC_EPSG) {
            warn!("{country}: raster CRS EPSG:{epsg} differs from geometry CRS EPSG:{GEOGRAPHIC_EPSG}");
        }

        doc.start_country(country);
        record(sink, doc, &ProgressEvent::CountryStarted { country });

        let levels = store.levels(country)?;
        debug!("{country}: levels {levels:?}");
        for &level in levels.iter().filter(|&&l| self.config.aggregates_level(l)) {
            if self.interrupted() {
                return Ok(Flow::Interrupted);
            }
            if doc.level_done(country, level) {
                info!("{country} level {level}: already done");
                report.levels_skipped += 1;
                continue;
            }
            if self.run_level(country, level, store, raster.as_mut(), sink, doc, report)? == Flow::Interrupted {
                return Ok(Flow::Interrupted);
            }
        }

        // Coarser levels summed from children, finest first so stacked
        // rollups see their children's fresh values.
        let mut rollups = self.config.rollup_levels.clone();
        rollups.sort_unstable_by(|a, b| b.cmp(a));
        rollups.dedup();
        for level in rollups {
            if self.config.level_filter.as_ref().is_some_and(|f| !f.contains(&level)) {
                continue;
            }
            if self.interrupted() {
                return Ok(Flow::Interrupted);
            }
            if doc.level_done(country, level) {
                report.levels_skipped += 1;
                continue;
            }
            let out = rollup_parent_level(store, country, level, self.config.population_year)?;
            report.rolled_up += out.updated;
            report.rows_updated += out.updated;
            doc.mark_chunk_done(country, level, 0, out.updated);
            doc.mark_level_done(country, level);
            record(sink, doc, &ProgressEvent::LevelDone { country, level });
        }

        let checks = check_country(store, country, self.config.validation_tolerance)?;
        report.validation_warnings = checks.iter().filter(|c| c.report.verdict == Verdict::Warning).count();

        // A filtered run leaves other levels pending; the country stays in
        // progress so a later run picks them up.
        if !doc.levels_done(country, &levels) {
            report.status = CountryStatus::Partial;
            record(sink, doc, &ProgressEvent::CountryFinished { country, status: Status::InProgress });
            info!("{country}: partial, {} rows updated this run", report.rows_updated);
            return Ok(Flow::Finished);
        }
        let total = doc.country_rows(country);
        doc.finish_country(country, total);
        record(sink, doc, &ProgressEvent::CountryFinished { country, status: Status::Done });
        info!("{country}: done, {} rows updated this run", report.rows_updated);
        Ok(Flow::Finished)
    }

    #[allow(clippy::too_many_arguments)]
    fn run_level<S, K>(
        &self,
        country: &str,
        level: u8,
        store: &mut S,
        raster: &mut dyn RasterSource,
        sink: &mut K,
        doc: &mut ProgressDocument,
        report: &mut CountryReport,
    ) -> Result<Flow, CountryError>
    where
        S: ChunkSource + PopulationWriter,
        K: CheckpointSink + ?Sized,
    {
        let chunk_size = self.config.chunk_size.max(1);
        let total = store.count(country, level)?;
        let n_chunks = total.div_ceil(chunk_size as u64);
        info!("{country} level {level}: {total} polygons in {n_chunks} chunks");
        let dropped = doc.align_chunk_size(country, level, chunk_size);
        if dropped > 0 {
            warn!("{country} level {level}: chunk size is now {chunk_size}, discarding {dropped} recorded chunks");
        }

        for idx in 0..n_chunks {
            if self.interrupted() {
                return Ok(Flow::Interrupted);
            }
            let chunk = u32::try_from(idx).unwrap_or(u32::MAX);
            if doc.chunk_done(country, level, chunk) {
                debug!("{country} level {level} chunk {chunk}: already done");
                report.chunks_skipped += 1;
                continue;
            }

            let rows = store.fetch(country, level, idx * chunk_size as u64, chunk_size)?;
            if rows.is_empty() {
                break;
            }
            let outcome = aggregate_chunk(&rows, raster, &self.config);
            let updated = store.write_populations(&outcome.values, self.config.population_year)?;

            report.absorb(&outcome, updated);
            doc.mark_chunk_done(country, level, chunk, updated);
            record(sink, doc, &ProgressEvent::ChunkDone { country, level, chunk, updated });
            info!(
                "{country} level {level} chunk {}/{n_chunks}: {} polygons, {updated} rows updated",
                idx + 1,
                rows.len()
            );

            if rows.len() < chunk_size {
                break;
            }
        }

        doc.mark_level_done(country, level);
        record(sink, doc, &ProgressEvent::LevelDone { country, level });
        Ok(Flow::Finished)
    }
}
