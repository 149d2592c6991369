//! Resumable progress: a typed Country → Level → Chunk document and the sink
//! that persists it.
//!
//! Only completed work is recorded at chunk granularity. A chunk entry marked
//! done means its bulk update committed, so a resumed run skips it without
//! reading or writing anything.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    InProgress,
    Done,
    Skipped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub status: Status,
    /// Rows the bulk update changed.
    pub updated: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default)]
    pub updated: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Rows per chunk the `chunks` indices were computed with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub chunks: BTreeMap<u32, ChunkEntry>,
}

impl LevelProgress {
    pub fn is_done(&self) -> bool {
        self.status == Some(Status::Done)
    }

    /// Rows changed across all recorded chunks.
    pub fn chunk_rows(&self) -> usize {
        self.chunks.values().map(|c| c.updated).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryProgress {
    pub status: Status,
    #[serde(default)]
    pub updated: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub levels: BTreeMap<u8, LevelProgress>,
}

impl CountryProgress {
    fn new(status: Status) -> Self {
        Self {
            status,
            updated: 0,
            reason: None,
            error: None,
            timestamp: Utc::now(),
            levels: BTreeMap::new(),
        }
    }
}

/// The whole progress file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressDocument {
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub countries: BTreeMap<String, CountryProgress>,
}

impl Default for ProgressDocument {
    fn default() -> Self {
        Self { started_at: Utc::now(), countries: BTreeMap::new() }
    }
}

impl ProgressDocument {
    pub fn country(&self, country: &str) -> Option<&CountryProgress> {
        self.countries.get(country)
    }

    pub fn country_status(&self, country: &str) -> Option<Status> {
        self.countries.get(country).map(|c| c.status)
    }

    pub fn level(&self, country: &str, level: u8) -> Option<&LevelProgress> {
        self.countries.get(country)?.levels.get(&level)
    }

    pub fn level_done(&self, country: &str, level: u8) -> bool {
        self.level(country, level).is_some_and(LevelProgress::is_done)
    }

    pub fn chunk_done(&self, country: &str, level: u8, chunk: u32) -> bool {
        self.level(country, level)
            .and_then(|l| l.chunks.get(&chunk))
            .is_some_and(|c| c.status == Status::Done)
    }

    fn country_mut(&mut self, country: &str) -> &mut CountryProgress {
        self.countries
            .entry(country.to_string())
            .or_insert_with(|| CountryProgress::new(Status::Pending))
    }

    fn level_mut(&mut self, country: &str, level: u8) -> &mut LevelProgress {
        self.country_mut(country).levels.entry(level).or_default()
    }

    /// Enter a country. Chunk and level entries from an earlier attempt are
    /// kept so the run resumes where it stopped.
    pub fn start_country(&mut self, country: &str) {
        let entry = self.country_mut(country);
        entry.status = Status::InProgress;
        entry.reason = None;
        entry.error = None;
        entry.timestamp = Utc::now();
    }

    /// Bind the level's chunk indices to `chunk_size`. Entries recorded
    /// under another size, or under no recorded size, name other rows, so
    /// they are dropped and the level restarts from chunk 0. Returns the
    /// number of entries dropped.
    pub fn align_chunk_size(&mut self, country: &str, level: u8, chunk_size: usize) -> usize {
        let lp = self.level_mut(country, level);
        let mut dropped = 0;
        if lp.chunk_size != Some(chunk_size) {
            dropped = lp.chunks.len();
            lp.chunks.clear();
            lp.chunk_size = Some(chunk_size);
        }
        dropped
    }

    /// Every one of `levels` is done for `country`.
    pub fn levels_done(&self, country: &str, levels: &[u8]) -> bool {
        levels.iter().all(|&l| self.level_done(country, l))
    }

    pub fn mark_chunk_done(&mut self, country: &str, level: u8, chunk: u32, updated: usize) {
        let entry = ChunkEntry { status: Status::Done, updated, timestamp: Utc::now() };
        self.level_mut(country, level).chunks.insert(chunk, entry);
    }

    pub fn mark_level_done(&mut self, country: &str, level: u8) {
        let lp = self.level_mut(country, level);
        lp.status = Some(Status::Done);
        lp.updated = lp.chunk_rows();
        lp.timestamp = Some(Utc::now());
    }

    /// Mark a level done from rows already populated in the store, with no
    /// chunk history behind it.
    pub fn mark_level_rebuilt(&mut self, country: &str, level: u8, rows: usize) {
        let lp = self.level_mut(country, level);
        lp.status = Some(Status::Done);
        lp.updated = rows;
        lp.timestamp = Some(Utc::now());
        lp.chunk_size = None;
        lp.chunks.clear();
    }

    /// Mark a country as finished. `updated` is the total across its levels.
    pub fn finish_country(&mut self, country: &str, updated: usize) {
        let entry = self.country_mut(country);
        entry.status = Status::Done;
        entry.updated = updated;
        entry.timestamp = Utc::now();
    }

    pub fn skip_country(&mut self, country: &str, reason: &str) {
        let entry = self.country_mut(country);
        entry.status = Status::Skipped;
        entry.reason = Some(reason.to_string());
        entry.timestamp = Utc::now();
    }

    pub fn fail_country(&mut self, country: &str, error: &str) {
        let entry = self.country_mut(country);
        entry.status = Status::Error;
        entry.error = Some(error.to_string());
        entry.timestamp = Utc::now();
    }

    /// Rows changed for `country` across every recorded level.
    pub fn country_rows(&self, country: &str) -> usize {
        self.country(country)
            .map(|c| c.levels.values().map(|l| l.chunk_rows().max(l.updated)).sum())
            .unwrap_or(0)
    }
}

// ── Sink ──────────────────────────────────────────────────────────────────────

/// A progress transition, reported after the document has been updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent<'a> {
    CountryStarted { country: &'a str },
    ChunkDone { country: &'a str, level: u8, chunk: u32, updated: usize },
    LevelDone { country: &'a str, level: u8 },
    CountryFinished { country: &'a str, status: Status },
}

/// Where progress goes. Implementations decide how often to persist; the
/// pipeline calls [`CheckpointSink::flush`] before returning on interrupt.
pub trait CheckpointSink {
    fn record(&mut self, doc: &ProgressDocument, event: &ProgressEvent<'_>) -> Result<(), CheckpointError>;

    fn flush(&mut self, _doc: &ProgressDocument) -> Result<(), CheckpointError> {
        Ok(())
    }
}

/// Persists the document to a JSON file on every event.
#[derive(Debug, Clone)]
pub struct ProgressFile {
    path: PathBuf,
}

impl ProgressFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document, or `None` when the file does not exist yet.
    pub fn load(&self) -> Result<Option<ProgressDocument>, CheckpointError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CheckpointError::Io { path: self.path.clone(), source }),
        }
    }

    /// Write `<file>.tmp`, then rename over `<file>`.
    pub fn save(&self, doc: &ProgressDocument) -> Result<(), CheckpointError> {
        save_atomic(&self.path, doc)
    }
}

impl CheckpointSink for ProgressFile {
    fn record(&mut self, doc: &ProgressDocument, _event: &ProgressEvent<'_>) -> Result<(), CheckpointError> {
        self.save(doc)
    }

    fn flush(&mut self, doc: &ProgressDocument) -> Result<(), CheckpointError> {
        self.save(doc)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

pub fn save_atomic(path: &Path, doc: &ProgressDocument) -> Result<(), CheckpointError> {
    let io_err = |source| CheckpointError::Io { path: path.to_path_buf(), source };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp = tmp_path(path);
    let json = serde_json::to_string_pretty(doc)?;
    let mut file = File::create(&tmp).map_err(io_err)?;
    file.write_all(json.as_bytes()).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    drop(file);
    fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}
