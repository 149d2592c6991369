/// Population aggregation runner: sums per-country population rasters onto
/// the administrative polygons of a jurisdiction database, resuming from a
/// progress file after interruption.
use std::fs;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use popgrid_core::checkpoint::{ProgressDocument, ProgressFile};
use popgrid_core::raster::locate::RasterDirectory;
use popgrid_core::store::{ChunkSource, SqliteStore};
use popgrid_core::{AggregationConfig, Pipeline, RasterLayout};

// ── CLI ──────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "popgrid-aggregate",
    about = "Aggregate population rasters onto administrative polygons"
)]
struct Args {
    /// Jurisdiction database (SQLite)
    #[arg(long, default_value = "data/jurisdictions.db")]
    db: PathBuf,

    /// Root directory of per-country rasters (`<root>/<iso3>/*.tif`)
    #[arg(long)]
    raster_root: Option<PathBuf>,

    /// Progress file used to resume interrupted runs
    #[arg(long, default_value = "data/population_progress.json")]
    progress: PathBuf,

    /// Comma-separated ISO3 codes (default: every country in the database)
    #[arg(long, value_delimiter = ',')]
    countries: Vec<String>,

    /// Comma-separated administrative levels to aggregate directly
    #[arg(long, value_delimiter = ',')]
    levels: Vec<u8>,

    /// Ignore the existing progress file and start over
    #[arg(long)]
    fresh: bool,

    /// Engine config (JSON); flags below override individual fields
    #[arg(long)]
    config: Option<PathBuf>,

    /// Raster layout (JSON): file pattern, fallbacks, no-coverage list
    #[arg(long)]
    layout: Option<PathBuf>,

    #[arg(long)]
    chunk_size: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Bounding-box pixel estimate at which polygons use the tiled path
    #[arg(long)]
    max_bbox_pixels: Option<u64>,

    #[arg(long)]
    tile_pixels: Option<usize>,

    /// National vs children tolerance, as a fraction (0.05 = 5%)
    #[arg(long)]
    tolerance: Option<f64>,

    /// Comma-separated levels computed by summing children
    #[arg(long, value_delimiter = ',')]
    rollup_levels: Vec<u8>,

    #[arg(long)]
    year: Option<i32>,

    /// Log filter when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn engine_config(&self) -> Result<AggregationConfig> {
        let mut config = match &self.config {
            Some(path) => AggregationConfig::from_file(path)?,
            None => AggregationConfig::default(),
        };
        if let Some(v) = self.chunk_size {
            config.chunk_size = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.max_bbox_pixels {
            config.max_bbox_pixels = v;
        }
        if let Some(v) = self.tile_pixels {
            config.tile_pixels = v;
        }
        if let Some(v) = self.tolerance {
            config.validation_tolerance = v;
        }
        if let Some(v) = self.year {
            config.population_year = v;
        }
        if !self.rollup_levels.is_empty() {
            config.rollup_levels = self.rollup_levels.clone();
        }
        if !self.levels.is_empty() {
            config.level_filter = Some(self.levels.clone());
        }
        config.validate().context("Invalid engine config")?;
        Ok(config)
    }

    fn raster_layout(&self) -> Result<RasterLayout> {
        let mut layout = match &self.layout {
            Some(path) => {
                let text = fs::read_to_string(path)
                    .with_context(|| format!("Cannot read {}", path.display()))?;
                serde_json::from_str(&text)
                    .with_context(|| format!("Failed to parse {}", path.display()))?
            }
            None => RasterLayout::default(),
        };
        if let Some(root) = &self.raster_root {
            layout.root = root.clone();
        }
        Ok(layout)
    }
}

fn load_progress(file: &ProgressFile, fresh: bool) -> Result<ProgressDocument> {
    if fresh {
        info!("starting fresh; ignoring {}", file.path().display());
        return Ok(ProgressDocument::default());
    }
    match file.load().with_context(|| format!("Cannot load {}", file.path().display()))? {
        Some(doc) => {
            info!("resuming from {} ({} countries recorded)", file.path().display(), doc.countries.len());
            Ok(doc)
        }
        None => Ok(ProgressDocument::default()),
    }
}

/// First Ctrl-C / SIGTERM asks the pipeline to stop after the current chunk;
/// a second one exits immediately. The progress file is rewritten after every
/// committed chunk, so a hard exit loses at most the chunk in flight, which
/// the next run redoes.
fn install_interrupt(flag: Arc<AtomicBool>) -> Result<()> {
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            eprintln!("\n[popgrid] second interrupt, exiting; progress stands at the last committed chunk");
            process::exit(130);
        }
        eprintln!("\n[popgrid] interrupt received, finishing current chunk");
    })
    .context("Failed to install signal handler")
}

fn check_inputs(db: &Path, layout: &RasterLayout) -> Result<()> {
    anyhow::ensure!(db.is_file(), "Database not found: {}", db.display());
    if !layout.root.is_dir() {
        warn!("raster root {} does not exist; every country will be skipped", layout.root.display());
    }
    Ok(())
}

// ── Main ─────────────────────────────────────────────────────────────────────

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level)).init();

    let config = args.engine_config()?;
    let layout = args.raster_layout()?;
    check_inputs(&args.db, &layout)?;

    let mut store = SqliteStore::open(&args.db)
        .with_context(|| format!("Cannot open {}", args.db.display()))?
        .with_sources(config.sources.clone());
    let countries = if args.countries.is_empty() {
        store.countries().context("Failed to list countries")?
    } else {
        args.countries.iter().map(|c| c.to_uppercase()).collect()
    };

    let mut progress = ProgressFile::new(&args.progress);
    let mut doc = load_progress(&progress, args.fresh)?;
    let mut rasters = RasterDirectory::new(layout);

    let pipeline = Pipeline::new(config);
    install_interrupt(pipeline.interrupt_handle())?;

    eprintln!(
        "[popgrid] {} countries, chunk {}, batch {}, tiled at {} px",
        countries.len(),
        pipeline.config().chunk_size,
        pipeline.config().batch_size,
        pipeline.config().max_bbox_pixels
    );
    let summary = pipeline.run(&mut store, &mut rasters, &mut progress, &mut doc, &countries);

    eprintln!();
    eprintln!("{summary}");
    eprintln!("[popgrid] progress: {}", args.progress.display());

    if summary.interrupted {
        process::exit(130);
    }
    Ok(())
}
