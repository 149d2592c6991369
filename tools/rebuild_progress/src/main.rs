/// Rebuild the aggregation progress file from the database: every
/// (country, level) with populated rows is merged into the existing file as
/// done, so the next run skips work that already landed even if the
/// original file was lost.
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use popgrid_core::checkpoint::{ProgressDocument, ProgressFile};
use popgrid_core::rebuild::rebuild_progress;
use popgrid_core::store::SqliteStore;
use popgrid_core::AggregationConfig;

#[derive(Parser, Debug)]
#[command(
    name = "rebuild-progress",
    about = "Rebuild the population progress file from populated rows"
)]
struct Args {
    /// Jurisdiction database (SQLite)
    #[arg(long, default_value = "data/jurisdictions.db")]
    db: PathBuf,

    /// Progress file to merge into (replaced atomically)
    #[arg(long, default_value = "data/population_progress.json")]
    progress: PathBuf,

    /// Engine config (JSON); only `sources` is used here
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level)).init();

    let config = match &args.config {
        Some(path) => AggregationConfig::from_file(path)?,
        None => AggregationConfig::default(),
    };
    let store = SqliteStore::open(&args.db)
        .with_context(|| format!("Cannot open {}", args.db.display()))?
        .with_sources(config.sources.clone());

    let file = ProgressFile::new(&args.progress);
    let mut doc = match file.load().with_context(|| format!("Cannot load {}", args.progress.display()))? {
        Some(doc) => {
            eprintln!("[rebuild] merging into {}", args.progress.display());
            doc
        }
        None => {
            eprintln!("[rebuild] no progress file at {}, creating one", args.progress.display());
            ProgressDocument::default()
        }
    };

    let rebuilt = rebuild_progress(&store, &mut doc).context("Failed to read populated levels")?;
    if rebuilt.is_empty() {
        eprintln!("[rebuild] no population data found, nothing to do");
        return Ok(());
    }

    eprintln!("{:<8} {:<16} {:>10} {:>9}", "Country", "New levels", "Rows", "Complete");
    eprintln!("{}", "-".repeat(46));
    for r in &rebuilt {
        let levels = r.levels.iter().map(|l| format!("adm{l}")).collect::<Vec<_>>().join(",");
        eprintln!("{:<8} {:<16} {:>10} {:>9}", r.country, levels, r.rows, if r.complete { "yes" } else { "no" });
    }
    eprintln!("{}", "-".repeat(46));

    file.save(&doc).with_context(|| format!("Cannot write {}", args.progress.display()))?;
    eprintln!(
        "[rebuild] {} countries, {} complete → {}",
        rebuilt.len(),
        rebuilt.iter().filter(|r| r.complete).count(),
        args.progress.display()
    );
    Ok(())
}
