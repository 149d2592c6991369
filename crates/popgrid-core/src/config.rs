//! Tunables for the aggregation engine and raster lookup.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::store::DEFAULT_CHUNK_LIMIT;

// ── Engine tunables ───────────────────────────────────────────────────────────

/// Engine parameters passed to [`crate::Pipeline`] at construction.
///
/// The footprint threshold and tile size were tuned against 100 m country
/// rasters; other resolutions or memory ceilings need different values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Polygons fetched, aggregated, written and checkpointed together.
    pub chunk_size: usize,
    /// Polygons per standard-path sub-batch; the unit of partial failure.
    pub batch_size: usize,
    /// Bounding-box pixel estimate at which a polygon moves to the tiled path.
    /// 400 MP ≈ 20 000 × 20 000 pixels.
    pub max_bbox_pixels: u64,
    /// Edge length of one tiled-path window, in pixels.
    /// 5000 × 5000 × 4 bytes ≈ 100 MB per tile.
    pub tile_pixels: usize,
    /// Relative national-vs-children delta above which a warning is logged.
    pub validation_tolerance: f64,
    /// Stamped into `population_year` alongside every written value.
    pub population_year: i32,
    /// Store `source` tags whose rows take part in aggregation.
    pub sources: Vec<String>,
    /// Levels whose values come from summing children instead of the raster.
    pub rollup_levels: Vec<u8>,
    /// Restrict direct aggregation to these levels when set.
    pub level_filter: Option<Vec<u8>>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_LIMIT,
            batch_size: 50,
            max_bbox_pixels: 400_000_000,
            tile_pixels: 5000,
            validation_tolerance: 0.05,
            population_year: 2023,
            sources: vec!["geoboundaries".into(), "synthetic".into()],
            rollup_levels: Vec::new(),
            level_filter: None,
        }
    }
}

impl AggregationConfig {
    /// Read a JSON config file; missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Zero("chunk_size"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero("batch_size"));
        }
        if self.tile_pixels == 0 {
            return Err(ConfigError::Zero("tile_pixels"));
        }
        if self.max_bbox_pixels == 0 {
            return Err(ConfigError::Zero("max_bbox_pixels"));
        }
        if !self.validation_tolerance.is_finite() || self.validation_tolerance < 0.0 {
            return Err(ConfigError::Tolerance(self.validation_tolerance));
        }
        Ok(())
    }

    /// Whether `level` should be aggregated from the raster in this run.
    pub fn aggregates_level(&self, level: u8) -> bool {
        if self.rollup_levels.contains(&level) {
            return false;
        }
        match &self.level_filter {
            Some(levels) => levels.contains(&level),
            None => true,
        }
    }
}

// ── Raster layout ─────────────────────────────────────────────────────────────

/// Where per-country rasters live and which countries borrow another's.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RasterLayout {
    pub root: PathBuf,
    /// File name inside `<root>/<iso3 lower>/`; `{iso}` expands to the
    /// lower-case ISO3 code.
    pub file_pattern: String,
    /// Country → country whose raster covers it (enclaves, disputed areas).
    pub fallbacks: BTreeMap<String, String>,
    /// Countries with no raster at all; skipped without a lookup.
    pub no_coverage: Vec<String>,
}

impl Default for RasterLayout {
    fn default() -> Self {
        let mut fallbacks = BTreeMap::new();
        // VAT is enclosed by Italy; XKX is covered by the Serbian raster.
        fallbacks.insert("VAT".to_string(), "ITA".to_string());
        fallbacks.insert("XKX".to_string(), "SRB".to_string());
        Self {
            root: PathBuf::from("/docs/worldpop_100m_latest"),
            file_pattern: "{iso}_pop_2023_CN_100m_R2025A_v1.tif".to_string(),
            fallbacks,
            no_coverage: vec!["ATA".to_string()],
        }
    }
}

impl RasterLayout {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), ..Self::default() }
    }

    pub fn file_name(&self, iso3: &str) -> String {
        self.file_pattern.replace("{iso}", &iso3.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AggregationConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_LIMIT);
        assert_eq!(config.chunk_size, 2000);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.max_bbox_pixels, 400_000_000);
        assert_eq!(config.tile_pixels, 5000);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: AggregationConfig =
            serde_json::from_str(r#"{"chunk_size": 10, "rollup_levels": [1]}"#).unwrap();
        assert_eq!(config.chunk_size, 10);
        assert_eq!(config.batch_size, 50);
        assert!(!config.aggregates_level(1));
        assert!(config.aggregates_level(2));
    }

    #[test]
    fn zero_sizes_rejected() {
        let config = AggregationConfig { tile_pixels: 0, ..AggregationConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Zero("tile_pixels"))));
    }

    #[test]
    fn level_filter_limits_levels() {
        let config = AggregationConfig {
            level_filter: Some(vec![3]),
            ..AggregationConfig::default()
        };
        assert!(config.aggregates_level(3));
        assert!(!config.aggregates_level(2));
    }

    #[test]
    fn file_name_uses_lower_case_iso() {
        let layout = RasterLayout::default();
        assert_eq!(layout.file_name("NZL"), "nzl_pop_2023_CN_100m_R2025A_v1.tif");
    }
}
