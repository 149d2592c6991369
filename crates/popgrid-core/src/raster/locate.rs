//! Finding and opening the raster for a country.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use super::geotiff::GeoTiffRaster;
use super::warp::ReprojectedRaster;
use super::{RasterSource, GEOGRAPHIC_EPSG};
use crate::config::RasterLayout;
use crate::error::RasterError;

/// Why a country has no raster to aggregate against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    RasterNotFound,
    NoCoverage,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::RasterNotFound => "raster_not_found",
            SkipReason::NoCoverage => "no_coverage",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of looking a country up on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Located {
    Found {
        path: PathBuf,
        /// Country whose raster stands in, when a fallback was used.
        via: Option<String>,
    },
    Missing(SkipReason),
}

/// Result of opening a country's raster.
pub enum Opened {
    Raster(Box<dyn RasterSource>),
    Skipped(SkipReason),
}

/// Supplies the raster for each country the pipeline visits.
pub trait RasterProvider {
    fn open(&mut self, country: &str) -> Result<Opened, RasterError>;
}

/// Per-country GeoTIFFs under one root directory.
#[derive(Debug, Clone)]
pub struct RasterDirectory {
    layout: RasterLayout,
}

impl RasterDirectory {
    pub fn new(layout: RasterLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &RasterLayout {
        &self.layout
    }

    /// `<root>/<iso>/<pattern>`, else the first `*.tif` in `<root>/<iso>/`.
    fn in_country_dir(&self, iso3: &str) -> Option<PathBuf> {
        let dir = self.layout.root.join(iso3.to_lowercase());
        let expected = dir.join(self.layout.file_name(iso3));
        if expected.is_file() {
            return Some(expected);
        }
        first_tif(&dir)
    }

    pub fn locate(&self, iso3: &str) -> Located {
        let iso3 = iso3.to_uppercase();
        if self.layout.no_coverage.iter().any(|c| c.eq_ignore_ascii_case(&iso3)) {
            return Located::Missing(SkipReason::NoCoverage);
        }
        if let Some(path) = self.in_country_dir(&iso3) {
            return Located::Found { path, via: None };
        }
        if let Some(other) = self.layout.fallbacks.get(&iso3) {
            if let Some(path) = self.in_country_dir(other) {
                return Located::Found { path, via: Some(other.clone()) };
            }
        }
        Located::Missing(SkipReason::RasterNotFound)
    }
}

fn first_tif(dir: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(dir).ok()?;
    let mut tifs: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("tif")))
        .collect();
    tifs.sort();
    tifs.into_iter().next()
}

impl RasterProvider for RasterDirectory {
    fn open(&mut self, country: &str) -> Result<Opened, RasterError> {
        let (path, via) = match self.locate(country) {
            Located::Found { path, via } => (path, via),
            Located::Missing(reason) => return Ok(Opened::Skipped(reason)),
        };
        match &via {
            Some(other) => info!("{country}: using {other} raster {}", path.display()),
            None => info!("{country}: raster {}", path.display()),
        }

        let raster = GeoTiffRaster::open(&path)?;
        match raster.grid().epsg {
            Some(GEOGRAPHIC_EPSG) => Ok(Opened::Raster(Box::new(raster))),
            Some(epsg) => {
                warn!("{country}: raster CRS is EPSG:{epsg}, reprojecting to EPSG:{GEOGRAPHIC_EPSG}");
                Ok(Opened::Raster(Box::new(ReprojectedRaster::new(raster)?)))
            }
            None => {
                warn!("{country}: raster declares no CRS, assuming EPSG:{GEOGRAPHIC_EPSG}");
                Ok(Opened::Raster(Box::new(raster)))
            }
        }
    }
}
