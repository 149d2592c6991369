//! Parent values from children, and the national-vs-children cross-check.

use std::collections::BTreeMap;

use log::{info, warn};

use crate::error::StoreError;
use crate::store::{Hierarchy, PopulationWriter};

/// National level in every hierarchy.
pub const NATIONAL_LEVEL: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Ok,
    Warning,
}

/// Direct aggregate compared against the sum of its children.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationReport {
    pub direct: u64,
    pub children_sum: u64,
    pub delta: i64,
    /// Percent of `children_sum`; 0 when the children sum to 0.
    pub delta_pct: f64,
    pub verdict: Verdict,
}

/// Compare `direct` against `children_sum`. Deltas beyond `tolerance`
/// (a fraction, 0.05 = 5 %) are a warning, never an error.
pub fn validate(direct: u64, children_sum: u64, tolerance: f64) -> ValidationReport {
    let delta = direct as i64 - children_sum as i64;
    let delta_pct = if children_sum == 0 {
        0.0
    } else {
        delta as f64 / children_sum as f64 * 100.0
    };
    let verdict = if delta_pct.abs() > tolerance * 100.0 {
        Verdict::Warning
    } else {
        Verdict::Ok
    };
    ValidationReport { direct, children_sum, delta, delta_pct, verdict }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollupOutcome {
    pub parents: usize,
    pub updated: usize,
    /// Parents left untouched because none of their children has a value.
    pub without_children: usize,
}

/// Set every polygon of `country` at `level` to the sum of its immediate
/// children's populations, in one bulk write.
pub fn rollup_parent_level<S: Hierarchy + PopulationWriter>(
    store: &mut S,
    country: &str,
    level: u8,
    year: i32,
) -> Result<RollupOutcome, StoreError> {
    let units = store.units(country, level)?;
    let mut out = RollupOutcome { parents: units.len(), ..RollupOutcome::default() };
    let mut values = BTreeMap::new();

    for unit in &units {
        let totals = store.child_totals(&unit.id)?;
        if totals.populated == 0 {
            out.without_children += 1;
            continue;
        }
        if totals.populated < totals.children {
            warn!(
                "{country} {}: only {} of {} children have a population",
                unit.id, totals.populated, totals.children
            );
        }
        values.insert(unit.id.clone(), totals.sum);
    }

    if out.without_children > 0 {
        warn!("{country} level {level}: {} polygons have no populated children", out.without_children);
    }
    out.updated = store.write_populations(&values, year)?;
    info!("{country} level {level}: rolled up {} of {} polygons", out.updated, out.parents);
    Ok(out)
}

/// One national polygon's cross-check.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitCheck {
    pub id: String,
    pub report: ValidationReport,
}

/// Compare each national polygon's stored value against its children.
/// Polygons without a value or without populated children are skipped.
pub fn check_country<S: Hierarchy>(store: &S, country: &str, tolerance: f64) -> Result<Vec<UnitCheck>, StoreError> {
    let mut checks = Vec::new();
    for unit in store.units(country, NATIONAL_LEVEL)? {
        let Some(direct) = unit.population else {
            continue;
        };
        let totals = store.child_totals(&unit.id)?;
        if totals.populated == 0 {
            continue;
        }
        let report = validate(direct, totals.sum, tolerance);
        match report.verdict {
            Verdict::Warning => warn!(
                "{country} {}: national {} vs children {} ({:+.1}%, tolerance {:.1}%)",
                unit.id,
                report.direct,
                report.children_sum,
                report.delta_pct,
                tolerance * 100.0
            ),
            Verdict::Ok => info!(
                "{country} {}: national {} vs children {} ({:+.1}%)",
                unit.id, report.direct, report.children_sum, report.delta_pct
            ),
        }
        checks.push(UnitCheck { id: unit.id, report });
    }
    Ok(checks)
}
