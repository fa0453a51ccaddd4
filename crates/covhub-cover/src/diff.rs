//! Diff engine
//!
//! Compares a new coverage summary against a baseline file by file.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::coverage::{percent_str, Coverage, CoverageList};

/// Percentage shown for a file missing from one side
pub const NONE_PERCENTAGE: &str = "None";

/// File name of the aggregate row
pub const TOTAL_ROW: &str = "Total";

/// Delta of a file whose coverage did not move
const UNCHANGED_DELTA: &str = "0.0%";

/// One row of a coverage comparison
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeltaCov {
    pub file_name: String,
    pub base_percentage: String,
    pub new_percentage: String,
    pub delta_percentage: String,
}

/// Compare `new` against `base`
///
/// Rows come out in byte-wise file name order followed by a `Total` row.
/// Files whose percentage did not change are left out, unless `restrict_to`
/// is given: then only files matching one of its entries are considered and
/// all of them are shown.
pub fn diff(
    new: &CoverageList,
    base: &CoverageList,
    restrict_to: Option<&[String]>,
) -> Vec<DeltaCov> {
    let restrict: Option<Vec<&str>> = restrict_to.map(|entries| {
        entries
            .iter()
            .map(|e| normalize_entry(e))
            .filter(|e| !e.is_empty())
            .collect()
    });
    let considered = |file: &str| match &restrict {
        Some(entries) => entries
            .iter()
            .any(|entry| file == *entry || file.starts_with(entry)),
        None => true,
    };

    let mut pairs: BTreeMap<&str, (Option<&Coverage>, Option<&Coverage>)> = BTreeMap::new();
    for c in new.iter().filter(|c| considered(&c.file_name)) {
        pairs.entry(c.file_name.as_str()).or_default().0 = Some(c);
    }
    for c in base.iter().filter(|c| considered(&c.file_name)) {
        pairs.entry(c.file_name.as_str()).or_default().1 = Some(c);
    }

    let mut rows = Vec::with_capacity(pairs.len() + 1);
    let mut new_total = Coverage::new(TOTAL_ROW);
    let mut base_total = Coverage::new(TOTAL_ROW);
    let mut new_seen = false;
    let mut base_seen = false;

    for (file, (n, b)) in pairs {
        if let Some(n) = n {
            new_seen = true;
            new_total.n_covered_stmts += n.n_covered_stmts;
            new_total.n_all_stmts += n.n_all_stmts;
        }
        if let Some(b) = b {
            base_seen = true;
            base_total.n_covered_stmts += b.n_covered_stmts;
            base_total.n_all_stmts += b.n_all_stmts;
        }

        let row = match (n, b) {
            (Some(n), Some(b)) => {
                let row = delta_row(file, b.percentage(), n.percentage(), ratio(n) - ratio(b));
                if restrict.is_none() && row.delta_percentage == UNCHANGED_DELTA {
                    continue;
                }
                row
            }
            (Some(n), None) => delta_row(file, NONE_PERCENTAGE.to_string(), n.percentage(), ratio(n)),
            (None, Some(b)) => delta_row(file, b.percentage(), NONE_PERCENTAGE.to_string(), -ratio(b)),
            (None, None) => continue,
        };
        rows.push(row);
    }

    if new_seen && base_seen {
        rows.push(delta_row(
            TOTAL_ROW,
            base_total.percentage(),
            new_total.percentage(),
            ratio(&new_total) - ratio(&base_total),
        ));
    }

    rows
}

fn normalize_entry(entry: &str) -> &str {
    let entry = entry.trim();
    entry.strip_prefix("./").unwrap_or(entry)
}

fn ratio(c: &Coverage) -> f64 {
    c.ratio().unwrap_or(0.0)
}

fn delta_row(file: &str, base: String, new: String, delta: f64) -> DeltaCov {
    // Avoid printing "-0.0%" for an unchanged total.
    let delta = if delta == 0.0 { 0.0 } else { delta };
    DeltaCov {
        file_name: file.to_string(),
        base_percentage: base,
        new_percentage: new,
        delta_percentage: percent_str(delta),
    }
}
