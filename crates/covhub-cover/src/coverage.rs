//! Per-file statement coverage summaries

use serde::Serialize;

use crate::error::CoverError;
use crate::profile::Profile;

/// Percentage shown when a file has no statements
pub const NOT_APPLICABLE: &str = "N/A";

/// Format a fraction as a one-decimal percentage, e.g. `0.5` as `50.0%`
pub fn percent_str(fraction: f64) -> String {
    format!("{:.1}%", fraction * 100.0)
}

/// Statement coverage of one file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Coverage {
    pub file_name: String,
    pub n_covered_stmts: i64,
    pub n_all_stmts: i64,
}

impl Coverage {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            ..Default::default()
        }
    }

    /// Covered fraction, `None` when the file has no statements
    pub fn ratio(&self) -> Option<f64> {
        if self.n_all_stmts == 0 {
            None
        } else {
            Some(self.n_covered_stmts as f64 / self.n_all_stmts as f64)
        }
    }

    pub fn percentage(&self) -> String {
        match self.ratio() {
            Some(ratio) => percent_str(ratio),
            None => NOT_APPLICABLE.to_string(),
        }
    }
}

/// Coverage summaries in profile file order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoverageList(Vec<Coverage>);

impl CoverageList {
    /// Fold a profile's blocks into one summary per file
    pub fn from_profile(profile: &Profile) -> Self {
        let list = profile
            .by_file()
            .into_iter()
            .map(|(file, blocks)| {
                let mut coverage = Coverage::new(file);
                for block in blocks {
                    let stmts = i64::from(block.num_stmt);
                    coverage.n_all_stmts += stmts;
                    if block.count > 0 {
                        coverage.n_covered_stmts += stmts;
                    }
                }
                coverage
            })
            .collect();
        Self(list)
    }

    /// Parse profile text and summarize it
    pub fn parse(text: &str) -> Result<Self, CoverError> {
        Ok(Self::from_profile(&Profile::parse(text)?))
    }

    /// Sum of every file's statements
    pub fn total(&self) -> Coverage {
        self.0.iter().fold(Coverage::new("Total"), |mut acc, c| {
            acc.n_covered_stmts += c.n_covered_stmts;
            acc.n_all_stmts += c.n_all_stmts;
            acc
        })
    }

    pub fn get(&self, file_name: &str) -> Option<&Coverage> {
        self.0.iter().find(|c| c.file_name == file_name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Coverage> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Coverage>> for CoverageList {
    fn from(list: Vec<Coverage>) -> Self {
        Self(list)
    }
}

impl<'a> IntoIterator for &'a CoverageList {
    type Item = &'a Coverage;
    type IntoIter = std::slice::Iter<'a, Coverage>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage_exact_ratio() {
        let c = Coverage {
            file_name: "fake-coverage".to_string(),
            n_covered_stmts: 200,
            n_all_stmts: 300,
        };
        assert_eq!(c.ratio(), Some(200.0 / 300.0));
        assert_eq!(c.percentage(), "66.7%");
    }

    #[test]
    fn test_percentage_without_statements() {
        let c = Coverage::new("empty.go");
        assert_eq!(c.ratio(), None);
        assert_eq!(c.percentage(), "N/A");
    }

    #[test]
    fn test_percent_str() {
        assert_eq!(percent_str(0.5), "50.0%");
        assert_eq!(percent_str(1.0), "100.0%");
        assert_eq!(percent_str(-0.25), "-25.0%");
    }

    #[test]
    fn test_fold_profile_per_file() {
        let text = "mode: count\n\
                    a.go:1.1,2.2 2 1\n\
                    a.go:3.1,4.2 3 0\n\
                    b.go:1.1,2.2 4 9\n";
        let list = CoverageList::parse(text).unwrap();

        assert_eq!(list.len(), 2);
        let a = list.get("a.go").unwrap();
        assert_eq!((a.n_covered_stmts, a.n_all_stmts), (2, 5));
        let b = list.get("b.go").unwrap();
        assert_eq!((b.n_covered_stmts, b.n_all_stmts), (4, 4));

        let total = list.total();
        assert_eq!((total.n_covered_stmts, total.n_all_stmts), (6, 9));
    }
}
