//! Coverage report structures and their persisted JSON layout.
//!
//! The serialized document is stable: file keys sort lexicographically
//! (a `BTreeMap`), line numbers serialize as ascending arrays, and
//! branches as ascending `[src, dst]` pairs.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Report metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    /// Producing software.
    pub software: String,
    /// Engine version.
    pub version: String,
    /// Whether branch coverage was collected.
    pub branch_coverage: bool,
    /// Host platform.
    pub platform: String,
}

impl Meta {
    /// Metadata for this engine build.
    #[must_use]
    pub fn current(branch_coverage: bool) -> Self {
        Self {
            software: "wispcover".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            branch_coverage,
            platform: std::env::consts::OS.to_string(),
        }
    }
}

/// Aggregated probe counters for one file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStats {
    /// Probes created.
    pub probes: u32,
    /// Probes removed (by a deinstrument round or in place).
    pub removed: u32,
    /// Total probe firings.
    pub hits: u64,
    /// Firings while still instrumented, after the first.
    pub d_misses: u64,
    /// Firings after removal (dormant frames on old code).
    pub u_misses: u64,
}

/// Per-file summary counts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Lines executed.
    pub covered_lines: usize,
    /// Lines not executed.
    pub missing_lines: usize,
    /// Branches executed (branch mode only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub covered_branches: Option<usize>,
    /// Branches not executed (branch mode only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_branches: Option<usize>,
    /// Percent of lines (and branches) covered.
    pub percent_covered: f64,
}

/// Coverage data for one source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileCoverage {
    /// Executed lines, ascending.
    pub executed_lines: Vec<u32>,
    /// Instrumentable lines never executed, ascending.
    pub missing_lines: Vec<u32>,
    /// Executed branch edges, ascending (branch mode only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub executed_branches: Option<Vec<(u32, u32)>>,
    /// Possible branch edges never executed (branch mode only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_branches: Option<Vec<(u32, u32)>>,
    /// Aggregated probe counters, when stats collection is on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<FileStats>,
    /// Per-file summary.
    pub summary: Summary,
}

impl FileCoverage {
    /// Build a file entry, sorting inputs and computing its summary.
    #[must_use]
    pub fn new(
        mut executed_lines: Vec<u32>,
        mut missing_lines: Vec<u32>,
        branches: Option<(Vec<(u32, u32)>, Vec<(u32, u32)>)>,
        stats: Option<FileStats>,
    ) -> Self {
        executed_lines.sort_unstable();
        missing_lines.sort_unstable();

        let (executed_branches, missing_branches) = match branches {
            Some((mut executed, mut missing)) => {
                executed.sort_unstable();
                missing.sort_unstable();
                (Some(executed), Some(missing))
            }
            None => (None, None),
        };

        let summary = summarize(
            executed_lines.len(),
            missing_lines.len(),
            executed_branches.as_ref().map(Vec::len),
            missing_branches.as_ref().map(Vec::len),
        );

        Self {
            executed_lines,
            missing_lines,
            executed_branches,
            missing_branches,
            stats,
            summary,
        }
    }
}

/// A complete coverage report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    /// Report metadata.
    pub meta: Meta,
    /// Per-file coverage, keyed by filename.
    pub files: BTreeMap<String, FileCoverage>,
    /// Whole-run summary.
    pub summary: Summary,
}

impl CoverageReport {
    /// Assemble a report from per-file entries.
    #[must_use]
    pub fn new(meta: Meta, files: BTreeMap<String, FileCoverage>) -> Self {
        let mut covered_lines = 0;
        let mut missing_lines = 0;
        let mut covered_branches = 0;
        let mut missing_branches = 0;
        let mut any_branches = false;

        for f in files.values() {
            covered_lines += f.summary.covered_lines;
            missing_lines += f.summary.missing_lines;
            if let (Some(cb), Some(mb)) = (f.summary.covered_branches, f.summary.missing_branches)
            {
                any_branches = true;
                covered_branches += cb;
                missing_branches += mb;
            }
        }

        let summary = summarize(
            covered_lines,
            missing_lines,
            any_branches.then_some(covered_branches),
            any_branches.then_some(missing_branches),
        );

        Self {
            meta,
            files,
            summary,
        }
    }

    /// Serialize to the persisted JSON layout.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

fn summarize(
    covered_lines: usize,
    missing_lines: usize,
    covered_branches: Option<usize>,
    missing_branches: Option<usize>,
) -> Summary {
    let mut nom = covered_lines;
    let mut den = covered_lines + missing_lines;
    if let (Some(cb), Some(mb)) = (covered_branches, missing_branches) {
        nom += cb;
        den += cb + mb;
    }
    Summary {
        covered_lines,
        missing_lines,
        covered_branches,
        missing_branches,
        percent_covered: if den == 0 {
            100.0
        } else {
            100.0 * nom as f64 / den as f64
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_coverage_sorted() {
        let f = FileCoverage::new(vec![3, 1, 2], vec![6, 5], None, None);
        assert_eq!(f.executed_lines, vec![1, 2, 3]);
        assert_eq!(f.missing_lines, vec![5, 6]);
        assert_eq!(f.summary.covered_lines, 3);
        assert!((f.summary.percent_covered - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_branch_summary_math() {
        let f = FileCoverage::new(
            vec![1, 2],
            vec![],
            Some((vec![(1, 2)], vec![(1, 0)])),
            None,
        );
        // (2 lines + 1 branch) / (2 lines + 2 branches)
        assert!((f.summary.percent_covered - 75.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_report_is_fully_covered() {
        let report = CoverageReport::new(Meta::current(false), BTreeMap::new());
        assert!((report.summary.percent_covered - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_json_layout() {
        let mut files = BTreeMap::new();
        files.insert(
            "b.wsp".to_string(),
            FileCoverage::new(vec![1], vec![2], None, None),
        );
        files.insert(
            "a.wsp".to_string(),
            FileCoverage::new(vec![3], vec![], None, None),
        );
        let report = CoverageReport::new(Meta::current(false), files);
        let json = report.to_json().unwrap();

        // File keys sort lexicographically.
        let a_pos = json.find("a.wsp").unwrap();
        let b_pos = json.find("b.wsp").unwrap();
        assert!(a_pos < b_pos);
        assert!(json.contains("\"software\": \"wispcover\""));
        // Branch fields absent in line mode.
        assert!(!json.contains("executed_branches"));
    }

    #[test]
    fn test_json_roundtrip() {
        let mut files = BTreeMap::new();
        files.insert(
            "a.wsp".to_string(),
            FileCoverage::new(
                vec![1, 2, 3],
                vec![4],
                Some((vec![(2, 3)], vec![(2, 0)])),
                Some(FileStats {
                    probes: 4,
                    removed: 2,
                    hits: 10,
                    d_misses: 5,
                    u_misses: 1,
                }),
            ),
        );
        let report = CoverageReport::new(Meta::current(true), files);
        let json = report.to_json().unwrap();
        let back: CoverageReport = serde_json::from_str(&json).unwrap();
        assert_eq!(report, back);
    }
}
