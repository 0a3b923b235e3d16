//! Risk factor math and the weighted linear score.

use regex::RegexSet;
use strata_core::{RiskConfig, RiskFactors, RiskScore, RiskWeights, StrataError};

/// Magnitude blend of lines changed vs. files touched.
const LINES_SHARE: f64 = 0.7;
const FILES_SHARE: f64 = 0.3;

/// Turns factor values into a bounded [`RiskScore`].
///
/// # Examples
///
/// ```
/// use strata_analytics::RiskModel;
/// use strata_core::{RiskConfig, RiskFactors};
///
/// let model = RiskModel::from_config(&RiskConfig::default()).unwrap();
/// let quiet = model.score("c1", RiskFactors::default());
/// assert_eq!(quiet.score, 0.0);
///
/// let loud = model.score("c2", RiskFactors {
///     magnitude: 1.0, file_defects: 1.0, test_gap: 1.0, first_touch: 1.0, own_defects: 1.0,
/// });
/// assert!((loud.score - 100.0).abs() < 1e-9);
/// ```
#[derive(Debug, Clone)]
pub struct RiskModel {
    weights: RiskWeights,
    lines_cap: u32,
    files_cap: u32,
    test_patterns: RegexSet,
}

impl RiskModel {
    /// Build from the `[risk]` section.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Config`] for invalid test patterns.
    pub fn from_config(config: &RiskConfig) -> Result<Self, StrataError> {
        let test_patterns = RegexSet::new(&config.test_patterns)
            .map_err(|e| StrataError::Config(format!("risk.test_patterns: {e}")))?;
        Ok(Self {
            weights: config.weights,
            lines_cap: config.lines_cap.max(1),
            files_cap: config.files_cap.max(1),
            test_patterns,
        })
    }

    /// Whether `path` looks like a test file.
    pub fn is_test_file(&self, path: &str) -> bool {
        self.test_patterns.is_match(path)
    }

    /// Change magnitude: log-saturated lines blended with files touched.
    pub fn magnitude(&self, lines_changed: u32, files_touched: usize) -> f64 {
        let lines = (f64::from(lines_changed)).ln_1p() / f64::from(self.lines_cap).ln_1p();
        let files = files_touched as f64 / f64::from(self.files_cap);
        LINES_SHARE * lines.min(1.0) + FILES_SHARE * files.min(1.0)
    }

    /// Share of touched files without a paired test change.
    ///
    /// A commit touching no files has no gap; one touching only
    /// non-test files has the full gap.
    pub fn test_gap<'a>(&self, paths: impl IntoIterator<Item = &'a str>) -> f64 {
        let mut total = 0usize;
        let mut tests = 0usize;
        for path in paths {
            total += 1;
            if self.is_test_file(path) {
                tests += 1;
            }
        }
        if total == 0 {
            0.0
        } else {
            1.0 - tests as f64 / total as f64
        }
    }

    /// Weighted linear combination normalized into `[0, 100]`.
    pub fn score(&self, sha: &str, factors: RiskFactors) -> RiskScore {
        let w = &self.weights;
        let total = w.total();
        let weighted = w.magnitude * clamp01(factors.magnitude)
            + w.file_defects * clamp01(factors.file_defects)
            + w.test_gap * clamp01(factors.test_gap)
            + w.first_touch * clamp01(factors.first_touch)
            + w.own_defects * clamp01(factors.own_defects);
        let score = if total > 0.0 {
            (100.0 * weighted / total).clamp(0.0, 100.0)
        } else {
            0.0
        };
        RiskScore {
            sha: sha.to_string(),
            score,
            factors,
        }
    }
}

/// Lines later implicated by fixes, per line changed, capped at one.
///
/// # Examples
///
/// ```
/// use strata_analytics::own_defect_density;
///
/// assert_eq!(own_defect_density(10, 100), 0.1);
/// assert_eq!(own_defect_density(500, 100), 1.0);
/// assert_eq!(own_defect_density(0, 0), 0.0);
/// ```
pub fn own_defect_density(implicated_lines: u32, lines_changed: u32) -> f64 {
    if implicated_lines == 0 {
        0.0
    } else if lines_changed == 0 {
        1.0
    } else {
        (f64::from(implicated_lines) / f64::from(lines_changed)).min(1.0)
    }
}

fn clamp01(v: f64) -> f64 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, 1.0)
    }
}
