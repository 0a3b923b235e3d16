use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StrataError;
use crate::types::{MergePolicy, WindowBound};

/// Top-level configuration loaded from `.strata.toml`.
///
/// Supports layered resolution: CLI flags > local config > defaults.
///
/// # Examples
///
/// ```
/// use strata_core::StrataConfig;
///
/// let config = StrataConfig::default();
/// assert_eq!(config.scan.batch_size, 500);
/// assert_eq!(config.ownership.half_life_days, 180.0);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrataConfig {
    /// Scan and ingestion settings.
    #[serde(default)]
    pub scan: ScanConfig,
    /// Risk scoring settings.
    #[serde(default)]
    pub risk: RiskConfig,
    /// Ownership tracking settings.
    #[serde(default)]
    pub ownership: OwnershipConfig,
    /// Temporal coupling settings.
    #[serde(default)]
    pub coupling: CouplingConfig,
    /// Aggregate store settings.
    #[serde(default)]
    pub store: StoreConfig,
}

impl StrataConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Io`] if the file cannot be read, or
    /// [`StrataError::Toml`] if the content is not valid TOML.
    pub fn from_file(path: &Path) -> Result<Self, StrataError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Toml`] if parsing fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use strata_core::StrataConfig;
    ///
    /// let toml = r#"
    /// [scan]
    /// batch_size = 100
    /// "#;
    /// let config = StrataConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.scan.batch_size, 100);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, StrataError> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Reject values that would make a scan ambiguous or unbounded.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), StrataError> {
        self.scan.merge_policy()?;
        self.scan.window()?;
        if self.scan.batch_size == 0 {
            return Err(StrataError::Config("scan.batch_size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.scan.rename_threshold) {
            return Err(StrataError::Config(
                "scan.rename_threshold must be within [0, 1]".into(),
            ));
        }
        self.risk.weights.validate()?;
        if self.risk.lines_cap == 0 || self.risk.files_cap == 0 {
            return Err(StrataError::Config(
                "risk.lines_cap and risk.files_cap must be positive".into(),
            ));
        }
        if self.ownership.half_life_days <= 0.0 || self.coupling.half_life_days <= 0.0 {
            return Err(StrataError::Config("half_life_days must be positive".into()));
        }
        if self.ownership.coverage <= 0.0 || self.ownership.coverage >= 1.0 {
            return Err(StrataError::Config(
                "ownership.coverage must be strictly between 0 and 1".into(),
            ));
        }
        if self.coupling.top_k == 0 {
            return Err(StrataError::Config("coupling.top_k must be positive".into()));
        }
        Ok(())
    }
}

/// Scan and ingestion configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Commits folded per checkpointed batch (default: 500).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Diff worker threads; 0 uses every available core.
    #[serde(default)]
    pub workers: usize,
    /// Merge diff policy: `"first-parent"` or `"skip-merges"`.
    #[serde(default = "default_merge_policy")]
    pub merge_policy: String,
    /// Ref to walk (default: HEAD).
    pub branch: Option<String>,
    /// Only analyze commits within N days of the newest tip commit.
    pub window_days: Option<u64>,
    /// Only analyze the newest N commits.
    pub max_commits: Option<usize>,
    /// Per-commit diff budget in milliseconds (default: 2000).
    #[serde(default = "default_diff_budget_ms")]
    pub diff_budget_ms: u64,
    /// Per-commit blame budget in milliseconds (default: 5000).
    #[serde(default = "default_blame_budget_ms")]
    pub blame_budget_ms: u64,
    /// Minimum share of unchanged lines for a rename continuation (default: 0.5).
    #[serde(default = "default_rename_threshold")]
    pub rename_threshold: f64,
    /// Commits touching more files add no coupling pairs (default: 50).
    #[serde(default = "default_max_files_per_commit")]
    pub max_files_per_commit: usize,
}

fn default_batch_size() -> usize {
    500
}

fn default_merge_policy() -> String {
    MergePolicy::FirstParent.to_string()
}

fn default_diff_budget_ms() -> u64 {
    2000
}

fn default_blame_budget_ms() -> u64 {
    5000
}

fn default_rename_threshold() -> f64 {
    0.5
}

fn default_max_files_per_commit() -> usize {
    50
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            workers: 0,
            merge_policy: default_merge_policy(),
            branch: None,
            window_days: None,
            max_commits: None,
            diff_budget_ms: default_diff_budget_ms(),
            blame_budget_ms: default_blame_budget_ms(),
            rename_threshold: default_rename_threshold(),
            max_files_per_commit: default_max_files_per_commit(),
        }
    }
}

impl ScanConfig {
    /// Parsed merge policy.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Config`] for any value other than the known
    /// policies; there is no silent fallback.
    ///
    /// # Examples
    ///
    /// ```
    /// use strata_core::{MergePolicy, ScanConfig};
    ///
    /// let mut scan = ScanConfig::default();
    /// assert_eq!(scan.merge_policy().unwrap(), MergePolicy::FirstParent);
    /// scan.merge_policy = "both".into();
    /// assert!(scan.merge_policy().is_err());
    /// ```
    pub fn merge_policy(&self) -> Result<MergePolicy, StrataError> {
        self.merge_policy
            .parse()
            .map_err(|e: String| StrataError::Config(format!("scan.merge_policy: {e}")))
    }

    /// Window bound, if one is configured.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Config`] when both a time and a count window
    /// are set.
    pub fn window(&self) -> Result<Option<WindowBound>, StrataError> {
        match (self.window_days, self.max_commits) {
            (Some(_), Some(n)) if n > 0 => Err(StrataError::Config(
                "set either scan.window_days or scan.max_commits, not both".into(),
            )),
            (Some(days), _) => Ok(Some(WindowBound::Days(days))),
            (None, Some(n)) if n > 0 => Ok(Some(WindowBound::Commits(n))),
            _ => Ok(None),
        }
    }
}

/// Risk scoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Factor weights.
    #[serde(default)]
    pub weights: RiskWeights,
    /// Lines changed at which the magnitude factor saturates (default: 400).
    #[serde(default = "default_lines_cap")]
    pub lines_cap: u32,
    /// Files touched at which the magnitude factor saturates (default: 20).
    #[serde(default = "default_files_cap")]
    pub files_cap: u32,
    /// Regexes identifying test files.
    #[serde(default = "default_test_patterns")]
    pub test_patterns: Vec<String>,
    /// Ordered bug-fix rules; replaces the built-in set when non-empty.
    #[serde(default)]
    pub fix_rules: Vec<FixRuleConfig>,
}

fn default_lines_cap() -> u32 {
    400
}

fn default_files_cap() -> u32 {
    20
}

fn default_test_patterns() -> Vec<String> {
    [
        r"(^|/)tests?/",
        r"(^|/)__tests__/",
        r"_test\.",
        r"\.test\.",
        r"\.spec\.",
        r"(^|/)test_",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            lines_cap: default_lines_cap(),
            files_cap: default_files_cap(),
            test_patterns: default_test_patterns(),
            fix_rules: Vec::new(),
        }
    }
}

/// Weights of the linear risk combination.
///
/// # Examples
///
/// ```
/// use strata_core::RiskWeights;
///
/// let w = RiskWeights::default();
/// assert!((w.total() - 1.0).abs() < 1e-12);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskWeights {
    /// Change magnitude weight.
    #[serde(default = "default_w_magnitude")]
    pub magnitude: f64,
    /// File defect history weight.
    #[serde(default = "default_w_file_defects")]
    pub file_defects: f64,
    /// Missing-test weight.
    #[serde(default = "default_w_test_gap")]
    pub test_gap: f64,
    /// First-touch weight.
    #[serde(default = "default_w_first_touch")]
    pub first_touch: f64,
    /// Own defect density weight.
    #[serde(default = "default_w_own_defects")]
    pub own_defects: f64,
}

fn default_w_magnitude() -> f64 {
    0.25
}

fn default_w_file_defects() -> f64 {
    0.20
}

fn default_w_test_gap() -> f64 {
    0.15
}

fn default_w_first_touch() -> f64 {
    0.15
}

fn default_w_own_defects() -> f64 {
    0.25
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            magnitude: default_w_magnitude(),
            file_defects: default_w_file_defects(),
            test_gap: default_w_test_gap(),
            first_touch: default_w_first_touch(),
            own_defects: default_w_own_defects(),
        }
    }
}

impl RiskWeights {
    /// Sum of all weights.
    pub fn total(&self) -> f64 {
        self.magnitude + self.file_defects + self.test_gap + self.first_touch + self.own_defects
    }

    fn validate(&self) -> Result<(), StrataError> {
        let all = [
            self.magnitude,
            self.file_defects,
            self.test_gap,
            self.first_touch,
            self.own_defects,
        ];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(StrataError::Config(
                "risk.weights must be finite and non-negative".into(),
            ));
        }
        if self.total() <= 0.0 {
            return Err(StrataError::Config(
                "risk.weights must not all be zero".into(),
            ));
        }
        Ok(())
    }
}

/// One configured bug-fix classification rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixRuleConfig {
    /// Rule name, reported with matches.
    pub name: String,
    /// Regex applied to the full commit message.
    pub pattern: String,
    /// `"fix"` marks a bug fix; `"ignore"` stops evaluation as not-a-fix.
    #[serde(default = "default_rule_action")]
    pub action: String,
}

fn default_rule_action() -> String {
    "fix".into()
}

/// Ownership tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnershipConfig {
    /// Half-life of a contribution in days (default: 180).
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
    /// Share the top contributors must exceed for the bus factor (default: 0.5).
    #[serde(default = "default_coverage")]
    pub coverage: f64,
}

fn default_half_life_days() -> f64 {
    180.0
}

fn default_coverage() -> f64 {
    0.5
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            half_life_days: default_half_life_days(),
            coverage: default_coverage(),
        }
    }
}

/// Temporal coupling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouplingConfig {
    /// Half-life of a co-change in days (default: 180).
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
    /// Neighbors served per file (default: 20).
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Edges below this weight are not served (default: 0.1).
    #[serde(default = "default_min_weight")]
    pub min_weight: f64,
    /// Edges with fewer co-changes are not served (default: 1).
    #[serde(default = "default_min_co_changes")]
    pub min_co_changes: u32,
}

fn default_top_k() -> usize {
    20
}

fn default_min_weight() -> f64 {
    0.1
}

fn default_min_co_changes() -> u32 {
    1
}

impl Default for CouplingConfig {
    fn default() -> Self {
        Self {
            half_life_days: default_half_life_days(),
            top_k: default_top_k(),
            min_weight: default_min_weight(),
            min_co_changes: default_min_co_changes(),
        }
    }
}

/// Aggregate store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database path, relative to the repository root (default: `.strata/strata.db`).
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Commit attempts after the first failure (default: 4).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Initial retry backoff in milliseconds, doubled per attempt (default: 50).
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// SQLite busy timeout in milliseconds (default: 5000).
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(".strata/strata.db")
}

fn default_max_retries() -> u32 {
    4
}

fn default_backoff_ms() -> u64 {
    50
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let config = StrataConfig::default();
        assert_eq!(config.scan.batch_size, 500);
        assert_eq!(config.scan.workers, 0);
        assert_eq!(config.scan.merge_policy, "first-parent");
        assert_eq!(config.scan.rename_threshold, 0.5);
        assert_eq!(config.risk.lines_cap, 400);
        assert!(config.risk.fix_rules.is_empty());
        assert_eq!(config.ownership.coverage, 0.5);
        assert_eq!(config.coupling.top_k, 20);
        assert_eq!(config.store.max_retries, 4);
        assert_eq!(config.store.path, PathBuf::from(".strata/strata.db"));
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config = StrataConfig::from_toml("").unwrap();
        assert_eq!(config.scan.batch_size, 500);
        assert_eq!(config.coupling.min_weight, 0.1);
    }

    #[test]
    fn parse_full_toml() {
        let toml = r#"
[scan]
batch_size = 100
merge_policy = "skip-merges"
window_days = 90

[risk]
lines_cap = 200
[risk.weights]
magnitude = 0.5
own_defects = 0.5
file_defects = 0.0
test_gap = 0.0
first_touch = 0.0

[[risk.fix_rules]]
name = "merge"
pattern = "^Merge "
action = "ignore"

[[risk.fix_rules]]
name = "fix"
pattern = "(?i)\\bfix"

[ownership]
half_life_days = 30
coverage = 0.75
"#;
        let config = StrataConfig::from_toml(toml).unwrap();
        assert_eq!(config.scan.batch_size, 100);
        assert_eq!(config.scan.merge_policy().unwrap(), MergePolicy::SkipMerges);
        assert_eq!(config.scan.window().unwrap(), Some(WindowBound::Days(90)));
        assert_eq!(config.risk.weights.magnitude, 0.5);
        assert_eq!(config.risk.fix_rules.len(), 2);
        assert_eq!(config.risk.fix_rules[0].action, "ignore");
        assert_eq!(config.risk.fix_rules[1].action, "fix");
        assert_eq!(config.ownership.half_life_days, 30.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_merge_policy_is_rejected_not_defaulted() {
        let config = StrataConfig::from_toml("[scan]\nmerge_policy = \"octopus\"\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("octopus"));
    }

    #[test]
    fn both_windows_are_rejected() {
        let toml = "[scan]\nwindow_days = 30\nmax_commits = 100\n";
        let config = StrataConfig::from_toml(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn negative_weight_is_rejected() {
        let mut config = StrataConfig::default();
        config.risk.weights.test_gap = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn coverage_must_be_a_fraction() {
        let mut config = StrataConfig::default();
        config.ownership.coverage = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_toml_returns_error() {
        let result = StrataConfig::from_toml("{{invalid}}");
        assert!(result.is_err());
    }
}
