use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Author or committer identity attached to a commit.
///
/// # Examples
///
/// ```
/// use strata_core::Signature;
///
/// let sig = Signature::new("Alice", "Alice@Example.com");
/// assert_eq!(sig.contributor_key(), "alice@example.com");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Display name.
    pub name: String,
    /// Email address (may be empty).
    pub email: String,
}

impl Signature {
    /// Build a signature from a name and an email.
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// Stable identity used for ownership: lower-cased email, or the name
    /// when no email is recorded.
    pub fn contributor_key(&self) -> String {
        let email = self.email.trim();
        if email.is_empty() {
            self.name.trim().to_lowercase()
        } else {
            email.to_lowercase()
        }
    }
}

/// One commit as yielded by the ingestor.
///
/// Immutable once ingested.
///
/// # Examples
///
/// ```
/// use strata_core::{CommitRecord, Signature};
///
/// let commit = CommitRecord {
///     sha: "c1".into(),
///     parents: vec![],
///     author: Signature::new("alice", "alice@example.com"),
///     committer: Signature::new("alice", "alice@example.com"),
///     timestamp: 1_700_000_000,
///     message: "initial import".into(),
/// };
/// assert!(commit.is_root());
/// assert!(!commit.is_merge());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    /// Full commit sha.
    pub sha: String,
    /// Parent shas in recorded order.
    pub parents: Vec<String>,
    /// Author identity.
    pub author: Signature,
    /// Committer identity.
    pub committer: Signature,
    /// Commit time, unix seconds.
    pub timestamp: i64,
    /// Full commit message.
    pub message: String,
}

impl CommitRecord {
    /// True when the commit has more than one parent.
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    /// True when the commit has no parent.
    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    /// First line of the message.
    pub fn subject(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }
}

/// Per-file change statistics for one commit against its chosen parent.
///
/// # Examples
///
/// ```
/// use strata_core::DiffRecord;
///
/// let record = DiffRecord {
///     sha: "c1".into(),
///     path: "src/lib.rs".into(),
///     lines_added: 10,
///     lines_removed: 3,
///     rename_from: None,
///     binary: false,
/// };
/// assert_eq!(record.lines_changed(), 13);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffRecord {
    /// Commit the change belongs to.
    pub sha: String,
    /// Path after the change.
    pub path: String,
    /// Lines added.
    pub lines_added: u32,
    /// Lines removed.
    pub lines_removed: u32,
    /// Previous path when the change continues a renamed file.
    pub rename_from: Option<String>,
    /// Binary files carry no line counts.
    pub binary: bool,
}

impl DiffRecord {
    /// Lines added plus removed; zero for binary files.
    pub fn lines_changed(&self) -> u32 {
        if self.binary {
            0
        } else {
            self.lines_added + self.lines_removed
        }
    }
}

/// Kind of change a file saw in a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// New file.
    Added,
    /// Existing file modified.
    Modified,
    /// File removed.
    Deleted,
    /// File continued under a new path.
    Renamed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Deleted => write!(f, "deleted"),
            ChangeKind::Renamed => write!(f, "renamed"),
        }
    }
}

/// Individual risk factors, each normalized to `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskFactors {
    /// Lines changed and files touched.
    pub magnitude: f64,
    /// Historical fix ratio of the touched files.
    pub file_defects: f64,
    /// Missing paired test changes.
    pub test_gap: f64,
    /// Share of touched files the author had never touched.
    pub first_touch: f64,
    /// Lines of this commit later implicated by fixes, per line changed.
    pub own_defects: f64,
}

/// Bounded risk score for one commit.
///
/// # Examples
///
/// ```
/// use strata_core::{RiskFactors, RiskLevel, RiskScore};
///
/// let score = RiskScore {
///     sha: "c1".into(),
///     score: 62.5,
///     factors: RiskFactors::default(),
/// };
/// assert_eq!(score.level(), RiskLevel::High);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskScore {
    /// Commit sha.
    pub sha: String,
    /// Weighted score in `[0.0, 100.0]`.
    pub score: f64,
    /// Factor breakdown.
    pub factors: RiskFactors,
}

impl RiskScore {
    /// Categorical band for gating.
    pub fn level(&self) -> RiskLevel {
        RiskLevel::from_score(self.score)
    }
}

/// Categorical risk classification based on score ranges.
///
/// # Examples
///
/// ```
/// use strata_core::RiskLevel;
///
/// assert_eq!(RiskLevel::from_score(10.0), RiskLevel::Low);
/// assert_eq!(RiskLevel::from_score(50.0), RiskLevel::Medium);
/// assert_eq!(RiskLevel::from_score(60.0), RiskLevel::High);
/// assert_eq!(RiskLevel::from_score(90.0), RiskLevel::Critical);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Score 0–25.
    Low,
    /// Score 26–50.
    Medium,
    /// Score 51–75.
    High,
    /// Score 76–100.
    Critical,
}

impl RiskLevel {
    /// Map a numeric score to a risk level.
    pub fn from_score(score: f64) -> Self {
        if score <= 25.0 {
            RiskLevel::Low
        } else if score <= 50.0 {
            RiskLevel::Medium
        } else if score <= 75.0 {
            RiskLevel::High
        } else {
            RiskLevel::Critical
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "Low"),
            RiskLevel::Medium => write!(f, "Medium"),
            RiskLevel::High => write!(f, "High"),
            RiskLevel::Critical => write!(f, "Critical"),
        }
    }
}

/// One contributor's share of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerShare {
    /// Contributor identity (see [`Signature::contributor_key`]).
    pub contributor: String,
    /// Decayed share in `[0.0, 1.0]`.
    pub share: f64,
}

/// Ownership of a single file at query time.
///
/// # Examples
///
/// ```
/// use strata_core::{FileOwnership, OwnerShare};
///
/// let own = FileOwnership {
///     path: "src/main.rs".into(),
///     owners: vec![OwnerShare { contributor: "alice@example.com".into(), share: 1.0 }],
///     bus_factor: 1,
/// };
/// assert_eq!(own.primary_owner(), Some("alice@example.com"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOwnership {
    /// File path relative to repo root.
    pub path: String,
    /// Contributors sorted by share, descending.
    pub owners: Vec<OwnerShare>,
    /// Minimum number of top contributors whose shares exceed the coverage threshold.
    pub bus_factor: u32,
}

impl FileOwnership {
    /// Contributor with the largest current share.
    pub fn primary_owner(&self) -> Option<&str> {
        self.owners.first().map(|o| o.contributor.as_str())
    }
}

/// Weighted co-change relation between two files.
///
/// `file_a` is always the lexicographically smaller path.
///
/// # Examples
///
/// ```
/// use strata_core::CouplingEdge;
///
/// assert_eq!(CouplingEdge::canonical_pair("z.rs", "a.rs"), ("a.rs", "z.rs"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CouplingEdge {
    /// Lexicographically smaller path.
    pub file_a: String,
    /// Lexicographically larger path.
    pub file_b: String,
    /// Decayed conditional co-change probability.
    pub weight: f64,
    /// Raw number of commits touching both files.
    pub co_changes: u32,
    /// Timestamp of the latest co-change.
    pub last_updated: i64,
}

impl CouplingEdge {
    /// Order two paths canonically.
    pub fn canonical_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// The endpoint opposite to `path`, if `path` is an endpoint.
    pub fn other(&self, path: &str) -> Option<&str> {
        if self.file_a == path {
            Some(&self.file_b)
        } else if self.file_b == path {
            Some(&self.file_a)
        } else {
            None
        }
    }
}

/// How merge commits are diffed.
///
/// # Examples
///
/// ```
/// use strata_core::MergePolicy;
///
/// let policy: MergePolicy = "first-parent".parse().unwrap();
/// assert_eq!(policy, MergePolicy::FirstParent);
/// assert!("merge-base".parse::<MergePolicy>().is_err());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    /// Diff a merge against its first listed parent.
    #[default]
    FirstParent,
    /// Record merges in the timeline but contribute no diff.
    SkipMerges,
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergePolicy::FirstParent => write!(f, "first-parent"),
            MergePolicy::SkipMerges => write!(f, "skip-merges"),
        }
    }
}

impl FromStr for MergePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "first-parent" => Ok(MergePolicy::FirstParent),
            "skip-merges" => Ok(MergePolicy::SkipMerges),
            other => Err(format!(
                "unknown merge policy '{other}' (expected 'first-parent' or 'skip-merges')"
            )),
        }
    }
}

/// Bound on how much history a scan covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WindowBound {
    /// Only the newest N commits.
    Commits(usize),
    /// Only commits within N days of the newest tip commit.
    Days(u64),
}

/// Durable marker of how far analysis has progressed for a repository.
///
/// Owned exclusively by the aggregate store; advances only after a whole
/// batch is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSnapshot {
    /// Repository id.
    pub repo_id: String,
    /// Shas of the last batch's frontier (commits without analyzed children).
    pub last_processed: Vec<String>,
    /// Oldest analyzed commit timestamp.
    pub window_start: Option<i64>,
    /// Newest analyzed commit timestamp; the reference time for decay.
    pub window_end: Option<i64>,
    /// Number of committed batches.
    pub sequence: u64,
    /// Total commits folded so far.
    pub commits_analyzed: u64,
    /// Merge policy every batch so far was analyzed with.
    pub merge_policy: MergePolicy,
    /// Sequence number of the last published event.
    pub event_sequence: u64,
}

impl AnalysisSnapshot {
    /// Snapshot of a repository that was never scanned.
    pub fn empty(repo_id: impl Into<String>, merge_policy: MergePolicy) -> Self {
        Self {
            repo_id: repo_id.into(),
            last_processed: Vec::new(),
            window_start: None,
            window_end: None,
            sequence: 0,
            commits_analyzed: 0,
            merge_policy,
            event_sequence: 0,
        }
    }

    /// Reference time used for query-time decay.
    pub fn reference_time(&self) -> i64 {
        self.window_end.unwrap_or(0)
    }
}

/// Timeline row exposed to the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSummary {
    /// Commit sha.
    pub sha: String,
    /// Author contributor key.
    pub author: String,
    /// Commit time, unix seconds.
    pub timestamp: i64,
    /// Current risk score.
    pub risk_score: f64,
    /// Whether the commit was classified as a bug fix.
    pub bug_fix: bool,
    /// Whether the diff exceeded its budget and awaits reprocessing.
    pub partial: bool,
}

/// Kind of event emitted after a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// New commits were folded into the aggregates.
    CommitsAnalyzed,
    /// The checkpoint moved forward.
    SnapshotAdvanced,
    /// A scan aborted.
    ScanFailed,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::CommitsAnalyzed => write!(f, "CommitsAnalyzed"),
            EventType::SnapshotAdvanced => write!(f, "SnapshotAdvanced"),
            EventType::ScanFailed => write!(f, "ScanFailed"),
        }
    }
}

/// Payload carried by an [`AnalysisEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum EventPayload {
    /// Commits folded in this batch and the files whose aggregates changed.
    CommitsAnalyzed {
        /// Newly analyzed commits, topological order.
        shas: Vec<String>,
        /// Files whose ownership or coupling changed.
        changed_files: Vec<String>,
        /// Earlier commits whose score was recomputed by new fix attributions.
        rescored: Vec<String>,
    },
    /// The checkpoint after the batch.
    SnapshotAdvanced {
        /// New snapshot.
        snapshot: AnalysisSnapshot,
    },
    /// The scan aborted; the last checkpoint is intact.
    ScanFailed {
        /// Error description.
        message: String,
    },
}

impl EventPayload {
    /// Event type matching the payload variant.
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::CommitsAnalyzed { .. } => EventType::CommitsAnalyzed,
            EventPayload::SnapshotAdvanced { .. } => EventType::SnapshotAdvanced,
            EventPayload::ScanFailed { .. } => EventType::ScanFailed,
        }
    }
}

/// Ordered, sequenced notification for dashboard subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisEvent {
    /// Repository the event belongs to.
    pub repo_id: String,
    /// Monotonic sequence number.
    pub sequence_number: u64,
    /// Event kind.
    pub event_type: EventType,
    /// Event body.
    pub payload: EventPayload,
}

impl AnalysisEvent {
    /// Build an event, deriving the type from the payload.
    pub fn new(repo_id: impl Into<String>, sequence_number: u64, payload: EventPayload) -> Self {
        Self {
            repo_id: repo_id.into(),
            sequence_number,
            event_type: payload.event_type(),
            payload,
        }
    }
}

/// Output format for CLI results.
///
/// # Examples
///
/// ```
/// use strata_core::OutputFormat;
///
/// let fmt: OutputFormat = "json".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Json);
///
/// let fmt: OutputFormat = "md".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Markdown);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable tables and summaries.
    #[default]
    Text,
    /// Machine-readable JSON with camelCase keys.
    Json,
    /// Markdown-formatted output.
    Markdown,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Markdown => write!(f, "markdown"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}
