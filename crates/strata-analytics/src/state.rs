//! Per-repository analysis state and the sequential fold.
//!
//! [`RepoState`] is the single owner of every aggregate for one repository.
//! Commits are folded one at a time in topological order; each fold records
//! which entities changed so the store can persist exactly those.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use strata_core::{
    ChangeKind, CommitSummary, CouplingEdge, FileOwnership, Result, RiskFactors, RiskScore,
    StrataConfig, StrataError,
};
use strata_history::DiffStatus;

use crate::analyze::AnalyzedCommit;
use crate::coupling::{CouplingAnalyzer, FileChanges, PairStats, ServingLimits};
use crate::decay::HalfLife;
use crate::hotspots::FileStats;
use crate::ownership::{FileOwners, OwnershipTracker};
use crate::risk::{own_defect_density, RiskModel};

/// Analysis parameters that must stay fixed across a scan.
#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    /// Risk scoring model.
    pub model: RiskModel,
    /// Ownership decay.
    pub ownership_half_life: HalfLife,
    /// Bus-factor coverage threshold.
    pub coverage: f64,
    /// Coupling decay.
    pub coupling_half_life: HalfLife,
    /// Commits touching more files add no coupling pairs.
    pub max_files_per_commit: usize,
    /// Serving limits for coupling neighbors.
    pub limits: ServingLimits,
}

impl AnalysisSettings {
    /// Settings from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Config`] for invalid test patterns.
    pub fn from_config(config: &StrataConfig) -> Result<Self> {
        Ok(Self {
            model: RiskModel::from_config(&config.risk)?,
            ownership_half_life: HalfLife::from_days(config.ownership.half_life_days),
            coverage: config.ownership.coverage,
            coupling_half_life: HalfLife::from_days(config.coupling.half_life_days),
            max_files_per_commit: config.scan.max_files_per_commit,
            limits: ServingLimits::from(&config.coupling),
        })
    }
}

/// Stored analysis of one commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitState {
    /// Commit sha.
    pub sha: String,
    /// Author contributor key.
    pub author: String,
    /// Commit time, unix seconds.
    pub timestamp: i64,
    /// Classified as a bug fix.
    pub bug_fix: bool,
    /// Diff was abandoned; the commit awaits manual reprocessing.
    pub partial: bool,
    /// Why the diff was abandoned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_reason: Option<String>,
    /// Lines changed across text files.
    pub lines_changed: u32,
    /// Paths the commit touched, after renames.
    pub files: Vec<String>,
    /// Factors as computed when the commit was folded.
    pub factors: RiskFactors,
    /// Lines later implicated by fixes.
    pub implicated_lines: u32,
    /// Current score.
    pub score: f64,
    /// Position in the fold order.
    pub seq: u64,
}

impl CommitState {
    /// Risk view of this commit.
    pub fn risk(&self) -> RiskScore {
        RiskScore {
            sha: self.sha.clone(),
            score: self.score,
            factors: self.factors,
        }
    }

    /// Timeline row.
    pub fn summary(&self) -> CommitSummary {
        CommitSummary {
            sha: self.sha.clone(),
            author: self.author.clone(),
            timestamp: self.timestamp,
            risk_score: self.score,
            bug_fix: self.bug_fix,
            partial: self.partial,
        }
    }
}

/// Entities touched since the last [`RepoState::take_changes`].
///
/// Keys that no longer exist in the state were removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateChanges {
    /// New or rescored commits.
    pub commits: BTreeSet<String>,
    /// Files whose stats, owners or change history changed.
    pub files: BTreeSet<String>,
    /// Canonical pairs whose co-change history changed.
    pub pairs: BTreeSet<(String, String)>,
    /// Files whose coupling serving view must be rebuilt.
    pub views: BTreeSet<String>,
}

impl StateChanges {
    /// True when nothing changed.
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty() && self.files.is_empty() && self.pairs.is_empty()
    }
}

/// What folding one commit changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FoldOutcome {
    /// False when the commit was already known and nothing happened.
    pub folded: bool,
    /// Earlier commits whose score changed through new attributions.
    pub rescored: Vec<String>,
    /// Files whose aggregates changed.
    pub changed_files: BTreeSet<String>,
}

/// All aggregates of one repository.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use strata_analytics::{AnalysisSettings, CommitAnalyzer, PatternClassifier, RepoState};
/// use strata_core::StrataConfig;
/// use strata_history::{DiffAnalyzer, GitObjectSource, MemoryRepository};
///
/// let repo = MemoryRepository::new();
/// repo.commit("c1").author("alice", "a@x").write("f.rs", "1\n2\n").apply().unwrap();
///
/// let analyzer = CommitAnalyzer::new(
///     DiffAnalyzer::default(),
///     Arc::new(PatternClassifier::default()),
///     Duration::from_secs(5),
/// );
/// let settings = AnalysisSettings::from_config(&StrataConfig::default()).unwrap();
/// let mut state = RepoState::new(settings);
/// let analyzed = analyzer.analyze(&repo, repo.get_commit("c1").unwrap()).unwrap();
/// assert!(state.fold(&analyzed).folded);
///
/// assert_eq!(state.ownership("f.rs").unwrap().bus_factor, 1);
/// assert!(state.risk("c1").is_some());
/// ```
#[derive(Debug, Clone)]
pub struct RepoState {
    settings: AnalysisSettings,
    commits: BTreeMap<String, CommitState>,
    files: BTreeMap<String, FileStats>,
    ownership: OwnershipTracker,
    coupling: CouplingAnalyzer,
    next_seq: u64,
    changes: StateChanges,
}

impl RepoState {
    /// Empty state.
    pub fn new(settings: AnalysisSettings) -> Self {
        let ownership = OwnershipTracker::new(settings.ownership_half_life, settings.coverage);
        let coupling =
            CouplingAnalyzer::new(settings.coupling_half_life, settings.max_files_per_commit)
                .with_prune_threshold(settings.limits.min_weight);
        Self {
            settings,
            commits: BTreeMap::new(),
            files: BTreeMap::new(),
            ownership,
            coupling,
            next_seq: 0,
            changes: StateChanges::default(),
        }
    }

    /// Analysis parameters.
    pub fn settings(&self) -> &AnalysisSettings {
        &self.settings
    }

    /// Fold one analyzed commit.
    ///
    /// Must be called in topological order. Factors are captured from the
    /// state as it was before this commit; attributions then rescore the
    /// earlier commits they implicate.
    pub fn fold(&mut self, analyzed: &AnalyzedCommit) -> FoldOutcome {
        let commit = &analyzed.commit;
        if self.commits.contains_key(&commit.sha) {
            tracing::debug!(sha = %commit.sha, "commit already folded");
            return FoldOutcome::default();
        }
        let author = commit.author.contributor_key();
        let seq = self.next_seq;
        self.next_seq += 1;
        let mut outcome = FoldOutcome {
            folded: true,
            ..FoldOutcome::default()
        };

        if let DiffStatus::Partial { reason } = &analyzed.diff.status {
            let factors = RiskFactors::default();
            let state = CommitState {
                sha: commit.sha.clone(),
                author,
                timestamp: commit.timestamp,
                bug_fix: analyzed.is_fix(),
                partial: true,
                partial_reason: Some(reason.clone()),
                lines_changed: 0,
                files: Vec::new(),
                factors,
                implicated_lines: 0,
                score: self.settings.model.score(&commit.sha, factors).score,
                seq,
            };
            self.insert_commit(state);
            return outcome;
        }

        let factors = self.factors(analyzed, &author);
        let lines_changed = analyzed.diff.lines_changed();
        let state = CommitState {
            sha: commit.sha.clone(),
            author: author.clone(),
            timestamp: commit.timestamp,
            bug_fix: analyzed.is_fix(),
            partial: false,
            partial_reason: None,
            lines_changed,
            files: analyzed.diff.records().map(|r| r.path.clone()).collect(),
            factors,
            implicated_lines: 0,
            score: self.settings.model.score(&commit.sha, factors).score,
            seq,
        };
        self.insert_commit(state);

        self.apply_file_changes(analyzed, &author, &mut outcome);

        if let Some(attribution) = &analyzed.attribution {
            for (introducing, lines) in &attribution.introducing {
                if self.implicate(introducing, *lines) {
                    outcome.rescored.push(introducing.clone());
                }
            }
        }
        outcome
    }

    fn factors(&self, analyzed: &AnalyzedCommit, author: &str) -> RiskFactors {
        let model = &self.settings.model;
        let records: Vec<_> = analyzed.diff.records().collect();

        let mut fix_ratios = 0.0;
        let mut with_history = 0usize;
        let mut first_touches = 0usize;
        for record in &records {
            let history_path = record.rename_from.as_deref().unwrap_or(&record.path);
            if let Some(stats) = self.files.get(history_path) {
                fix_ratios += stats.fix_ratio();
            }
            if self.ownership.get(history_path).is_some() {
                with_history += 1;
                if !self.ownership.has_touched(history_path, author) {
                    first_touches += 1;
                }
            }
        }

        let file_defects = if records.is_empty() {
            0.0
        } else {
            fix_ratios / records.len() as f64
        };
        let first_touch = if with_history == 0 {
            0.0
        } else {
            first_touches as f64 / with_history as f64
        };

        RiskFactors {
            magnitude: model.magnitude(analyzed.diff.lines_changed(), records.len()),
            file_defects,
            test_gap: model.test_gap(records.iter().map(|r| r.path.as_str())),
            first_touch,
            own_defects: 0.0,
        }
    }

    fn apply_file_changes(
        &mut self,
        analyzed: &AnalyzedCommit,
        author: &str,
        outcome: &mut FoldOutcome,
    ) {
        let commit = &analyzed.commit;

        // History moves before anything is recorded under the new paths.
        for change in &analyzed.diff.files {
            let record = &change.record;
            match change.kind {
                ChangeKind::Renamed => {
                    let Some(from) = record.rename_from.as_deref() else {
                        continue;
                    };
                    if let Some(previous) = self.files.remove(from) {
                        self.files
                            .entry(record.path.clone())
                            .or_default()
                            .absorb(previous);
                    }
                    self.ownership.rename(from, &record.path);
                    let neighbors = self.coupling.rename(from, &record.path);
                    self.mark_removed_edges(from, &neighbors);
                    self.changes.views.insert(record.path.clone());
                    self.note_file(from, outcome);
                }
                ChangeKind::Deleted => {
                    self.files.remove(&record.path);
                    self.ownership.remove(&record.path);
                    let neighbors = self.coupling.remove(&record.path);
                    self.mark_removed_edges(&record.path, &neighbors);
                    self.note_file(&record.path, outcome);
                }
                ChangeKind::Added | ChangeKind::Modified => {}
            }
        }

        let mut touched = Vec::new();
        for change in &analyzed.diff.files {
            if change.kind == ChangeKind::Deleted {
                continue;
            }
            let record = &change.record;
            let lines = record.lines_changed();
            self.files.entry(record.path.clone()).or_default().touch(
                lines,
                analyzed.is_fix(),
                commit.timestamp,
            );
            let pure_move = change.kind == ChangeKind::Renamed && lines == 0 && !record.binary;
            if !pure_move {
                self.ownership
                    .record(&record.path, author, lines.max(1), commit.timestamp);
            }
            touched.push(record.path.as_str());
        }

        let pairs = self.coupling.record_commit(&touched, commit.timestamp);
        for (a, b) in &pairs {
            self.changes.views.insert(a.clone());
            self.changes.views.insert(b.clone());
        }
        self.changes.pairs.extend(pairs);
        for path in &touched {
            self.changes.views.insert((*path).to_string());
            let adjacent: Vec<String> = self.coupling.adjacent(path).map(str::to_string).collect();
            self.changes.views.extend(adjacent);
        }
        for path in touched {
            self.note_file(path, outcome);
        }
    }

    fn mark_removed_edges(&mut self, path: &str, neighbors: &[String]) {
        self.changes.views.insert(path.to_string());
        for other in neighbors {
            let (a, b) = CouplingEdge::canonical_pair(path, other);
            self.changes.pairs.insert((a.to_string(), b.to_string()));
            self.changes.views.insert(other.clone());
        }
    }

    fn note_file(&mut self, path: &str, outcome: &mut FoldOutcome) {
        self.changes.files.insert(path.to_string());
        outcome.changed_files.insert(path.to_string());
    }

    fn insert_commit(&mut self, state: CommitState) {
        self.changes.commits.insert(state.sha.clone());
        self.commits.insert(state.sha.clone(), state);
    }

    /// Add implicated lines to a known commit and rescore it.
    fn implicate(&mut self, sha: &str, lines: u32) -> bool {
        let model = &self.settings.model;
        let Some(state) = self.commits.get_mut(sha) else {
            tracing::debug!(sha, "attribution to a commit outside the analyzed history");
            return false;
        };
        state.implicated_lines += lines;
        self.changes.commits.insert(sha.to_string());
        if state.partial {
            // Line counts of a partial diff are unknown; the score waits for reprocessing.
            return false;
        }
        state.factors.own_defects = own_defect_density(state.implicated_lines, state.lines_changed);
        state.score = model.score(sha, state.factors).score;
        true
    }

    /// Take and reset the set of changed entities.
    pub fn take_changes(&mut self) -> StateChanges {
        std::mem::take(&mut self.changes)
    }

    /// Whether `sha` was already folded.
    pub fn is_processed(&self, sha: &str) -> bool {
        self.commits.contains_key(sha)
    }

    /// Every folded sha.
    pub fn processed(&self) -> HashSet<String> {
        self.commits.keys().cloned().collect()
    }

    /// Number of folded commits.
    pub fn commit_count(&self) -> usize {
        self.commits.len()
    }

    /// Stored analysis of one commit.
    pub fn commit(&self, sha: &str) -> Option<&CommitState> {
        self.commits.get(sha)
    }

    /// All commits in sha order.
    pub fn commits(&self) -> impl Iterator<Item = &CommitState> {
        self.commits.values()
    }

    /// Risk of one commit.
    pub fn risk(&self, sha: &str) -> Option<RiskScore> {
        self.commits.get(sha).map(CommitState::risk)
    }

    /// Change statistics of one file.
    pub fn file_stats(&self, path: &str) -> Option<&FileStats> {
        self.files.get(path)
    }

    /// All file statistics in path order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &FileStats)> {
        self.files.iter().map(|(p, s)| (p.as_str(), s))
    }

    /// Ownership of one file.
    pub fn ownership(&self, path: &str) -> Option<FileOwnership> {
        self.ownership.ownership(path)
    }

    /// Ownership tracker.
    pub fn owners(&self) -> &OwnershipTracker {
        &self.ownership
    }

    /// Coupling analyzer.
    pub fn coupling(&self) -> &CouplingAnalyzer {
        &self.coupling
    }

    /// Serving view of one file's coupling neighbors.
    pub fn neighbors(&self, path: &str) -> Vec<CouplingEdge> {
        self.coupling.neighbors(path, self.settings.limits)
    }

    /// Restore a stored commit.
    pub fn restore_commit(&mut self, state: CommitState) {
        self.next_seq = self.next_seq.max(state.seq + 1);
        self.commits.insert(state.sha.clone(), state);
    }

    /// Restore stored file statistics.
    pub fn restore_file(&mut self, path: String, stats: FileStats) {
        self.files.insert(path, stats);
    }

    /// Restore stored ownership masses.
    pub fn restore_owners(&mut self, path: String, owners: FileOwners) {
        self.ownership.insert(path, owners);
    }

    /// Restore a stored file change history.
    pub fn restore_file_changes(&mut self, path: String, changes: FileChanges) {
        self.coupling.insert_file(path, changes);
    }

    /// Restore a stored pair.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Store`] for a pair of a file with itself.
    pub fn restore_pair(&mut self, a: &str, b: &str, stats: PairStats) -> Result<()> {
        if a == b {
            return Err(StrataError::Store(format!("self pair for '{a}'")));
        }
        self.coupling.insert_pair(a, b, stats);
        Ok(())
    }
}
