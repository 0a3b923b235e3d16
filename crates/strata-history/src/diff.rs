//! Diff Analyzer: per-file change records with rename continuation.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_core::{ChangeKind, CommitRecord, DiffRecord, MergePolicy, Result, StrataError};

use crate::source::{Deadline, GitObjectSource, RawFileDiff};

/// Whether a commit's diff was fully computed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "status")]
pub enum DiffStatus {
    /// Every file was analyzed.
    Complete,
    /// The diff was abandoned; the commit must be reprocessed.
    Partial {
        /// Why the diff is incomplete.
        reason: String,
    },
}

/// One file touched by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    /// Kind of change.
    pub kind: ChangeKind,
    /// Line statistics.
    pub record: DiffRecord,
}

/// Everything the aggregates need to know about one commit's changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitDiff {
    /// Commit sha.
    pub sha: String,
    /// Parent the diff was computed against.
    pub parent: Option<String>,
    /// Touched files, sorted by path. Empty for partial diffs.
    pub files: Vec<FileChange>,
    /// Old path to the old-side numbers of removed lines.
    pub removed_lines: BTreeMap<String, Vec<u32>>,
    /// Completion status.
    pub status: DiffStatus,
}

impl CommitDiff {
    fn empty(commit: &CommitRecord, parent: Option<String>) -> Self {
        Self {
            sha: commit.sha.clone(),
            parent,
            files: Vec::new(),
            removed_lines: BTreeMap::new(),
            status: DiffStatus::Complete,
        }
    }

    fn partial(commit: &CommitRecord, parent: Option<String>, reason: String) -> Self {
        Self {
            status: DiffStatus::Partial { reason },
            ..Self::empty(commit, parent)
        }
    }

    /// Per-file records.
    pub fn records(&self) -> impl Iterator<Item = &DiffRecord> {
        self.files.iter().map(|f| &f.record)
    }

    /// True when the diff was abandoned.
    pub fn is_partial(&self) -> bool {
        matches!(self.status, DiffStatus::Partial { .. })
    }

    /// Total lines changed across text files.
    pub fn lines_changed(&self) -> u32 {
        self.records().map(DiffRecord::lines_changed).sum()
    }
}

/// Options for the [`DiffAnalyzer`].
#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Minimum share of unchanged lines for a delete/add pair to be a rename.
    pub rename_threshold: f64,
    /// Time budget per commit.
    pub budget: Duration,
    /// How merges are diffed.
    pub merge_policy: MergePolicy,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            rename_threshold: 0.5,
            budget: Duration::from_millis(2000),
            merge_policy: MergePolicy::FirstParent,
        }
    }
}

/// Computes [`CommitDiff`]s from a [`GitObjectSource`].
///
/// # Examples
///
/// ```
/// use strata_history::{DiffAnalyzer, DiffOptions, GitObjectSource, MemoryRepository};
///
/// let repo = MemoryRepository::new();
/// repo.commit("c1").write("a.py", "x\ny\nz\n").apply().unwrap();
/// repo.commit("c2").delete("a.py").write("b.py", "x\ny\nz\nw\n").apply().unwrap();
///
/// let analyzer = DiffAnalyzer::new(DiffOptions::default());
/// let commit = repo.get_commit("c2").unwrap();
/// let diff = analyzer.analyze(&repo, &commit).unwrap();
/// assert_eq!(diff.files.len(), 1);
/// assert_eq!(diff.files[0].record.rename_from.as_deref(), Some("a.py"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct DiffAnalyzer {
    options: DiffOptions,
}

impl DiffAnalyzer {
    /// Analyzer with the given options.
    pub fn new(options: DiffOptions) -> Self {
        Self { options }
    }

    /// Parent a commit is diffed against.
    ///
    /// `None` means the commit contributes no diff (a merge under
    /// [`MergePolicy::SkipMerges`]); `Some(None)` is a root commit.
    pub fn diff_parent<'c>(&self, commit: &'c CommitRecord) -> Option<Option<&'c str>> {
        if commit.is_merge() && self.options.merge_policy == MergePolicy::SkipMerges {
            return None;
        }
        Some(commit.parents.first().map(String::as_str))
    }

    /// Diff one commit against its policy parent.
    ///
    /// The source gives up once the time budget runs out. A diff that
    /// exceeds it, or whose objects cannot be read, comes back as
    /// [`DiffStatus::Partial`] with no records.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Repository`] when the repository itself is
    /// unavailable.
    pub fn analyze<S: GitObjectSource + ?Sized>(
        &self,
        source: &S,
        commit: &CommitRecord,
    ) -> Result<CommitDiff> {
        let Some(parent) = self.diff_parent(commit) else {
            return Ok(CommitDiff::empty(commit, None));
        };
        let parent_sha = parent.map(str::to_string);
        let deadline = Deadline::after(self.options.budget);

        let raw = match source.diff_between(parent, &commit.sha, deadline) {
            Ok(raw) => raw,
            Err(e @ StrataError::Repository(_)) => return Err(e),
            Err(StrataError::Timeout(_)) => {
                tracing::warn!(sha = %commit.sha, "diff exceeded its budget");
                return Ok(CommitDiff::partial(commit, parent_sha, self.budget_reason()));
            }
            Err(e) => {
                tracing::warn!(sha = %commit.sha, error = %e, "diff unavailable");
                return Ok(CommitDiff::partial(commit, parent_sha, e.to_string()));
            }
        };

        let mut diff = CommitDiff::empty(commit, parent_sha);
        let mut deleted = Vec::new();
        let mut added = Vec::new();

        for file in raw {
            if deadline.expired() {
                tracing::warn!(sha = %commit.sha, "diff exceeded its budget");
                return Ok(CommitDiff::partial(commit, diff.parent, self.budget_reason()));
            }
            match file.kind() {
                ChangeKind::Deleted if !file.binary => deleted.push(file),
                ChangeKind::Added if !file.binary => added.push(file),
                _ => push_change(&mut diff, &commit.sha, &file),
            }
        }
        if deadline.expired() {
            return Ok(CommitDiff::partial(commit, diff.parent, self.budget_reason()));
        }

        self.pair_renames(&mut diff, &commit.sha, deleted, added);
        diff.files.sort_by(|a, b| a.record.path.cmp(&b.record.path));
        tracing::debug!(sha = %commit.sha, files = diff.files.len(), "analyzed diff");
        Ok(diff)
    }

    fn budget_reason(&self) -> String {
        format!(
            "diff exceeded its budget of {}ms",
            self.options.budget.as_millis()
        )
    }

    /// Pair deleted and added files whose contents mostly survive, best match first.
    fn pair_renames(
        &self,
        diff: &mut CommitDiff,
        sha: &str,
        deleted: Vec<RawFileDiff>,
        added: Vec<RawFileDiff>,
    ) {
        let mut candidates = Vec::new();
        for (i, old) in deleted.iter().enumerate() {
            for (j, new) in added.iter().enumerate() {
                let sim = similarity(old, new);
                if sim > 0.0 && sim >= self.options.rename_threshold {
                    candidates.push((sim, i, j));
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| deleted[a.1].path().cmp(deleted[b.1].path()))
                .then_with(|| added[a.2].path().cmp(added[b.2].path()))
        });

        let mut old_used = vec![false; deleted.len()];
        let mut new_used = vec![false; added.len()];
        for (_, i, j) in candidates {
            if old_used[i] || new_used[j] {
                continue;
            }
            old_used[i] = true;
            new_used[j] = true;
            push_paired_rename(diff, sha, &deleted[i], &added[j]);
        }

        for (i, file) in deleted.iter().enumerate() {
            if !old_used[i] {
                push_change(diff, sha, file);
            }
        }
        for (j, file) in added.iter().enumerate() {
            if !new_used[j] {
                push_change(diff, sha, file);
            }
        }
    }
}

fn push_change(diff: &mut CommitDiff, sha: &str, file: &RawFileDiff) {
    let kind = file.kind();
    let rename_from = match kind {
        ChangeKind::Renamed => file.old_path.clone(),
        _ => None,
    };
    if let Some(old) = &file.old_path {
        let removed = file.removed_line_numbers();
        if !removed.is_empty() {
            diff.removed_lines.insert(old.clone(), removed);
        }
    }
    diff.files.push(FileChange {
        kind,
        record: DiffRecord {
            sha: sha.to_string(),
            path: file.path().to_string(),
            lines_added: if file.binary { 0 } else { file.lines_added() },
            lines_removed: if file.binary { 0 } else { file.lines_removed() },
            rename_from,
            binary: file.binary,
        },
    });
}

fn push_paired_rename(diff: &mut CommitDiff, sha: &str, old: &RawFileDiff, new: &RawFileDiff) {
    let mut available: HashMap<&str, u32> = HashMap::new();
    for line in new.hunks.iter().flat_map(|h| &h.added) {
        *available.entry(line.text.as_str()).or_default() += 1;
    }
    let mut removed = Vec::new();
    let mut common = 0u32;
    for line in old.hunks.iter().flat_map(|h| &h.removed) {
        match available.get_mut(line.text.as_str()) {
            Some(n) if *n > 0 => {
                *n -= 1;
                common += 1;
            }
            _ => removed.push(line.number),
        }
    }
    let old_path = old.path().to_string();
    if !removed.is_empty() {
        diff.removed_lines.insert(old_path.clone(), removed);
    }
    diff.files.push(FileChange {
        kind: ChangeKind::Renamed,
        record: DiffRecord {
            sha: sha.to_string(),
            path: new.path().to_string(),
            lines_added: new.lines_added() - common,
            lines_removed: old.lines_removed() - common,
            rename_from: Some(old_path),
            binary: false,
        },
    });
}

/// Shared lines over the longer side, counting duplicates as a multiset.
fn similarity(old: &RawFileDiff, new: &RawFileDiff) -> f64 {
    let old_len = old.lines_removed();
    let new_len = new.lines_added();
    let longest = old_len.max(new_len);
    if longest == 0 {
        return 0.0;
    }
    let mut available: HashMap<&str, u32> = HashMap::new();
    for line in new.hunks.iter().flat_map(|h| &h.added) {
        *available.entry(line.text.as_str()).or_default() += 1;
    }
    let mut common = 0u32;
    for line in old.hunks.iter().flat_map(|h| &h.removed) {
        if let Some(n) = available.get_mut(line.text.as_str()) {
            if *n > 0 {
                *n -= 1;
                common += 1;
            }
        }
    }
    f64::from(common) / f64::from(longest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;

    fn analyze(repo: &MemoryRepository, sha: &str, options: DiffOptions) -> CommitDiff {
        let commit = repo.get_commit(sha).unwrap();
        DiffAnalyzer::new(options).analyze(repo, &commit).unwrap()
    }

    #[test]
    fn modified_file_counts_and_removed_lines() {
        let repo = MemoryRepository::new();
        repo.commit("c1").write("a.rs", "1\n2\n3\n").apply().unwrap();
        repo.commit("c2").write("a.rs", "1\nX\n3\nY\n").apply().unwrap();
        let diff = analyze(&repo, "c2", DiffOptions::default());
        assert_eq!(diff.status, DiffStatus::Complete);
        assert_eq!(diff.files.len(), 1);
        assert_eq!(diff.files[0].kind, ChangeKind::Modified);
        assert_eq!(diff.files[0].record.lines_added, 2);
        assert_eq!(diff.files[0].record.lines_removed, 1);
        assert_eq!(diff.removed_lines.get("a.rs"), Some(&vec![2]));
        assert_eq!(diff.parent.as_deref(), Some("c1"));
    }

    #[test]
    fn delete_add_pair_above_threshold_is_a_rename() {
        let repo = MemoryRepository::new();
        repo.commit("c1").write("a.py", "a\nb\nc\nd\n").apply().unwrap();
        repo.commit("c2").delete("a.py").write("b.py", "a\nb\nc\nz\n").apply().unwrap();
        let diff = analyze(&repo, "c2", DiffOptions::default());
        assert_eq!(diff.files.len(), 1);
        let change = &diff.files[0];
        assert_eq!(change.kind, ChangeKind::Renamed);
        assert_eq!(change.record.path, "b.py");
        assert_eq!(change.record.rename_from.as_deref(), Some("a.py"));
        assert_eq!(change.record.lines_added, 1);
        assert_eq!(change.record.lines_removed, 1);
        assert_eq!(diff.removed_lines.get("a.py"), Some(&vec![4]));
    }

    #[test]
    fn dissimilar_pair_stays_delete_and_add() {
        let repo = MemoryRepository::new();
        repo.commit("c1").write("a.py", "a\nb\nc\nd\n").apply().unwrap();
        repo.commit("c2").delete("a.py").write("b.py", "a\nx\ny\nz\n").apply().unwrap();
        let diff = analyze(&repo, "c2", DiffOptions::default());
        let kinds: Vec<ChangeKind> = diff.files.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Deleted, ChangeKind::Added]);
    }

    #[test]
    fn best_candidate_wins_the_pairing() {
        let repo = MemoryRepository::new();
        repo.commit("c1").write("old.rs", "1\n2\n3\n4\n").apply().unwrap();
        repo.commit("c2")
            .delete("old.rs")
            .write("close.rs", "1\n2\n3\n4\n5\n")
            .write("far.rs", "1\n2\n3\nq\n")
            .apply()
            .unwrap();
        let diff = analyze(&repo, "c2", DiffOptions::default());
        let renamed: Vec<&str> = diff
            .files
            .iter()
            .filter(|f| f.kind == ChangeKind::Renamed)
            .map(|f| f.record.path.as_str())
            .collect();
        assert_eq!(renamed, vec!["close.rs"]);
        assert_eq!(diff.files.len(), 2);
    }

    #[test]
    fn reported_rename_is_kept() {
        let repo = MemoryRepository::new();
        repo.commit("c1").write("a.py", "x\n").apply().unwrap();
        repo.commit("c2").rename("a.py", "b.py", None).apply().unwrap();
        let diff = analyze(&repo, "c2", DiffOptions::default());
        assert_eq!(diff.files[0].kind, ChangeKind::Renamed);
        assert_eq!(diff.files[0].record.lines_changed(), 0);
    }

    #[test]
    fn binary_file_has_zero_lines() {
        let repo = MemoryRepository::new();
        repo.commit("c1").write_binary("logo.png", "v1").apply().unwrap();
        let diff = analyze(&repo, "c1", DiffOptions::default());
        assert!(diff.files[0].record.binary);
        assert_eq!(diff.files[0].record.lines_changed(), 0);
        assert_eq!(diff.parent, None);
    }

    #[test]
    fn skip_merges_yields_no_changes() {
        let repo = MemoryRepository::new();
        repo.commit("base").write("a", "1\n").apply().unwrap();
        repo.commit("side").branch("topic").write("b", "1\n").apply().unwrap();
        repo.commit("merge").parents(&["base", "side"]).write("b", "1\n").apply().unwrap();
        let options = DiffOptions {
            merge_policy: MergePolicy::SkipMerges,
            ..DiffOptions::default()
        };
        let diff = analyze(&repo, "merge", options);
        assert!(diff.files.is_empty());
        assert!(!diff.is_partial());

        let first_parent = analyze(&repo, "merge", DiffOptions::default());
        assert_eq!(first_parent.files.len(), 1);
        assert_eq!(first_parent.files[0].record.path, "b");
    }

    #[test]
    fn slow_diff_is_abandoned_at_the_budget() {
        let repo = MemoryRepository::new();
        repo.commit("c1").write("a", "1\n").apply().unwrap();
        repo.delay_diff("c1", Duration::from_millis(1500)).unwrap();
        let options = DiffOptions {
            budget: Duration::from_millis(5),
            ..DiffOptions::default()
        };
        let started = std::time::Instant::now();
        let diff = analyze(&repo, "c1", options);
        assert!(started.elapsed() < Duration::from_millis(750));
        assert!(diff.files.is_empty());
        assert!(diff.removed_lines.is_empty());
        assert_eq!(
            diff.status,
            DiffStatus::Partial {
                reason: "diff exceeded its budget of 5ms".into()
            }
        );
    }

    #[test]
    fn unavailable_repository_is_an_error() {
        let repo = MemoryRepository::new();
        repo.commit("c1").write("a", "1\n").apply().unwrap();
        let commit = repo.get_commit("c1").unwrap();
        repo.set_unavailable(true).unwrap();
        let result = DiffAnalyzer::default().analyze(&repo, &commit);
        assert!(matches!(result, Err(StrataError::Repository(_))));
    }
}
