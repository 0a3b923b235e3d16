//! Git object access seam.
//!
//! Every history consumer goes through [`GitObjectSource`] so the ingestion
//! pipeline can run against a real repository ([`crate::GitRepository`]) or a
//! scripted fixture ([`crate::MemoryRepository`]).

use std::time::{Duration, Instant};

use strata_core::{ChangeKind, CommitRecord, Result, StrataError};

/// Point in time after which a source abandons the current operation.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use strata_history::Deadline;
///
/// assert!(!Deadline::none().expired());
/// assert!(Deadline::after(Duration::ZERO).check("diff of c1").is_err());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No time limit.
    pub fn none() -> Self {
        Self(None)
    }

    /// Expires `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self(Instant::now().checked_add(budget))
    }

    /// Whether the deadline has passed.
    pub fn expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Time left, or `None` without a limit.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Fail with [`StrataError::Timeout`] once expired.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Timeout`] naming `what` when the deadline passed.
    pub fn check(&self, what: &str) -> Result<()> {
        if self.expired() {
            return Err(StrataError::Timeout(what.to_string()));
        }
        Ok(())
    }
}

/// One line inside a hunk, with its number on the relevant side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffLine {
    /// 1-based line number (old side for removals, new side for additions).
    pub number: u32,
    /// Line text without the leading marker.
    pub text: String,
}

/// One hunk of a file diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hunk {
    /// Start line in the old file.
    pub old_start: u32,
    /// Line count in the old file.
    pub old_lines: u32,
    /// Start line in the new file.
    pub new_start: u32,
    /// Line count in the new file.
    pub new_lines: u32,
    /// Removed lines, numbered on the old side.
    pub removed: Vec<DiffLine>,
    /// Added lines, numbered on the new side.
    pub added: Vec<DiffLine>,
}

/// File-level diff as reported by a source, before rename pairing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawFileDiff {
    /// Path before the change; `None` for added files.
    pub old_path: Option<String>,
    /// Path after the change; `None` for deleted files.
    pub new_path: Option<String>,
    /// Binary content, no hunks.
    pub binary: bool,
    /// The source itself detected a rename.
    pub renamed: bool,
    /// Parsed hunks.
    pub hunks: Vec<Hunk>,
}

impl RawFileDiff {
    /// The path this change is reported under: new path, or old path for deletions.
    pub fn path(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or("")
    }

    /// Classify the change.
    pub fn kind(&self) -> ChangeKind {
        match (&self.old_path, &self.new_path) {
            (None, Some(_)) => ChangeKind::Added,
            (Some(_), None) => ChangeKind::Deleted,
            (Some(old), Some(new)) if self.renamed || old != new => ChangeKind::Renamed,
            _ => ChangeKind::Modified,
        }
    }

    /// Number of added lines.
    pub fn lines_added(&self) -> u32 {
        self.hunks.iter().map(|h| h.added.len() as u32).sum()
    }

    /// Number of removed lines.
    pub fn lines_removed(&self) -> u32 {
        self.hunks.iter().map(|h| h.removed.len() as u32).sum()
    }

    /// Old-side numbers of every removed line.
    pub fn removed_line_numbers(&self) -> Vec<u32> {
        self.hunks
            .iter()
            .flat_map(|h| h.removed.iter().map(|l| l.number))
            .collect()
    }
}

/// Read access to a commit graph and its objects.
///
/// Implementations must be shareable across diff workers.
pub trait GitObjectSource: Send + Sync {
    /// Tip commits to walk from: the given ref, or HEAD.
    ///
    /// # Errors
    ///
    /// Returns [`strata_core::StrataError::Repository`] when the repository is
    /// unreachable or locked.
    fn tips(&self, branch: Option<&str>) -> Result<Vec<String>>;

    /// Read one commit.
    ///
    /// # Errors
    ///
    /// Returns [`strata_core::StrataError::CorruptObject`] for an unreadable
    /// commit, or [`strata_core::StrataError::Repository`] when the whole
    /// repository is unavailable.
    fn get_commit(&self, sha: &str) -> Result<CommitRecord>;

    /// Parent shas of a commit, in recorded order.
    fn list_parents(&self, sha: &str) -> Result<Vec<String>> {
        Ok(self.get_commit(sha)?.parents)
    }

    /// File diffs between `parent` (or the empty tree) and `child`.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Timeout`] as soon as `deadline` passes.
    fn diff_between(
        &self,
        parent: Option<&str>,
        child: &str,
        deadline: Deadline,
    ) -> Result<Vec<RawFileDiff>>;

    /// Introducing commit of every line of `path` as of commit `at`.
    ///
    /// Index `i` of the result is line `i + 1`.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Timeout`] once `deadline` has passed.
    fn blame(&self, path: &str, at: &str, deadline: Deadline) -> Result<Vec<String>>;
}

impl<S: GitObjectSource + ?Sized> GitObjectSource for std::sync::Arc<S> {
    fn tips(&self, branch: Option<&str>) -> Result<Vec<String>> {
        (**self).tips(branch)
    }

    fn get_commit(&self, sha: &str) -> Result<CommitRecord> {
        (**self).get_commit(sha)
    }

    fn list_parents(&self, sha: &str) -> Result<Vec<String>> {
        (**self).list_parents(sha)
    }

    fn diff_between(
        &self,
        parent: Option<&str>,
        child: &str,
        deadline: Deadline,
    ) -> Result<Vec<RawFileDiff>> {
        (**self).diff_between(parent, child, deadline)
    }

    fn blame(&self, path: &str, at: &str, deadline: Deadline) -> Result<Vec<String>> {
        (**self).blame(path, at, deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(number: u32, text: &str) -> DiffLine {
        DiffLine {
            number,
            text: text.into(),
        }
    }

    #[test]
    fn kind_follows_paths() {
        let added = RawFileDiff {
            new_path: Some("a.rs".into()),
            ..RawFileDiff::default()
        };
        assert_eq!(added.kind(), ChangeKind::Added);

        let deleted = RawFileDiff {
            old_path: Some("a.rs".into()),
            ..RawFileDiff::default()
        };
        assert_eq!(deleted.kind(), ChangeKind::Deleted);
        assert_eq!(deleted.path(), "a.rs");

        let moved = RawFileDiff {
            old_path: Some("a.rs".into()),
            new_path: Some("b.rs".into()),
            ..RawFileDiff::default()
        };
        assert_eq!(moved.kind(), ChangeKind::Renamed);
    }

    #[test]
    fn deadline_tracks_remaining_time() {
        let open = Deadline::none();
        assert_eq!(open.remaining(), None);
        assert!(open.check("diff").is_ok());

        let far = Deadline::after(Duration::from_secs(60));
        assert!(!far.expired());
        assert!(far.remaining().unwrap() > Duration::from_secs(59));

        let gone = Deadline::after(Duration::ZERO);
        assert_eq!(gone.remaining(), Some(Duration::ZERO));
        assert!(matches!(gone.check("blame of f"), Err(StrataError::Timeout(w)) if w == "blame of f"));
    }

    #[test]
    fn counts_lines_across_hunks() {
        let diff = RawFileDiff {
            old_path: Some("a.rs".into()),
            new_path: Some("a.rs".into()),
            hunks: vec![
                Hunk {
                    removed: vec![line(2, "x")],
                    added: vec![line(2, "y"), line(3, "z")],
                    ..Hunk::default()
                },
                Hunk {
                    removed: vec![line(9, "q")],
                    ..Hunk::default()
                },
            ],
            ..RawFileDiff::default()
        };
        assert_eq!(diff.kind(), ChangeKind::Modified);
        assert_eq!(diff.lines_added(), 2);
        assert_eq!(diff.lines_removed(), 2);
        assert_eq!(diff.removed_line_numbers(), vec![2, 9]);
    }
}
