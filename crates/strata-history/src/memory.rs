//! In-memory commit graph for fixtures and tests.
//!
//! Commits are scripted with [`CommitBuilder`]; file contents are tracked per
//! commit with the introducing commit of every line, so diffs and blame behave
//! like a real repository.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use strata_core::{CommitRecord, Result, Signature, StrataError};

use crate::source::{Deadline, DiffLine, GitObjectSource, Hunk, RawFileDiff};

const DEFAULT_EPOCH: i64 = 1_700_000_000;

#[derive(Debug, Clone)]
struct Line {
    text: String,
    origin: String,
}

#[derive(Debug, Clone, Default)]
struct Blob {
    lines: Vec<Line>,
    binary: bool,
}

#[derive(Debug, Clone)]
struct StoredCommit {
    record: CommitRecord,
    tree: BTreeMap<String, Blob>,
    renames: Vec<(String, String)>,
}

#[derive(Default)]
struct Inner {
    commits: HashMap<String, StoredCommit>,
    head: Option<String>,
    branches: HashMap<String, String>,
    corrupt: HashSet<String>,
    unavailable: bool,
    diff_delays: HashMap<String, Duration>,
    blame_delays: HashMap<String, Duration>,
}

/// A scripted repository held entirely in memory.
///
/// # Examples
///
/// ```
/// use strata_history::{Deadline, GitObjectSource, MemoryRepository};
///
/// let repo = MemoryRepository::new();
/// let c1 = repo.commit("c1").author("alice", "alice@example.com")
///     .write("a.rs", "one\ntwo\n").apply().unwrap();
/// let c2 = repo.commit("c2").author("bob", "bob@example.com")
///     .write("a.rs", "one\nTWO\n").apply().unwrap();
///
/// assert_eq!(repo.tips(None).unwrap(), vec![c2.clone()]);
/// let diffs = repo.diff_between(Some(c1.as_str()), &c2, Deadline::none()).unwrap();
/// assert_eq!(diffs[0].lines_added(), 1);
/// assert_eq!(repo.blame("a.rs", &c2, Deadline::none()).unwrap(), vec![c1, c2]);
/// ```
#[derive(Default)]
pub struct MemoryRepository {
    inner: RwLock<Inner>,
    diff_calls: AtomicUsize,
}

impl MemoryRepository {
    /// Empty repository without commits.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start scripting a commit with the given sha.
    pub fn commit(&self, sha: impl Into<String>) -> CommitBuilder<'_> {
        CommitBuilder {
            repo: self,
            sha: sha.into(),
            parents: None,
            author: Signature::new("dev", "dev@example.com"),
            timestamp: None,
            message: String::new(),
            branch: None,
            changes: Vec::new(),
        }
    }

    /// Make `get_commit` fail for `sha` as if its object were damaged.
    pub fn mark_corrupt(&self, sha: &str) -> Result<()> {
        self.write_state()?.corrupt.insert(sha.to_string());
        Ok(())
    }

    /// Make every operation fail as if the repository were locked.
    pub fn set_unavailable(&self, unavailable: bool) -> Result<()> {
        self.write_state()?.unavailable = unavailable;
        Ok(())
    }

    /// Slow down diffs of `sha` by `delay`, or until the caller's deadline.
    pub fn delay_diff(&self, sha: &str, delay: Duration) -> Result<()> {
        self.write_state()?.diff_delays.insert(sha.to_string(), delay);
        Ok(())
    }

    /// Slow down blames of `path` by `delay`, or until the caller's deadline.
    pub fn delay_blame(&self, path: &str, delay: Duration) -> Result<()> {
        self.write_state()?.blame_delays.insert(path.to_string(), delay);
        Ok(())
    }

    /// Number of `diff_between` calls served so far.
    pub fn diff_calls(&self) -> usize {
        self.diff_calls.load(Ordering::Relaxed)
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        let guard = self
            .inner
            .read()
            .map_err(|_| StrataError::Repository("memory repository lock poisoned".into()))?;
        if guard.unavailable {
            return Err(StrataError::Repository("repository is unavailable".into()));
        }
        Ok(guard)
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| StrataError::Repository("memory repository lock poisoned".into()))
    }
}

enum Change {
    Write { path: String, content: String },
    Binary { path: String, tag: String },
    Delete { path: String },
    Rename { from: String, to: String, content: Option<String> },
}

/// Builder for one scripted commit.
pub struct CommitBuilder<'a> {
    repo: &'a MemoryRepository,
    sha: String,
    parents: Option<Vec<String>>,
    author: Signature,
    timestamp: Option<i64>,
    message: String,
    branch: Option<String>,
    changes: Vec<Change>,
}

impl CommitBuilder<'_> {
    /// Author (and committer) identity.
    pub fn author(mut self, name: &str, email: &str) -> Self {
        self.author = Signature::new(name, email);
        self
    }

    /// Commit time, unix seconds. Defaults to one minute after the first parent.
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Commit message.
    pub fn message(mut self, message: &str) -> Self {
        self.message = message.to_string();
        self
    }

    /// Explicit parents; defaults to the current tip of the target branch.
    pub fn parents(mut self, parents: &[&str]) -> Self {
        self.parents = Some(parents.iter().map(|p| p.to_string()).collect());
        self
    }

    /// Advance the named branch instead of HEAD.
    pub fn branch(mut self, name: &str) -> Self {
        self.branch = Some(name.to_string());
        self
    }

    /// Replace the full content of a text file.
    pub fn write(mut self, path: &str, content: &str) -> Self {
        self.changes.push(Change::Write {
            path: path.to_string(),
            content: content.to_string(),
        });
        self
    }

    /// Replace a binary file; `tag` identifies its content.
    pub fn write_binary(mut self, path: &str, tag: &str) -> Self {
        self.changes.push(Change::Binary {
            path: path.to_string(),
            tag: tag.to_string(),
        });
        self
    }

    /// Remove a file.
    pub fn delete(mut self, path: &str) -> Self {
        self.changes.push(Change::Delete {
            path: path.to_string(),
        });
        self
    }

    /// Move a file, reported by the source as a rename; optionally edit it.
    pub fn rename(mut self, from: &str, to: &str, content: Option<&str>) -> Self {
        self.changes.push(Change::Rename {
            from: from.to_string(),
            to: to.to_string(),
            content: content.map(str::to_string),
        });
        self
    }

    /// Record the commit and advance the branch.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Git`] for duplicate shas or unknown parents.
    pub fn apply(self) -> Result<String> {
        let mut state = self.repo.write_state()?;
        if state.commits.contains_key(&self.sha) {
            return Err(StrataError::Git(format!("duplicate commit {}", self.sha)));
        }

        let tip = match &self.branch {
            Some(name) => state.branches.get(name).cloned().or_else(|| state.head.clone()),
            None => state.head.clone(),
        };
        let parents = self.parents.unwrap_or_else(|| tip.into_iter().collect());
        let mut parent_trees = Vec::with_capacity(parents.len());
        for parent in &parents {
            let stored = state
                .commits
                .get(parent)
                .ok_or_else(|| StrataError::Git(format!("unknown parent {parent}")))?;
            parent_trees.push(stored.tree.clone());
        }
        let timestamp = self.timestamp.unwrap_or_else(|| {
            parents
                .first()
                .and_then(|p| state.commits.get(p))
                .map(|c| c.record.timestamp + 60)
                .unwrap_or(DEFAULT_EPOCH)
        });

        let mut tree = parent_trees.first().cloned().unwrap_or_default();
        let mut renames = Vec::new();
        for change in self.changes {
            match change {
                Change::Write { path, content } => {
                    let blob = text_blob(&content, &self.sha, &path, &parent_trees);
                    tree.insert(path, blob);
                }
                Change::Binary { path, tag } => {
                    let blob = Blob {
                        lines: vec![Line {
                            text: tag,
                            origin: self.sha.clone(),
                        }],
                        binary: true,
                    };
                    tree.insert(path, blob);
                }
                Change::Delete { path } => {
                    tree.remove(&path);
                }
                Change::Rename { from, to, content } => {
                    let old = tree.remove(&from).unwrap_or_default();
                    let blob = match content {
                        Some(content) => {
                            let previous = [BTreeMap::from([(to.clone(), old)])];
                            text_blob(&content, &self.sha, &to, &previous)
                        }
                        None => old,
                    };
                    tree.insert(to.clone(), blob);
                    renames.push((from, to));
                }
            }
        }

        let record = CommitRecord {
            sha: self.sha.clone(),
            parents,
            author: self.author.clone(),
            committer: self.author,
            timestamp,
            message: self.message,
        };
        state.commits.insert(
            self.sha.clone(),
            StoredCommit {
                record,
                tree,
                renames,
            },
        );
        match self.branch {
            Some(name) => {
                state.branches.insert(name, self.sha.clone());
            }
            None => state.head = Some(self.sha.clone()),
        }
        Ok(self.sha)
    }
}

/// Build a blob whose unchanged lines keep their origin from the parents.
fn text_blob(content: &str, sha: &str, path: &str, parents: &[BTreeMap<String, Blob>]) -> Blob {
    let texts: Vec<&str> = content.lines().collect();
    let mut origins: Vec<Option<String>> = vec![None; texts.len()];
    for parent in parents {
        let Some(previous) = parent.get(path) else {
            continue;
        };
        let old: Vec<&str> = previous.lines.iter().map(|l| l.text.as_str()).collect();
        for (i, j) in lcs_pairs(&old, &texts) {
            if origins[j].is_none() {
                origins[j] = Some(previous.lines[i].origin.clone());
            }
        }
    }
    Blob {
        lines: texts
            .iter()
            .zip(origins)
            .map(|(text, origin)| Line {
                text: text.to_string(),
                origin: origin.unwrap_or_else(|| sha.to_string()),
            })
            .collect(),
        binary: false,
    }
}

/// Matched index pairs of a longest common subsequence.
fn lcs_pairs(a: &[&str], b: &[&str]) -> Vec<(usize, usize)> {
    let (n, m) = (a.len(), b.len());
    let mut table = vec![vec![0u32; m + 1]; n + 1];
    for i in (0..n).rev() {
        for j in (0..m).rev() {
            table[i][j] = if a[i] == b[j] {
                table[i + 1][j + 1] + 1
            } else {
                table[i + 1][j].max(table[i][j + 1])
            };
        }
    }
    let mut pairs = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < n && j < m {
        if a[i] == b[j] {
            pairs.push((i, j));
            i += 1;
            j += 1;
        } else if table[i + 1][j] >= table[i][j + 1] {
            i += 1;
        } else {
            j += 1;
        }
    }
    pairs
}

fn blob_diff(
    old_path: Option<&str>,
    new_path: Option<&str>,
    old: Option<&Blob>,
    new: Option<&Blob>,
) -> Option<RawFileDiff> {
    let empty = Blob::default();
    let old_blob = old.unwrap_or(&empty);
    let new_blob = new.unwrap_or(&empty);
    let renamed = old_path.is_some() && new_path.is_some() && old_path != new_path;

    let same = old_blob.binary == new_blob.binary
        && old_blob.lines.len() == new_blob.lines.len()
        && old_blob
            .lines
            .iter()
            .zip(&new_blob.lines)
            .all(|(a, b)| a.text == b.text);
    if same && old.is_some() && new.is_some() && !renamed {
        return None;
    }

    let mut diff = RawFileDiff {
        old_path: old_path.map(str::to_string),
        new_path: new_path.map(str::to_string),
        binary: old_blob.binary || new_blob.binary,
        renamed,
        hunks: Vec::new(),
    };
    if diff.binary {
        return Some(diff);
    }

    let a: Vec<&str> = old_blob.lines.iter().map(|l| l.text.as_str()).collect();
    let b: Vec<&str> = new_blob.lines.iter().map(|l| l.text.as_str()).collect();
    let pairs = lcs_pairs(&a, &b);
    let kept_old: BTreeSet<usize> = pairs.iter().map(|(i, _)| *i).collect();
    let kept_new: BTreeSet<usize> = pairs.iter().map(|(_, j)| *j).collect();

    let hunk = Hunk {
        old_start: 1,
        old_lines: a.len() as u32,
        new_start: 1,
        new_lines: b.len() as u32,
        removed: (0..a.len())
            .filter(|i| !kept_old.contains(i))
            .map(|i| DiffLine {
                number: i as u32 + 1,
                text: a[i].to_string(),
            })
            .collect(),
        added: (0..b.len())
            .filter(|j| !kept_new.contains(j))
            .map(|j| DiffLine {
                number: j as u32 + 1,
                text: b[j].to_string(),
            })
            .collect(),
    };
    if !hunk.removed.is_empty() || !hunk.added.is_empty() {
        diff.hunks.push(hunk);
    }
    Some(diff)
}

impl GitObjectSource for MemoryRepository {
    fn tips(&self, branch: Option<&str>) -> Result<Vec<String>> {
        let state = self.read_state()?;
        match branch {
            None | Some("HEAD") => Ok(state.head.iter().cloned().collect()),
            Some(name) => state
                .branches
                .get(name)
                .map(|sha| vec![sha.clone()])
                .ok_or_else(|| StrataError::Git(format!("failed to resolve branch '{name}'"))),
        }
    }

    fn get_commit(&self, sha: &str) -> Result<CommitRecord> {
        let state = self.read_state()?;
        if state.corrupt.contains(sha) {
            return Err(StrataError::CorruptObject {
                sha: sha.to_string(),
                reason: "object failed to inflate".into(),
            });
        }
        state
            .commits
            .get(sha)
            .map(|c| c.record.clone())
            .ok_or_else(|| StrataError::CorruptObject {
                sha: sha.to_string(),
                reason: "object not found".into(),
            })
    }

    fn list_parents(&self, sha: &str) -> Result<Vec<String>> {
        let state = self.read_state()?;
        state
            .commits
            .get(sha)
            .map(|c| c.record.parents.clone())
            .ok_or_else(|| StrataError::CorruptObject {
                sha: sha.to_string(),
                reason: "object not found".into(),
            })
    }

    fn diff_between(
        &self,
        parent: Option<&str>,
        child: &str,
        deadline: Deadline,
    ) -> Result<Vec<RawFileDiff>> {
        self.diff_calls.fetch_add(1, Ordering::Relaxed);
        let delay = self.read_state()?.diff_delays.get(child).copied();
        stall(delay, deadline, &format!("diff of {child}"))?;

        let state = self.read_state()?;
        let missing = |sha: &str| StrataError::CorruptObject {
            sha: sha.to_string(),
            reason: "object not found".into(),
        };
        let child_commit = state.commits.get(child).ok_or_else(|| missing(child))?;
        let empty = BTreeMap::new();
        let parent_tree = match parent {
            Some(p) => &state.commits.get(p).ok_or_else(|| missing(p))?.tree,
            None => &empty,
        };
        let child_tree = &child_commit.tree;

        // Renames are only known relative to the first parent
        let first_parent = child_commit.record.parents.first().map(String::as_str);
        let renames: Vec<&(String, String)> = if parent.is_some() && parent == first_parent {
            child_commit
                .renames
                .iter()
                .filter(|(from, to)| parent_tree.contains_key(from) && child_tree.contains_key(to))
                .collect()
        } else {
            Vec::new()
        };
        let renamed_from: HashSet<&str> = renames.iter().map(|(f, _)| f.as_str()).collect();
        let renamed_to: HashSet<&str> = renames.iter().map(|(_, t)| t.as_str()).collect();

        let mut diffs = Vec::new();
        for (from, to) in &renames {
            if let Some(d) = blob_diff(
                Some(from.as_str()),
                Some(to.as_str()),
                parent_tree.get(from.as_str()),
                child_tree.get(to.as_str()),
            ) {
                diffs.push(d);
            }
        }

        let paths: BTreeSet<&String> = parent_tree.keys().chain(child_tree.keys()).collect();
        for path in paths {
            let old = parent_tree.get(path).filter(|_| !renamed_from.contains(path.as_str()));
            let new = child_tree.get(path).filter(|_| !renamed_to.contains(path.as_str()));
            if old.is_none() && new.is_none() {
                continue;
            }
            let old_path = old.map(|_| path.as_str());
            let new_path = new.map(|_| path.as_str());
            if let Some(d) = blob_diff(old_path, new_path, old, new) {
                diffs.push(d);
            }
        }
        diffs.sort_by(|a, b| a.path().cmp(b.path()));
        Ok(diffs)
    }

    fn blame(&self, path: &str, at: &str, deadline: Deadline) -> Result<Vec<String>> {
        let delay = self.read_state()?.blame_delays.get(path).copied();
        stall(delay, deadline, &format!("blame of {path} at {at}"))?;

        let state = self.read_state()?;
        let commit = state.commits.get(at).ok_or_else(|| StrataError::CorruptObject {
            sha: at.to_string(),
            reason: "object not found".into(),
        })?;
        let blob = commit
            .tree
            .get(path)
            .ok_or_else(|| StrataError::Git(format!("path '{path}' does not exist in {at}")))?;
        Ok(blob.lines.iter().map(|l| l.origin.clone()).collect())
    }
}

/// Sit out an injected delay, giving up at the deadline.
fn stall(delay: Option<Duration>, deadline: Deadline, what: &str) -> Result<()> {
    let Some(delay) = delay else {
        return Ok(());
    };
    match deadline.remaining() {
        Some(left) if left <= delay => {
            std::thread::sleep(left);
            Err(StrataError::Timeout(what.to_string()))
        }
        _ => {
            std::thread::sleep(delay);
            Ok(())
        }
    }
}
