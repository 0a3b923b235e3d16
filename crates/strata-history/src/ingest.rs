//! Commit Ingestor: walks unprocessed history into a topologically ordered plan.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use strata_core::{CommitRecord, MergePolicy, Result, StrataError, WindowBound, SECONDS_PER_DAY};

use crate::graph::CommitGraph;
use crate::source::GitObjectSource;

/// Options for one ingestion walk.
///
/// # Examples
///
/// ```
/// use strata_core::MergePolicy;
/// use strata_history::IngestOptions;
///
/// let opts = IngestOptions::default();
/// assert_eq!(opts.merge_policy, MergePolicy::FirstParent);
/// assert!(opts.window.is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Ref to walk (default: HEAD).
    pub branch: Option<String>,
    /// Which parents are followed.
    pub merge_policy: MergePolicy,
    /// Optional bound on how much history is analyzed.
    pub window: Option<WindowBound>,
    /// Commits older than this were excluded by an earlier windowed scan.
    pub floor: Option<i64>,
}

/// A recoverable condition met during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanWarning {
    /// Commit the warning is about, if any.
    pub sha: Option<String>,
    /// What happened.
    pub message: String,
}

impl ScanWarning {
    /// Warning about a specific commit.
    pub fn for_commit(sha: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sha: Some(sha.into()),
            message: message.into(),
        }
    }
}

impl fmt::Display for ScanWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sha {
            Some(sha) => write!(f, "{}: {}", short(sha), self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

fn short(sha: &str) -> &str {
    &sha[..sha.len().min(8)]
}

/// Progress counters for a running scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanProgress {
    /// Commits planned.
    pub total: usize,
    /// Commits handed out so far.
    pub done: usize,
}

/// Unprocessed commits in topological order, ready to be batched.
#[derive(Debug, Default)]
pub struct IngestPlan {
    commits: VecDeque<CommitRecord>,
    warnings: Vec<ScanWarning>,
    total: usize,
}

impl IngestPlan {
    /// Commits still to be handed out.
    pub fn remaining(&self) -> usize {
        self.commits.len()
    }

    /// True when nothing is left to analyze.
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// Progress of the plan.
    pub fn progress(&self) -> ScanProgress {
        ScanProgress {
            total: self.total,
            done: self.total - self.commits.len(),
        }
    }

    /// Warnings recorded while walking.
    pub fn warnings(&self) -> &[ScanWarning] {
        &self.warnings
    }

    /// Drain the warnings recorded while walking.
    pub fn take_warnings(&mut self) -> Vec<ScanWarning> {
        std::mem::take(&mut self.warnings)
    }

    /// Hand out the next `size` commits, oldest first.
    pub fn next_batch(&mut self, size: usize) -> Vec<CommitRecord> {
        let n = size.max(1).min(self.commits.len());
        self.commits.drain(..n).collect()
    }
}

impl Iterator for IngestPlan {
    type Item = CommitRecord;

    fn next(&mut self) -> Option<Self::Item> {
        self.commits.pop_front()
    }
}

/// Walks a [`GitObjectSource`] and plans the commits a scan must fold.
pub struct Ingestor<'a, S: GitObjectSource + ?Sized> {
    source: &'a S,
    options: IngestOptions,
}

impl<'a, S: GitObjectSource + ?Sized> Ingestor<'a, S> {
    /// Ingestor over `source`.
    pub fn new(source: &'a S, options: IngestOptions) -> Self {
        Self { source, options }
    }

    /// Collect every reachable commit not in `processed`, in topological order.
    ///
    /// The walk stops at processed commits and at the window bound. Corrupt
    /// commits are skipped with a warning; their parents are still followed
    /// when they can be read.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Repository`] if the repository is unreachable,
    /// or any non-recoverable source error.
    pub fn plan(&self, processed: &HashSet<String>) -> Result<IngestPlan> {
        let tips = self.source.tips(self.options.branch.as_deref())?;
        let mut warnings = Vec::new();

        let floor = self.time_floor(&tips, &mut warnings)?;
        let mut graph = CommitGraph::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = tips.into_iter().rev().collect();

        while let Some(sha) = stack.pop() {
            if processed.contains(&sha) || !visited.insert(sha.clone()) {
                continue;
            }
            match self.source.get_commit(&sha) {
                Ok(record) => {
                    if floor.is_some_and(|f| record.timestamp < f) {
                        continue;
                    }
                    self.push_parents(&record.parents, &mut stack);
                    graph.insert(record);
                }
                Err(StrataError::CorruptObject { sha, reason }) => {
                    tracing::warn!(%sha, %reason, "skipping unreadable commit");
                    warnings.push(ScanWarning::for_commit(
                        sha.clone(),
                        format!("skipped unreadable commit: {reason}"),
                    ));
                    match self.source.list_parents(&sha) {
                        Ok(parents) => self.push_parents(&parents, &mut stack),
                        Err(StrataError::CorruptObject { .. }) => {}
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        graph.link_parents();
        let mut commits = graph.into_topological();
        if let Some(WindowBound::Commits(n)) = self.options.window {
            if commits.len() > n {
                commits = commits.split_off(commits.len() - n);
            }
        }

        tracing::info!(
            commits = commits.len(),
            warnings = warnings.len(),
            policy = %self.options.merge_policy,
            "planned ingestion"
        );
        Ok(IngestPlan {
            total: commits.len(),
            commits: commits.into(),
            warnings,
        })
    }

    fn push_parents(&self, parents: &[String], stack: &mut Vec<String>) {
        match self.options.merge_policy {
            MergePolicy::FirstParent => stack.extend(parents.first().cloned()),
            MergePolicy::SkipMerges => stack.extend(parents.iter().rev().cloned()),
        }
    }

    /// Oldest admissible timestamp, anchored at the newest tip rather than
    /// the wall clock.
    fn time_floor(&self, tips: &[String], warnings: &mut Vec<ScanWarning>) -> Result<Option<i64>> {
        let window_floor = match self.options.window {
            Some(WindowBound::Days(days)) => {
                let mut newest: Option<i64> = None;
                for tip in tips {
                    match self.source.get_commit(tip) {
                        Ok(c) => newest = Some(newest.map_or(c.timestamp, |n| n.max(c.timestamp))),
                        Err(StrataError::CorruptObject { .. }) => {
                            warnings.push(ScanWarning::for_commit(
                                tip.clone(),
                                "tip unreadable; ignored for the time window",
                            ));
                        }
                        Err(e) => return Err(e),
                    }
                }
                newest.map(|n| n - days as i64 * SECONDS_PER_DAY)
            }
            _ => None,
        };
        Ok(match (window_floor, self.options.floor) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        })
    }
}
