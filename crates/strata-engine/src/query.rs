//! Read-only query surface over the last committed checkpoint.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;
use strata_analytics::{rank_hotspots, CommitState, Hotspot};
use strata_core::{
    AnalysisSnapshot, CommitSummary, CouplingEdge, FileOwnership, Result, RiskScore,
    StrataConfig, StrataError,
};

use crate::aggregate::AggregateStore;
use crate::store::EntityKind;

/// Largest timeline page served at once.
pub const MAX_PAGE: usize = 500;

/// One page of the commit timeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelinePage {
    /// Rows in fold order, oldest first.
    pub items: Vec<CommitSummary>,
    /// Cursor for the next page; `None` at the end.
    pub next_cursor: Option<u64>,
}

/// Timeline request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimelineQuery {
    /// Cursor returned by the previous page.
    pub cursor: Option<u64>,
    /// Rows per page (capped at [`MAX_PAGE`]).
    pub limit: usize,
    /// Only commits at or after this timestamp.
    pub since: Option<i64>,
    /// Only commits at or before this timestamp.
    pub until: Option<i64>,
}

impl TimelineQuery {
    fn admits(&self, row: &CommitSummary) -> bool {
        self.since.map_or(true, |s| row.timestamp >= s)
            && self.until.map_or(true, |u| row.timestamp <= u)
    }
}

/// Repository-level code metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSummary {
    /// Repository id.
    pub repo_id: String,
    /// Commits folded so far.
    pub commits_analyzed: u64,
    /// Files with recorded history.
    pub files_tracked: usize,
    /// Commits classified as bug fixes.
    pub bug_fixes: usize,
    /// Commits awaiting reprocessing.
    pub partial_commits: usize,
    /// Mean risk score over complete commits.
    pub mean_risk: f64,
    /// Files a single contributor dominates.
    pub bus_factor_one: usize,
    /// Oldest analyzed commit.
    pub window_start: Option<i64>,
    /// Newest analyzed commit.
    pub window_end: Option<i64>,
}

/// Full copy of the current aggregates, for subscribers that missed events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resync {
    /// Checkpoint the data belongs to.
    pub snapshot: Option<AnalysisSnapshot>,
    /// Every commit in fold order.
    pub timeline: Vec<CommitSummary>,
    /// Ownership of every tracked file.
    pub ownership: Vec<FileOwnership>,
    /// Served coupling edges, each pair once.
    pub coupling: Vec<CouplingEdge>,
}

#[derive(Default)]
struct QueryCache {
    sequence: u64,
    risk: HashMap<String, RiskScore>,
    ownership: HashMap<String, FileOwnership>,
    coupling: HashMap<String, Vec<CouplingEdge>>,
}

/// Point lookups and listings for one repository.
///
/// Reads only committed state, so it never waits for a running scan.
/// Results are cached until the checkpoint sequence changes.
pub struct QueryService {
    store: AggregateStore,
    repo_id: String,
    coverage: f64,
    cache: Mutex<QueryCache>,
}

impl QueryService {
    /// Queries against `repo_id` with the ownership coverage of `config`.
    pub fn new(store: AggregateStore, repo_id: impl Into<String>, config: &StrataConfig) -> Self {
        Self {
            store,
            repo_id: repo_id.into(),
            coverage: config.ownership.coverage,
            cache: Mutex::new(QueryCache::default()),
        }
    }

    /// Repository this service answers for.
    pub fn repo_id(&self) -> &str {
        &self.repo_id
    }

    /// Last committed checkpoint.
    pub fn snapshot(&self) -> Result<Option<AnalysisSnapshot>> {
        self.store.snapshot(&self.repo_id)
    }

    fn cache(&self) -> Result<std::sync::MutexGuard<'_, QueryCache>> {
        let sequence = self.snapshot()?.map_or(0, |s| s.sequence);
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if cache.sequence != sequence {
            *cache = QueryCache {
                sequence,
                ..QueryCache::default()
            };
        }
        Ok(cache)
    }

    /// Full sha for `sha`, which may be an unambiguous prefix.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::NotFound`] for unknown or ambiguous prefixes.
    pub fn resolve_sha(&self, sha: &str) -> Result<String> {
        if self.store.commit_state(&self.repo_id, sha)?.is_some() {
            return Ok(sha.to_string());
        }
        let matches: Vec<String> = self
            .store
            .backend()
            .list(&self.repo_id, EntityKind::Commit)?
            .into_iter()
            .map(|(id, _)| id)
            .filter(|id| id.starts_with(sha))
            .take(2)
            .collect();
        match matches.as_slice() {
            [one] => Ok(one.clone()),
            [] => Err(StrataError::NotFound(format!("commit {sha}"))),
            _ => Err(StrataError::NotFound(format!("ambiguous commit prefix {sha}"))),
        }
    }

    /// Stored analysis of a commit.
    pub fn commit(&self, sha: &str) -> Result<CommitState> {
        let sha = self.resolve_sha(sha)?;
        self.store
            .commit_state(&self.repo_id, &sha)?
            .ok_or_else(|| StrataError::NotFound(format!("commit {sha}")))
    }

    /// Serve `key` from the cache slot picked by `slot`, loading it on a miss.
    ///
    /// A loaded value is only cached when no checkpoint landed while it was
    /// being read, so a value from an older checkpoint never outlives it.
    fn cached<T, F>(&self, slot: F, key: &str, load: impl FnOnce() -> Result<T>) -> Result<T>
    where
        T: Clone,
        F: Fn(&mut QueryCache) -> &mut HashMap<String, T>,
    {
        let sequence = {
            let mut cache = self.cache()?;
            if let Some(hit) = slot(&mut cache).get(key) {
                return Ok(hit.clone());
            }
            cache.sequence
        };
        let value = load()?;
        let mut cache = self.cache()?;
        if cache.sequence == sequence {
            slot(&mut cache).insert(key.to_string(), value.clone());
        }
        Ok(value)
    }

    /// Risk score of a commit.
    pub fn risk(&self, sha: &str) -> Result<RiskScore> {
        self.cached(|c| &mut c.risk, sha, || Ok(self.commit(sha)?.risk()))
    }

    /// Owners and bus factor of a file.
    pub fn ownership(&self, path: &str) -> Result<FileOwnership> {
        self.cached(|c| &mut c.ownership, path, || {
            Ok(self
                .store
                .owners(&self.repo_id, path)?
                .ok_or_else(|| StrataError::NotFound(format!("file {path}")))?
                .to_ownership(path, self.coverage))
        })
    }

    /// Top coupling neighbors of a file, strongest first.
    pub fn coupling(&self, path: &str) -> Result<Vec<CouplingEdge>> {
        self.cached(|c| &mut c.coupling, path, || {
            if self.store.file_stats(&self.repo_id, path)?.is_none() {
                return Err(StrataError::NotFound(format!("file {path}")));
            }
            self.store.neighbors(&self.repo_id, path)
        })
    }

    /// One page of the commit timeline.
    pub fn timeline(&self, query: TimelineQuery) -> Result<TimelinePage> {
        let limit = query.limit.clamp(1, MAX_PAGE);
        let mut items = Vec::with_capacity(limit);
        let mut after = query.cursor;
        loop {
            let rows = self.store.timeline(&self.repo_id, after, limit)?;
            let exhausted = rows.len() < limit;
            for (seq, row) in rows {
                after = Some(seq);
                if query.admits(&row) {
                    items.push(row);
                    if items.len() == limit {
                        return Ok(TimelinePage {
                            items,
                            next_cursor: Some(seq),
                        });
                    }
                }
            }
            if exhausted {
                return Ok(TimelinePage {
                    items,
                    next_cursor: None,
                });
            }
        }
    }

    /// Files ranked by change activity.
    pub fn hotspots(&self, limit: usize) -> Result<Vec<Hotspot>> {
        let files = self.store.all_file_stats(&self.repo_id)?;
        Ok(rank_hotspots(
            files.iter().map(|(path, stats)| (path.as_str(), stats)),
            limit,
        ))
    }

    /// Commits whose diff exceeded its budget.
    pub fn partial_commits(&self) -> Result<Vec<CommitSummary>> {
        let mut partial: Vec<CommitState> = self
            .store
            .commits(&self.repo_id)?
            .into_iter()
            .filter(|c| c.partial)
            .collect();
        partial.sort_by_key(|c| c.seq);
        Ok(partial.iter().map(CommitState::summary).collect())
    }

    /// Repository-level metrics.
    pub fn summary(&self) -> Result<RepoSummary> {
        let snapshot = self.snapshot()?;
        let commits = self.store.commits(&self.repo_id)?;
        let complete: Vec<&CommitState> = commits.iter().filter(|c| !c.partial).collect();
        let mean_risk = if complete.is_empty() {
            0.0
        } else {
            complete.iter().map(|c| c.score).sum::<f64>() / complete.len() as f64
        };
        let bus_factor_one = self
            .store
            .all_owners(&self.repo_id)?
            .iter()
            .filter(|(path, owners)| owners.to_ownership(path, self.coverage).bus_factor == 1)
            .count();

        Ok(RepoSummary {
            repo_id: self.repo_id.clone(),
            commits_analyzed: snapshot.as_ref().map_or(0, |s| s.commits_analyzed),
            files_tracked: self.store.all_file_stats(&self.repo_id)?.len(),
            bug_fixes: commits.iter().filter(|c| c.bug_fix).count(),
            partial_commits: commits.len() - complete.len(),
            mean_risk,
            bus_factor_one,
            window_start: snapshot.as_ref().and_then(|s| s.window_start),
            window_end: snapshot.as_ref().and_then(|s| s.window_end),
        })
    }

    /// Everything a subscriber needs after a detected gap.
    pub fn resync(&self) -> Result<Resync> {
        let snapshot = self.snapshot()?;
        let timeline = self
            .store
            .timeline(&self.repo_id, None, usize::MAX)?
            .into_iter()
            .map(|(_, row)| row)
            .collect();
        let ownership = self
            .store
            .all_owners(&self.repo_id)?
            .iter()
            .map(|(path, owners)| owners.to_ownership(path, self.coverage))
            .collect();
        let mut coupling = BTreeMap::new();
        for (_, edges) in self.store.all_neighbors(&self.repo_id)? {
            for edge in edges {
                coupling
                    .entry((edge.file_a.clone(), edge.file_b.clone()))
                    .or_insert(edge);
            }
        }
        Ok(Resync {
            snapshot,
            timeline,
            ownership,
            coupling: coupling.into_values().collect(),
        })
    }
}
