//! Typed aggregate storage on top of a [`Persistence`] backend.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use strata_analytics::{
    pair_id, parse_pair_id, AnalysisSettings, CommitState, FileChanges, FileOwners, FileStats,
    PairStats, RepoState, StateChanges,
};
use strata_core::{
    AnalysisEvent, AnalysisSnapshot, CommitSummary, CouplingEdge, Result, StoreConfig,
    StrataError,
};

use crate::store::{EntityKind, EntityWrite, Persistence};

pub(crate) const SNAPSHOT_ID: &str = "current";
const DELIVERED_ID: &str = "delivered";

/// Number of published events kept for redelivery.
pub const EVENT_RETENTION: u64 = 256;

/// Bounded exponential backoff for store commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub backoff: Duration,
}

impl From<&StoreConfig> for RetryPolicy {
    fn from(config: &StoreConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&StoreConfig::default())
    }
}

/// Zero-padded id that sorts in sequence order.
pub fn sequence_id(seq: u64) -> String {
    format!("{seq:020}")
}

/// Maps [`RepoState`] to stored entities and back.
///
/// The snapshot is only ever written in the same atomic commit as the batch
/// it describes.
#[derive(Clone)]
pub struct AggregateStore {
    backend: Arc<dyn Persistence>,
    retry: RetryPolicy,
}

impl AggregateStore {
    /// Store over `backend`.
    pub fn new(backend: Arc<dyn Persistence>, retry: RetryPolicy) -> Self {
        Self { backend, retry }
    }

    /// Underlying backend.
    pub fn backend(&self) -> &Arc<dyn Persistence> {
        &self.backend
    }

    fn get_json<T: DeserializeOwned>(&self, repo: &str, kind: EntityKind, id: &str) -> Result<Option<T>> {
        self.backend
            .get(repo, kind, id)?
            .map(|raw| serde_json::from_str(&raw).map_err(StrataError::from))
            .transpose()
    }

    fn list_json<T: DeserializeOwned>(&self, repo: &str, kind: EntityKind) -> Result<Vec<(String, T)>> {
        self.backend
            .list(repo, kind)?
            .into_iter()
            .map(|(id, raw)| Ok((id, serde_json::from_str(&raw)?)))
            .collect()
    }

    /// Last committed checkpoint.
    pub fn snapshot(&self, repo: &str) -> Result<Option<AnalysisSnapshot>> {
        self.get_json(repo, EntityKind::Snapshot, SNAPSHOT_ID)
    }

    /// Rebuild the in-memory state from the last committed batch.
    pub fn load_state(&self, repo: &str, settings: AnalysisSettings) -> Result<RepoState> {
        let mut state = RepoState::new(settings);
        for (_, commit) in self.list_json::<CommitState>(repo, EntityKind::Commit)? {
            state.restore_commit(commit);
        }
        for (path, stats) in self.list_json::<FileStats>(repo, EntityKind::FileStats)? {
            state.restore_file(path, stats);
        }
        for (path, owners) in self.list_json::<FileOwners>(repo, EntityKind::Owners)? {
            state.restore_owners(path, owners);
        }
        for (path, changes) in self.list_json::<FileChanges>(repo, EntityKind::FileChanges)? {
            state.restore_file_changes(path, changes);
        }
        for (id, stats) in self.list_json::<PairStats>(repo, EntityKind::Pair)? {
            let (a, b) = parse_pair_id(&id)
                .ok_or_else(|| StrataError::Store(format!("malformed pair id '{id}'")))?;
            state.restore_pair(&a, &b, stats)?;
        }
        tracing::debug!(repo, commits = state.commit_count(), "loaded state");
        Ok(state)
    }

    /// Writes that persist `changes`, the events and the new snapshot together.
    pub fn batch_writes(
        &self,
        state: &RepoState,
        changes: &StateChanges,
        snapshot: &AnalysisSnapshot,
        events: &[AnalysisEvent],
    ) -> Result<Vec<EntityWrite>> {
        let mut writes = Vec::new();

        for sha in &changes.commits {
            match state.commit(sha) {
                Some(commit) => {
                    writes.push(put(EntityKind::Commit, sha, commit)?);
                    writes.push(put(EntityKind::Timeline, &sequence_id(commit.seq), &commit.summary())?);
                }
                None => writes.push(delete(EntityKind::Commit, sha)),
            }
        }

        for path in &changes.files {
            writes.push(put_or_delete(EntityKind::FileStats, path, state.file_stats(path))?);
            writes.push(put_or_delete(EntityKind::Owners, path, state.owners().get(path))?);
            writes.push(put_or_delete(
                EntityKind::FileChanges,
                path,
                state.coupling().file(path),
            )?);
        }

        for (a, b) in &changes.pairs {
            writes.push(put_or_delete(
                EntityKind::Pair,
                &pair_id(a, b),
                state.coupling().pair(a, b),
            )?);
        }

        for path in &changes.views {
            let neighbors = state.neighbors(path);
            if neighbors.is_empty() {
                writes.push(delete(EntityKind::Neighbors, path));
            } else {
                writes.push(put(EntityKind::Neighbors, path, &neighbors)?);
            }
        }

        for event in events {
            writes.push(put(EntityKind::Event, &sequence_id(event.sequence_number), event)?);
            if event.sequence_number > EVENT_RETENTION {
                let expired = event.sequence_number - EVENT_RETENTION;
                writes.push(delete(EntityKind::Event, &sequence_id(expired)));
            }
        }

        writes.push(put(EntityKind::Snapshot, SNAPSHOT_ID, snapshot)?);
        Ok(writes)
    }

    /// Commit writes atomically, retrying transient failures with backoff.
    ///
    /// # Errors
    ///
    /// Returns the last [`StrataError::Store`] once retries are exhausted;
    /// nothing from `writes` is visible in that case.
    pub fn commit(&self, repo: &str, writes: &[EntityWrite]) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.backend.commit(repo, writes) {
                Ok(()) => {
                    tracing::debug!(repo, writes = writes.len(), "committed batch");
                    return Ok(());
                }
                Err(e) if e.is_recoverable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.backoff.saturating_mul(1 << attempt.min(16));
                    tracing::warn!(repo, attempt, error = %e, ?delay, "store commit failed, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(StrataError::Store(format!(
                        "commit failed after {} attempt(s): {e}",
                        attempt + 1
                    )))
                }
            }
        }
    }

    /// Stored analysis of one commit.
    pub fn commit_state(&self, repo: &str, sha: &str) -> Result<Option<CommitState>> {
        self.get_json(repo, EntityKind::Commit, sha)
    }

    /// Every stored commit.
    pub fn commits(&self, repo: &str) -> Result<Vec<CommitState>> {
        Ok(self
            .list_json(repo, EntityKind::Commit)?
            .into_iter()
            .map(|(_, c)| c)
            .collect())
    }

    /// Stats of one file.
    pub fn file_stats(&self, repo: &str, path: &str) -> Result<Option<FileStats>> {
        self.get_json(repo, EntityKind::FileStats, path)
    }

    /// Stats of every tracked file.
    pub fn all_file_stats(&self, repo: &str) -> Result<Vec<(String, FileStats)>> {
        self.list_json(repo, EntityKind::FileStats)
    }

    /// Contributor masses of one file.
    pub fn owners(&self, repo: &str, path: &str) -> Result<Option<FileOwners>> {
        self.get_json(repo, EntityKind::Owners, path)
    }

    /// Contributor masses of every tracked file.
    pub fn all_owners(&self, repo: &str) -> Result<Vec<(String, FileOwners)>> {
        self.list_json(repo, EntityKind::Owners)
    }

    /// Materialized coupling neighbors of one file.
    pub fn neighbors(&self, repo: &str, path: &str) -> Result<Vec<CouplingEdge>> {
        Ok(self
            .get_json(repo, EntityKind::Neighbors, path)?
            .unwrap_or_default())
    }

    /// Materialized neighbors of every file.
    pub fn all_neighbors(&self, repo: &str) -> Result<Vec<(String, Vec<CouplingEdge>)>> {
        self.list_json(repo, EntityKind::Neighbors)
    }

    /// Timeline rows after fold position `after`, in fold order.
    pub fn timeline(
        &self,
        repo: &str,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<(u64, CommitSummary)>> {
        let after = after.map(sequence_id);
        self.backend
            .page(repo, EntityKind::Timeline, after.as_deref(), limit)?
            .into_iter()
            .map(|(id, raw)| {
                let seq = id
                    .parse::<u64>()
                    .map_err(|_| StrataError::Store(format!("malformed timeline id '{id}'")))?;
                Ok((seq, serde_json::from_str(&raw)?))
            })
            .collect()
    }

    /// Sequence number of the last event handed to the publisher.
    pub fn delivered(&self, repo: &str) -> Result<u64> {
        Ok(self
            .get_json(repo, EntityKind::Snapshot, DELIVERED_ID)?
            .unwrap_or(0))
    }

    /// Record that every event up to `sequence` was published.
    pub fn mark_delivered(&self, repo: &str, sequence: u64) -> Result<()> {
        self.backend.put(
            repo,
            EntityKind::Snapshot,
            DELIVERED_ID,
            &serde_json::to_string(&sequence)?,
        )
    }

    /// Retained events with a sequence number greater than `after`.
    pub fn events_since(&self, repo: &str, after: u64) -> Result<Vec<AnalysisEvent>> {
        let after = sequence_id(after);
        Ok(self
            .backend
            .page(repo, EntityKind::Event, Some(&after), usize::MAX)?
            .into_iter()
            .map(|(_, raw)| serde_json::from_str(&raw))
            .collect::<std::result::Result<Vec<AnalysisEvent>, _>>()?)
    }
}

fn put<T: Serialize + ?Sized>(kind: EntityKind, id: &str, value: &T) -> Result<EntityWrite> {
    Ok(EntityWrite::Put {
        kind,
        id: id.to_string(),
        value: serde_json::to_string(value)?,
    })
}

fn delete(kind: EntityKind, id: &str) -> EntityWrite {
    EntityWrite::Delete {
        kind,
        id: id.to_string(),
    }
}

fn put_or_delete<T: Serialize>(kind: EntityKind, id: &str, value: Option<&T>) -> Result<EntityWrite> {
    match value {
        Some(v) => put(kind, id, v),
        None => Ok(delete(kind, id)),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::store::MemoryStore;
    use strata_core::{MergePolicy, StrataConfig};

    struct Flaky {
        inner: MemoryStore,
        failures_left: AtomicU32,
    }

    impl Persistence for Flaky {
        fn get(&self, repo: &str, kind: EntityKind, id: &str) -> Result<Option<String>> {
            self.inner.get(repo, kind, id)
        }
        fn list(&self, repo: &str, kind: EntityKind) -> Result<Vec<(String, String)>> {
            self.inner.list(repo, kind)
        }
        fn page(
            &self,
            repo: &str,
            kind: EntityKind,
            after: Option<&str>,
            limit: usize,
        ) -> Result<Vec<(String, String)>> {
            self.inner.page(repo, kind, after, limit)
        }
        fn commit(&self, repo: &str, writes: &[EntityWrite]) -> Result<()> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(StrataError::Store("disk busy".into()));
            }
            self.inner.commit(repo, writes)
        }
    }

    fn flaky(failures: u32) -> Arc<Flaky> {
        Arc::new(Flaky {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(failures),
        })
    }

    fn retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: Duration::from_millis(1),
        }
    }

    fn snapshot_write() -> Vec<EntityWrite> {
        let snapshot = AnalysisSnapshot::empty("r", MergePolicy::FirstParent);
        vec![put(EntityKind::Snapshot, SNAPSHOT_ID, &snapshot).unwrap()]
    }

    #[test]
    fn transient_failures_are_retried() {
        let backend = flaky(2);
        let store = AggregateStore::new(backend.clone(), retry(3));
        store.commit("r", &snapshot_write()).unwrap();
        assert!(store.snapshot("r").unwrap().is_some());
    }

    #[test]
    fn exhausted_retries_leave_nothing_behind() {
        let backend = flaky(10);
        let store = AggregateStore::new(backend, retry(2));
        let err = store.commit("r", &snapshot_write()).unwrap_err();
        assert!(err.to_string().contains("3 attempt"));
        assert!(store.snapshot("r").unwrap().is_none());
    }

    #[test]
    fn sequence_ids_sort_numerically() {
        assert!(sequence_id(9) < sequence_id(10));
        assert_eq!(sequence_id(42).parse::<u64>().unwrap(), 42);
    }

    #[test]
    fn pruned_pairs_are_deleted_from_the_store() {
        use strata_analytics::{CommitAnalyzer, PatternClassifier};
        use strata_history::{DiffAnalyzer, GitObjectSource, MemoryRepository};

        let repo = MemoryRepository::new();
        repo.commit("c0").write("hub.rs", "0\n").write("leaf.rs", "0\n").apply().unwrap();
        for i in 1..12 {
            repo.commit(format!("c{i}")).write("hub.rs", &format!("{i}\n")).apply().unwrap();
        }
        let analyzer = CommitAnalyzer::new(
            DiffAnalyzer::default(),
            Arc::new(PatternClassifier::default()),
            Duration::from_secs(5),
        );
        let settings = AnalysisSettings::from_config(&StrataConfig::default()).unwrap();
        let mut state = RepoState::new(settings);
        let store = AggregateStore::new(Arc::new(MemoryStore::new()), retry(0));
        let snapshot = AnalysisSnapshot::empty("r", MergePolicy::FirstParent);
        let id = pair_id("hub.rs", "leaf.rs");

        state.fold(&analyzer.analyze(&repo, repo.get_commit("c0").unwrap()).unwrap());
        let changes = state.take_changes();
        store.commit("r", &store.batch_writes(&state, &changes, &snapshot, &[]).unwrap()).unwrap();
        assert!(store.backend().get("r", EntityKind::Pair, &id).unwrap().is_some());

        for i in 1..12 {
            let commit = repo.get_commit(&format!("c{i}")).unwrap();
            state.fold(&analyzer.analyze(&repo, commit).unwrap());
        }
        let changes = state.take_changes();
        let writes = store.batch_writes(&state, &changes, &snapshot, &[]).unwrap();
        assert!(writes.contains(&delete(EntityKind::Pair, &id)));
        assert!(writes.contains(&delete(EntityKind::Neighbors, "leaf.rs")));
        store.commit("r", &writes).unwrap();
        assert!(store.backend().get("r", EntityKind::Pair, &id).unwrap().is_none());
        assert!(store.neighbors("r", "hub.rs").unwrap().is_empty());
    }

    #[test]
    fn empty_store_loads_empty_state() {
        let store = AggregateStore::new(Arc::new(MemoryStore::new()), RetryPolicy::default());
        let settings = AnalysisSettings::from_config(&StrataConfig::default()).unwrap();
        let state = store.load_state("r", settings).unwrap();
        assert_eq!(state.commit_count(), 0);
        assert!(store.neighbors("r", "missing").unwrap().is_empty());
    }
}
