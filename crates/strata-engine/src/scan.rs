//! Scan orchestration: ingest, analyze in parallel, fold, checkpoint, publish.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rayon::prelude::*;
use serde::Serialize;
use strata_analytics::{
    AnalysisSettings, AnalyzedCommit, CommitAnalyzer, FixClassifier, PatternClassifier,
};
use strata_core::{
    AnalysisEvent, AnalysisSnapshot, EventPayload, MergePolicy, Result, StrataConfig, StrataError,
};
use strata_history::{
    DiffAnalyzer, DiffOptions, GitObjectSource, IngestOptions, Ingestor, ScanProgress,
    ScanWarning,
};

use crate::aggregate::AggregateStore;
use crate::events::EventPublisher;

/// Cooperative cancellation flag shared with a running scan.
///
/// The scan observes it at batch boundaries and right before each commit.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// Fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Serializes scans per repository id.
#[derive(Debug, Default)]
pub struct ScanRegistry {
    active: Mutex<HashSet<String>>,
}

impl ScanRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `repo_id` for one scan.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::ScanInProgress`] while another guard for the
    /// same repository is alive.
    pub fn acquire(&self, repo_id: &str) -> Result<ScanGuard<'_>> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(repo_id.to_string()) {
            return Err(StrataError::ScanInProgress(repo_id.to_string()));
        }
        Ok(ScanGuard {
            registry: self,
            repo_id: repo_id.to_string(),
        })
    }

    /// Whether a scan currently holds `repo_id`.
    pub fn is_active(&self, repo_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(repo_id)
    }
}

/// Releases the repository when dropped.
#[derive(Debug)]
pub struct ScanGuard<'a> {
    registry: &'a ScanRegistry,
    repo_id: String,
}

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.registry
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.repo_id);
    }
}

/// Outcome of one scan.
///
/// Recoverable problems are listed here; a fatal error comes back as a
/// [`ScanError`] that still carries the report up to the failure.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    /// Repository id.
    pub repo_id: String,
    /// Commits folded and checkpointed by this scan.
    pub commits_analyzed: u64,
    /// Batches checkpointed by this scan.
    pub batches: u64,
    /// Recoverable conditions: skipped objects, partial diffs, blame failures.
    pub warnings: Vec<ScanWarning>,
    /// Commits whose diff was partial and which need reprocessing.
    pub partial_commits: Vec<String>,
    /// Last committed checkpoint.
    pub snapshot: Option<AnalysisSnapshot>,
}

impl ScanReport {
    fn new(repo_id: &str) -> Self {
        Self {
            repo_id: repo_id.to_string(),
            ..Self::default()
        }
    }

    /// True when the scan met no recoverable problem.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty() && self.partial_commits.is_empty()
    }
}

/// A fatal scan failure; the last checkpoint is unchanged.
#[derive(Debug, thiserror::Error)]
#[error("scan of {} aborted: {error}", .report.repo_id)]
pub struct ScanError {
    /// What aborted the scan.
    #[source]
    pub error: StrataError,
    /// Progress made before the failure.
    pub report: ScanReport,
}

/// Drives scans for one configuration.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use strata_core::StrataConfig;
/// use strata_engine::{
///     AggregateStore, CancellationToken, EventPublisher, MemoryStore, RetryPolicy, Scanner,
/// };
/// use strata_history::MemoryRepository;
///
/// let repo = MemoryRepository::new();
/// repo.commit("c1").write("a.rs", "fn a() {}\n").apply().unwrap();
///
/// let store = AggregateStore::new(Arc::new(MemoryStore::new()), RetryPolicy::default());
/// let scanner = Scanner::new(StrataConfig::default(), store, Arc::new(EventPublisher::default()))
///     .unwrap();
/// let report = scanner.scan("demo", &repo, &CancellationToken::new(), |_| {}).unwrap();
/// assert_eq!(report.commits_analyzed, 1);
/// ```
pub struct Scanner {
    config: StrataConfig,
    store: AggregateStore,
    publisher: Arc<EventPublisher>,
    registry: Arc<ScanRegistry>,
    classifier: Arc<dyn FixClassifier>,
}

impl Scanner {
    /// Scanner with the fix classifier described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Config`] when a fix rule does not compile.
    pub fn new(
        config: StrataConfig,
        store: AggregateStore,
        publisher: Arc<EventPublisher>,
    ) -> Result<Self> {
        let classifier: Arc<dyn FixClassifier> =
            Arc::new(PatternClassifier::from_config(&config.risk.fix_rules)?);
        Ok(Self {
            config,
            store,
            publisher,
            registry: Arc::new(ScanRegistry::new()),
            classifier,
        })
    }

    /// Share a registry with other scanners of the same repositories.
    pub fn with_registry(mut self, registry: Arc<ScanRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the bug-fix classification strategy.
    pub fn with_classifier(mut self, classifier: Arc<dyn FixClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Registry serializing this scanner's scans.
    pub fn registry(&self) -> &Arc<ScanRegistry> {
        &self.registry
    }

    /// Publisher events are sent to.
    pub fn publisher(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    /// Analyze every commit not yet covered by the checkpoint of `repo_id`.
    ///
    /// Commits are folded in batches of `scan.batch_size`; each batch is
    /// persisted with its checkpoint in one atomic commit before its events
    /// are published and `on_progress` is called.
    ///
    /// # Errors
    ///
    /// Fatal conditions return a [`ScanError`]: another scan of the same
    /// repository, an invalid configuration, an unavailable repository,
    /// exhausted store retries, or cancellation. Every failure except
    /// cancellation and a concurrent scan publishes `ScanFailed`.
    pub fn scan<S, F>(
        &self,
        repo_id: &str,
        source: &S,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> std::result::Result<ScanReport, ScanError>
    where
        S: GitObjectSource + ?Sized,
        F: FnMut(ScanProgress),
    {
        let mut report = ScanReport::new(repo_id);
        let _guard = match self.registry.acquire(repo_id) {
            Ok(guard) => guard,
            Err(error) => return Err(ScanError { error, report }),
        };

        match self.run(repo_id, source, cancel, &mut on_progress, &mut report) {
            Ok(()) => {
                tracing::info!(
                    repo = repo_id,
                    commits = report.commits_analyzed,
                    batches = report.batches,
                    warnings = report.warnings.len(),
                    "scan complete"
                );
                Ok(report)
            }
            Err(StrataError::Cancelled) => {
                tracing::info!(repo = repo_id, batches = report.batches, "scan cancelled");
                Err(ScanError {
                    error: StrataError::Cancelled,
                    report,
                })
            }
            Err(error) => {
                tracing::warn!(repo = repo_id, %error, "scan failed");
                let last = report.snapshot.as_ref().map_or(0, |s| s.event_sequence);
                self.publisher.publish(AnalysisEvent::new(
                    repo_id,
                    last,
                    EventPayload::ScanFailed {
                        message: error.to_string(),
                    },
                ));
                Err(ScanError { error, report })
            }
        }
    }

    fn run<S, F>(
        &self,
        repo_id: &str,
        source: &S,
        cancel: &CancellationToken,
        on_progress: &mut F,
        report: &mut ScanReport,
    ) -> Result<()>
    where
        S: GitObjectSource + ?Sized,
        F: FnMut(ScanProgress),
    {
        self.config.validate()?;
        let scan = &self.config.scan;
        let policy = scan.merge_policy()?;
        let window = scan.window()?;

        let mut snapshot = self.checkpoint(repo_id, policy)?;
        report.snapshot = Some(snapshot.clone());

        let settings = AnalysisSettings::from_config(&self.config)?;
        let mut state = self.store.load_state(repo_id, settings)?;
        self.republish(repo_id)?;

        let options = IngestOptions {
            branch: scan.branch.clone(),
            merge_policy: policy,
            window,
            floor: window.and(snapshot.window_start),
        };
        let mut plan = Ingestor::new(source, options).plan(&state.processed())?;
        report.warnings.extend(plan.take_warnings());
        if plan.is_empty() {
            tracing::info!(repo = repo_id, "nothing new to analyze");
            return Ok(());
        }

        let analyzer = CommitAnalyzer::new(
            DiffAnalyzer::new(DiffOptions {
                rename_threshold: scan.rename_threshold,
                budget: Duration::from_millis(scan.diff_budget_ms),
                merge_policy: policy,
            }),
            Arc::clone(&self.classifier),
            Duration::from_millis(scan.blame_budget_ms),
        );
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(scan.workers)
            .build()
            .map_err(|e| StrataError::Config(format!("cannot start diff workers: {e}")))?;

        while !plan.is_empty() {
            if cancel.is_cancelled() {
                return Err(StrataError::Cancelled);
            }
            let batch = plan.next_batch(scan.batch_size);
            tracing::debug!(repo = repo_id, commits = batch.len(), "analyzing batch");

            let analyzed = pool.install(|| {
                batch
                    .into_par_iter()
                    .map(|commit| analyzer.analyze(source, commit))
                    .collect::<Result<Vec<AnalyzedCommit>>>()
            })?;

            let mut folded = Vec::with_capacity(analyzed.len());
            let mut partials = Vec::new();
            let mut rescored = BTreeSet::new();
            let mut changed_files = BTreeSet::new();
            let mut window_start = snapshot.window_start;
            let mut window_end = snapshot.window_end;
            for commit in &analyzed {
                let outcome = state.fold(commit);
                if !outcome.folded {
                    continue;
                }
                let sha = commit.commit.sha.clone();
                if commit.diff.is_partial() {
                    partials.push(sha.clone());
                }
                report.warnings.extend(commit.warnings.iter().cloned());
                rescored.extend(outcome.rescored);
                changed_files.extend(outcome.changed_files);
                let ts = commit.commit.timestamp;
                window_start = Some(window_start.map_or(ts, |w| w.min(ts)));
                window_end = Some(window_end.map_or(ts, |w| w.max(ts)));
                folded.push(sha);
            }

            let next = AnalysisSnapshot {
                repo_id: repo_id.to_string(),
                last_processed: frontier(&analyzed),
                window_start,
                window_end,
                sequence: snapshot.sequence + 1,
                commits_analyzed: snapshot.commits_analyzed + folded.len() as u64,
                merge_policy: policy,
                event_sequence: snapshot.event_sequence + 2,
            };
            let events = vec![
                AnalysisEvent::new(
                    repo_id,
                    snapshot.event_sequence + 1,
                    EventPayload::CommitsAnalyzed {
                        shas: folded.clone(),
                        changed_files: changed_files.into_iter().collect(),
                        rescored: rescored.into_iter().collect(),
                    },
                ),
                AnalysisEvent::new(
                    repo_id,
                    snapshot.event_sequence + 2,
                    EventPayload::SnapshotAdvanced {
                        snapshot: next.clone(),
                    },
                ),
            ];

            let changes = state.take_changes();
            let writes = self.store.batch_writes(&state, &changes, &next, &events)?;
            if cancel.is_cancelled() {
                return Err(StrataError::Cancelled);
            }
            self.store.commit(repo_id, &writes)?;

            tracing::info!(
                repo = repo_id,
                sequence = next.sequence,
                commits = folded.len(),
                partial = partials.len(),
                "checkpoint advanced"
            );
            snapshot = next;
            report.batches += 1;
            report.commits_analyzed += folded.len() as u64;
            report.partial_commits.extend(partials);
            report.snapshot = Some(snapshot.clone());

            self.deliver(repo_id, &events);
            on_progress(plan.progress());
        }
        Ok(())
    }

    /// Last checkpoint, or an empty one for a new repository.
    fn checkpoint(&self, repo_id: &str, policy: MergePolicy) -> Result<AnalysisSnapshot> {
        match self.store.snapshot(repo_id)? {
            Some(snapshot) if snapshot.commits_analyzed > 0 && snapshot.merge_policy != policy => {
                Err(StrataError::Config(format!(
                    "repository {repo_id} was analyzed with merge policy '{}', not '{policy}'; \
                     keep the policy or start from a fresh store",
                    snapshot.merge_policy
                )))
            }
            Some(mut snapshot) => {
                snapshot.merge_policy = policy;
                Ok(snapshot)
            }
            None => Ok(AnalysisSnapshot::empty(repo_id, policy)),
        }
    }

    /// Publish committed events that never reached the publisher.
    fn republish(&self, repo_id: &str) -> Result<()> {
        let delivered = self.store.delivered(repo_id)?;
        let pending = self.store.events_since(repo_id, delivered)?;
        if !pending.is_empty() {
            tracing::info!(repo = repo_id, events = pending.len(), "republishing undelivered events");
            self.deliver(repo_id, &pending);
        }
        Ok(())
    }

    fn deliver(&self, repo_id: &str, events: &[AnalysisEvent]) {
        for event in events {
            self.publisher.publish(event.clone());
        }
        if let Some(last) = events.last() {
            if let Err(e) = self.store.mark_delivered(repo_id, last.sequence_number) {
                tracing::warn!(repo = repo_id, error = %e, "failed to record event delivery");
            }
        }
    }
}

/// Batch commits that are not a parent of another commit in the batch.
fn frontier(batch: &[AnalyzedCommit]) -> Vec<String> {
    let parents: HashSet<&str> = batch
        .iter()
        .flat_map(|a| a.commit.parents.iter().map(String::as_str))
        .collect();
    batch
        .iter()
        .map(|a| a.commit.sha.as_str())
        .filter(|sha| !parents.contains(sha))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_serializes_per_repository() {
        let registry = ScanRegistry::new();
        let guard = registry.acquire("a").unwrap();
        assert!(matches!(
            registry.acquire("a"),
            Err(StrataError::ScanInProgress(_))
        ));
        let _other = registry.acquire("b").unwrap();
        drop(guard);
        assert!(!registry.is_active("a"));
        assert!(registry.acquire("a").is_ok());
    }

    #[test]
    fn cancellation_is_shared_between_clones() {
        let token = CancellationToken::new();
        let seen_by_scan = token.clone();
        token.cancel();
        assert!(seen_by_scan.is_cancelled());
    }

    #[test]
    fn scan_error_names_repository() {
        let err = ScanError {
            error: StrataError::Repository("locked".into()),
            report: ScanReport::new("r1"),
        };
        assert_eq!(err.to_string(), "scan of r1 aborted: repository error: locked");
    }
}
