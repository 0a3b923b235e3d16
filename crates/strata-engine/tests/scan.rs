use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use strata_analytics::CommitState;
use strata_core::{EventType, Result, StrataConfig, StrataError};
use strata_engine::{
    AggregateStore, CancellationToken, DeliveryStatus, EntityKind, EntityWrite, EventPublisher,
    MemoryStore, Persistence, QueryService, Resync, RetryPolicy, ScanReport, Scanner,
    SqliteStore, TimelineQuery,
};
use strata_history::MemoryRepository;

const REPO: &str = "fixture";
const T0: i64 = 1_700_000_000;
const DAY: i64 = 86_400;

fn lines(tag: &str, range: std::ops::RangeInclusive<u32>) -> String {
    range.map(|i| format!("{tag} {i}\n")).collect()
}

/// Twelve commits by four authors: two fixes, a rename, a delete, and a
/// merge whose side branch only the skip-merges policy walks.
fn history() -> MemoryRepository {
    let repo = MemoryRepository::new();
    let alice = ("Alice", "alice@example.com");
    let bob = ("Bob", "bob@example.com");
    let carol = ("Carol", "carol@example.com");
    let dave = ("Dave", "dave@example.com");

    let mut lib = lines("lib", 1..=20);
    let mut util = lines("util", 1..=10);
    repo.commit("c01")
        .author(alice.0, alice.1)
        .at(T0)
        .message("initial import")
        .write("src/lib.rs", &lib)
        .write("src/util.rs", &util)
        .apply()
        .unwrap();

    lib = lines("lib", 1..=2) + &lines("bob", 3..=5) + &lines("lib", 6..=20);
    repo.commit("c02")
        .author(bob.0, bob.1)
        .at(T0 + DAY)
        .message("add parser")
        .write("src/lib.rs", &lib)
        .write("tests/lib_test.rs", &lines("test", 1..=5))
        .apply()
        .unwrap();

    util.push_str(&lines("more", 11..=14));
    lib.push_str(&lines("lib", 21..=22));
    repo.commit("c03")
        .author(alice.0, alice.1)
        .at(T0 + 2 * DAY)
        .message("extend helpers")
        .write("src/util.rs", &util)
        .write("src/lib.rs", &lib)
        .apply()
        .unwrap();

    util = lines("util", 1..=1) + "fixed 2\n" + &lines("util", 3..=10) + &lines("more", 11..=14);
    repo.commit("c04")
        .author(carol.0, carol.1)
        .at(T0 + 3 * DAY)
        .message("fix: crash in util")
        .write("src/util.rs", &util)
        .apply()
        .unwrap();

    repo.commit("c05")
        .author(bob.0, bob.1)
        .at(T0 + 4 * DAY)
        .message("move util")
        .rename("src/util.rs", "src/helpers.rs", None)
        .apply()
        .unwrap();

    util.push_str("wired 15\n");
    lib.push_str("lib 23\n");
    repo.commit("c06")
        .author(alice.0, alice.1)
        .at(T0 + 5 * DAY)
        .message("wire helpers")
        .write("src/helpers.rs", &util)
        .write("src/lib.rs", &lib)
        .apply()
        .unwrap();

    repo.commit("c07")
        .author(carol.0, carol.1)
        .at(T0 + 6 * DAY)
        .message("docs")
        .write("docs/guide.md", &lines("guide", 1..=8))
        .apply()
        .unwrap();

    lib = lines("lib", 1..=2) + &lines("fixed", 3..=5) + &lines("lib", 6..=23);
    repo.commit("c08")
        .author(bob.0, bob.1)
        .at(T0 + 7 * DAY)
        .message("Fix off-by-one in parser (#12)")
        .write("src/lib.rs", &lib)
        .write("tests/lib_test.rs", &lines("test", 1..=6))
        .apply()
        .unwrap();

    lib.push_str("lib 24\n");
    repo.commit("c09")
        .author(dave.0, dave.1)
        .at(T0 + 8 * DAY)
        .message("drop guide")
        .delete("docs/guide.md")
        .write("src/lib.rs", &lib)
        .apply()
        .unwrap();

    repo.commit("c10")
        .author(dave.0, dave.1)
        .at(T0 + 9 * DAY)
        .parents(&["c09"])
        .branch("feature")
        .message("feature flag")
        .write("src/feature.rs", &lines("feature", 1..=6))
        .apply()
        .unwrap();

    lib.push_str("lib 25\n");
    repo.commit("c11")
        .author(alice.0, alice.1)
        .at(T0 + 10 * DAY)
        .message("tune parser")
        .write("src/lib.rs", &lib)
        .apply()
        .unwrap();

    repo.commit("c12")
        .author(alice.0, alice.1)
        .at(T0 + 11 * DAY)
        .parents(&["c11", "c10"])
        .message("Merge branch 'feature'")
        .write("src/feature.rs", &lines("feature", 1..=6))
        .apply()
        .unwrap();

    repo
}

fn config(batch_size: usize) -> StrataConfig {
    let mut config = StrataConfig::default();
    config.scan.batch_size = batch_size;
    config.scan.workers = 2;
    config.coupling.min_weight = 0.0;
    config
}

fn retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 1,
        backoff: Duration::from_millis(1),
    }
}

fn memory_store() -> AggregateStore {
    AggregateStore::new(Arc::new(MemoryStore::new()), retry())
}

fn scanner(config: &StrataConfig, store: &AggregateStore) -> Scanner {
    Scanner::new(config.clone(), store.clone(), Arc::new(EventPublisher::default())).unwrap()
}

fn scan(config: &StrataConfig, store: &AggregateStore, repo: &MemoryRepository) -> ScanReport {
    scanner(config, store)
        .scan(REPO, repo, &CancellationToken::new(), |_| {})
        .unwrap()
}

/// Everything derived from history, without the checkpoint bookkeeping.
fn aggregates(store: &AggregateStore) -> (Vec<CommitState>, Resync) {
    let query = QueryService::new(store.clone(), REPO, &StrataConfig::default());
    let mut resync = query.resync().unwrap();
    resync.snapshot = None;
    (store.commits(REPO).unwrap(), resync)
}

/// Delegates to a shared [`MemoryStore`]; commits fail once the budget is spent.
struct Crashing {
    inner: Arc<MemoryStore>,
    commits_left: AtomicUsize,
    fail_puts: bool,
}

impl Crashing {
    fn new(inner: Arc<MemoryStore>, commits: usize) -> Self {
        Self {
            inner,
            commits_left: AtomicUsize::new(commits),
            fail_puts: false,
        }
    }
}

impl Persistence for Crashing {
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

    fn put(&self, repo: &str, kind: EntityKind, id: &str, value: &str) -> Result<()> {
        if self.fail_puts {
            return Err(StrataError::Store("marker write refused".into()));
        }
        self.inner.put(repo, kind, id, value)
    }

    fn commit(&self, repo: &str, writes: &[EntityWrite]) -> Result<()> {
        if self.commits_left.load(Ordering::SeqCst) == 0 {
            return Err(StrataError::Store("simulated crash".into()));
        }
        self.commits_left.fetch_sub(1, Ordering::SeqCst);
        self.inner.commit(repo, writes)
    }
}

#[test]
fn batch_size_does_not_change_aggregates() {
    let repo = history();
    let whole = memory_store();
    let report = scan(&config(100), &whole, &repo);
    assert_eq!(report.commits_analyzed, 11);
    assert_eq!(report.batches, 1);

    for batch_size in [1, 3, 5] {
        let batched = memory_store();
        let report = scan(&config(batch_size), &batched, &repo);
        assert_eq!(report.commits_analyzed, 11);
        assert_eq!(aggregates(&batched), aggregates(&whole), "batch size {batch_size}");
    }
}

#[test]
fn pruning_is_independent_of_batch_size() {
    let repo = history();
    let stored_pairs = |store: &AggregateStore| store.backend().list(REPO, EntityKind::Pair).unwrap();

    let unpruned = memory_store();
    scan(&config(100), &unpruned, &repo);

    let mut pruning = config(100);
    pruning.coupling.min_weight = 0.4;
    let whole = memory_store();
    scan(&pruning, &whole, &repo);
    assert!(stored_pairs(&whole).len() < stored_pairs(&unpruned).len());

    for batch_size in [1, 3, 5] {
        pruning.scan.batch_size = batch_size;
        let batched = memory_store();
        scan(&pruning, &batched, &repo);
        assert_eq!(stored_pairs(&batched), stored_pairs(&whole), "batch size {batch_size}");
        assert_eq!(aggregates(&batched), aggregates(&whole), "batch size {batch_size}");
    }
}

#[test]
fn rescanning_is_idempotent() {
    let repo = history();
    let store = memory_store();
    scan(&config(4), &store, &repo);
    let first = aggregates(&store);
    let calls = repo.diff_calls();

    let again = scan(&config(4), &store, &repo);
    assert_eq!(again.commits_analyzed, 0);
    assert_eq!(again.batches, 0);
    assert_eq!(repo.diff_calls(), calls);
    assert_eq!(aggregates(&store), first);

    let fresh = memory_store();
    scan(&config(4), &fresh, &repo);
    assert_eq!(aggregates(&fresh), first);
}

#[test]
fn ownership_shares_sum_to_one_with_positive_bus_factor() {
    let repo = history();
    let store = memory_store();
    scan(&config(5), &store, &repo);
    let resync = QueryService::new(store, REPO, &StrataConfig::default())
        .resync()
        .unwrap();
    assert!(!resync.ownership.is_empty());
    for file in &resync.ownership {
        let total: f64 = file.owners.iter().map(|o| o.share).sum();
        assert!((total - 1.0).abs() < 1e-6, "{} sums to {total}", file.path);
        assert!(file.bus_factor >= 1);
        assert!(file.owners.windows(2).all(|w| w[0].share >= w[1].share));
    }
}

#[test]
fn deleted_files_are_dropped() {
    let repo = history();
    let store = memory_store();
    scan(&config(5), &store, &repo);
    let query = QueryService::new(store, REPO, &StrataConfig::default());
    assert!(matches!(
        query.ownership("docs/guide.md"),
        Err(StrataError::NotFound(_))
    ));
    assert!(matches!(
        query.ownership("src/util.rs"),
        Err(StrataError::NotFound(_))
    ));
}

#[test]
fn coupling_edges_are_symmetric() {
    let repo = history();
    let store = memory_store();
    scan(&config(3), &store, &repo);
    let query = QueryService::new(store, REPO, &StrataConfig::default());
    let resync = query.resync().unwrap();
    assert!(!resync.coupling.is_empty());
    for edge in &resync.coupling {
        assert!(edge.file_a < edge.file_b);
        let from_a = query.coupling(&edge.file_a).unwrap();
        let from_b = query.coupling(&edge.file_b).unwrap();
        let forward = from_a.iter().find(|e| e.other(&edge.file_a) == Some(&edge.file_b));
        let backward = from_b.iter().find(|e| e.other(&edge.file_b) == Some(&edge.file_a));
        let (forward, backward) = (forward.unwrap(), backward.unwrap());
        assert_eq!(forward.weight, backward.weight);
        assert_eq!(forward.co_changes, backward.co_changes);
    }
}

#[test]
fn risk_scores_stay_in_bounds() {
    let repo = history();
    let store = memory_store();
    scan(&config(2), &store, &repo);
    let query = QueryService::new(store.clone(), REPO, &StrataConfig::default());
    for commit in store.commits(REPO).unwrap() {
        let risk = query.risk(&commit.sha).unwrap();
        assert!((0.0..=100.0).contains(&risk.score), "{}: {}", risk.sha, risk.score);
    }
}

#[test]
fn later_fix_raises_the_introducing_commit_score() {
    let repo = MemoryRepository::new();
    let body: String = lines("f", 1..=100);
    repo.commit("c1")
        .author("A", "a@example.com")
        .write("F.py", &body)
        .message("add F")
        .apply()
        .unwrap();
    repo.commit("twin")
        .author("A", "a@example.com")
        .write("G.py", &lines("g", 1..=100))
        .message("add G")
        .apply()
        .unwrap();
    let fixed = lines("patched", 1..=10) + &lines("f", 11..=100);
    repo.commit("c2")
        .author("B", "b@example.com")
        .write("F.py", &fixed)
        .message("fix: wrong defaults")
        .apply()
        .unwrap();

    let store = memory_store();
    let report = scan(&config(1), &store, &repo);
    assert_eq!(report.commits_analyzed, 3);

    let query = QueryService::new(store, REPO, &StrataConfig::default());
    let introducing = query.commit("c1").unwrap();
    assert_eq!(introducing.implicated_lines, 10);
    assert!((introducing.factors.own_defects - 0.1).abs() < 1e-12);
    assert!(query.risk("c1").unwrap().score > query.risk("twin").unwrap().score);
    assert!(query.commit("c2").unwrap().bug_fix);
}

#[test]
fn half_the_changes_together_gives_half_weight() {
    let repo = MemoryRepository::new();
    for i in 0..10 {
        let mut commit = repo
            .commit(format!("c{i:02}"))
            .at(T0)
            .write("x.rs", &format!("x {i}\n"));
        if i % 2 == 0 {
            commit = commit.write("y.rs", &format!("y {i}\n"));
        }
        commit.apply().unwrap();
    }

    let store = memory_store();
    scan(&config(4), &store, &repo);
    let query = QueryService::new(store, REPO, &StrataConfig::default());
    let edges = query.coupling("x.rs").unwrap();
    let edge = edges
        .iter()
        .find(|e| e.other("x.rs") == Some("y.rs"))
        .unwrap();
    assert_eq!(edge.co_changes, 5);
    assert!((edge.weight - 0.5).abs() < 1e-9, "weight {}", edge.weight);
}

#[test]
fn crash_between_batches_resumes_without_gaps() {
    let repo = history();
    let shared = Arc::new(MemoryStore::new());
    let crashing = AggregateStore::new(Arc::new(Crashing::new(Arc::clone(&shared), 2)), retry());
    let publisher = Arc::new(EventPublisher::default());
    let mut sub = publisher.subscribe();
    let scanner = Scanner::new(config(3), crashing, Arc::clone(&publisher)).unwrap();

    let err = scanner
        .scan(REPO, &repo, &CancellationToken::new(), |_| {})
        .unwrap_err();
    assert!(matches!(err.error, StrataError::Store(_)));
    assert_eq!(err.report.batches, 2);

    let healthy = AggregateStore::new(shared, retry());
    let checkpoint = healthy.snapshot(REPO).unwrap().unwrap();
    assert_eq!(checkpoint.sequence, 2);
    assert_eq!(checkpoint.commits_analyzed, 6);
    assert_eq!(healthy.commits(REPO).unwrap().len(), 6);

    let failed: Vec<_> = std::iter::from_fn(|| sub.try_recv())
        .filter(|d| d.event.event_type == EventType::ScanFailed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].event.sequence_number, checkpoint.event_sequence);
    assert_eq!(failed[0].status, DeliveryStatus::InOrder);

    let resumed = scan(&config(3), &healthy, &repo);
    assert_eq!(resumed.commits_analyzed, 5);
    let final_snapshot = healthy.snapshot(REPO).unwrap().unwrap();
    assert_eq!(final_snapshot.commits_analyzed, 11);
    assert_eq!(final_snapshot.sequence, 4);

    let reference = memory_store();
    scan(&config(100), &reference, &repo);
    assert_eq!(aggregates(&healthy), aggregates(&reference));
}

#[test]
fn rename_carries_ownership_forward() {
    let repo = MemoryRepository::new();
    let body = lines("a", 1..=10);
    repo.commit("c1")
        .author("Alice", "alice@example.com")
        .write("a.py", &body)
        .apply()
        .unwrap();
    repo.commit("c2")
        .author("Bob", "bob@example.com")
        .delete("a.py")
        .write("b.py", &(body + "b 11\n"))
        .apply()
        .unwrap();

    let store = memory_store();
    scan(&config(10), &store, &repo);
    let query = QueryService::new(store, REPO, &StrataConfig::default());
    let ownership = query.ownership("b.py").unwrap();
    assert_eq!(ownership.primary_owner(), Some("alice@example.com"));
    assert_eq!(ownership.owners.len(), 2);
    assert!(query.ownership("a.py").is_err());
    assert_eq!(query.hotspots(10).unwrap()[0].revisions, 2);
}

#[test]
fn corrupt_commit_is_skipped_with_a_warning() {
    let repo = history();
    repo.mark_corrupt("c07").unwrap();
    let store = memory_store();
    let report = scan(&config(4), &store, &repo);
    assert_eq!(report.commits_analyzed, 10);
    assert!(report
        .warnings
        .iter()
        .any(|w| w.sha.as_deref() == Some("c07")));
    assert!(store.commit_state(REPO, "c07").unwrap().is_none());
    assert!(store.commit_state(REPO, "c08").unwrap().is_some());
}

#[test]
fn unavailable_repository_leaves_checkpoint_unchanged() {
    let repo = history();
    let store = memory_store();
    scan(&config(4), &store, &repo);
    let before = store.snapshot(REPO).unwrap();

    repo.commit("c13").write("late.rs", "late\n").apply().unwrap();
    repo.set_unavailable(true).unwrap();
    let scanner = scanner(&config(4), &store);
    let mut sub = scanner.publisher().subscribe();
    let err = scanner
        .scan(REPO, &repo, &CancellationToken::new(), |_| {})
        .unwrap_err();
    assert!(matches!(err.error, StrataError::Repository(_)));
    assert_eq!(store.snapshot(REPO).unwrap(), before);

    let delivered: Vec<_> = std::iter::from_fn(|| sub.try_recv()).collect();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].event.event_type, EventType::ScanFailed);
}

#[test]
fn merge_policy_cannot_change_between_scans() {
    let repo = history();
    let store = memory_store();
    scan(&config(4), &store, &repo);

    let mut skip = config(4);
    skip.scan.merge_policy = "skip-merges".into();
    let err = scanner(&skip, &store)
        .scan(REPO, &repo, &CancellationToken::new(), |_| {})
        .unwrap_err();
    assert!(matches!(err.error, StrataError::Config(_)));
    assert!(err.error.to_string().contains("first-parent"));
}

#[test]
fn unknown_merge_policy_is_rejected_at_scan_start() {
    let repo = history();
    let store = memory_store();
    let mut bad = config(4);
    bad.scan.merge_policy = "merge-base".into();
    let err = scanner(&bad, &store)
        .scan(REPO, &repo, &CancellationToken::new(), |_| {})
        .unwrap_err();
    assert!(matches!(err.error, StrataError::Config(_)));
    assert!(store.snapshot(REPO).unwrap().is_none());
}

#[test]
fn skipped_merges_contribute_no_diff() {
    let repo = history();
    let store = memory_store();
    let mut skip = config(4);
    skip.scan.merge_policy = "skip-merges".into();
    let report = scan(&skip, &store, &repo);
    assert_eq!(report.commits_analyzed, 12);
    let merge = store.commit_state(REPO, "c12").unwrap().unwrap();
    assert!(merge.files.is_empty());
    assert_eq!(merge.lines_changed, 0);
}

#[test]
fn second_scan_of_the_same_repository_is_rejected() {
    let repo = history();
    let store = memory_store();
    let scanner = scanner(&config(4), &store);
    let _running = scanner.registry().acquire(REPO).unwrap();
    let err = scanner
        .scan(REPO, &repo, &CancellationToken::new(), |_| {})
        .unwrap_err();
    assert!(matches!(err.error, StrataError::ScanInProgress(_)));
    assert!(store.snapshot(REPO).unwrap().is_none());
}

#[test]
fn cancellation_stops_at_a_batch_boundary() {
    let repo = history();
    let store = memory_store();
    let scanner = scanner(&config(4), &store);
    let cancel = CancellationToken::new();
    let err = scanner
        .scan(REPO, &repo, &cancel, |_| cancel.cancel())
        .unwrap_err();
    assert!(matches!(err.error, StrataError::Cancelled));
    assert_eq!(err.report.batches, 1);
    assert_eq!(store.snapshot(REPO).unwrap().unwrap().commits_analyzed, 4);
    assert_eq!(store.commits(REPO).unwrap().len(), 4);

    let resumed = scan(&config(4), &store, &repo);
    assert_eq!(resumed.commits_analyzed, 7);
}

#[test]
fn subscribers_see_ordered_events_and_detect_gaps() {
    let repo = history();
    let store = memory_store();
    let scanner = scanner(&config(4), &store);
    let publisher = Arc::clone(scanner.publisher());
    let mut early = publisher.subscribe();
    scanner
        .scan(REPO, &repo, &CancellationToken::new(), |_| {})
        .unwrap();

    let deliveries: Vec<_> = std::iter::from_fn(|| early.try_recv()).collect();
    let seqs: Vec<u64> = deliveries.iter().map(|d| d.event.sequence_number).collect();
    assert_eq!(seqs, vec![1, 2, 3, 4, 5, 6]);
    assert!(deliveries.iter().all(|d| d.status == DeliveryStatus::InOrder));
    assert_eq!(deliveries[0].event.event_type, EventType::CommitsAnalyzed);
    assert_eq!(deliveries[1].event.event_type, EventType::SnapshotAdvanced);

    let mut late = publisher.subscribe();
    repo.commit("c13").write("late.rs", "late\n").apply().unwrap();
    scanner
        .scan(REPO, &repo, &CancellationToken::new(), |_| {})
        .unwrap();
    let first = late.try_recv().unwrap();
    assert_eq!(first.event.sequence_number, 7);
    assert_eq!(first.status, DeliveryStatus::Gap { expected: 1 });
    assert_eq!(publisher.replay_since(REPO, 0).unwrap().len(), 8);

    let query = QueryService::new(store, REPO, &StrataConfig::default());
    let resync = query.resync().unwrap();
    let snapshot = resync.snapshot.unwrap();
    assert_eq!(snapshot.event_sequence, 8);
    assert_eq!(resync.timeline.len(), 12);
    late.resynced(REPO, snapshot.event_sequence);
    assert_eq!(late.try_recv().unwrap().status, DeliveryStatus::Duplicate);
}

#[test]
fn undelivered_events_are_republished_on_the_next_scan() {
    let repo = history();
    let shared = Arc::new(MemoryStore::new());
    let mut refusing = Crashing::new(Arc::clone(&shared), usize::MAX);
    refusing.fail_puts = true;
    let store = AggregateStore::new(Arc::new(refusing), retry());
    scan(&config(6), &store, &repo);

    let healthy = AggregateStore::new(shared, retry());
    let scanner = scanner(&config(6), &healthy);
    let mut sub = scanner.publisher().subscribe();
    let report = scanner
        .scan(REPO, &repo, &CancellationToken::new(), |_| {})
        .unwrap();
    assert_eq!(report.commits_analyzed, 0);
    let seqs: Vec<u64> = std::iter::from_fn(|| sub.try_recv())
        .map(|d| d.event.sequence_number)
        .collect();
    assert_eq!(seqs, vec![1, 2, 3, 4]);
    assert_eq!(healthy.delivered(REPO).unwrap(), 4);
}

#[test]
fn partial_diffs_are_listed_for_reprocessing() {
    let repo = history();
    repo.delay_diff("c02", Duration::from_secs(3)).unwrap();
    let mut cfg = config(4);
    cfg.scan.diff_budget_ms = 25;
    let store = memory_store();
    let started = std::time::Instant::now();
    let report = scan(&cfg, &store, &repo);
    // The slow diff is abandoned at its budget instead of holding up the batch.
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.partial_commits, vec!["c02".to_string()]);
    assert!(report.warnings.iter().any(|w| w.message.contains("partial")));

    let query = QueryService::new(store, REPO, &StrataConfig::default());
    let partial = query.partial_commits().unwrap();
    assert_eq!(partial.len(), 1);
    assert!(partial[0].partial);
    assert_eq!(query.summary().unwrap().partial_commits, 1);
}

#[test]
fn timeline_pages_follow_fold_order() {
    let repo = history();
    let store = memory_store();
    scan(&config(5), &store, &repo);
    let query = QueryService::new(store, REPO, &StrataConfig::default());

    let mut shas = Vec::new();
    let mut cursor = None;
    loop {
        let page = query
            .timeline(TimelineQuery {
                cursor,
                limit: 5,
                ..TimelineQuery::default()
            })
            .unwrap();
        shas.extend(page.items.into_iter().map(|row| row.sha));
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    let expected: Vec<String> = (1..=12)
        .filter(|i| *i != 10)
        .map(|i| format!("c{i:02}"))
        .collect();
    assert_eq!(shas, expected);

    let windowed = query
        .timeline(TimelineQuery {
            limit: 50,
            since: Some(T0 + 2 * DAY),
            until: Some(T0 + 4 * DAY),
            ..TimelineQuery::default()
        })
        .unwrap();
    let shas: Vec<&str> = windowed.items.iter().map(|r| r.sha.as_str()).collect();
    assert_eq!(shas, vec!["c03", "c04", "c05"]);
    assert!(windowed.next_cursor.is_none());
}

#[test]
fn summary_and_hotspots_reflect_history() {
    let repo = history();
    let store = memory_store();
    scan(&config(5), &store, &repo);
    let query = QueryService::new(store, REPO, &StrataConfig::default());

    let summary = query.summary().unwrap();
    assert_eq!(summary.commits_analyzed, 11);
    assert_eq!(summary.bug_fixes, 2);
    assert_eq!(summary.window_start, Some(T0));
    assert_eq!(summary.window_end, Some(T0 + 11 * DAY));
    assert!(summary.mean_risk > 0.0 && summary.mean_risk <= 100.0);

    let hotspots = query.hotspots(3).unwrap();
    assert_eq!(hotspots.len(), 3);
    assert_eq!(hotspots[0].path, "src/lib.rs");
}

#[test]
fn sqlite_store_survives_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("strata.db");
    let repo = history();
    let expected = {
        let backend = SqliteStore::open(&path, Duration::from_secs(5)).unwrap();
        let store = AggregateStore::new(Arc::new(backend), retry());
        scan(&config(5), &store, &repo);
        aggregates(&store)
    };

    let reopened = AggregateStore::new(
        Arc::new(SqliteStore::open(&path, Duration::from_secs(5)).unwrap()),
        retry(),
    );
    assert_eq!(aggregates(&reopened), expected);
    let again = scan(&config(5), &reopened, &repo);
    assert_eq!(again.commits_analyzed, 0);
}
