//! Temporal coupling between files that change together.
//!
//! Each file keeps a decayed change mass and each canonical pair a decayed
//! co-change mass. The coupling weight divides the pair's mass by the larger
//! of the two file masses, so busy hub files do not dominate every pairing.
//! Whenever a file changes, its edges are re-weighed and the ones that fell
//! below the prune threshold are dropped, so the pair count stays bounded.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use strata_core::{CouplingConfig, CouplingEdge};

use crate::decay::{HalfLife, LogMass};

/// Separator between the two paths of a pair id.
const PAIR_SEPARATOR: char = '\u{1f}';

/// Decayed change history of one file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChanges {
    /// Decayed number of commits touching the file.
    pub mass: LogMass,
    /// Raw number of commits touching the file.
    pub count: u32,
}

impl FileChanges {
    fn absorb(&mut self, other: FileChanges) {
        self.mass.merge(other.mass);
        self.count += other.count;
    }
}

/// Decayed co-change history of one canonical pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairStats {
    /// Decayed number of commits touching both files.
    pub co: LogMass,
    /// Raw number of commits touching both files.
    pub count: u32,
    /// Timestamp of the latest co-change.
    pub last_updated: i64,
}

impl PairStats {
    fn absorb(&mut self, other: PairStats) {
        self.co.merge(other.co);
        self.count += other.count;
        self.last_updated = self.last_updated.max(other.last_updated);
    }
}

/// Stable id of a canonical pair, used as a storage key.
///
/// # Examples
///
/// ```
/// use strata_analytics::{pair_id, parse_pair_id};
///
/// let id = pair_id("b.rs", "a.rs");
/// assert_eq!(parse_pair_id(&id), Some(("a.rs".to_string(), "b.rs".to_string())));
/// ```
pub fn pair_id(a: &str, b: &str) -> String {
    let (a, b) = CouplingEdge::canonical_pair(a, b);
    format!("{a}{PAIR_SEPARATOR}{b}")
}

/// Inverse of [`pair_id`].
pub fn parse_pair_id(id: &str) -> Option<(String, String)> {
    id.split_once(PAIR_SEPARATOR)
        .map(|(a, b)| (a.to_string(), b.to_string()))
}

/// Limits applied when serving neighbors.
#[derive(Debug, Clone, Copy)]
pub struct ServingLimits {
    /// Neighbors kept per file.
    pub top_k: usize,
    /// Minimum coupling weight.
    pub min_weight: f64,
    /// Minimum raw co-change count.
    pub min_co_changes: u32,
}

impl From<&CouplingConfig> for ServingLimits {
    fn from(config: &CouplingConfig) -> Self {
        Self {
            top_k: config.top_k,
            min_weight: config.min_weight,
            min_co_changes: config.min_co_changes,
        }
    }
}

/// Co-change graph over all tracked files.
///
/// # Examples
///
/// ```
/// use strata_analytics::{CouplingAnalyzer, HalfLife};
///
/// let mut coupling = CouplingAnalyzer::new(HalfLife::from_days(180.0), 50);
/// for i in 0..10 {
///     let files: &[&str] = if i % 2 == 0 { &["x.rs", "y.rs"] } else { &["x.rs"] };
///     coupling.record_commit(files, 1_000);
/// }
/// let edge = coupling.edge("y.rs", "x.rs").unwrap();
/// assert!((edge.weight - 0.5).abs() < 1e-9);
/// assert_eq!(edge.co_changes, 5);
/// assert_eq!(edge.file_a, "x.rs");
/// ```
#[derive(Debug, Clone)]
pub struct CouplingAnalyzer {
    half_life: HalfLife,
    max_files: usize,
    prune_below: f64,
    files: BTreeMap<String, FileChanges>,
    pairs: BTreeMap<(String, String), PairStats>,
    adjacency: BTreeMap<String, BTreeSet<String>>,
}

impl CouplingAnalyzer {
    /// Empty analyzer. Commits touching more than `max_files` files add no pairs.
    pub fn new(half_life: HalfLife, max_files: usize) -> Self {
        Self {
            half_life,
            max_files,
            prune_below: 0.0,
            files: BTreeMap::new(),
            pairs: BTreeMap::new(),
            adjacency: BTreeMap::new(),
        }
    }

    /// Drop edges whose weight falls below `min_weight` after a change.
    pub fn with_prune_threshold(mut self, min_weight: f64) -> Self {
        self.prune_below = min_weight;
        self
    }

    /// Fold one commit's touched files.
    ///
    /// Returns the pairs whose statistics changed, including pairs pruned
    /// because a touched file outgrew them.
    pub fn record_commit(&mut self, paths: &[&str], timestamp: i64) -> Vec<(String, String)> {
        let unique: BTreeSet<&str> = paths.iter().copied().collect();
        for path in &unique {
            let entry = self.files.entry((*path).to_string()).or_default();
            entry.mass.add(1.0, timestamp, self.half_life);
            entry.count += 1;
        }

        let mut changed = Vec::new();
        if unique.len() > self.max_files {
            tracing::debug!(files = unique.len(), "commit too wide for coupling pairs");
        } else if unique.len() >= 2 {
            let ordered: Vec<&str> = unique.iter().copied().collect();
            for (i, a) in ordered.iter().enumerate() {
                for b in &ordered[i + 1..] {
                    let key = ((*a).to_string(), (*b).to_string());
                    let stats = self.pairs.entry(key.clone()).or_default();
                    stats.co.add(1.0, timestamp, self.half_life);
                    stats.count += 1;
                    stats.last_updated = stats.last_updated.max(timestamp);
                    self.link(a, b);
                    changed.push(key);
                }
            }
        }
        changed.extend(self.prune_around(&unique));
        changed
    }

    /// Remove weak edges of `paths`. A weight only moves when one of its
    /// files changes, so checking the touched files is enough.
    fn prune_around(&mut self, paths: &BTreeSet<&str>) -> Vec<(String, String)> {
        if self.prune_below <= 0.0 {
            return Vec::new();
        }
        let mut weak = BTreeSet::new();
        for path in paths {
            for other in self.adjacent(path) {
                let key = canonical_key(path, other);
                let Some(stats) = self.pairs.get(&key) else {
                    continue;
                };
                if self.to_edge(&key.0, &key.1, stats).weight < self.prune_below {
                    weak.insert(key);
                }
            }
        }
        for (a, b) in &weak {
            self.pairs.remove(&(a.clone(), b.clone()));
            self.unlink(a, b);
            self.unlink(b, a);
        }
        if !weak.is_empty() {
            tracing::trace!(pruned = weak.len(), "pruned weak coupling edges");
        }
        weak.into_iter().collect()
    }

    /// Re-key every edge of `from` under `to`.
    ///
    /// Returns the former neighbors of `from`.
    pub fn rename(&mut self, from: &str, to: &str) -> Vec<String> {
        if from == to {
            return Vec::new();
        }
        if let Some(changes) = self.files.remove(from) {
            self.files.entry(to.to_string()).or_default().absorb(changes);
        }
        let neighbors: Vec<String> = self
            .adjacency
            .remove(from)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for other in &neighbors {
            self.unlink(other, from);
            let Some(stats) = self.pairs.remove(&canonical_key(from, other)) else {
                continue;
            };
            if other == to {
                continue;
            }
            self.pairs
                .entry(canonical_key(to, other))
                .or_default()
                .absorb(stats);
            self.link(to, other);
        }
        neighbors
    }

    /// Drop a deleted file and all its edges.
    ///
    /// Returns the former neighbors.
    pub fn remove(&mut self, path: &str) -> Vec<String> {
        self.files.remove(path);
        let neighbors: Vec<String> = self
            .adjacency
            .remove(path)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        for other in &neighbors {
            self.unlink(other, path);
            self.pairs.remove(&canonical_key(path, other));
        }
        neighbors
    }

    /// Coupling edge between two files, if they ever changed together.
    pub fn edge(&self, a: &str, b: &str) -> Option<CouplingEdge> {
        let key = canonical_key(a, b);
        let stats = self.pairs.get(&key)?;
        Some(self.to_edge(&key.0, &key.1, stats))
    }

    /// Top neighbors of `path` under the serving limits, strongest first.
    pub fn neighbors(&self, path: &str, limits: ServingLimits) -> Vec<CouplingEdge> {
        let Some(adjacent) = self.adjacency.get(path) else {
            return Vec::new();
        };
        let mut edges: Vec<CouplingEdge> = adjacent
            .iter()
            .filter_map(|other| self.edge(path, other))
            .filter(|e| e.weight >= limits.min_weight && e.co_changes >= limits.min_co_changes)
            .collect();
        edges.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| a.other(path).cmp(&b.other(path)))
        });
        edges.truncate(limits.top_k);
        edges
    }

    /// Files adjacent to `path`.
    pub fn adjacent(&self, path: &str) -> impl Iterator<Item = &str> {
        self.adjacency
            .get(path)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Change history of one file.
    pub fn file(&self, path: &str) -> Option<&FileChanges> {
        self.files.get(path)
    }

    /// Co-change history of one pair.
    pub fn pair(&self, a: &str, b: &str) -> Option<&PairStats> {
        self.pairs.get(&canonical_key(a, b))
    }

    /// Restore one file's history from storage.
    pub fn insert_file(&mut self, path: String, changes: FileChanges) {
        self.files.insert(path, changes);
    }

    /// Restore one pair's history from storage.
    pub fn insert_pair(&mut self, a: &str, b: &str, stats: PairStats) {
        if a == b {
            return;
        }
        self.pairs.insert(canonical_key(a, b), stats);
        self.link(a, b);
    }

    /// Number of stored pairs.
    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    fn to_edge(&self, a: &str, b: &str, stats: &PairStats) -> CouplingEdge {
        let empty = FileChanges::default();
        let fa = self.files.get(a).unwrap_or(&empty);
        let fb = self.files.get(b).unwrap_or(&empty);
        // The larger decayed mass is the more frequently changed file.
        let busier = match (fa.mass.log(), fb.mass.log()) {
            (Some(x), Some(y)) if y > x => &fb.mass,
            (None, Some(_)) => &fb.mass,
            _ => &fa.mass,
        };
        CouplingEdge {
            file_a: a.to_string(),
            file_b: b.to_string(),
            weight: stats.co.ratio(busier).min(1.0),
            co_changes: stats.count,
            last_updated: stats.last_updated,
        }
    }

    fn link(&mut self, a: &str, b: &str) {
        self.adjacency
            .entry(a.to_string())
            .or_default()
            .insert(b.to_string());
        self.adjacency
            .entry(b.to_string())
            .or_default()
            .insert(a.to_string());
    }

    fn unlink(&mut self, from: &str, to: &str) {
        if let Some(set) = self.adjacency.get_mut(from) {
            set.remove(to);
            if set.is_empty() {
                self.adjacency.remove(from);
            }
        }
    }
}

fn canonical_key(a: &str, b: &str) -> (String, String) {
    let (a, b) = CouplingEdge::canonical_pair(a, b);
    (a.to_string(), b.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::SECONDS_PER_DAY;

    fn analyzer() -> CouplingAnalyzer {
        CouplingAnalyzer::new(HalfLife::from_days(180.0), 50)
    }

    fn limits() -> ServingLimits {
        ServingLimits {
            top_k: 20,
            min_weight: 0.0,
            min_co_changes: 1,
        }
    }

    #[test]
    fn edges_are_symmetric() {
        let mut c = analyzer();
        c.record_commit(&["b", "a", "c"], 10);
        c.record_commit(&["a", "b"], 20);
        let ab = c.edge("a", "b").unwrap();
        let ba = c.edge("b", "a").unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.co_changes, 2);
        assert_eq!(ab.last_updated, 20);
    }

    #[test]
    fn hub_file_does_not_dominate() {
        let mut c = analyzer();
        for _ in 0..9 {
            c.record_commit(&["hub"], 0);
        }
        c.record_commit(&["hub", "leaf"], 0);
        c.record_commit(&["leaf", "twin"], 0);
        // leaf/hub divides by hub's 10 changes; leaf/twin by leaf's 2.
        assert!((c.edge("hub", "leaf").unwrap().weight - 0.1).abs() < 1e-9);
        assert!((c.edge("leaf", "twin").unwrap().weight - 0.5).abs() < 1e-9);
    }

    #[test]
    fn old_co_changes_fade() {
        let mut c = analyzer();
        c.record_commit(&["x", "y"], 0);
        c.record_commit(&["x"], 360 * SECONDS_PER_DAY);
        // Co-change is two half-lives older than x's latest change.
        let w = c.edge("x", "y").unwrap().weight;
        assert!((w - 1.0 / 5.0).abs() < 1e-9);
    }

    #[test]
    fn wide_commit_adds_no_pairs() {
        let mut c = CouplingAnalyzer::new(HalfLife::from_days(180.0), 2);
        c.record_commit(&["a", "b", "c"], 0);
        assert_eq!(c.pair_count(), 0);
        assert_eq!(c.file("a").unwrap().count, 1);
    }

    #[test]
    fn rename_rekeys_edges() {
        let mut c = analyzer();
        c.record_commit(&["old", "z"], 0);
        c.record_commit(&["old", "new"], 0);
        let neighbors = c.rename("old", "new");
        assert_eq!(neighbors, vec!["new".to_string(), "z".to_string()]);
        assert!(c.edge("old", "z").is_none());
        assert!(c.edge("new", "new").is_none());
        let edge = c.edge("new", "z").unwrap();
        assert_eq!(edge.co_changes, 1);
        assert_eq!(c.file("new").unwrap().count, 3);
        assert_eq!(c.adjacent("z").collect::<Vec<_>>(), vec!["new"]);
    }

    #[test]
    fn remove_drops_edges() {
        let mut c = analyzer();
        c.record_commit(&["a", "b"], 0);
        c.record_commit(&["a", "c"], 0);
        c.remove("a");
        assert_eq!(c.pair_count(), 0);
        assert!(c.neighbors("b", limits()).is_empty());
        assert!(c.file("a").is_none());
    }

    #[test]
    fn serving_view_is_bounded_and_filtered() {
        let mut c = analyzer();
        for other in ["b", "c", "d"] {
            c.record_commit(&["a", other], 0);
        }
        c.record_commit(&["a", "b"], 0);
        c.record_commit(&["a"], 0);

        let top = c.neighbors(
            "a",
            ServingLimits {
                top_k: 2,
                ..limits()
            },
        );
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].other("a"), Some("b"));
        assert_eq!(top[1].other("a"), Some("c"));

        let strong = c.neighbors(
            "a",
            ServingLimits {
                min_co_changes: 2,
                ..limits()
            },
        );
        assert_eq!(strong.len(), 1);
    }

    #[test]
    fn edges_outgrown_by_a_hub_are_pruned() {
        let mut c = analyzer().with_prune_threshold(0.1);
        let leaves: Vec<String> = (0..200).map(|i| format!("leaf{i}.rs")).collect();
        for leaf in &leaves[..5] {
            c.record_commit(&["hub.rs", "twin.rs", leaf.as_str()], 0);
        }
        // Every leaf pair still weighs 1/5.
        assert_eq!(c.pair_count(), 1 + 5 * 2);

        let mut pruned = Vec::new();
        for leaf in &leaves[5..] {
            pruned.extend(c.record_commit(&["hub.rs", "twin.rs", leaf.as_str()], 0));
        }
        assert_eq!(c.pair_count(), 1);
        assert!(c.pair("hub.rs", "leaf0.rs").is_none());
        assert!(pruned.contains(&("hub.rs".to_string(), "leaf0.rs".to_string())));
        assert_eq!(c.adjacent("hub.rs").collect::<Vec<_>>(), vec!["twin.rs"]);
        assert!(c.adjacent("leaf0.rs").next().is_none());
        assert_eq!(c.edge("hub.rs", "twin.rs").unwrap().co_changes, 200);
    }

    #[test]
    fn single_file_commits_also_prune() {
        let mut c = analyzer().with_prune_threshold(0.3);
        c.record_commit(&["a", "b"], 0);
        c.record_commit(&["a"], 0);
        c.record_commit(&["a"], 0);
        assert!(c.pair("a", "b").is_some());
        let changed = c.record_commit(&["a"], 0);
        assert_eq!(changed, vec![("a".to_string(), "b".to_string())]);
        assert_eq!(c.pair_count(), 0);
        assert_eq!(c.file("b").unwrap().count, 1);
    }

    #[test]
    fn zero_threshold_keeps_every_pair() {
        let mut c = analyzer();
        for i in 0..50 {
            let leaf = format!("leaf{i}");
            c.record_commit(&["hub", leaf.as_str()], 0);
        }
        assert_eq!(c.pair_count(), 50);
    }

    #[test]
    fn restored_pairs_rebuild_adjacency() {
        let mut original = analyzer();
        original.record_commit(&["a", "b"], 5);
        let mut restored = analyzer();
        for path in ["a", "b"] {
            restored.insert_file(path.into(), original.file(path).unwrap().clone());
        }
        restored.insert_pair("a", "b", original.pair("a", "b").unwrap().clone());
        assert_eq!(restored.neighbors("b", limits()), original.neighbors("b", limits()));
    }
}
