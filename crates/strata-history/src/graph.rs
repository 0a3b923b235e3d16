//! Commit arena with an iterative, deterministic topological order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use strata_core::CommitRecord;

/// Commits indexed by sha, with parent → child edges.
///
/// # Examples
///
/// ```
/// use strata_core::{CommitRecord, Signature};
/// use strata_history::CommitGraph;
///
/// let commit = |sha: &str, parents: &[&str], ts: i64| CommitRecord {
///     sha: sha.into(),
///     parents: parents.iter().map(|p| p.to_string()).collect(),
///     author: Signature::new("a", "a@x"),
///     committer: Signature::new("a", "a@x"),
///     timestamp: ts,
///     message: String::new(),
/// };
///
/// let mut graph = CommitGraph::new();
/// graph.insert(commit("child", &["root"], 10));
/// graph.insert(commit("root", &[], 20));
/// graph.link_parents();
///
/// let order: Vec<String> = graph.into_topological().into_iter().map(|c| c.sha).collect();
/// assert_eq!(order, vec!["root", "child"]);
/// ```
#[derive(Debug, Default)]
pub struct CommitGraph {
    graph: DiGraph<CommitRecord, ()>,
    index: HashMap<String, NodeIndex>,
}

impl CommitGraph {
    /// Empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a commit; a sha already present is left untouched.
    pub fn insert(&mut self, record: CommitRecord) -> NodeIndex {
        if let Some(idx) = self.index.get(&record.sha) {
            return *idx;
        }
        let sha = record.sha.clone();
        let idx = self.graph.add_node(record);
        self.index.insert(sha, idx);
        idx
    }

    /// Connect every commit to those of its parents present in the arena.
    pub fn link_parents(&mut self) {
        let mut edges = Vec::new();
        for child in self.graph.node_indices() {
            for parent in &self.graph[child].parents {
                if let Some(&p) = self.index.get(parent) {
                    edges.push((p, child));
                }
            }
        }
        for (parent, child) in edges {
            self.graph.update_edge(parent, child, ());
        }
    }

    /// Whether `sha` is in the arena.
    pub fn contains(&self, sha: &str) -> bool {
        self.index.contains_key(sha)
    }

    /// Look up a commit by sha.
    pub fn get(&self, sha: &str) -> Option<&CommitRecord> {
        self.index.get(sha).map(|idx| &self.graph[*idx])
    }

    /// Number of commits.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    /// True when no commit was inserted.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Node indices in topological order (parents first).
    ///
    /// Ties between ready commits are broken by `(timestamp, sha)`, so the
    /// same history always yields the same order.
    pub fn topological_order(&self) -> Vec<NodeIndex> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| (n, self.graph.neighbors_directed(n, Direction::Incoming).count()))
            .collect();

        let key = |n: NodeIndex| {
            let c = &self.graph[n];
            Reverse((c.timestamp, c.sha.clone(), n))
        };
        let mut ready: BinaryHeap<_> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| key(*n))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse((_, _, node))) = ready.pop() {
            order.push(node);
            for child in self.graph.neighbors_directed(node, Direction::Outgoing) {
                if let Some(d) = in_degree.get_mut(&child) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push(key(child));
                    }
                }
            }
        }

        if order.len() < self.graph.node_count() {
            tracing::warn!(
                stuck = self.graph.node_count() - order.len(),
                "commit graph contains a cycle; appending remaining commits by time"
            );
            let mut rest: Vec<NodeIndex> = in_degree
                .into_iter()
                .filter(|(_, d)| *d > 0)
                .map(|(n, _)| n)
                .collect();
            rest.sort_by_key(|n| (self.graph[*n].timestamp, self.graph[*n].sha.clone()));
            order.extend(rest);
        }
        order
    }

    /// Consume the arena, yielding commits in topological order.
    pub fn into_topological(self) -> Vec<CommitRecord> {
        let order = self.topological_order();
        let mut slots: Vec<Option<CommitRecord>> =
            self.graph.into_nodes_edges().0.into_iter().map(|n| Some(n.weight)).collect();
        order
            .into_iter()
            .filter_map(|idx| slots.get_mut(idx.index()).and_then(Option::take))
            .collect()
    }
}
