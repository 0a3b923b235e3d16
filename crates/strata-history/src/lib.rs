//! Commit history access for strata.
//!
//! Provides the [`GitObjectSource`] seam with a git2-backed
//! [`GitRepository`] and an in-memory [`MemoryRepository`], the Commit
//! Ingestor ([`Ingestor`]) that plans unprocessed commits in topological
//! order, and the Diff Analyzer ([`DiffAnalyzer`]).

pub mod diff;
pub mod git;
pub mod graph;
pub mod ingest;
pub mod memory;
pub mod source;

pub use diff::{CommitDiff, DiffAnalyzer, DiffOptions, DiffStatus, FileChange};
pub use git::GitRepository;
pub use graph::CommitGraph;
pub use ingest::{IngestOptions, IngestPlan, Ingestor, ScanProgress, ScanWarning};
pub use memory::{CommitBuilder, MemoryRepository};
pub use source::{Deadline, DiffLine, GitObjectSource, Hunk, RawFileDiff};
