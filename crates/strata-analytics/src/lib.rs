//! Derived intelligence over commit history.
//!
//! Bug-fix classification, SZZ-style defect attribution, risk scoring,
//! decayed ownership with bus factor, temporal coupling and hotspot ranking,
//! all folded incrementally into a per-repository [`RepoState`].

pub mod analyze;
pub mod classify;
pub mod coupling;
pub mod decay;
pub mod hotspots;
pub mod ownership;
pub mod risk;
pub mod state;
pub mod szz;

pub use analyze::{AnalyzedCommit, CommitAnalyzer};
pub use classify::{Classification, FixClassifier, FixRule, PatternClassifier, RuleAction};
pub use coupling::{pair_id, parse_pair_id, CouplingAnalyzer, FileChanges, PairStats, ServingLimits};
pub use decay::{shares, HalfLife, LogMass};
pub use hotspots::{rank_hotspots, FileStats, Hotspot};
pub use ownership::{bus_factor, FileOwners, OwnershipTracker};
pub use risk::{own_defect_density, RiskModel};
pub use state::{AnalysisSettings, CommitState, FoldOutcome, RepoState, StateChanges};
pub use szz::{attribute, Attribution};
