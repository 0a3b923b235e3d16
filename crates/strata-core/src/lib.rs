//! Core types, configuration, and error handling for strata.
//!
//! This crate provides the shared foundation used by all other strata crates:
//! - [`StrataError`]: unified error type using `thiserror`
//! - [`StrataConfig`]: configuration loaded from `.strata.toml`
//! - The analysis data model: [`CommitRecord`], [`DiffRecord`], [`RiskScore`],
//!   [`FileOwnership`], [`CouplingEdge`], [`AnalysisSnapshot`], [`AnalysisEvent`]

mod config;
mod error;
mod types;

pub use config::{
    CouplingConfig, FixRuleConfig, OwnershipConfig, RiskConfig, RiskWeights, ScanConfig,
    StoreConfig, StrataConfig,
};
pub use error::StrataError;
pub use types::{
    AnalysisEvent, AnalysisSnapshot, ChangeKind, CommitRecord, CommitSummary, CouplingEdge,
    DiffRecord, EventPayload, EventType, FileOwnership, MergePolicy, OutputFormat, OwnerShare,
    RiskFactors, RiskLevel, RiskScore, Signature, WindowBound,
};

/// A convenience `Result` type for strata operations.
pub type Result<T> = std::result::Result<T, StrataError>;

/// Seconds per day, used to convert half-lives.
pub const SECONDS_PER_DAY: i64 = 86_400;
