//! Persistence, scanning, event streaming and queries for strata.
//!
//! - [`Persistence`] is the storage seam, implemented by [`SqliteStore`] and
//!   [`MemoryStore`]
//! - [`AggregateStore`] maps analysis state to stored entities and owns the
//!   checkpoint
//! - [`Scanner`] runs incremental, batched, cancellable scans
//! - [`EventPublisher`] streams sequenced events to subscribers
//! - [`QueryService`] serves lookups from the last committed checkpoint

pub mod aggregate;
pub mod events;
pub mod query;
pub mod scan;
pub mod store;

use std::path::Path;

use sha2::{Digest, Sha256};
use strata_core::Result;

pub use aggregate::{sequence_id, AggregateStore, RetryPolicy, EVENT_RETENTION};
pub use events::{Delivery, DeliveryStatus, EventPublisher, Subscription};
pub use query::{QueryService, RepoSummary, Resync, TimelinePage, TimelineQuery, MAX_PAGE};
pub use scan::{CancellationToken, ScanError, ScanGuard, ScanRegistry, ScanReport, Scanner};
pub use store::{EntityKind, EntityWrite, MemoryStore, Persistence, SqliteStore};

/// Stable repository id: the first 16 hex digits of the SHA-256 of the
/// canonical repository path.
///
/// # Errors
///
/// Returns [`strata_core::StrataError::Io`] when the path cannot be
/// canonicalized.
pub fn repo_id(path: &Path) -> Result<String> {
    let canonical = path.canonicalize()?;
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string_lossy().as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    Ok(digest[..16].to_string())
}
