//! Decayed per-file ownership and bus factor.
//!
//! Every touch adds its lines changed to the (file, contributor) mass at the
//! commit's timestamp. Shares are the normalized masses, so decay against a
//! common reference time never changes who owns what between commits; it
//! only shifts weight towards recent contributors as new commits arrive.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_core::{FileOwnership, OwnerShare};

use crate::decay::{self, HalfLife, LogMass};

/// Contributor masses for one file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileOwners {
    contributors: BTreeMap<String, LogMass>,
}

impl FileOwners {
    /// Record `lines` changed by `contributor` at `timestamp`.
    pub fn record(&mut self, contributor: &str, lines: u32, timestamp: i64, half_life: HalfLife) {
        self.contributors
            .entry(contributor.to_string())
            .or_default()
            .add(f64::from(lines), timestamp, half_life);
    }

    /// Fold another file's history into this one.
    pub fn absorb(&mut self, other: FileOwners) {
        for (contributor, mass) in other.contributors {
            self.contributors.entry(contributor).or_default().merge(mass);
        }
    }

    /// Whether `contributor` ever touched the file.
    pub fn has_contributor(&self, contributor: &str) -> bool {
        self.contributors.contains_key(contributor)
    }

    /// True when no contributor is recorded.
    pub fn is_empty(&self) -> bool {
        self.contributors.is_empty()
    }

    /// Number of distinct contributors.
    pub fn len(&self) -> usize {
        self.contributors.len()
    }

    /// Shares sorted descending, ties broken by contributor.
    pub fn shares(&self) -> Vec<OwnerShare> {
        let masses: Vec<LogMass> = self.contributors.values().copied().collect();
        let mut owners: Vec<OwnerShare> = self
            .contributors
            .keys()
            .zip(decay::shares(&masses))
            .map(|(contributor, share)| OwnerShare {
                contributor: contributor.clone(),
                share,
            })
            .collect();
        owners.sort_by(|a, b| {
            b.share
                .total_cmp(&a.share)
                .then_with(|| a.contributor.cmp(&b.contributor))
        });
        owners
    }

    /// Serving view for `path`.
    pub fn to_ownership(&self, path: &str, coverage: f64) -> FileOwnership {
        let owners = self.shares();
        let bus_factor = bus_factor(&owners, coverage);
        FileOwnership {
            path: path.to_string(),
            owners,
            bus_factor,
        }
    }
}

/// Minimum number of top contributors whose shares strictly exceed `coverage`.
///
/// `owners` must be sorted by share, descending. Any file with at least one
/// contributor has a bus factor of at least one.
///
/// # Examples
///
/// ```
/// use strata_analytics::bus_factor;
/// use strata_core::OwnerShare;
///
/// let owners = vec![
///     OwnerShare { contributor: "a".into(), share: 0.5 },
///     OwnerShare { contributor: "b".into(), share: 0.3 },
///     OwnerShare { contributor: "c".into(), share: 0.2 },
/// ];
/// // Exactly 50% is not a majority.
/// assert_eq!(bus_factor(&owners, 0.5), 2);
/// assert_eq!(bus_factor(&owners, 0.4), 1);
/// ```
pub fn bus_factor(owners: &[OwnerShare], coverage: f64) -> u32 {
    let mut covered = 0.0;
    for (i, owner) in owners.iter().enumerate() {
        covered += owner.share;
        if covered > coverage {
            return i as u32 + 1;
        }
    }
    owners.len() as u32
}

/// Ownership state for every tracked file.
///
/// # Examples
///
/// ```
/// use strata_analytics::{HalfLife, OwnershipTracker};
///
/// let mut tracker = OwnershipTracker::new(HalfLife::from_days(180.0), 0.5);
/// tracker.record("a.py", "alice", 90, 1_000);
/// tracker.record("a.py", "bob", 10, 1_000);
/// tracker.rename("a.py", "b.py");
///
/// let own = tracker.ownership("b.py").unwrap();
/// assert_eq!(own.primary_owner(), Some("alice"));
/// assert!((own.owners[0].share - 0.9).abs() < 1e-9);
/// assert!(tracker.ownership("a.py").is_none());
/// ```
#[derive(Debug, Clone)]
pub struct OwnershipTracker {
    half_life: HalfLife,
    coverage: f64,
    files: BTreeMap<String, FileOwners>,
}

impl OwnershipTracker {
    /// Empty tracker.
    pub fn new(half_life: HalfLife, coverage: f64) -> Self {
        Self {
            half_life,
            coverage,
            files: BTreeMap::new(),
        }
    }

    /// Add a touch of `path`.
    pub fn record(&mut self, path: &str, contributor: &str, lines: u32, timestamp: i64) {
        self.files
            .entry(path.to_string())
            .or_default()
            .record(contributor, lines, timestamp, self.half_life);
    }

    /// Carry the history of `from` forward under `to`.
    pub fn rename(&mut self, from: &str, to: &str) {
        if from == to {
            return;
        }
        if let Some(previous) = self.files.remove(from) {
            self.files.entry(to.to_string()).or_default().absorb(previous);
        }
    }

    /// Forget a deleted file.
    pub fn remove(&mut self, path: &str) -> Option<FileOwners> {
        self.files.remove(path)
    }

    /// Whether `contributor` touched `path` before.
    pub fn has_touched(&self, path: &str, contributor: &str) -> bool {
        self.files
            .get(path)
            .is_some_and(|owners| owners.has_contributor(contributor))
    }

    /// Raw masses of one file.
    pub fn get(&self, path: &str) -> Option<&FileOwners> {
        self.files.get(path)
    }

    /// Replace the masses of one file, e.g. when loading persisted state.
    pub fn insert(&mut self, path: String, owners: FileOwners) {
        if owners.is_empty() {
            self.files.remove(&path);
        } else {
            self.files.insert(path, owners);
        }
    }

    /// Shares and bus factor of one file.
    pub fn ownership(&self, path: &str) -> Option<FileOwnership> {
        self.files
            .get(path)
            .filter(|owners| !owners.is_empty())
            .map(|owners| owners.to_ownership(path, self.coverage))
    }

    /// Tracked files in path order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &FileOwners)> {
        self.files.iter().map(|(path, owners)| (path.as_str(), owners))
    }

    /// Number of tracked files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True when no file is tracked.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
