//! Persistence seam: keyed entity storage with atomic multi-key commits.
//!
//! Every derived entity is a JSON document addressed by
//! `(repository id, kind, entity id)`. [`SqliteStore`] keeps them in a single
//! WAL-mode SQLite table; [`MemoryStore`] keeps them in a `BTreeMap` for tests.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use strata_core::{Result, StrataError};

/// Kind of stored entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntityKind {
    /// The repository's [`strata_core::AnalysisSnapshot`].
    Snapshot,
    /// Per-commit analysis, keyed by sha.
    Commit,
    /// Timeline rows, keyed by zero-padded fold position.
    Timeline,
    /// Per-file change statistics.
    FileStats,
    /// Per-file contributor masses.
    Owners,
    /// Per-file decayed change history for coupling.
    FileChanges,
    /// Per-pair co-change history.
    Pair,
    /// Materialized top-K coupling neighbors per file.
    Neighbors,
    /// Published events kept for redelivery.
    Event,
}

impl EntityKind {
    /// Stable storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Snapshot => "snapshot",
            EntityKind::Commit => "commit",
            EntityKind::Timeline => "timeline",
            EntityKind::FileStats => "file_stats",
            EntityKind::Owners => "owners",
            EntityKind::FileChanges => "file_changes",
            EntityKind::Pair => "pair",
            EntityKind::Neighbors => "neighbors",
            EntityKind::Event => "event",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One write inside an atomic commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityWrite {
    /// Insert or replace an entity.
    Put {
        /// Entity kind.
        kind: EntityKind,
        /// Entity id.
        id: String,
        /// Serialized document.
        value: String,
    },
    /// Remove an entity if present.
    Delete {
        /// Entity kind.
        kind: EntityKind,
        /// Entity id.
        id: String,
    },
}

/// Get/put/transactional-write primitives keyed by repository and entity.
///
/// Implementations must make [`Persistence::commit`] all-or-nothing.
pub trait Persistence: Send + Sync {
    /// Read one entity.
    fn get(&self, repo: &str, kind: EntityKind, id: &str) -> Result<Option<String>>;

    /// Every entity of a kind, ordered by id.
    fn list(&self, repo: &str, kind: EntityKind) -> Result<Vec<(String, String)>>;

    /// Up to `limit` entities of a kind with ids strictly after `after`, ordered by id.
    fn page(
        &self,
        repo: &str,
        kind: EntityKind,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, String)>>;

    /// Write a single entity.
    fn put(&self, repo: &str, kind: EntityKind, id: &str, value: &str) -> Result<()> {
        self.commit(
            repo,
            &[EntityWrite::Put {
                kind,
                id: id.to_string(),
                value: value.to_string(),
            }],
        )
    }

    /// Apply every write or none of them.
    fn commit(&self, repo: &str, writes: &[EntityWrite]) -> Result<()>;
}

/// SQLite-backed persistence.
///
/// # Examples
///
/// ```
/// use strata_engine::{EntityKind, Persistence, SqliteStore};
///
/// let store = SqliteStore::in_memory().unwrap();
/// store.put("repo", EntityKind::Commit, "c1", "{}").unwrap();
/// assert_eq!(store.get("repo", EntityKind::Commit, "c1").unwrap().as_deref(), Some("{}"));
/// assert!(store.get("other", EntityKind::Commit, "c1").unwrap().is_none());
/// ```
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at `path` in WAL mode.
    ///
    /// Writers wait up to `busy_timeout` for a lock held by another
    /// connection before failing.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Store`] if the database cannot be opened.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StrataError::Store(format!("failed to create store directory: {e}"))
            })?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StrataError::Store(format!("failed to open database: {e}")))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| StrataError::Store(format!("failed to set busy timeout: {e}")))?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(|e| StrataError::Store(format!("failed to enable WAL: {e}")))?;
        tracing::debug!(path = %path.display(), journal_mode = %mode, "opened store");
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| StrataError::Store(format!("failed to set synchronous mode: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Store`] if schema creation fails.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            StrataError::Store(format!("failed to create in-memory database: {e}"))
        })?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS entities (
                    repo_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    id TEXT NOT NULL,
                    value TEXT NOT NULL,
                    PRIMARY KEY (repo_id, kind, id)
                ) WITHOUT ROWID;
                ",
            )
            .map_err(|e| StrataError::Store(format!("failed to create schema: {e}")))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StrataError::Store("connection lock poisoned".into()))
    }
}

impl Persistence for SqliteStore {
    fn get(&self, repo: &str, kind: EntityKind, id: &str) -> Result<Option<String>> {
        self.conn()?
            .query_row(
                "SELECT value FROM entities WHERE repo_id = ?1 AND kind = ?2 AND id = ?3",
                params![repo, kind.as_str(), id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StrataError::Store(format!("failed to read {kind} '{id}': {e}")))
    }

    fn list(&self, repo: &str, kind: EntityKind) -> Result<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, value FROM entities WHERE repo_id = ?1 AND kind = ?2 ORDER BY id")
            .map_err(|e| StrataError::Store(format!("failed to prepare list: {e}")))?;
        let rows = stmt
            .query_map(params![repo, kind.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| StrataError::Store(format!("failed to list {kind}: {e}")))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| StrataError::Store(format!("failed to read {kind} row: {e}")))
    }

    fn page(
        &self,
        repo: &str,
        kind: EntityKind,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, String)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, value FROM entities
                 WHERE repo_id = ?1 AND kind = ?2 AND id > ?3
                 ORDER BY id LIMIT ?4",
            )
            .map_err(|e| StrataError::Store(format!("failed to prepare page: {e}")))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(
                params![repo, kind.as_str(), after.unwrap_or(""), limit],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .map_err(|e| StrataError::Store(format!("failed to page {kind}: {e}")))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| StrataError::Store(format!("failed to read {kind} row: {e}")))
    }

    fn commit(&self, repo: &str, writes: &[EntityWrite]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| StrataError::Store(format!("failed to begin transaction: {e}")))?;
        {
            let mut put = tx
                .prepare_cached(
                    "INSERT OR REPLACE INTO entities (repo_id, kind, id, value)
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(|e| StrataError::Store(format!("failed to prepare put: {e}")))?;
            let mut delete = tx
                .prepare_cached("DELETE FROM entities WHERE repo_id = ?1 AND kind = ?2 AND id = ?3")
                .map_err(|e| StrataError::Store(format!("failed to prepare delete: {e}")))?;
            for write in writes {
                match write {
                    EntityWrite::Put { kind, id, value } => {
                        put.execute(params![repo, kind.as_str(), id, value])
                            .map_err(|e| {
                                StrataError::Store(format!("failed to write {kind} '{id}': {e}"))
                            })?;
                    }
                    EntityWrite::Delete { kind, id } => {
                        delete.execute(params![repo, kind.as_str(), id]).map_err(|e| {
                            StrataError::Store(format!("failed to delete {kind} '{id}': {e}"))
                        })?;
                    }
                }
            }
        }
        tx.commit()
            .map_err(|e| StrataError::Store(format!("failed to commit transaction: {e}")))
    }
}

type EntityKey = (String, EntityKind, String);

/// In-memory persistence for tests and ephemeral scans.
///
/// # Examples
///
/// ```
/// use strata_engine::{EntityKind, EntityWrite, MemoryStore, Persistence};
///
/// let store = MemoryStore::new();
/// store.commit("repo", &[
///     EntityWrite::Put { kind: EntityKind::Commit, id: "a".into(), value: "1".into() },
///     EntityWrite::Put { kind: EntityKind::Commit, id: "b".into(), value: "2".into() },
/// ]).unwrap();
/// let page = store.page("repo", EntityKind::Commit, Some("a"), 10).unwrap();
/// assert_eq!(page, vec![("b".to_string(), "2".to_string())]);
/// ```
#[derive(Default)]
pub struct MemoryStore {
    entities: RwLock<BTreeMap<EntityKey, String>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn range(&self, repo: &str, kind: EntityKind, after: Option<&str>) -> Result<Vec<(String, String)>> {
        let entities = self
            .entities
            .read()
            .map_err(|_| StrataError::Store("memory store lock poisoned".into()))?;
        Ok(entities
            .iter()
            .filter(|((r, k, id), _)| {
                r == repo && *k == kind && after.map_or(true, |a| id.as_str() > a)
            })
            .map(|((_, _, id), value)| (id.clone(), value.clone()))
            .collect())
    }
}

impl Persistence for MemoryStore {
    fn get(&self, repo: &str, kind: EntityKind, id: &str) -> Result<Option<String>> {
        let entities = self
            .entities
            .read()
            .map_err(|_| StrataError::Store("memory store lock poisoned".into()))?;
        Ok(entities
            .get(&(repo.to_string(), kind, id.to_string()))
            .cloned())
    }

    fn list(&self, repo: &str, kind: EntityKind) -> Result<Vec<(String, String)>> {
        self.range(repo, kind, None)
    }

    fn page(
        &self,
        repo: &str,
        kind: EntityKind,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, String)>> {
        let mut rows = self.range(repo, kind, after)?;
        rows.truncate(limit);
        Ok(rows)
    }

    fn commit(&self, repo: &str, writes: &[EntityWrite]) -> Result<()> {
        let mut entities = self
            .entities
            .write()
            .map_err(|_| StrataError::Store("memory store lock poisoned".into()))?;
        for write in writes {
            match write {
                EntityWrite::Put { kind, id, value } => {
                    entities.insert((repo.to_string(), *kind, id.clone()), value.clone());
                }
                EntityWrite::Delete { kind, id } => {
                    entities.remove(&(repo.to_string(), *kind, id.clone()));
                }
            }
        }
        Ok(())
    }
}

impl<P: Persistence + ?Sized> Persistence for std::sync::Arc<P> {
    fn get(&self, repo: &str, kind: EntityKind, id: &str) -> Result<Option<String>> {
        (**self).get(repo, kind, id)
    }

    fn list(&self, repo: &str, kind: EntityKind) -> Result<Vec<(String, String)>> {
        (**self).list(repo, kind)
    }

    fn page(
        &self,
        repo: &str,
        kind: EntityKind,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(String, String)>> {
        (**self).page(repo, kind, after, limit)
    }

    fn commit(&self, repo: &str, writes: &[EntityWrite]) -> Result<()> {
        (**self).commit(repo, writes)
    }
}
