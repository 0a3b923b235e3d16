use std::path::PathBuf;

/// Errors that can occur across the strata workspace.
///
/// Library crates use this type directly; the binary renders it through
/// `miette` at the boundary.
///
/// # Examples
///
/// ```
/// use strata_core::StrataError;
///
/// let err = StrataError::Config("unknown merge policy".into());
/// assert!(err.to_string().contains("unknown merge policy"));
/// assert!(!err.is_recoverable());
/// ```
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum StrataError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    #[diagnostic(
        code(strata::config),
        help("check the [scan], [risk], [ownership], [coupling] and [store] sections of .strata.toml")
    )]
    Config(String),

    /// Git operation failure that does not invalidate the whole repository.
    #[error("git error: {0}")]
    Git(String),

    /// The repository handle is unreachable or locked. Fatal for a scan.
    #[error("repository error: {0}")]
    #[diagnostic(
        code(strata::repository),
        help("make sure the path is a readable git repository and no other process holds its lock")
    )]
    Repository(String),

    /// A single commit object could not be read. Recoverable.
    #[error("corrupt object {sha}: {reason}")]
    CorruptObject {
        /// Sha of the unreadable object.
        sha: String,
        /// Why the object could not be read.
        reason: String,
    },

    /// Patch or rule parsing failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Persistence layer failure.
    #[error("store error: {0}")]
    Store(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A diff or blame ran past its deadline and was abandoned.
    #[error("time budget exceeded: {0}")]
    Timeout(String),

    /// Another scan already holds the repository.
    #[error("a scan is already running for repository {0}")]
    ScanInProgress(String),

    /// The scan was cancelled before the batch could be checkpointed.
    #[error("scan cancelled")]
    Cancelled,

    /// A requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A required file was not found.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

impl StrataError {
    /// Whether a scan may continue after this error.
    ///
    /// Corrupt individual objects and transient store failures are
    /// recoverable; everything else aborts the scan.
    ///
    /// # Examples
    ///
    /// ```
    /// use strata_core::StrataError;
    ///
    /// let corrupt = StrataError::CorruptObject { sha: "abc".into(), reason: "zlib".into() };
    /// assert!(corrupt.is_recoverable());
    /// assert!(!StrataError::Repository("locked".into()).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StrataError::CorruptObject { .. } | StrataError::Store(_))
    }
}
