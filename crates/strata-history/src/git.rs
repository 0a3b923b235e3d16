//! Git object access via git2.
//!
//! `git2::Repository` is `Send` but not `Sync`, so the source keeps a small
//! pool of handles and lends one to each call; parallel diff workers never
//! share a handle.

use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use git2::{
    BlameOptions, Delta, DiffDelta, DiffFindOptions, DiffOptions, ErrorCode, Oid, Repository,
};
use strata_core::{CommitRecord, Result, Signature, StrataError};

use crate::source::{Deadline, DiffLine, GitObjectSource, Hunk, RawFileDiff};

/// A repository on disk, read through git2.
///
/// # Examples
///
/// ```no_run
/// use std::path::Path;
/// use strata_history::{GitObjectSource, GitRepository};
///
/// let repo = GitRepository::open(Path::new(".")).unwrap();
/// for tip in repo.tips(None).unwrap() {
///     let commit = repo.get_commit(&tip).unwrap();
///     println!("{}: {}", &commit.sha[..7], commit.subject());
/// }
/// ```
pub struct GitRepository {
    path: PathBuf,
    pool: Mutex<Vec<Repository>>,
}

impl GitRepository {
    /// Open the repository containing `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Repository`] if no repository can be opened.
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::discover(path).map_err(|e| {
            StrataError::Repository(format!("failed to open repository at {}: {e}", path.display()))
        })?;
        let root = repo
            .workdir()
            .unwrap_or_else(|| repo.path())
            .to_path_buf();
        Ok(Self {
            path: root,
            pool: Mutex::new(vec![repo]),
        })
    }

    /// Root directory of the repository.
    pub fn root(&self) -> &Path {
        &self.path
    }

    fn with_repo<T>(&self, f: impl FnOnce(&Repository) -> Result<T>) -> Result<T> {
        let pooled = self
            .pool
            .lock()
            .map_err(|_| StrataError::Repository("repository pool lock poisoned".into()))?
            .pop();
        let repo = match pooled {
            Some(repo) => repo,
            None => Repository::open(&self.path).map_err(|e| {
                StrataError::Repository(format!("failed to reopen repository: {e}"))
            })?,
        };
        let result = f(&repo);
        if let Ok(mut pool) = self.pool.lock() {
            pool.push(repo);
        }
        result
    }
}

fn parse_oid(sha: &str) -> Result<Oid> {
    Oid::from_str(sha).map_err(|e| StrataError::CorruptObject {
        sha: sha.to_string(),
        reason: format!("invalid object id: {e}"),
    })
}

/// Map a git2 failure on a single object; lock failures invalidate the repository.
fn object_error(sha: &str, e: git2::Error) -> StrataError {
    match e.code() {
        ErrorCode::Locked => StrataError::Repository(format!("repository is locked: {e}")),
        _ => StrataError::CorruptObject {
            sha: sha.to_string(),
            reason: e.message().to_string(),
        },
    }
}

fn signature(sig: &git2::Signature<'_>) -> Signature {
    Signature::new(
        sig.name().unwrap_or("unknown"),
        sig.email().unwrap_or(""),
    )
}

impl GitObjectSource for GitRepository {
    fn tips(&self, branch: Option<&str>) -> Result<Vec<String>> {
        self.with_repo(|repo| {
            let oid = match branch {
                Some(name) if name != "HEAD" => {
                    let reference = repo.resolve_reference_from_short_name(name).map_err(|e| {
                        StrataError::Git(format!("failed to resolve branch '{name}': {e}"))
                    })?;
                    reference
                        .peel_to_commit()
                        .map_err(|e| StrataError::Git(format!("branch '{name}' has no commit: {e}")))?
                        .id()
                }
                _ => match repo.head() {
                    Ok(head) => head
                        .peel_to_commit()
                        .map_err(|e| StrataError::Git(format!("HEAD has no commit: {e}")))?
                        .id(),
                    Err(e) if e.code() == ErrorCode::UnbornBranch => return Ok(Vec::new()),
                    Err(e) => {
                        return Err(StrataError::Repository(format!("failed to read HEAD: {e}")))
                    }
                },
            };
            Ok(vec![oid.to_string()])
        })
    }

    fn get_commit(&self, sha: &str) -> Result<CommitRecord> {
        let oid = parse_oid(sha)?;
        self.with_repo(|repo| {
            let commit = repo.find_commit(oid).map_err(|e| object_error(sha, e))?;
            let message = commit
                .message()
                .ok_or_else(|| StrataError::CorruptObject {
                    sha: sha.to_string(),
                    reason: "message is not valid UTF-8".into(),
                })?
                .to_string();
            let record = CommitRecord {
                sha: sha.to_string(),
                parents: commit.parent_ids().map(|p| p.to_string()).collect(),
                author: signature(&commit.author()),
                committer: signature(&commit.committer()),
                timestamp: commit.time().seconds(),
                message,
            };
            Ok(record)
        })
    }

    fn list_parents(&self, sha: &str) -> Result<Vec<String>> {
        let oid = parse_oid(sha)?;
        self.with_repo(|repo| {
            let commit = repo.find_commit(oid).map_err(|e| object_error(sha, e))?;
            Ok(commit.parent_ids().map(|p| p.to_string()).collect())
        })
    }

    fn diff_between(
        &self,
        parent: Option<&str>,
        child: &str,
        deadline: Deadline,
    ) -> Result<Vec<RawFileDiff>> {
        let child_oid = parse_oid(child)?;
        let parent_oid = parent.map(parse_oid).transpose()?;
        let what = format!("diff of {child}");
        self.with_repo(|repo| {
            let child_tree = repo
                .find_commit(child_oid)
                .and_then(|c| c.tree())
                .map_err(|e| object_error(child, e))?;
            let parent_tree = match (parent, parent_oid) {
                (Some(p), Some(oid)) => Some(
                    repo.find_commit(oid)
                        .and_then(|c| c.tree())
                        .map_err(|e| object_error(p, e))?,
                ),
                _ => None,
            };

            let mut diff_opts = DiffOptions::new();
            diff_opts.context_lines(0);
            let mut diff = repo
                .diff_tree_to_tree(parent_tree.as_ref(), Some(&child_tree), Some(&mut diff_opts))
                .map_err(|e| object_error(child, e))?;
            deadline.check(&what)?;

            let mut find_opts = DiffFindOptions::new();
            find_opts.renames(true);
            diff.find_similar(Some(&mut find_opts))
                .map_err(|e| StrataError::Git(format!("failed to find renames: {e}")))?;
            deadline.check(&what)?;

            // Callbacks run one at a time, in delta, hunk, line order.
            let files = RefCell::new(Vec::<RawFileDiff>::new());
            let timed_out = Cell::new(false);
            let alive = || {
                if deadline.expired() {
                    timed_out.set(true);
                }
                !timed_out.get()
            };
            let walked = diff.foreach(
                &mut |delta, _progress| {
                    files.borrow_mut().push(file_diff(&delta));
                    alive()
                },
                Some(&mut |_delta, _binary| {
                    if let Some(file) = files.borrow_mut().last_mut() {
                        file.binary = true;
                        file.hunks.clear();
                    }
                    alive()
                }),
                Some(&mut |_delta, hunk| {
                    if let Some(file) = files.borrow_mut().last_mut() {
                        file.hunks.push(Hunk {
                            old_start: hunk.old_start(),
                            old_lines: hunk.old_lines(),
                            new_start: hunk.new_start(),
                            new_lines: hunk.new_lines(),
                            ..Hunk::default()
                        });
                    }
                    alive()
                }),
                Some(&mut |_delta, _hunk, line| {
                    let mut files = files.borrow_mut();
                    let Some(hunk) = files.last_mut().and_then(|f| f.hunks.last_mut()) else {
                        return alive();
                    };
                    let text = String::from_utf8_lossy(line.content())
                        .trim_end_matches(|c: char| c == '\n' || c == '\r')
                        .to_string();
                    match (line.origin(), line.old_lineno(), line.new_lineno()) {
                        ('-', Some(number), _) => hunk.removed.push(DiffLine { number, text }),
                        ('+', _, Some(number)) => hunk.added.push(DiffLine { number, text }),
                        _ => {}
                    }
                    alive()
                }),
            );
            if timed_out.get() {
                return Err(StrataError::Timeout(what));
            }
            walked.map_err(|e| StrataError::Git(format!("failed to walk diff of {child}: {e}")))?;
            Ok(files.into_inner())
        })
    }

    fn blame(&self, path: &str, at: &str, deadline: Deadline) -> Result<Vec<String>> {
        let oid = parse_oid(at)?;
        let what = format!("blame of {path} at {at}");
        deadline.check(&what)?;
        self.with_repo(|repo| {
            let mut opts = BlameOptions::new();
            opts.newest_commit(oid);
            // libgit2 cannot interrupt a blame; an overrun is discarded afterwards.
            let blame = repo
                .blame_file(Path::new(path), Some(&mut opts))
                .map_err(|e| StrataError::Git(format!("failed to blame {path} at {at}: {e}")))?;
            deadline.check(&what)?;

            let mut lines = Vec::new();
            for hunk in blame.iter() {
                let origin = hunk.final_commit_id().to_string();
                let start = hunk.final_start_line().max(1);
                let needed = start - 1 + hunk.lines_in_hunk();
                if lines.len() < needed {
                    lines.resize(needed, String::new());
                }
                for slot in &mut lines[start - 1..needed] {
                    *slot = origin.clone();
                }
            }
            Ok(lines)
        })
    }
}

/// Paths and rename flag of one delta, read from the tree entries.
fn file_diff(delta: &DiffDelta<'_>) -> RawFileDiff {
    let path = |file: git2::DiffFile<'_>| {
        file.path().map(|p| p.to_string_lossy().into_owned())
    };
    let (old_path, new_path) = match delta.status() {
        Delta::Added | Delta::Untracked => (None, path(delta.new_file())),
        Delta::Deleted => (path(delta.old_file()), None),
        _ => (path(delta.old_file()), path(delta.new_file())),
    };
    RawFileDiff {
        old_path,
        new_path,
        binary: delta.flags().is_binary(),
        renamed: delta.status() == Delta::Renamed,
        hunks: Vec::new(),
    }
}
