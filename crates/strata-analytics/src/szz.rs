//! SZZ-style attribution of fix commits to the commits that introduced the fixed lines.

use std::collections::BTreeMap;
use std::time::Duration;

use strata_core::{Result, StrataError};
use strata_history::{CommitDiff, Deadline, GitObjectSource};

/// Introducing commits resolved for one fix commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attribution {
    /// Introducing commit sha to the number of its lines the fix touched.
    pub introducing: BTreeMap<String, u32>,
    /// False when blame ran out of budget or failed for some file.
    pub complete: bool,
    /// Files whose blame could not be resolved, with the reason.
    pub failures: Vec<(String, String)>,
}

impl Attribution {
    /// Total implicated lines.
    pub fn total_lines(&self) -> u32 {
        self.introducing.values().sum()
    }
}

/// Blame the removed lines of `diff` at its parent.
///
/// Every old-side line the fix removed or rewrote is resolved to the commit
/// that last modified it. The budget covers the whole attribution: a blame
/// still running when it runs out is abandoned, and that file and every file
/// left over are reported as failures.
///
/// # Errors
///
/// Returns [`StrataError::Repository`] when the repository is unavailable.
/// Other blame failures only make the attribution incomplete.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use strata_analytics::attribute;
/// use strata_history::{DiffAnalyzer, GitObjectSource, MemoryRepository};
///
/// let repo = MemoryRepository::new();
/// repo.commit("c1").write("f.rs", "a\nb\nc\n").apply().unwrap();
/// repo.commit("c2").write("f.rs", "a\nB\nc\n").message("fix b").apply().unwrap();
///
/// let commit = repo.get_commit("c2").unwrap();
/// let diff = DiffAnalyzer::default().analyze(&repo, &commit).unwrap();
/// let attribution = attribute(&repo, &diff, Duration::from_secs(5)).unwrap();
/// assert_eq!(attribution.introducing.get("c1"), Some(&1));
/// ```
pub fn attribute<S: GitObjectSource + ?Sized>(
    source: &S,
    diff: &CommitDiff,
    budget: Duration,
) -> Result<Attribution> {
    let mut attribution = Attribution {
        complete: true,
        ..Attribution::default()
    };
    let Some(parent) = diff.parent.as_deref() else {
        return Ok(attribution);
    };
    let deadline = Deadline::after(budget);

    for (path, lines) in &diff.removed_lines {
        if deadline.expired() {
            attribution.complete = false;
            let reason = format!("blame exceeded its budget of {}ms", budget.as_millis());
            attribution.failures.push((path.clone(), reason));
            continue;
        }
        let origins = match source.blame(path, parent, deadline) {
            Ok(origins) => origins,
            Err(e @ StrataError::Repository(_)) => return Err(e),
            Err(e) => {
                tracing::warn!(sha = %diff.sha, path, error = %e, "blame failed");
                attribution.complete = false;
                attribution.failures.push((path.clone(), e.to_string()));
                continue;
            }
        };
        for line in lines {
            let Some(origin) = (*line as usize)
                .checked_sub(1)
                .and_then(|i| origins.get(i))
            else {
                continue;
            };
            if origin != &diff.sha {
                *attribution.introducing.entry(origin.clone()).or_default() += 1;
            }
        }
    }

    tracing::debug!(
        sha = %diff.sha,
        introducing = attribution.introducing.len(),
        lines = attribution.total_lines(),
        "attributed fix"
    );
    Ok(attribution)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_history::{DiffAnalyzer, MemoryRepository};

    fn diff_of(repo: &MemoryRepository, sha: &str) -> CommitDiff {
        let commit = repo.get_commit(sha).unwrap();
        DiffAnalyzer::default().analyze(repo, &commit).unwrap()
    }

    #[test]
    fn lines_resolve_to_their_last_author() {
        let repo = MemoryRepository::new();
        repo.commit("c1").write("f", "1\n2\n3\n4\n").apply().unwrap();
        repo.commit("c2").write("f", "1\n2\nX\n4\n").apply().unwrap();
        repo.commit("fix").write("f", "1\nY\nZ\n4\n").apply().unwrap();

        let a = attribute(&repo, &diff_of(&repo, "fix"), Duration::from_secs(5)).unwrap();
        assert!(a.complete);
        assert_eq!(a.introducing.get("c1"), Some(&1));
        assert_eq!(a.introducing.get("c2"), Some(&1));
        assert_eq!(a.total_lines(), 2);
    }

    #[test]
    fn pure_additions_implicate_nobody() {
        let repo = MemoryRepository::new();
        repo.commit("c1").write("f", "1\n").apply().unwrap();
        repo.commit("c2").write("f", "1\n2\n").apply().unwrap();
        let a = attribute(&repo, &diff_of(&repo, "c2"), Duration::from_secs(5)).unwrap();
        assert!(a.introducing.is_empty());
        assert!(a.complete);
    }

    #[test]
    fn deleted_file_lines_are_blamed() {
        let repo = MemoryRepository::new();
        repo.commit("c1").write("gone", "a\nb\n").write("keep", "k\n").apply().unwrap();
        repo.commit("c2").delete("gone").apply().unwrap();
        let a = attribute(&repo, &diff_of(&repo, "c2"), Duration::from_secs(5)).unwrap();
        assert_eq!(a.introducing.get("c1"), Some(&2));
    }

    #[test]
    fn root_commit_has_nothing_to_blame() {
        let repo = MemoryRepository::new();
        repo.commit("c1").write("f", "1\n").apply().unwrap();
        let a = attribute(&repo, &diff_of(&repo, "c1"), Duration::from_secs(5)).unwrap();
        assert!(a.introducing.is_empty());
    }

    #[test]
    fn slow_blame_is_abandoned_at_the_budget() {
        let repo = MemoryRepository::new();
        repo.commit("c1")
            .write("a", "1\n2\n")
            .write("b", "1\n")
            .write("c", "1\n")
            .apply()
            .unwrap();
        repo.commit("c2")
            .write("a", "x\ny\n")
            .write("b", "z\n")
            .write("c", "w\n")
            .apply()
            .unwrap();
        repo.delay_blame("b", Duration::from_millis(1500)).unwrap();
        let diff = diff_of(&repo, "c2");

        let started = std::time::Instant::now();
        let a = attribute(&repo, &diff, Duration::from_millis(100)).unwrap();
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert!(!a.complete);
        assert_eq!(a.introducing.get("c1"), Some(&2));
        let failed: Vec<&str> = a.failures.iter().map(|(path, _)| path.as_str()).collect();
        assert_eq!(failed, vec!["b", "c"]);
    }

    #[test]
    fn unavailable_repository_propagates() {
        let repo = MemoryRepository::new();
        repo.commit("c1").write("f", "1\n").apply().unwrap();
        repo.commit("c2").write("f", "2\n").apply().unwrap();
        let diff = diff_of(&repo, "c2");
        repo.set_unavailable(true).unwrap();
        assert!(matches!(
            attribute(&repo, &diff, Duration::from_secs(5)),
            Err(StrataError::Repository(_))
        ));
    }
}
