//! Per-commit analysis that can run in parallel: diff, classification, blame.

use std::sync::Arc;
use std::time::Duration;

use strata_core::{CommitRecord, Result};
use strata_history::{CommitDiff, DiffAnalyzer, DiffStatus, GitObjectSource, ScanWarning};

use crate::classify::{Classification, FixClassifier};
use crate::szz::{attribute, Attribution};

/// Everything computed for one commit before it is folded into state.
#[derive(Debug, Clone)]
pub struct AnalyzedCommit {
    /// The commit.
    pub commit: CommitRecord,
    /// Its diff against the policy parent.
    pub diff: CommitDiff,
    /// Bug-fix classification of the message.
    pub classification: Classification,
    /// Introducing commits, for complete fix diffs.
    pub attribution: Option<Attribution>,
    /// Recoverable conditions met while analyzing.
    pub warnings: Vec<ScanWarning>,
}

impl AnalyzedCommit {
    /// Whether the commit was classified as a bug fix.
    pub fn is_fix(&self) -> bool {
        self.classification.is_fix
    }
}

/// Runs the stateless part of the pipeline for one commit.
///
/// Holds no per-repository state, so one analyzer can serve a whole worker
/// pool.
#[derive(Clone)]
pub struct CommitAnalyzer {
    diff: DiffAnalyzer,
    classifier: Arc<dyn FixClassifier>,
    blame_budget: Duration,
}

impl CommitAnalyzer {
    /// Analyzer with the given diff settings, classifier and blame budget.
    pub fn new(
        diff: DiffAnalyzer,
        classifier: Arc<dyn FixClassifier>,
        blame_budget: Duration,
    ) -> Self {
        Self {
            diff,
            classifier,
            blame_budget,
        }
    }

    /// Diff, classify and, for fixes, blame one commit.
    ///
    /// # Errors
    ///
    /// Only a repository-level failure is an error; partial diffs and blame
    /// failures are recorded as warnings.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::time::Duration;
    /// use strata_analytics::{CommitAnalyzer, PatternClassifier};
    /// use strata_history::{DiffAnalyzer, GitObjectSource, MemoryRepository};
    ///
    /// let repo = MemoryRepository::new();
    /// repo.commit("c1").write("f", "1\n2\n").apply().unwrap();
    /// repo.commit("c2").write("f", "1\nX\n").message("fix: second line").apply().unwrap();
    ///
    /// let analyzer = CommitAnalyzer::new(
    ///     DiffAnalyzer::default(),
    ///     Arc::new(PatternClassifier::default()),
    ///     Duration::from_secs(5),
    /// );
    /// let analyzed = analyzer.analyze(&repo, repo.get_commit("c2").unwrap()).unwrap();
    /// assert!(analyzed.is_fix());
    /// assert_eq!(analyzed.attribution.unwrap().introducing.get("c1"), Some(&1));
    /// ```
    pub fn analyze<S: GitObjectSource + ?Sized>(
        &self,
        source: &S,
        commit: CommitRecord,
    ) -> Result<AnalyzedCommit> {
        let diff = self.diff.analyze(source, &commit)?;
        let classification = self.classifier.classify(&commit.message);
        let mut warnings = Vec::new();

        if let DiffStatus::Partial { reason } = &diff.status {
            warnings.push(ScanWarning::for_commit(
                &commit.sha,
                format!("partial diff, needs reprocessing: {reason}"),
            ));
        }

        let attribution = if classification.is_fix && !diff.is_partial() {
            let attribution = attribute(source, &diff, self.blame_budget)?;
            for (path, reason) in &attribution.failures {
                warnings.push(ScanWarning::for_commit(
                    &commit.sha,
                    format!("blame of {path} incomplete: {reason}"),
                ));
            }
            Some(attribution)
        } else {
            None
        };

        Ok(AnalyzedCommit {
            commit,
            diff,
            classification,
            attribution,
            warnings,
        })
    }
}
