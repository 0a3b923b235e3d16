//! Per-file change statistics and hotspot ranking.
//!
//! Files that change often, churn many lines and keep attracting fixes are
//! likely sources of future defects.

use serde::{Deserialize, Serialize};

/// Accumulated history of one file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStats {
    /// Commits touching the file.
    pub revisions: u32,
    /// Lines added plus removed across all commits.
    pub churn: u64,
    /// Bug-fix commits touching the file.
    pub fixes: u32,
    /// Timestamp of the latest touch.
    pub last_touched: i64,
}

impl FileStats {
    /// Record one touch.
    pub fn touch(&mut self, lines: u32, is_fix: bool, timestamp: i64) {
        self.revisions += 1;
        self.churn += u64::from(lines);
        if is_fix {
            self.fixes += 1;
        }
        self.last_touched = self.last_touched.max(timestamp);
    }

    /// Fold a renamed file's history into this one.
    pub fn absorb(&mut self, other: FileStats) {
        self.revisions += other.revisions;
        self.churn += other.churn;
        self.fixes += other.fixes;
        self.last_touched = self.last_touched.max(other.last_touched);
    }

    /// Share of revisions that were bug fixes.
    ///
    /// # Examples
    ///
    /// ```
    /// use strata_analytics::FileStats;
    ///
    /// let stats = FileStats { revisions: 4, churn: 80, fixes: 1, last_touched: 0 };
    /// assert_eq!(stats.fix_ratio(), 0.25);
    /// assert_eq!(FileStats::default().fix_ratio(), 0.0);
    /// ```
    pub fn fix_ratio(&self) -> f64 {
        if self.revisions == 0 {
            0.0
        } else {
            f64::from(self.fixes) / f64::from(self.revisions)
        }
    }
}

/// A file ranked by change activity.
///
/// # Examples
///
/// ```
/// use strata_analytics::Hotspot;
///
/// let h = Hotspot {
///     path: "src/main.rs".into(),
///     revisions: 10,
///     churn: 500,
///     fixes: 4,
///     fix_ratio: 0.4,
///     score: 0.85,
///     last_touched: 1_700_000_000,
/// };
/// assert!(h.score > 0.0 && h.score <= 1.0);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hotspot {
    /// File path relative to repo root.
    pub path: String,
    /// Commits touching this file.
    pub revisions: u32,
    /// Lines added plus removed across all commits.
    pub churn: u64,
    /// Bug-fix commits touching this file.
    pub fixes: u32,
    /// `fixes / revisions`.
    pub fix_ratio: f64,
    /// Normalized hotspot score (0.0–1.0).
    pub score: f64,
    /// Unix timestamp of the most recent change.
    pub last_touched: i64,
}

/// Rank files by `0.5·revisions + 0.3·churn + 0.2·fix ratio`, each
/// normalized to the maximum across all files.
///
/// Sorted by score descending, then by path. At most `limit` entries are
/// returned.
pub fn rank_hotspots<'a>(
    files: impl IntoIterator<Item = (&'a str, &'a FileStats)>,
    limit: usize,
) -> Vec<Hotspot> {
    let mut hotspots: Vec<Hotspot> = files
        .into_iter()
        .filter(|(_, stats)| stats.revisions > 0)
        .map(|(path, stats)| Hotspot {
            path: path.to_string(),
            revisions: stats.revisions,
            churn: stats.churn,
            fixes: stats.fixes,
            fix_ratio: stats.fix_ratio(),
            score: 0.0,
            last_touched: stats.last_touched,
        })
        .collect();
    if hotspots.is_empty() {
        return hotspots;
    }

    let max_revisions = hotspots.iter().map(|h| h.revisions).max().unwrap_or(1).max(1) as f64;
    let max_churn = hotspots.iter().map(|h| h.churn).max().unwrap_or(1).max(1) as f64;
    let max_fix_ratio = hotspots
        .iter()
        .map(|h| h.fix_ratio)
        .fold(0.0f64, f64::max);

    for hotspot in &mut hotspots {
        let norm_revisions = f64::from(hotspot.revisions) / max_revisions;
        let norm_churn = hotspot.churn as f64 / max_churn;
        let norm_fixes = if max_fix_ratio > 0.0 {
            hotspot.fix_ratio / max_fix_ratio
        } else {
            0.0
        };
        hotspot.score = norm_revisions * 0.5 + norm_churn * 0.3 + norm_fixes * 0.2;
    }

    hotspots.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.path.cmp(&b.path)));
    hotspots.truncate(limit);
    hotspots
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(revisions: u32, churn: u64, fixes: u32) -> FileStats {
        FileStats {
            revisions,
            churn,
            fixes,
            last_touched: 0,
        }
    }

    #[test]
    fn busy_file_ranks_first() {
        let busy = stats(10, 500, 3);
        let quiet = stats(1, 5, 0);
        let ranked = rank_hotspots([("busy.rs", &busy), ("quiet.rs", &quiet)], 10);
        assert_eq!(ranked[0].path, "busy.rs");
        assert!((ranked[0].score - 1.0).abs() < 1e-12);
    }

    #[test]
    fn scores_are_in_valid_range() {
        let files = [stats(3, 10, 1), stats(7, 2, 0), stats(1, 900, 1)];
        let ranked = rank_hotspots(
            files.iter().enumerate().map(|(i, s)| (["a", "b", "c"][i], s)),
            10,
        );
        for h in &ranked {
            assert!((0.0..=1.0).contains(&h.score), "{} out of range", h.score);
        }
    }

    #[test]
    fn ties_are_ordered_by_path_and_limited() {
        let same = stats(2, 20, 0);
        let ranked = rank_hotspots([("z", &same), ("a", &same), ("m", &same)], 2);
        let paths: Vec<&str> = ranked.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "m"]);
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(rank_hotspots(std::iter::empty(), 5).is_empty());
    }

    #[test]
    fn rename_absorbs_history() {
        let mut new = stats(1, 10, 0);
        new.absorb(FileStats {
            revisions: 2,
            churn: 30,
            fixes: 1,
            last_touched: 50,
        });
        assert_eq!(new.revisions, 3);
        assert_eq!(new.churn, 40);
        assert_eq!(new.last_touched, 50);
    }
}
