//! Exponential decay kept in log space.
//!
//! A [`LogMass`] stores `ln Σ wᵢ·2^(tᵢ/h)`. Adding a contribution never
//! rewrites earlier ones, and the value at any reference time `now` is
//! `exp(mass − now·ln2/h)`. Ratios of masses with the same half-life do not
//! depend on `now` at all.

use std::f64::consts::LN_2;

use serde::{Deserialize, Serialize};
use strata_core::SECONDS_PER_DAY;

/// Half-life expressed in seconds.
///
/// # Examples
///
/// ```
/// use strata_analytics::HalfLife;
///
/// let h = HalfLife::from_days(1.0);
/// assert_eq!(h.seconds(), 86_400.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HalfLife(f64);

impl HalfLife {
    /// Half-life of `days` days.
    pub fn from_days(days: f64) -> Self {
        Self(days * SECONDS_PER_DAY as f64)
    }

    /// Length in seconds.
    pub fn seconds(&self) -> f64 {
        self.0
    }

    fn exponent(&self, timestamp: i64) -> f64 {
        timestamp as f64 * LN_2 / self.0
    }
}

/// Decayed, accumulated weight in log space. `None` is an empty mass.
///
/// # Examples
///
/// ```
/// use strata_analytics::{HalfLife, LogMass};
///
/// let h = HalfLife::from_days(1.0);
/// let mut mass = LogMass::default();
/// mass.add(4.0, 0, h);
/// // One half-life later only half remains.
/// assert!((mass.value_at(86_400, h) - 2.0).abs() < 1e-9);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LogMass(Option<f64>);

impl LogMass {
    /// Whether nothing was ever added.
    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// Raw log value.
    pub fn log(&self) -> Option<f64> {
        self.0
    }

    /// Add `weight` contributed at `timestamp`. Non-positive weights are ignored.
    pub fn add(&mut self, weight: f64, timestamp: i64, half_life: HalfLife) {
        if weight <= 0.0 {
            return;
        }
        let term = weight.ln() + half_life.exponent(timestamp);
        self.0 = Some(log_add(self.0, term));
    }

    /// Combine two masses with the same half-life.
    pub fn merge(&mut self, other: LogMass) {
        if let Some(term) = other.0 {
            self.0 = Some(log_add(self.0, term));
        }
    }

    /// Decayed value as of `now`.
    pub fn value_at(&self, now: i64, half_life: HalfLife) -> f64 {
        self.0
            .map_or(0.0, |log| (log - half_life.exponent(now)).exp())
    }

    /// `self / other`, computed without leaving log space.
    pub fn ratio(&self, other: &LogMass) -> f64 {
        match (self.0, other.0) {
            (Some(a), Some(b)) => (a - b).exp(),
            _ => 0.0,
        }
    }
}

fn log_add(acc: Option<f64>, term: f64) -> f64 {
    match acc {
        None => term,
        Some(a) => {
            let (hi, lo) = if a >= term { (a, term) } else { (term, a) };
            hi + (lo - hi).exp().ln_1p()
        }
    }
}

/// Normalize log masses into shares that sum to one.
pub fn shares(masses: &[LogMass]) -> Vec<f64> {
    let max = masses
        .iter()
        .filter_map(LogMass::log)
        .fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return vec![0.0; masses.len()];
    }
    let scaled: Vec<f64> = masses
        .iter()
        .map(|m| m.log().map_or(0.0, |l| (l - max).exp()))
        .collect();
    let total: f64 = scaled.iter().sum();
    scaled.iter().map(|v| v / total).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = SECONDS_PER_DAY;

    #[test]
    fn equal_age_contributions_add_up() {
        let h = HalfLife::from_days(180.0);
        let mut mass = LogMass::default();
        mass.add(3.0, 1_000, h);
        mass.add(7.0, 1_000, h);
        assert!((mass.value_at(1_000, h) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn older_contribution_weighs_less() {
        let h = HalfLife::from_days(10.0);
        let mut old = LogMass::default();
        let mut new = LogMass::default();
        old.add(1.0, 0, h);
        new.add(1.0, 10 * DAY, h);
        assert!((old.ratio(&new) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn large_timestamps_do_not_overflow() {
        let h = HalfLife::from_days(1.0);
        let mut mass = LogMass::default();
        mass.add(5.0, 1_700_000_000, h);
        assert!(mass.log().is_some_and(f64::is_finite));
        assert!((mass.value_at(1_700_000_000, h) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn merge_matches_sequential_adds() {
        let h = HalfLife::from_days(30.0);
        let mut a = LogMass::default();
        a.add(2.0, 0, h);
        let mut b = LogMass::default();
        b.add(6.0, 0, h);
        a.merge(b);
        assert!((a.value_at(0, h) - 8.0).abs() < 1e-9);
    }

    #[test]
    fn non_positive_weight_is_ignored() {
        let h = HalfLife::from_days(30.0);
        let mut mass = LogMass::default();
        mass.add(0.0, 0, h);
        assert!(mass.is_empty());
    }

    #[test]
    fn shares_sum_to_one() {
        let h = HalfLife::from_days(30.0);
        let masses: Vec<LogMass> = [1.0, 2.0, 5.0]
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let mut m = LogMass::default();
                m.add(*w, i as i64 * DAY, h);
                m
            })
            .collect();
        let s = shares(&masses);
        assert!((s.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(s[2] > s[1] && s[1] > s[0]);
    }

    #[test]
    fn empty_masses_have_zero_shares() {
        assert_eq!(shares(&[LogMass::default()]), vec![0.0]);
    }
}
