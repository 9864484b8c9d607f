//! Quorum ratio arithmetic
//!
//! A step proceeds when `acked / total >= ratio`. An empty participant set
//! is treated as satisfied: there is nothing to synchronize.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Fraction of participants that must acknowledge a step, in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f64", into = "f64")]
pub struct QuorumRatio(f64);

impl QuorumRatio {
    /// Default threshold used when nothing is configured
    pub const DEFAULT: Self = Self(0.9);

    /// Validate and wrap a ratio
    pub fn new(ratio: f64) -> Result<Self> {
        if !ratio.is_finite() || !(0.0..=1.0).contains(&ratio) {
            return Err(Error::InvalidConfig(format!(
                "quorum_ratio must be within [0, 1], got {ratio}"
            )));
        }
        Ok(Self(ratio))
    }

    /// Raw ratio
    pub fn get(self) -> f64 {
        self.0
    }

    /// Whether `acked` out of `total` satisfies this ratio
    pub fn is_met(self, acked: usize, total: usize) -> bool {
        quorum_met(acked, total, self.0)
    }
}

impl Default for QuorumRatio {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl TryFrom<f64> for QuorumRatio {
    type Error = Error;

    fn try_from(value: f64) -> Result<Self> {
        Self::new(value)
    }
}

impl From<QuorumRatio> for f64 {
    fn from(value: QuorumRatio) -> Self {
        value.0
    }
}

/// `acked / total >= ratio`, with `total == 0` counted as satisfied
pub fn quorum_met(acked: usize, total: usize, ratio: f64) -> bool {
    if total == 0 {
        return true;
    }
    (acked.min(total) as f64) / (total as f64) >= ratio
}

/// Outcome tally for one broadcast phase of a round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuorumTally {
    /// Participants that replied success
    pub acked: usize,
    /// Participants that replied failure or timed out
    pub failed: usize,
    /// Participants whose channel errored; excluded from `total`
    pub unreachable: usize,
    /// Denominator used for the quorum decision
    pub total: usize,
}

impl QuorumTally {
    /// Start a tally over `total` reachable participants
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Record a successful acknowledgement
    pub fn ack(&mut self) {
        self.acked += 1;
    }

    /// Record a failure or timeout
    pub fn fail(&mut self) {
        self.failed += 1;
    }

    /// Record an unreachable participant and drop it from the denominator
    pub fn unreachable(&mut self) {
        self.unreachable += 1;
        self.total = self.total.saturating_sub(1);
    }

    /// Participants that have not answered yet
    pub fn pending(&self) -> usize {
        self.total.saturating_sub(self.acked + self.failed)
    }

    /// Whether the tally satisfies `ratio`
    pub fn is_met(&self, ratio: QuorumRatio) -> bool {
        ratio.is_met(self.acked, self.total)
    }

    /// Whether quorum can still be reached if every pending participant acks
    pub fn is_reachable(&self, ratio: QuorumRatio) -> bool {
        ratio.is_met(self.acked + self.pending(), self.total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_is_satisfied() {
        assert!(quorum_met(0, 0, 0.9));
        assert!(quorum_met(0, 0, 1.0));
    }

    #[test]
    fn nine_of_ten_meets_point_nine() {
        let ratio = QuorumRatio::new(0.9).unwrap();
        assert!(ratio.is_met(9, 10));
        assert!(ratio.is_met(10, 10));
        assert!(!ratio.is_met(8, 10));
    }

    #[test]
    fn two_of_three_misses_default() {
        assert!(!QuorumRatio::default().is_met(2, 3));
        assert!(QuorumRatio::new(0.6).unwrap().is_met(2, 3));
    }

    #[test]
    fn exhaustive_small_grid_matches_ratio_definition() {
        for ratio in [0.0, 0.5, 0.67, 0.9, 1.0] {
            let q = QuorumRatio::new(ratio).unwrap();
            for total in 1..=20usize {
                for acked in 0..=total {
                    let expected = acked as f64 / total as f64 >= ratio;
                    assert_eq!(q.is_met(acked, total), expected, "{acked}/{total} @ {ratio}");
                }
            }
        }
    }

    #[test]
    fn rejects_out_of_range_ratio() {
        assert!(QuorumRatio::new(-0.1).is_err());
        assert!(QuorumRatio::new(1.01).is_err());
        assert!(QuorumRatio::new(f64::NAN).is_err());
    }

    #[test]
    fn tally_excludes_unreachable_from_denominator() {
        let mut tally = QuorumTally::new(4);
        tally.ack();
        tally.ack();
        tally.ack();
        tally.unreachable();
        assert_eq!(tally.total, 3);
        assert_eq!(tally.pending(), 0);
        assert!(tally.is_met(QuorumRatio::default()));
    }

    #[test]
    fn tally_reports_unreachable_quorum_early() {
        let mut tally = QuorumTally::new(3);
        tally.fail();
        assert!(!tally.is_reachable(QuorumRatio::default()));
        assert!(tally.is_reachable(QuorumRatio::new(0.5).unwrap()));
    }

    #[test]
    fn ratio_deserializes_with_validation() {
        let ok: QuorumRatio = serde_json::from_str("0.75").unwrap();
        assert_eq!(ok.get(), 0.75);
        assert!(serde_json::from_str::<QuorumRatio>("1.5").is_err());
    }
}
