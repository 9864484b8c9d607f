//! Model version identifiers
//!
//! A [`ModelVersion`] is assigned by the trainer when a round commits and is
//! never decremented anywhere in the system. [`VersionCounter`] is the shared,
//! lock-free holder each role uses to publish the version it currently serves.

use core::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Monotonically increasing model version
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ModelVersion(pub i64);

impl ModelVersion {
    /// Version served before the first committed round
    pub const INITIAL: Self = Self(0);

    /// Create a version from its raw value
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Raw wire value
    pub const fn get(self) -> i64 {
        self.0
    }

    /// The version that follows this one
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// How many versions `self` trails `latest` by (0 when current or ahead)
    pub fn lag_behind(self, latest: ModelVersion) -> u64 {
        latest.0.saturating_sub(self.0).max(0) as u64
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

impl From<i64> for ModelVersion {
    fn from(raw: i64) -> Self {
        Self(raw)
    }
}

/// Atomic holder of the version a participant currently serves.
///
/// Writers can only move the value forward; stale writes are ignored.
#[derive(Debug, Default)]
pub struct VersionCounter {
    current: AtomicI64,
}

/// Shared handle to a [`VersionCounter`]
pub type SharedVersion = Arc<VersionCounter>;

impl VersionCounter {
    /// Start at `initial`
    pub fn new(initial: ModelVersion) -> Self {
        Self {
            current: AtomicI64::new(initial.0),
        }
    }

    /// Convenience constructor for a shared counter
    pub fn shared(initial: ModelVersion) -> SharedVersion {
        Arc::new(Self::new(initial))
    }

    /// Currently active version
    pub fn current(&self) -> ModelVersion {
        ModelVersion(self.current.load(Ordering::SeqCst))
    }

    /// Move forward to `version`.
    ///
    /// Returns `true` if the stored value changed. A version at or below the
    /// current one leaves the counter untouched.
    pub fn advance_to(&self, version: ModelVersion) -> bool {
        let prev = self.current.fetch_max(version.0, Ordering::SeqCst);
        prev < version.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_never_moves_backwards() {
        let counter = VersionCounter::new(ModelVersion(3));
        assert!(!counter.advance_to(ModelVersion(2)));
        assert!(!counter.advance_to(ModelVersion(3)));
        assert_eq!(counter.current(), ModelVersion(3));

        assert!(counter.advance_to(ModelVersion(7)));
        assert_eq!(counter.current(), ModelVersion(7));
        assert!(!counter.advance_to(ModelVersion(5)));
        assert_eq!(counter.current(), ModelVersion(7));
    }

    #[test]
    fn concurrent_advances_keep_the_maximum() {
        let counter = VersionCounter::shared(ModelVersion::INITIAL);
        let handles: Vec<_> = (1..=16)
            .map(|v| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    counter.advance_to(ModelVersion(v));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.current(), ModelVersion(16));
    }

    #[test]
    fn lag_is_zero_when_ahead() {
        assert_eq!(ModelVersion(4).lag_behind(ModelVersion(7)), 3);
        assert_eq!(ModelVersion(9).lag_behind(ModelVersion(7)), 0);
        assert_eq!(ModelVersion(1).next(), ModelVersion(2));
        assert_eq!(ModelVersion(12).to_string(), "v12");
    }
}
