//! On-policy sample filter.

use std::sync::Arc;

use policy_sync_core::version::{ModelVersion, SharedVersion};

use super::agent::GatewayStats;

/// Drops training samples produced by any version other than the adopted one
#[derive(Debug, Clone)]
pub struct SampleFilter {
    version: SharedVersion,
    stats: Arc<GatewayStats>,
}

impl SampleFilter {
    pub(crate) fn new(version: SharedVersion, stats: Arc<GatewayStats>) -> Self {
        Self { version, stats }
    }

    /// Whether a sample tagged with `sample_version` may be sent to the trainer
    pub fn admit(&self, sample_version: ModelVersion) -> bool {
        let current = self.version.current();
        if sample_version == current {
            return true;
        }
        self.stats.samples_filtered.inc();
        tracing::debug!(%sample_version, %current, "dropping off-policy sample");
        false
    }

    /// Version samples are currently checked against
    pub fn current(&self) -> ModelVersion {
        self.version.current()
    }
}
