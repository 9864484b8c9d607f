//! Gateway participant: answers the trainer on behalf of the barrier.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use policy_sync_core::config::SyncConfig;
use policy_sync_core::metrics::{observe_all, Counter, MetricSource, Observation};
use policy_sync_core::traits::Role;
use policy_sync_core::version::{ModelVersion, SharedVersion, VersionCounter};
use policy_sync_net::protocol::SyncMessage;

use super::barrier::BarrierController;
use super::filter::SampleFilter;
use crate::serve::ControlHandler;

/// Gateway counters
#[derive(Debug, Default)]
pub struct GatewayStats {
    pub pause_quorum_success: Counter,
    pub pause_quorum_failure: Counter,
    pub version_adopted: Counter,
    pub samples_filtered: Counter,
}

impl MetricSource for GatewayStats {
    fn observations(&self) -> Vec<Observation> {
        observe_all(
            "gateway",
            [
                ("pause_quorum_success", self.pause_quorum_success.get()),
                ("pause_quorum_failure", self.pause_quorum_failure.get()),
                ("version_adopted", self.version_adopted.get()),
                ("samples_filtered", self.samples_filtered.get()),
            ],
        )
    }
}

/// Control-message handler of one gateway process
#[derive(Debug)]
pub struct GatewayAgent {
    barrier: Arc<BarrierController>,
    version: SharedVersion,
    pause_wait: Duration,
    stats: Arc<GatewayStats>,
}

impl GatewayAgent {
    /// Build the agent and its barrier, starting at `initial`
    pub fn new(config: &SyncConfig, initial: ModelVersion) -> Self {
        let version = VersionCounter::shared(initial);
        let barrier = Arc::new(BarrierController::new(
            config.sync_trigger_mode,
            config.quorum_ratio,
            config.worker_pause_limit,
            Arc::clone(&version),
        ));
        Self {
            barrier,
            version,
            // answer inside the trainer's phase window
            pause_wait: config.per_phase_timeout.mul_f64(0.75),
            stats: Arc::new(GatewayStats::default()),
        }
    }

    /// Barrier shared with the episode workers
    pub fn barrier(&self) -> &Arc<BarrierController> {
        &self.barrier
    }

    /// Adopted model version
    pub fn version(&self) -> ModelVersion {
        self.version.current()
    }

    /// Filter for outgoing training samples
    pub fn sample_filter(&self) -> SampleFilter {
        SampleFilter::new(Arc::clone(&self.version), Arc::clone(&self.stats))
    }

    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    pub fn metrics(&self) -> Vec<Observation> {
        self.stats.observations()
    }

    async fn on_version_change(&self, version: ModelVersion) -> SyncMessage {
        let current = self.version.current();
        if version <= current {
            tracing::warn!(%version, %current, "ignoring version change to a version not newer than ours");
            return SyncMessage::VersionChangeResponse {
                version,
                success: false,
            };
        }

        self.barrier.arm();
        let success = self.barrier.wait_for_quorum(self.pause_wait).await;
        if success {
            self.stats.pause_quorum_success.inc();
            tracing::info!(%version, "workers paused, ready to switch");
        } else {
            self.stats.pause_quorum_failure.inc();
            let released = self.barrier.resume_all();
            tracing::warn!(%version, released, "pause quorum not reached, resuming workers");
        }
        SyncMessage::VersionChangeResponse { version, success }
    }

    fn on_round_end(&self, version: ModelVersion, committed: bool) {
        if committed && self.version.advance_to(version) {
            self.stats.version_adopted.inc();
            tracing::info!(%version, "adopted model version");
        }
        let released = self.barrier.resume_all();
        tracing::debug!(%version, committed, released, "round ended");
    }
}

#[async_trait]
impl ControlHandler for GatewayAgent {
    fn role(&self) -> Role {
        Role::Gateway
    }

    async fn handle(&self, message: SyncMessage) -> Option<SyncMessage> {
        match message {
            SyncMessage::HeartbeatRequest => Some(SyncMessage::HeartbeatResponse {
                round_pending: self.barrier.round_pending(),
            }),
            SyncMessage::VersionChangeRequest { version } => {
                Some(self.on_version_change(version).await)
            }
            SyncMessage::RoundEnd { version, committed } => {
                self.on_round_end(version, committed);
                None
            }
            other => {
                tracing::error!(kind = other.message_type().as_str(), "unexpected message at gateway");
                None
            }
        }
    }
}
