//! Trainer-side round driver.
//!
//! ```text
//! idle -> training -> publishing -> notifying-predictors -> notifying-gateways
//!      -> awaiting-resume-ack -> idle
//!                 \_________________ aborting -> idle
//! ```
//!
//! The coordinator owns the model version. It only advances after every
//! notify phase met quorum; any failure ends the round with
//! `RoundEnd { committed: false }` and everyone stays on the previous version.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;

use policy_sync_core::config::{SyncConfig, TriggerMode};
use policy_sync_core::metrics::{observe_all, Counter, MetricSource, Observation};
use policy_sync_core::quorum::quorum_met;
use policy_sync_core::round::{AckState, CoordinatorState, RoundId, SyncRound};
use policy_sync_core::traits::{ParticipantId, Role};
use policy_sync_core::version::ModelVersion;
use policy_sync_net::protocol::SyncMessage;
use policy_sync_net::traits::Connector;

use super::discovery::Discovery;
use super::registry::{Health, ParticipantRegistry, Reply};
use super::train::{TrainError, Trainer};
use crate::retry::RetryPolicy;
use crate::store::{ArtifactKey, ModelStore, StoreError};

/// Why a round was abandoned
#[derive(Debug, thiserror::Error)]
pub enum RoundError {
    #[error(transparent)]
    Train(#[from] TrainError),
    #[error("publish failed: {0}")]
    Publish(#[from] StoreError),
    #[error("{role} quorum not met: {acked}/{total} acknowledged")]
    QuorumNotMet {
        role: Role,
        acked: usize,
        total: usize,
    },
    #[error("round deadline passed while {phase}")]
    DeadlineExceeded { phase: &'static str },
}

/// How a round ended
#[derive(Debug)]
pub enum RoundOutcome {
    /// Every phase met quorum; the version advanced
    Committed { version: ModelVersion },
    /// The trainer had nothing to train on
    Skipped,
    /// Nothing changed anywhere
    Aborted { reason: RoundError },
}

impl RoundOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, RoundOutcome::Committed { .. })
    }
}

/// Liveness result of one heartbeat sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatSummary {
    pub predictors_alive: usize,
    pub gateways_alive: usize,
    /// Gateways reporting a paused quorum at a boundary
    pub gateways_pending: usize,
    pub failed: usize,
}

/// Coordinator counters
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    pub round_success: Counter,
    pub round_abort: Counter,
    pub round_skipped: Counter,
    pub publish_failure: Counter,
    pub predictor_ack_failure: Counter,
    pub gateway_ack_failure: Counter,
    pub participant_unreachable: Counter,
}

impl MetricSource for CoordinatorStats {
    fn observations(&self) -> Vec<Observation> {
        observe_all(
            "coordinator",
            [
                ("round_success", self.round_success.get()),
                ("round_abort", self.round_abort.get()),
                ("round_skipped", self.round_skipped.get()),
                ("publish_failure", self.publish_failure.get()),
                ("predictor_ack_failure", self.predictor_ack_failure.get()),
                ("gateway_ack_failure", self.gateway_ack_failure.get()),
                ("participant_unreachable", self.participant_unreachable.get()),
            ],
        )
    }
}

/// Synchronization leader of one training job
pub struct Coordinator {
    config: SyncConfig,
    trainer: Box<dyn Trainer>,
    store: Arc<dyn ModelStore>,
    connector: Arc<dyn Connector>,
    discovery: Arc<dyn Discovery>,
    registry: ParticipantRegistry,
    retry: RetryPolicy,
    version: ModelVersion,
    state: CoordinatorState,
    next_round: RoundId,
    last_round_at: Instant,
    stats: CoordinatorStats,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("version", &self.version)
            .field("state", &self.state)
            .field("next_round", &self.next_round)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn new(
        config: SyncConfig,
        trainer: Box<dyn Trainer>,
        store: Arc<dyn ModelStore>,
        connector: Arc<dyn Connector>,
        discovery: Arc<dyn Discovery>,
        initial: ModelVersion,
    ) -> policy_sync_core::Result<Self> {
        config.validate()?;
        Ok(Self {
            registry: ParticipantRegistry::new(config.max_retry_attempts),
            retry: RetryPolicy::from_config(&config),
            config,
            trainer,
            store,
            connector,
            discovery,
            version: initial,
            state: CoordinatorState::Idle,
            next_round: RoundId(1),
            last_round_at: Instant::now(),
            stats: CoordinatorStats::default(),
        })
    }

    /// Committed model version
    pub fn version(&self) -> ModelVersion {
        self.version
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    pub fn stats(&self) -> &CoordinatorStats {
        &self.stats
    }

    pub fn metrics(&self) -> Vec<Observation> {
        let mut out = self.stats.observations();
        out.push(Observation::new("coordinator.version", self.version.get() as f64));
        out.push(Observation::new(
            "coordinator.participants",
            self.registry.len() as f64,
        ));
        out
    }

    fn enter(&mut self, state: CoordinatorState) {
        tracing::debug!(from = self.state.as_str(), to = state.as_str(), "state transition");
        self.state = state;
    }

    /// Connect to discovered endpoints that are not registered yet
    pub async fn refresh_participants(&mut self) -> usize {
        let mut added = 0;
        for (role, endpoint) in self.discovery.discover().await {
            if self.registry.contains_endpoint(&endpoint) {
                continue;
            }
            match self.connector.connect(&endpoint).await {
                Ok(channel) => {
                    self.registry.add(role, endpoint, channel);
                    added += 1;
                }
                Err(e) => {
                    tracing::debug!(%role, %endpoint, error = %e, "discovered endpoint not reachable yet");
                }
            }
        }
        added
    }

    fn note_unreachable(&mut self, id: ParticipantId) {
        self.stats.participant_unreachable.inc();
        if let Some(Health::Unhealthy {
            consecutive_failures,
        }) = self.registry.record_failure(id)
        {
            tracing::info!(participant = %id, consecutive_failures, "participant unhealthy");
        }
    }

    /// Heartbeat every participant once
    pub async fn heartbeat_all(&mut self) -> HeartbeatSummary {
        let ids = self.registry.ids();
        let deadline = Instant::now() + self.config.heartbeat_timeout;
        let replies = self
            .registry
            .exchange(&*self.connector, &ids, SyncMessage::HeartbeatRequest, 0, deadline)
            .await;

        let mut summary = HeartbeatSummary::default();
        for (id, reply) in replies {
            let Some(role) = self.registry.get(id).map(|p| p.role) else {
                continue;
            };
            match reply {
                Reply::Answered(SyncMessage::HeartbeatResponse { round_pending }) => {
                    self.registry.record_success(id);
                    match role {
                        Role::Predictor => summary.predictors_alive += 1,
                        Role::Gateway => {
                            summary.gateways_alive += 1;
                            if round_pending {
                                summary.gateways_pending += 1;
                            }
                        }
                    }
                }
                Reply::Answered(other) => {
                    tracing::warn!(participant = %id, kind = other.message_type().as_str(), "unexpected heartbeat reply");
                    summary.failed += 1;
                    self.note_unreachable(id);
                }
                Reply::TimedOut | Reply::Unreachable => {
                    summary.failed += 1;
                    self.note_unreachable(id);
                }
            }
        }
        summary
    }

    /// Whether a round should start now
    pub fn trigger_due(&self, summary: &HeartbeatSummary) -> bool {
        match self.config.sync_trigger_mode {
            TriggerMode::Interval => self.last_round_at.elapsed() >= self.config.sync_interval,
            TriggerMode::EpisodeBoundary | TriggerMode::StepBoundary => {
                summary.gateways_pending > 0
                    && quorum_met(
                        summary.gateways_pending,
                        summary.gateways_alive,
                        self.config.quorum_ratio.get(),
                    )
            }
        }
    }

    /// Drive one round to commit, skip or abort
    #[tracing::instrument(skip_all, fields(round = %self.next_round, from = %self.version))]
    pub async fn run_round(&mut self) -> RoundOutcome {
        let id = self.next_round;
        self.next_round = id.next();
        let previous = self.version;
        let target = previous.next();
        self.last_round_at = Instant::now();

        self.enter(CoordinatorState::Training);
        let artifact = match self.trainer.train_step(target).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return self.skip(id).await,
            Err(e) => return self.abort(id, previous, e.into()).await,
        };

        let mut round = SyncRound::new(
            id,
            previous,
            target,
            self.config.round_deadline,
            self.registry.snapshot(),
        );

        self.enter(CoordinatorState::Publishing);
        let key = ArtifactKey::new(self.config.model_name.clone(), target);
        let store = &self.store;
        let published = self
            .retry
            .run("publish", Some(round.deadline), |_| store.publish(&key, &artifact))
            .await;
        match published {
            Ok(checksum) => tracing::info!(%key, %checksum, bytes = artifact.len(), "artifact published"),
            Err(e) => {
                self.stats.publish_failure.inc();
                return self.abort(id, previous, e.into()).await;
            }
        }

        self.enter(CoordinatorState::NotifyingPredictors);
        if let Err(reason) = self.notify(&mut round, Role::Predictor).await {
            return self.abort(id, previous, reason).await;
        }

        self.enter(CoordinatorState::NotifyingGateways);
        if let Err(reason) = self.notify(&mut round, Role::Gateway).await {
            return self.abort(id, previous, reason).await;
        }

        self.enter(CoordinatorState::AwaitingResumeAck);
        self.version = target;
        self.end_round(id, target, true, &Role::ALL).await;
        self.stats.round_success.inc();
        tracing::info!(version = %target, "round committed");
        self.enter(CoordinatorState::Idle);
        RoundOutcome::Committed { version: target }
    }

    /// Broadcast a version change to one role and record the answers
    async fn notify(&mut self, round: &mut SyncRound, role: Role) -> Result<(), RoundError> {
        let ids: Vec<ParticipantId> = round.participants(role).collect();
        let deadline = round.phase_deadline(self.config.per_phase_timeout);
        let request = SyncMessage::VersionChangeRequest {
            version: round.target,
        };
        let replies = self
            .registry
            .exchange(&*self.connector, &ids, request, round.id.0, deadline)
            .await;

        for (id, reply) in replies {
            let state = match reply {
                Reply::Answered(SyncMessage::VersionChangeResponse { version, success })
                    if version == round.target =>
                {
                    if success {
                        self.registry.record_success(id);
                        AckState::Acked
                    } else {
                        AckState::Failed
                    }
                }
                Reply::Answered(_) | Reply::TimedOut => AckState::Failed,
                Reply::Unreachable => {
                    self.note_unreachable(id);
                    AckState::Unreachable
                }
            };
            if state == AckState::Failed {
                match role {
                    Role::Predictor => self.stats.predictor_ack_failure.inc(),
                    Role::Gateway => self.stats.gateway_ack_failure.inc(),
                }
            }
            round.record(id, state);
        }
        round.expire_pending(role);

        let tally = round.tally(role);
        tracing::info!(
            %role,
            acked = tally.acked,
            failed = tally.failed,
            unreachable = tally.unreachable,
            total = tally.total,
            "phase finished"
        );
        if tally.is_met(self.config.quorum_ratio) {
            return Ok(());
        }
        if round.is_expired() {
            return Err(RoundError::DeadlineExceeded {
                phase: match role {
                    Role::Predictor => CoordinatorState::NotifyingPredictors.as_str(),
                    Role::Gateway => CoordinatorState::NotifyingGateways.as_str(),
                },
            });
        }
        Err(RoundError::QuorumNotMet {
            role,
            acked: tally.acked,
            total: tally.total,
        })
    }

    /// Fire-and-forget round end to every participant with one of `roles`
    async fn end_round(&mut self, id: RoundId, version: ModelVersion, committed: bool, roles: &[Role]) {
        let ids: Vec<ParticipantId> = self
            .registry
            .iter()
            .filter(|p| roles.contains(&p.role))
            .map(|p| p.id)
            .collect();
        let unreachable = self
            .registry
            .broadcast(
                &*self.connector,
                &ids,
                SyncMessage::RoundEnd { version, committed },
                id.0,
            )
            .await;
        for id in unreachable {
            self.note_unreachable(id);
        }
    }

    async fn skip(&mut self, id: RoundId) -> RoundOutcome {
        tracing::info!("nothing to train on, releasing gateways");
        // workers parked at a boundary still need their resume
        self.end_round(id, self.version, false, &[Role::Gateway]).await;
        self.stats.round_skipped.inc();
        self.enter(CoordinatorState::Idle);
        RoundOutcome::Skipped
    }

    async fn abort(&mut self, id: RoundId, previous: ModelVersion, reason: RoundError) -> RoundOutcome {
        self.enter(CoordinatorState::Aborting);
        tracing::warn!(error = %reason, version = %previous, "round aborted");
        self.stats.round_abort.inc();
        self.end_round(id, previous, false, &Role::ALL).await;
        self.enter(CoordinatorState::Idle);
        RoundOutcome::Aborted { reason }
    }

    /// Heartbeat, rediscover and run rounds until `shutdown` turns true or its sender is dropped
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            mode = ?self.config.sync_trigger_mode,
            version = %self.version,
            "coordinator started"
        );
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            self.refresh_participants().await;
            let summary = self.heartbeat_all().await;
            if self.trigger_due(&summary) {
                let outcome = self.run_round().await;
                tracing::debug!(?outcome, "round finished");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!(version = %self.version, "coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryModelStore;
    use crate::trainer::discovery::StaticDiscovery;
    use policy_sync_core::config::RetryBackoff;
    use policy_sync_net::memory::MemoryNetwork;
    use std::time::Duration;

    fn config() -> SyncConfig {
        SyncConfig::builder()
            .per_phase_timeout(Duration::from_millis(100))
            .retry(
                2,
                RetryBackoff::Fixed {
                    delay: Duration::from_millis(1),
                },
            )
            .build()
            .unwrap()
    }

    fn trainer<F>(f: F) -> Box<dyn Trainer>
    where
        F: FnMut(ModelVersion) -> Result<Option<Vec<u8>>, TrainError> + Send + 'static,
    {
        Box::new(f)
    }

    fn coordinator(trainer: Box<dyn Trainer>, store: Arc<dyn ModelStore>) -> Coordinator {
        Coordinator::new(
            config(),
            trainer,
            store,
            Arc::new(MemoryNetwork::new()),
            Arc::new(StaticDiscovery::default()),
            ModelVersion(1),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn empty_job_commits_and_publishes() {
        let store = Arc::new(MemoryModelStore::new());
        let mut c = coordinator(
            trainer(|v| Ok(Some(format!("weights-{v}").into_bytes()))),
            store.clone(),
        );
        let outcome = c.run_round().await;
        assert!(outcome.is_committed());
        assert_eq!(c.version(), ModelVersion(2));
        assert_eq!(c.state(), CoordinatorState::Idle);
        let bytes = store
            .fetch(&ArtifactKey::new("policy", ModelVersion(2)))
            .await
            .unwrap();
        assert_eq!(bytes, b"weights-v2");
    }

    #[tokio::test]
    async fn nothing_to_train_skips_without_version_change() {
        let store = Arc::new(MemoryModelStore::new());
        let mut c = coordinator(trainer(|_| Ok(None)), store.clone());
        assert!(matches!(c.run_round().await, RoundOutcome::Skipped));
        assert_eq!(c.version(), ModelVersion(1));
        assert!(store.is_empty());
        assert_eq!(c.stats().round_skipped.get(), 1);
    }

    #[tokio::test]
    async fn training_failure_aborts() {
        let mut c = coordinator(
            trainer(|_| Err(TrainError("diverged".into()))),
            Arc::new(MemoryModelStore::new()),
        );
        let outcome = c.run_round().await;
        assert!(matches!(
            outcome,
            RoundOutcome::Aborted {
                reason: RoundError::Train(_)
            }
        ));
        assert_eq!(c.version(), ModelVersion(1));
        assert_eq!(c.stats().round_abort.get(), 1);
    }

    #[tokio::test]
    async fn interval_trigger_waits_for_the_interval() {
        let mut cfg = config();
        cfg.sync_interval = Duration::from_secs(3600);
        let c = Coordinator::new(
            cfg,
            trainer(|_| Ok(None)),
            Arc::new(MemoryModelStore::new()),
            Arc::new(MemoryNetwork::new()),
            Arc::new(StaticDiscovery::default()),
            ModelVersion(1),
        )
        .unwrap();
        assert!(!c.trigger_due(&HeartbeatSummary::default()));
    }

    #[test]
    fn boundary_trigger_needs_gateway_quorum() {
        let mut cfg = config();
        cfg.sync_trigger_mode = TriggerMode::EpisodeBoundary;
        let c = Coordinator::new(
            cfg,
            trainer(|_| Ok(None)),
            Arc::new(MemoryModelStore::new()),
            Arc::new(MemoryNetwork::new()),
            Arc::new(StaticDiscovery::default()),
            ModelVersion(1),
        )
        .unwrap();
        let summary = |pending, alive| HeartbeatSummary {
            gateways_alive: alive,
            gateways_pending: pending,
            ..HeartbeatSummary::default()
        };
        assert!(!c.trigger_due(&summary(0, 0)));
        assert!(!c.trigger_due(&summary(8, 10)));
        assert!(c.trigger_due(&summary(9, 10)));
    }
}
