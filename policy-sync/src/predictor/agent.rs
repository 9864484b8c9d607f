//! Predictor participant.
//!
//! A version-change request fetches and validates the new artifact and keeps
//! it staged. Nothing changes for the serving pipeline until the trainer's
//! `RoundEnd` says the round committed; an aborted round discards the staged
//! artifact and the predictor keeps serving what it had. A committed round
//! this predictor never staged (it restarted or lagged) is fetched on the spot.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use policy_sync_core::config::SyncConfig;
use policy_sync_core::metrics::{observe_all, Counter, MetricSource, Observation};
use policy_sync_core::traits::Role;
use policy_sync_core::version::{ModelVersion, SharedVersion, VersionCounter};
use policy_sync_net::protocol::SyncMessage;

use super::model::InferenceModel;
use crate::retry::RetryPolicy;
use crate::serve::ControlHandler;
use crate::store::{ArtifactKey, ModelStore, StoreError};

/// Predictor counters
#[derive(Debug, Default)]
pub struct PredictorStats {
    pub fetch_success: Counter,
    pub fetch_failure: Counter,
    pub version_activated: Counter,
}

impl MetricSource for PredictorStats {
    fn observations(&self) -> Vec<Observation> {
        observe_all(
            "predictor",
            [
                ("fetch_success", self.fetch_success.get()),
                ("fetch_failure", self.fetch_failure.get()),
                ("version_activated", self.version_activated.get()),
            ],
        )
    }
}

#[derive(Debug, thiserror::Error)]
enum StageError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Model(#[from] super::model::ModelError),
}

/// Control-message handler of one predictor process
pub struct PredictorAgent {
    store: Arc<dyn ModelStore>,
    model: Arc<dyn InferenceModel>,
    version: SharedVersion,
    model_name: String,
    fetch_window: Duration,
    retry: RetryPolicy,
    staged: Mutex<Option<(ModelVersion, Vec<u8>)>>,
    stats: PredictorStats,
}

impl std::fmt::Debug for PredictorAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictorAgent")
            .field("version", &self.version.current())
            .field("staged", &self.staged_version())
            .field("model_name", &self.model_name)
            .finish_non_exhaustive()
    }
}

impl PredictorAgent {
    pub fn new(
        config: &SyncConfig,
        store: Arc<dyn ModelStore>,
        model: Arc<dyn InferenceModel>,
        initial: ModelVersion,
    ) -> Self {
        Self {
            store,
            model,
            version: VersionCounter::shared(initial),
            model_name: config.model_name.clone(),
            // answer inside the trainer's phase window
            fetch_window: config.per_phase_timeout.mul_f64(0.75),
            retry: RetryPolicy::from_config(config),
            staged: Mutex::new(None),
            stats: PredictorStats::default(),
        }
    }

    /// Active version
    pub fn version(&self) -> ModelVersion {
        self.version.current()
    }

    /// Active version shared with the serving pipeline
    pub fn shared_version(&self) -> SharedVersion {
        Arc::clone(&self.version)
    }

    /// Version fetched for the current round but not yet active
    pub fn staged_version(&self) -> Option<ModelVersion> {
        self.staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(v, _)| *v)
    }

    pub fn stats(&self) -> &PredictorStats {
        &self.stats
    }

    pub fn metrics(&self) -> Vec<Observation> {
        self.stats.observations()
    }

    async fn fetch_and_validate(&self, version: ModelVersion) -> Result<Vec<u8>, StageError> {
        let key = ArtifactKey::new(self.model_name.clone(), version);
        let deadline = Instant::now() + self.fetch_window;
        let store = &self.store;
        let bytes = self
            .retry
            .run("fetch", Some(deadline), |_| store.fetch(&key))
            .await?;
        self.model.validate(&bytes)?;
        Ok(bytes)
    }

    async fn on_version_change(&self, version: ModelVersion) -> SyncMessage {
        let current = self.version.current();
        if version <= current || self.staged_version() == Some(version) {
            return SyncMessage::VersionChangeResponse {
                version,
                success: true,
            };
        }

        let success = match self.fetch_and_validate(version).await {
            Ok(bytes) => {
                self.stats.fetch_success.inc();
                tracing::info!(%version, bytes = bytes.len(), "artifact staged");
                *self.staged.lock().unwrap_or_else(PoisonError::into_inner) = Some((version, bytes));
                true
            }
            Err(e) => {
                self.stats.fetch_failure.inc();
                tracing::warn!(%version, error = %e, "could not stage artifact");
                false
            }
        };
        SyncMessage::VersionChangeResponse { version, success }
    }

    async fn on_round_end(&self, version: ModelVersion, committed: bool) {
        let staged = self
            .staged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if !committed {
            if let Some((v, _)) = staged {
                tracing::info!(staged = %v, "round aborted, discarding staged artifact");
            }
            return;
        }

        let bytes = match staged {
            Some((v, bytes)) if v == version => bytes,
            _ if version > self.version.current() => {
                // restarted or lagging: rejoin on the committed version
                tracing::info!(%version, "round committed without us, fetching it now");
                match self.fetch_and_validate(version).await {
                    Ok(bytes) => {
                        self.stats.fetch_success.inc();
                        bytes
                    }
                    Err(e) => {
                        self.stats.fetch_failure.inc();
                        tracing::warn!(%version, error = %e, "catch-up fetch failed; staying behind");
                        return;
                    }
                }
            }
            _ => return,
        };
        self.activate(version, &bytes).await;
    }

    async fn activate(&self, version: ModelVersion, bytes: &[u8]) {
        match self.model.load(version, bytes).await {
            Ok(()) => {
                if self.version.advance_to(version) {
                    self.stats.version_activated.inc();
                    tracing::info!(%version, "activated model version");
                }
            }
            Err(e) => tracing::error!(%version, error = %e, "failed to load committed artifact"),
        }
    }
}

#[async_trait]
impl ControlHandler for PredictorAgent {
    fn role(&self) -> Role {
        Role::Predictor
    }

    async fn handle(&self, message: SyncMessage) -> Option<SyncMessage> {
        match message {
            SyncMessage::HeartbeatRequest => Some(SyncMessage::HeartbeatResponse {
                round_pending: false,
            }),
            SyncMessage::VersionChangeRequest { version } => {
                Some(self.on_version_change(version).await)
            }
            SyncMessage::RoundEnd { version, committed } => {
                self.on_round_end(version, committed).await;
                None
            }
            other => {
                tracing::error!(kind = other.message_type().as_str(), "unexpected message at predictor");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::model::EchoModel;
    use crate::store::MemoryModelStore;
    use policy_sync_core::config::RetryBackoff;

    fn config() -> SyncConfig {
        SyncConfig::builder()
            .retry(
                2,
                RetryBackoff::Fixed {
                    delay: Duration::from_millis(10),
                },
            )
            .build()
            .unwrap()
    }

    async fn store_with(version: i64) -> Arc<MemoryModelStore> {
        let store = Arc::new(MemoryModelStore::new());
        store
            .publish(&ArtifactKey::new("policy", ModelVersion(version)), b"weights")
            .await
            .unwrap();
        store
    }

    fn change(v: i64) -> SyncMessage {
        SyncMessage::VersionChangeRequest {
            version: ModelVersion(v),
        }
    }

    fn response(v: i64, success: bool) -> Option<SyncMessage> {
        Some(SyncMessage::VersionChangeResponse {
            version: ModelVersion(v),
            success,
        })
    }

    #[tokio::test]
    async fn stages_then_activates_on_commit() {
        let model = Arc::new(EchoModel::new());
        let agent = PredictorAgent::new(&config(), store_with(2).await, model.clone(), ModelVersion(1));

        assert_eq!(agent.handle(change(2)).await, response(2, true));
        assert_eq!(agent.version(), ModelVersion(1));
        assert_eq!(agent.staged_version(), Some(ModelVersion(2)));

        agent
            .handle(SyncMessage::RoundEnd {
                version: ModelVersion(2),
                committed: true,
            })
            .await;
        assert_eq!(agent.version(), ModelVersion(2));
        assert_eq!(agent.staged_version(), None);
        assert_eq!(model.loaded(), Some((ModelVersion(2), 7)));
    }

    #[tokio::test]
    async fn aborted_round_discards_staged_artifact() {
        let model = Arc::new(EchoModel::new());
        let agent = PredictorAgent::new(&config(), store_with(2).await, model.clone(), ModelVersion(1));
        agent.handle(change(2)).await;
        agent
            .handle(SyncMessage::RoundEnd {
                version: ModelVersion(1),
                committed: false,
            })
            .await;
        assert_eq!(agent.version(), ModelVersion(1));
        assert_eq!(agent.staged_version(), None);
        assert_eq!(model.loaded(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_artifact_fails_after_retries() {
        let agent = PredictorAgent::new(
            &config(),
            Arc::new(MemoryModelStore::new()),
            Arc::new(EchoModel::new()),
            ModelVersion(1),
        );
        assert_eq!(agent.handle(change(2)).await, response(2, false));
        assert_eq!(agent.stats().fetch_failure.get(), 1);
        assert_eq!(agent.staged_version(), None);
    }

    #[tokio::test]
    async fn corrupt_artifact_is_refused() {
        let store = store_with(2).await;
        store.corrupt(&ArtifactKey::new("policy", ModelVersion(2)), b"tampered".to_vec());
        let agent = PredictorAgent::new(&config(), store, Arc::new(EchoModel::new()), ModelVersion(1));
        assert_eq!(agent.handle(change(2)).await, response(2, false));
    }

    #[tokio::test]
    async fn old_version_request_is_acknowledged_without_fetching() {
        let agent = PredictorAgent::new(
            &config(),
            Arc::new(MemoryModelStore::new()),
            Arc::new(EchoModel::new()),
            ModelVersion(5),
        );
        assert_eq!(agent.handle(change(5)).await, response(5, true));
        assert_eq!(agent.stats().fetch_success.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn commit_for_missing_artifact_keeps_current() {
        let agent = PredictorAgent::new(
            &config(),
            Arc::new(MemoryModelStore::new()),
            Arc::new(EchoModel::new()),
            ModelVersion(1),
        );
        agent
            .handle(SyncMessage::RoundEnd {
                version: ModelVersion(2),
                committed: true,
            })
            .await;
        assert_eq!(agent.version(), ModelVersion(1));
        assert_eq!(agent.stats().fetch_failure.get(), 1);
    }

    #[tokio::test]
    async fn restarted_predictor_rejoins_on_committed_version() {
        let model = Arc::new(EchoModel::new());
        let agent = PredictorAgent::new(&config(), store_with(3).await, model.clone(), ModelVersion(1));
        agent
            .handle(SyncMessage::RoundEnd {
                version: ModelVersion(3),
                committed: true,
            })
            .await;
        assert_eq!(agent.version(), ModelVersion(3));
        assert_eq!(model.loaded(), Some((ModelVersion(3), 7)));
        assert_eq!(agent.stats().version_activated.get(), 1);
    }

    #[tokio::test]
    async fn commit_of_older_version_is_ignored() {
        let agent = PredictorAgent::new(
            &config(),
            Arc::new(MemoryModelStore::new()),
            Arc::new(EchoModel::new()),
            ModelVersion(4),
        );
        agent
            .handle(SyncMessage::RoundEnd {
                version: ModelVersion(3),
                committed: true,
            })
            .await;
        assert_eq!(agent.version(), ModelVersion(4));
        assert_eq!(agent.stats().fetch_failure.get(), 0);
    }
}
