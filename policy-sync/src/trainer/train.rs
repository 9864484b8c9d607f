//! Training step collaborator.

use async_trait::async_trait;

use policy_sync_core::version::ModelVersion;

/// Training step failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("training step failed: {0}")]
pub struct TrainError(pub String);

/// Produces the artifact for the next version
#[async_trait]
pub trait Trainer: Send {
    /// Run one training step toward `next`.
    ///
    /// `Ok(None)` means there was nothing to train on (not enough samples).
    async fn train_step(&mut self, next: ModelVersion) -> Result<Option<Vec<u8>>, TrainError>;
}

#[async_trait]
impl<F> Trainer for F
where
    F: FnMut(ModelVersion) -> Result<Option<Vec<u8>>, TrainError> + Send,
{
    async fn train_step(&mut self, next: ModelVersion) -> Result<Option<Vec<u8>>, TrainError> {
        self(next)
    }
}
