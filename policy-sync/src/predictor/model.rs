//! Inference collaborator seen by the serving pipeline.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use policy_sync_core::config::NodeConfig;
use policy_sync_core::item::{QueueItem, RequestKey};
use policy_sync_core::plugin::PluginRegistry;
use policy_sync_core::version::ModelVersion;

/// Failure reported by an inference model
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("model error: {0}")]
pub struct ModelError(pub String);

/// One model output, keyed like the request it answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prediction {
    pub key: RequestKey,
    pub payload: Vec<u8>,
}

/// The numerical model behind a predictor.
///
/// `predict` may return results in any order and may omit items it could not
/// answer; the pipeline correlates by key.
#[async_trait]
pub trait InferenceModel: Send + Sync {
    /// Run one batch
    async fn predict(&self, batch: &[QueueItem]) -> Result<Vec<Prediction>, ModelError>;

    /// Check a fetched artifact before it is staged
    fn validate(&self, _artifact: &[u8]) -> Result<(), ModelError> {
        Ok(())
    }

    /// Swap in the weights of a committed version
    async fn load(&self, version: ModelVersion, artifact: &[u8]) -> Result<(), ModelError>;
}

/// Returns every request payload unchanged
#[derive(Debug, Default)]
pub struct EchoModel {
    delay: Duration,
    loaded: Mutex<Option<(ModelVersion, usize)>>,
}

impl EchoModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long per batch
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Last loaded version and artifact size
    pub fn loaded(&self) -> Option<(ModelVersion, usize)> {
        *self.loaded.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl InferenceModel for EchoModel {
    async fn predict(&self, batch: &[QueueItem]) -> Result<Vec<Prediction>, ModelError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(batch
            .iter()
            .map(|item| Prediction {
                key: item.key,
                payload: item.payload.clone(),
            })
            .collect())
    }

    fn validate(&self, artifact: &[u8]) -> Result<(), ModelError> {
        if artifact.is_empty() {
            return Err(ModelError("empty artifact".to_string()));
        }
        Ok(())
    }

    async fn load(&self, version: ModelVersion, artifact: &[u8]) -> Result<(), ModelError> {
        *self.loaded.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((version, artifact.len()));
        Ok(())
    }
}

/// Registry with the built-in inference models.
///
/// `echo` accepts an optional `delay_ms` integer parameter.
pub fn builtin_models() -> PluginRegistry<dyn InferenceModel> {
    let mut registry = PluginRegistry::new("inference-model");
    registry.register("echo", |params| {
        let delay_ms = match params.get("delay_ms") {
            None => 0,
            Some(v) => v.as_u64().ok_or_else(|| {
                policy_sync_core::Error::InvalidConfig("delay_ms must be an integer".to_string())
            })?,
        };
        let model: Box<dyn InferenceModel> =
            Box::new(EchoModel::with_delay(Duration::from_millis(delay_ms)));
        Ok(model)
    });
    registry
}

/// Instantiate the inference plugin named by `config.model_plugin`
pub fn model_from_config(config: &NodeConfig) -> policy_sync_core::Result<Arc<dyn InferenceModel>> {
    builtin_models()
        .build(&config.model_plugin, &config.model_params)
        .map(Arc::from)
}
