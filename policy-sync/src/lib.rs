//! # Policy Sync
//!
//! **Rolling model-version synchronization for on-policy reinforcement learning.**
//!
//! A training job has three long-lived roles. Gateways run one worker per live
//! episode, predictors serve batched inference to those workers, and the
//! trainer updates the model. The trainer drives each rollout as a round:
//! train, publish the artifact, have predictors fetch it, have gateways park
//! their workers at a safe point, then commit. A round either reaches quorum
//! at every step or is abandoned, so samples can always be attributed to a
//! single known model version.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use policy_sync::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = NodeConfig::from_json_str(&std::fs::read_to_string("job.json")?)?;
//!     let mut coordinator = Coordinator::new(
//!         config.sync.clone(),
//!         Box::new(my_trainer),
//!         Arc::new(FsModelStore::new("/var/lib/policy-sync")),
//!         Arc::new(TcpConnector::default()),
//!         Arc::new(StaticDiscovery::from_config(&config.endpoints)),
//!         ModelVersion::INITIAL,
//!     )?;
//!     let (_stop, shutdown) = tokio::sync::watch::channel(false);
//!     coordinator.run(shutdown).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! - `tcp-transport` (default): TCP channels in [`policy_sync_net::tcp`]
//!
//! ## Crate Structure
//!
//! - [`policy_sync_core`]: versions, quorum arithmetic, bounded queue, config, metrics
//! - [`policy_sync_net`]: wire protocol and channel transports
//! - this crate: model store, gateway barrier, predictor pipeline, trainer coordinator

#![forbid(unsafe_code)]

// Re-export sub-crates
pub use policy_sync_core as core;
pub use policy_sync_net as net;

// Re-export commonly used items at the top level
pub use policy_sync_core::{
    config::{NodeConfig, PipelineConfig, SyncConfig, TriggerMode},
    quorum::QuorumRatio,
    version::ModelVersion,
    Error, Result,
};

pub mod gateway;
pub mod predictor;
pub mod retry;
pub mod serve;
pub mod store;
pub mod trainer;

pub use predictor::PipelineError;
pub use store::StoreError;
pub use trainer::RoundError;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::gateway::{BarrierController, Checkpoint, GatewayAgent, SafePoint, WorkerHandle};
    pub use crate::predictor::{
        builtin_models, model_from_config, serve_inference, InboundRequest, InferenceModel,
        PredictorAgent, ResponseRouter, ResponseSink, ServingPipeline,
    };
    pub use crate::serve::{serve_participant, ControlHandler};
    pub use crate::store::{ArtifactKey, FsModelStore, MemoryModelStore, ModelStore};
    pub use crate::trainer::{Coordinator, RoundOutcome, StaticDiscovery, Trainer};
    pub use policy_sync_core::prelude::*;
    pub use policy_sync_net::prelude::*;
    pub use policy_sync_net::MemoryNetwork;

    #[cfg(feature = "tcp-transport")]
    pub use policy_sync_net::tcp::{TcpChannelListener, TcpConnector};
}
