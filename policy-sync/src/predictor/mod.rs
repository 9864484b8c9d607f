//! Predictor side: batched inference serving plus the protocol participant.

mod agent;
mod inference;
mod model;
mod pipeline;

pub use agent::{PredictorAgent, PredictorStats};
pub use inference::{serve_inference, serve_inference_channel, ResponseRouter};
pub use model::{
    builtin_models, model_from_config, EchoModel, InferenceModel, ModelError, Prediction,
};
pub use pipeline::{
    EgressFrame, InboundRequest, Ingress, PipelineError, PipelineHandle, PipelineStats,
    ResponseSink, ServingPipeline,
};
