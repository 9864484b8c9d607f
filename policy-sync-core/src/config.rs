//! Configuration structs
//!
//! Every component receives its configuration at construction. Durations are
//! serialized as integer milliseconds (`*_ms` keys).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compression::CompressionMethod;
use crate::quorum::QuorumRatio;
use crate::{Error, Result};

/// Serde adapter storing a [`Duration`] as whole milliseconds
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// What starts a synchronization round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerMode {
    /// The trainer starts a round every `sync_interval`
    #[default]
    Interval,
    /// Workers pause at episode ends; gateways ask for a round via heartbeat
    EpisodeBoundary,
    /// Workers pause after every step; gateways ask for a round via heartbeat
    StepBoundary,
}

impl TriggerMode {
    /// Whether gateways drive round starts
    pub fn is_boundary(self) -> bool {
        !matches!(self, TriggerMode::Interval)
    }
}

/// Delay between retry attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RetryBackoff {
    /// Same delay before every retry
    Fixed {
        #[serde(rename = "delay_ms", with = "duration_ms")]
        delay: Duration,
    },
    /// Doubling delay, capped at `max`
    Exponential {
        #[serde(rename = "base_ms", with = "duration_ms")]
        base: Duration,
        #[serde(rename = "max_ms", with = "duration_ms")]
        max: Duration,
    },
}

impl Default for RetryBackoff {
    fn default() -> Self {
        RetryBackoff::Fixed {
            delay: Duration::from_millis(500),
        }
    }
}

impl RetryBackoff {
    /// Delay before retry number `attempt` (1-based: the delay after the first failure is `attempt = 1`)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            RetryBackoff::Fixed { delay } => delay,
            RetryBackoff::Exponential { base, max } => {
                let shift = attempt.saturating_sub(1).min(31);
                base.checked_mul(1u32 << shift).unwrap_or(max).min(max)
            }
        }
    }
}

/// Protocol configuration shared by trainer, gateways and predictors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Fraction of participants required for a step to proceed
    pub quorum_ratio: QuorumRatio,
    /// Abort threshold for a whole round
    #[serde(rename = "round_deadline_ms", with = "duration_ms")]
    pub round_deadline: Duration,
    /// Abort threshold for one notify phase, and a gateway's pause wait
    #[serde(rename = "per_phase_timeout_ms", with = "duration_ms")]
    pub per_phase_timeout: Duration,
    /// Attempts for artifact publish/fetch before giving up
    pub max_retry_attempts: u32,
    /// Delay policy between attempts
    pub retry_backoff: RetryBackoff,
    /// What starts a round
    pub sync_trigger_mode: TriggerMode,
    /// Round period in `interval` mode
    #[serde(rename = "sync_interval_ms", with = "duration_ms")]
    pub sync_interval: Duration,
    /// Idle tick: heartbeat period and trigger evaluation
    #[serde(rename = "heartbeat_interval_ms", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// How long to wait for one heartbeat response
    #[serde(rename = "heartbeat_timeout_ms", with = "duration_ms")]
    pub heartbeat_timeout: Duration,
    /// Longest a worker stays paused without a resume before releasing itself
    #[serde(rename = "worker_pause_limit_ms", with = "duration_ms")]
    pub worker_pause_limit: Duration,
    /// Logical artifact name in the model store
    pub model_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            quorum_ratio: QuorumRatio::DEFAULT,
            round_deadline: Duration::from_secs(120),
            per_phase_timeout: Duration::from_secs(30),
            max_retry_attempts: 3,
            retry_backoff: RetryBackoff::default(),
            sync_trigger_mode: TriggerMode::Interval,
            sync_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(2),
            worker_pause_limit: Duration::from_secs(300),
            model_name: "policy".to_string(),
        }
    }
}

impl SyncConfig {
    /// Start a builder from defaults
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.round_deadline.is_zero() || self.per_phase_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "round_deadline and per_phase_timeout must be non-zero".to_string(),
            ));
        }
        if self.max_retry_attempts == 0 {
            return Err(Error::InvalidConfig(
                "max_retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "heartbeat interval and timeout must be non-zero".to_string(),
            ));
        }
        if self.sync_trigger_mode == TriggerMode::Interval && self.sync_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "sync_interval must be non-zero in interval mode".to_string(),
            ));
        }
        if self.model_name.is_empty() || self.model_name.contains(['/', '\\', '@']) {
            return Err(Error::InvalidConfig(format!(
                "model_name `{}` must be non-empty and free of path separators",
                self.model_name
            )));
        }
        Ok(())
    }
}

/// Builder for [`SyncConfig`]
#[derive(Debug, Default)]
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    /// Set the quorum ratio
    pub fn quorum_ratio(mut self, ratio: QuorumRatio) -> Self {
        self.config.quorum_ratio = ratio;
        self
    }

    /// Set the round deadline
    pub fn round_deadline(mut self, deadline: Duration) -> Self {
        self.config.round_deadline = deadline;
        self
    }

    /// Set the per-phase timeout
    pub fn per_phase_timeout(mut self, timeout: Duration) -> Self {
        self.config.per_phase_timeout = timeout;
        self
    }

    /// Set retry attempts and backoff
    pub fn retry(mut self, max_attempts: u32, backoff: RetryBackoff) -> Self {
        self.config.max_retry_attempts = max_attempts;
        self.config.retry_backoff = backoff;
        self
    }

    /// Set the trigger mode
    pub fn trigger(mut self, mode: TriggerMode) -> Self {
        self.config.sync_trigger_mode = mode;
        self
    }

    /// Set the round period for interval mode
    pub fn sync_interval(mut self, interval: Duration) -> Self {
        self.config.sync_interval = interval;
        self
    }

    /// Set heartbeat period and response timeout
    pub fn heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self.config.heartbeat_timeout = timeout;
        self
    }

    /// Set the worker self-release limit
    pub fn worker_pause_limit(mut self, limit: Duration) -> Self {
        self.config.worker_pause_limit = limit;
        self
    }

    /// Set the logical model name
    pub fn model_name(mut self, name: impl Into<String>) -> Self {
        self.config.model_name = name.into();
        self
    }

    /// Validate and build
    pub fn build(self) -> Result<SyncConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Serving pipeline tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Request queue capacity; a full queue rejects ingress
    pub ingress_queue_capacity: usize,
    /// Egress queue capacity; a full queue drops results
    pub egress_queue_capacity: usize,
    /// Queue between batch assembly and dispatch
    pub batch_queue_capacity: usize,
    /// Largest batch handed to the model
    pub max_batch_size: usize,
    /// Longest a partial batch waits for more items
    #[serde(rename = "max_batch_wait_ms", with = "duration_ms")]
    pub max_batch_wait: Duration,
    /// Poll timeout of each stage loop; bounds shutdown latency
    #[serde(rename = "stage_poll_ms", with = "duration_ms")]
    pub stage_poll: Duration,
    /// Longest one batch prediction may run before it is abandoned
    #[serde(rename = "predict_timeout_ms", with = "duration_ms")]
    pub predict_timeout: Duration,
    /// Payload compression on the gateway link
    pub compression: CompressionMethod,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingress_queue_capacity: 1024,
            egress_queue_capacity: 1024,
            batch_queue_capacity: 4,
            max_batch_size: 32,
            max_batch_wait: Duration::from_millis(5),
            stage_poll: Duration::from_millis(100),
            predict_timeout: Duration::from_secs(5),
            compression: CompressionMethod::Lz4,
        }
    }
}

impl PipelineConfig {
    /// Check capacities and batch limits
    pub fn validate(&self) -> Result<()> {
        if self.ingress_queue_capacity == 0
            || self.egress_queue_capacity == 0
            || self.batch_queue_capacity == 0
        {
            return Err(Error::InvalidConfig(
                "queue capacities must be at least 1".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(Error::InvalidConfig(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.stage_poll.is_zero() {
            return Err(Error::InvalidConfig("stage_poll must be non-zero".to_string()));
        }
        if self.predict_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "predict_timeout must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Participant endpoints known to the trainer at startup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointsConfig {
    /// Predictor control endpoints (`host:port` or in-memory names)
    pub predictors: Vec<String>,
    /// Gateway control endpoints
    pub gateways: Vec<String>,
}

/// Complete configuration of one process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Protocol settings
    pub sync: SyncConfig,
    /// Serving pipeline settings (predictors)
    pub pipeline: PipelineConfig,
    /// Participants to discover (trainer)
    pub endpoints: EndpointsConfig,
    /// Control listen address (predictors and gateways)
    pub listen: Option<String>,
    /// Registered inference plugin to instantiate (predictors)
    pub model_plugin: String,
    /// Parameters handed to the plugin factory
    pub model_params: serde_json::Value,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            pipeline: PipelineConfig::default(),
            endpoints: EndpointsConfig::default(),
            listen: None,
            model_plugin: "echo".to_string(),
            model_params: serde_json::Value::Null,
        }
    }
}

impl NodeConfig {
    /// Parse and validate a JSON document; missing keys take defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: NodeConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.sync.validate()?;
        self.pipeline.validate()
    }
}
