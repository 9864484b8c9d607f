//! Predictor serving pipeline.
//!
//! ```text
//! Ingress::offer -> [requests] -> batcher -> [batches] -> predictor
//!     -> [results] -> compressor -> [egress] -> sender -> ResponseSink
//! ```
//!
//! Every arrow in brackets is a [`BoundedQueue`]. Ingress never waits: a full
//! request queue rejects the item and counts it. The egress queue drops frames
//! it cannot hold so a slow sink never stalls prediction. Closing the request
//! queue shuts the stages down one after another, each draining what it holds.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use policy_sync_core::compression::{compress, decompress, CompressionMethod};
use policy_sync_core::config::PipelineConfig;
use policy_sync_core::item::{group_by_connection, InferenceResult, QueueItem, RequestKey, ResultSet};
use policy_sync_core::metrics::{observe_all, Counter, MaxGauge, MetricSource, Observation};
use policy_sync_core::queue::BoundedQueue;
use policy_sync_core::version::{ModelVersion, SharedVersion};
use policy_sync_core::Error as CoreError;

use super::model::InferenceModel;

/// Serving pipeline errors
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Queue refusal, bad config or payload compression failure
    #[error(transparent)]
    Core(#[from] CoreError),
    /// Result set could not be serialized or parsed
    #[error("result encoding failed: {0}")]
    Encode(#[from] postcard::Error),
    /// The response sink could not deliver a frame
    #[error("response sink failed: {0}")]
    Sink(String),
}

/// An inference request as it arrives from a gateway, payload still compressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundRequest {
    pub key: RequestKey,
    pub model_version: ModelVersion,
    pub payload: Vec<u8>,
}

/// Compressed result set for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EgressFrame {
    pub connection_id: u64,
    /// Version that produced the results
    pub model_version: ModelVersion,
    pub result_count: usize,
    pub payload: Vec<u8>,
}

impl EgressFrame {
    fn encode(set: &ResultSet, version: ModelVersion, method: CompressionMethod) -> Result<Self, PipelineError> {
        let raw = set.encode()?;
        Ok(Self {
            connection_id: set.connection_id,
            model_version: version,
            result_count: set.results.len(),
            payload: compress(method, &raw)?,
        })
    }

    /// Decompress and parse the result set
    pub fn decode(&self, method: CompressionMethod) -> Result<ResultSet, PipelineError> {
        let raw = decompress(method, &self.payload)?;
        Ok(ResultSet::decode(&raw)?)
    }
}

/// Writes egress frames back toward the gateways
#[async_trait]
pub trait ResponseSink: Send + Sync {
    async fn send(&self, frame: EgressFrame) -> Result<(), PipelineError>;
}

#[async_trait]
impl ResponseSink for mpsc::Sender<EgressFrame> {
    async fn send(&self, frame: EgressFrame) -> Result<(), PipelineError> {
        mpsc::Sender::send(self, frame)
            .await
            .map_err(|_| PipelineError::Sink("receiver dropped".to_string()))
    }
}

/// Pipeline counters
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub ingress_accepted: Counter,
    pub queue_full: Counter,
    pub decompress_error: Counter,
    pub batches: Counter,
    pub predict_error: Counter,
    pub egress_dropped: Counter,
    pub stale_results: Counter,
    pub sent: Counter,
    pub send_error: Counter,
    pub max_batch_size: MaxGauge,
    pub max_predict_latency_us: MaxGauge,
}

impl MetricSource for PipelineStats {
    fn observations(&self) -> Vec<Observation> {
        observe_all(
            "pipeline",
            [
                ("ingress_accepted", self.ingress_accepted.get()),
                ("queue_full", self.queue_full.get()),
                ("decompress_error", self.decompress_error.get()),
                ("batches", self.batches.get()),
                ("predict_error", self.predict_error.get()),
                ("egress_dropped", self.egress_dropped.get()),
                ("stale_results", self.stale_results.get()),
                ("sent", self.sent.get()),
                ("send_error", self.send_error.get()),
                ("max_batch_size", self.max_batch_size.get()),
                ("max_predict_latency_us", self.max_predict_latency_us.get()),
            ],
        )
    }
}

/// Entry point for inbound requests. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Ingress {
    requests: Arc<BoundedQueue<QueueItem>>,
    compression: CompressionMethod,
    stats: Arc<PipelineStats>,
}

impl Ingress {
    /// Decompress and enqueue without waiting.
    ///
    /// A full queue returns [`CoreError::QueueFull`]; the caller retries or drops.
    pub fn offer(&self, request: InboundRequest) -> Result<(), PipelineError> {
        let payload = decompress(self.compression, &request.payload).map_err(|e| {
            self.stats.decompress_error.inc();
            e
        })?;
        let item = QueueItem {
            key: request.key,
            model_version: request.model_version,
            payload,
        };
        match self.requests.try_put(item) {
            Ok(()) => {
                self.stats.ingress_accepted.inc();
                Ok(())
            }
            Err(rejected) => {
                if rejected.is_full() {
                    self.stats.queue_full.inc();
                }
                Err(rejected.error.into())
            }
        }
    }

    /// Requests waiting for batching
    pub fn backlog(&self) -> usize {
        self.requests.len()
    }
}

/// A configured, not yet running pipeline
pub struct ServingPipeline {
    config: PipelineConfig,
    model: Arc<dyn InferenceModel>,
    version: SharedVersion,
}

impl std::fmt::Debug for ServingPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServingPipeline")
            .field("config", &self.config)
            .field("version", &self.version.current())
            .finish_non_exhaustive()
    }
}

impl ServingPipeline {
    /// `version` is the predictor's active version; results are tagged with it at dispatch.
    pub fn new(
        config: PipelineConfig,
        model: Arc<dyn InferenceModel>,
        version: SharedVersion,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        Ok(Self {
            config,
            model,
            version,
        })
    }

    /// Spawn the four stage loops
    pub fn start(self, sink: Arc<dyn ResponseSink>) -> PipelineHandle {
        let cfg = self.config;
        let stats = Arc::new(PipelineStats::default());
        let requests = Arc::new(BoundedQueue::new(cfg.ingress_queue_capacity));
        let batches = Arc::new(BoundedQueue::new(cfg.batch_queue_capacity));
        let results = Arc::new(BoundedQueue::new(cfg.batch_queue_capacity));
        let egress = Arc::new(BoundedQueue::new(cfg.egress_queue_capacity));

        let tasks = vec![
            tokio::spawn(assemble_batches(
                Arc::clone(&requests),
                Arc::clone(&batches),
                cfg.max_batch_size,
                cfg.max_batch_wait,
                cfg.stage_poll,
            )),
            tokio::spawn(dispatch_batches(
                Arc::clone(&batches),
                Arc::clone(&results),
                self.model,
                Arc::clone(&self.version),
                Arc::clone(&stats),
                cfg.predict_timeout,
                cfg.stage_poll,
            )),
            tokio::spawn(compress_results(
                Arc::clone(&results),
                Arc::clone(&egress),
                cfg.compression,
                Arc::clone(&stats),
                cfg.stage_poll,
            )),
            tokio::spawn(send_frames(
                egress,
                sink,
                self.version,
                Arc::clone(&stats),
                cfg.stage_poll,
            )),
        ];
        tracing::info!(
            ingress_capacity = cfg.ingress_queue_capacity,
            max_batch_size = cfg.max_batch_size,
            "serving pipeline started"
        );

        PipelineHandle {
            ingress: Ingress {
                requests,
                compression: cfg.compression,
                stats: Arc::clone(&stats),
            },
            stats,
            tasks,
        }
    }
}

/// Running pipeline. Dropping it stops intake; [`shutdown`](Self::shutdown) also waits for the drain.
#[derive(Debug)]
pub struct PipelineHandle {
    ingress: Ingress,
    stats: Arc<PipelineStats>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn ingress(&self) -> Ingress {
        self.ingress.clone()
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn metrics(&self) -> Vec<Observation> {
        self.stats.observations()
    }

    /// Stop intake and wait until every stage has drained
    pub async fn shutdown(mut self) {
        self.ingress.requests.close();
        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "pipeline stage panicked");
            }
        }
        tracing::info!("serving pipeline stopped");
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        self.ingress.requests.close();
    }
}

/// Blocking hand-off between stages. `false` once the next queue is closed.
async fn forward<T>(queue: &BoundedQueue<T>, item: T, poll: Duration) -> bool {
    let mut item = item;
    loop {
        match queue.put(item, poll).await {
            Ok(()) => return true,
            Err(rejected) if matches!(rejected.error, CoreError::Timeout(_)) => {
                item = rejected.into_inner();
            }
            Err(_) => return false,
        }
    }
}

/// Next item, `None` once the queue is closed and drained
async fn next<T>(queue: &BoundedQueue<T>, poll: Duration) -> Option<T> {
    loop {
        match queue.get(poll).await {
            Ok(item) => return Some(item),
            Err(CoreError::QueueClosed) => return None,
            Err(_) => continue,
        }
    }
}

async fn assemble_batches(
    requests: Arc<BoundedQueue<QueueItem>>,
    batches: Arc<BoundedQueue<Vec<QueueItem>>>,
    max_size: usize,
    max_wait: Duration,
    poll: Duration,
) {
    while let Some(first) = next(&requests, poll).await {
        let deadline = Instant::now() + max_wait;
        let mut batch = Vec::with_capacity(max_size);
        batch.push(first);
        while batch.len() < max_size {
            batch.extend(requests.drain_up_to(max_size - batch.len()));
            let remaining = deadline.saturating_duration_since(Instant::now());
            if batch.len() >= max_size || remaining.is_zero() {
                break;
            }
            match requests.get(remaining).await {
                Ok(item) => batch.push(item),
                Err(_) => break,
            }
        }
        if !forward(&batches, batch, poll).await {
            break;
        }
    }
    batches.close();
    tracing::debug!("batcher stopped");
}

async fn dispatch_batches(
    batches: Arc<BoundedQueue<Vec<QueueItem>>>,
    results: Arc<BoundedQueue<Vec<InferenceResult>>>,
    model: Arc<dyn InferenceModel>,
    version: SharedVersion,
    stats: Arc<PipelineStats>,
    predict_timeout: Duration,
    poll: Duration,
) {
    while let Some(batch) = next(&batches, poll).await {
        let active = version.current();
        stats.batches.inc();
        stats.max_batch_size.observe(batch.len() as u64);

        let started = Instant::now();
        let predicted = tokio::time::timeout(predict_timeout, model.predict(&batch)).await;
        stats
            .max_predict_latency_us
            .observe(started.elapsed().as_micros() as u64);

        let predictions = match predicted {
            Ok(Ok(p)) => p,
            Ok(Err(e)) => {
                stats.predict_error.inc();
                tracing::warn!(error = %e, size = batch.len(), "batch prediction failed");
                continue;
            }
            Err(_) => {
                stats.predict_error.inc();
                tracing::warn!(
                    timeout_ms = predict_timeout.as_millis() as u64,
                    size = batch.len(),
                    "batch prediction timed out; dropping batch"
                );
                continue;
            }
        };

        let expected: HashSet<RequestKey> = batch.iter().map(|item| item.key).collect();
        let out: Vec<InferenceResult> = predictions
            .into_iter()
            .filter(|p| expected.contains(&p.key))
            .map(|p| InferenceResult {
                key: p.key,
                model_version: active,
                payload: p.payload,
            })
            .collect();
        if out.len() < batch.len() {
            tracing::warn!(
                answered = out.len(),
                size = batch.len(),
                "model left requests unanswered"
            );
        }
        if !out.is_empty() && !forward(&results, out, poll).await {
            break;
        }
    }
    results.close();
    tracing::debug!("dispatcher stopped");
}

async fn compress_results(
    results: Arc<BoundedQueue<Vec<InferenceResult>>>,
    egress: Arc<BoundedQueue<EgressFrame>>,
    method: CompressionMethod,
    stats: Arc<PipelineStats>,
    poll: Duration,
) {
    while let Some(batch) = next(&results, poll).await {
        for set in group_by_connection(batch) {
            let Some(version) = set.oldest_version() else {
                continue;
            };
            let frame = match EgressFrame::encode(&set, version, method) {
                Ok(frame) => frame,
                Err(e) => {
                    stats.egress_dropped.inc();
                    tracing::warn!(connection = set.connection_id, error = %e, "dropping unencodable result set");
                    continue;
                }
            };
            if let Err(rejected) = egress.try_put(frame) {
                stats.egress_dropped.inc();
                tracing::warn!(
                    connection = set.connection_id,
                    error = %rejected.error,
                    "egress queue refused result set"
                );
            }
        }
    }
    egress.close();
    tracing::debug!("compressor stopped");
}

async fn send_frames(
    egress: Arc<BoundedQueue<EgressFrame>>,
    sink: Arc<dyn ResponseSink>,
    version: SharedVersion,
    stats: Arc<PipelineStats>,
    poll: Duration,
) {
    while let Some(frame) = next(&egress, poll).await {
        let active = version.current();
        if frame.model_version != active {
            // late arrival: still delivered
            stats.stale_results.add(frame.result_count as u64);
            tracing::debug!(produced_by = %frame.model_version, %active, "sending stale results");
        }
        let connection = frame.connection_id;
        match sink.send(frame).await {
            Ok(()) => stats.sent.inc(),
            Err(e) => {
                stats.send_error.inc();
                tracing::warn!(connection, error = %e, "failed to send result set");
            }
        }
    }
    tracing::debug!("sender stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::model::{EchoModel, ModelError, Prediction};
    use policy_sync_core::version::VersionCounter;

    fn request(conn: u64, seq: u64, method: CompressionMethod) -> InboundRequest {
        let body = format!("obs-{conn}-{seq}").into_bytes();
        InboundRequest {
            key: RequestKey::new(conn, 7, seq),
            model_version: ModelVersion(1),
            payload: compress(method, &body).unwrap(),
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            max_batch_size: 4,
            max_batch_wait: Duration::from_millis(2),
            stage_poll: Duration::from_millis(20),
            ..PipelineConfig::default()
        }
    }

    async fn collect(rx: &mut mpsc::Receiver<EgressFrame>, results: usize) -> Vec<EgressFrame> {
        let mut frames = Vec::new();
        let mut seen = 0;
        while seen < results {
            let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen += frame.result_count;
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn results_carry_request_keys_and_dispatch_version() {
        let version = VersionCounter::shared(ModelVersion(3));
        let (tx, mut rx) = mpsc::channel(64);
        let pipeline = ServingPipeline::new(config(), Arc::new(EchoModel::new()), version).unwrap();
        let handle = pipeline.start(Arc::new(tx));
        let ingress = handle.ingress();

        for conn in 0..3 {
            for seq in 0..5 {
                ingress.offer(request(conn, seq, CompressionMethod::Lz4)).unwrap();
            }
        }
        let frames = collect(&mut rx, 15).await;

        let mut keys = Vec::new();
        for frame in &frames {
            let set = frame.decode(CompressionMethod::Lz4).unwrap();
            assert_eq!(set.connection_id, frame.connection_id);
            for r in set.results {
                assert_eq!(r.key.connection_id, frame.connection_id);
                assert_eq!(r.model_version, ModelVersion(3));
                let expected = format!("obs-{}-{}", r.key.connection_id, r.key.sequence);
                assert_eq!(r.payload, expected.into_bytes());
                keys.push(r.key);
            }
        }
        keys.sort();
        let mut want: Vec<_> = (0..3)
            .flat_map(|c| (0..5).map(move |s| RequestKey::new(c, 7, s)))
            .collect();
        want.sort();
        assert_eq!(keys, want);
        assert!(handle.stats().max_batch_size.get() <= 4);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn burst_beyond_capacity_is_rejected_and_counted() {
        let version = VersionCounter::shared(ModelVersion(1));
        let (tx, _rx) = mpsc::channel(1);
        let cfg = PipelineConfig {
            ingress_queue_capacity: 100,
            ..config()
        };
        let model = Arc::new(EchoModel::with_delay(Duration::from_secs(60)));
        let handle = ServingPipeline::new(cfg, model, version).unwrap().start(Arc::new(tx));
        let ingress = handle.ingress();
        // offers never yield, so the stages cannot drain the queue mid-burst
        let mut accepted = 0;
        let mut rejected = 0;
        for seq in 0..150 {
            match ingress.offer(request(0, seq, CompressionMethod::Lz4)) {
                Ok(()) => accepted += 1,
                Err(PipelineError::Core(CoreError::QueueFull { capacity })) => {
                    assert_eq!(capacity, 100);
                    rejected += 1;
                }
                Err(other) => panic!("unexpected error {other}"),
            }
        }
        assert_eq!((accepted, rejected), (100, 50));
        assert_eq!(handle.stats().queue_full.get(), 50);
        assert_eq!(handle.stats().ingress_accepted.get(), 100);
        assert_eq!(ingress.backlog(), 100);
    }

    #[test]
    fn ingress_alone_accepts_capacity_then_rejects() {
        let stats = Arc::new(PipelineStats::default());
        let ingress = Ingress {
            requests: Arc::new(BoundedQueue::new(100)),
            compression: CompressionMethod::Lz4,
            stats: Arc::clone(&stats),
        };
        let outcomes: Vec<_> = (0..150)
            .map(|seq| ingress.offer(request(0, seq, CompressionMethod::Lz4)).is_ok())
            .collect();
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 100);
        assert_eq!(stats.queue_full.get(), 50);
        assert_eq!(ingress.backlog(), 100);
    }

    #[test]
    fn corrupt_payload_counts_decompress_error() {
        let stats = Arc::new(PipelineStats::default());
        let ingress = Ingress {
            requests: Arc::new(BoundedQueue::new(4)),
            compression: CompressionMethod::Lz4,
            stats: Arc::clone(&stats),
        };
        let mut req = request(0, 0, CompressionMethod::Lz4);
        req.payload = vec![0xff, 0xff, 0xff, 0x7f, 1, 2];
        assert!(ingress.offer(req).is_err());
        assert_eq!(stats.decompress_error.get(), 1);
        assert_eq!(ingress.backlog(), 0);
    }

    struct FailingModel;

    #[async_trait]
    impl InferenceModel for FailingModel {
        async fn predict(&self, _batch: &[QueueItem]) -> Result<Vec<Prediction>, ModelError> {
            Err(ModelError("no weights".to_string()))
        }

        async fn load(&self, _version: ModelVersion, _artifact: &[u8]) -> Result<(), ModelError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn predict_failure_is_counted_not_fatal() {
        let version = VersionCounter::shared(ModelVersion(1));
        let (tx, mut rx) = mpsc::channel(8);
        let handle = ServingPipeline::new(config(), Arc::new(FailingModel), version)
            .unwrap()
            .start(Arc::new(tx));
        handle
            .ingress()
            .offer(request(0, 1, CompressionMethod::Lz4))
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.stats().predict_error.get() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        handle.shutdown().await;
        assert!(rx.try_recv().is_err());
    }

    struct HangingModel;

    #[async_trait]
    impl InferenceModel for HangingModel {
        async fn predict(&self, _batch: &[QueueItem]) -> Result<Vec<Prediction>, ModelError> {
            std::future::pending().await
        }

        async fn load(&self, _version: ModelVersion, _artifact: &[u8]) -> Result<(), ModelError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_model_times_out_and_dispatch_moves_on() {
        let version = VersionCounter::shared(ModelVersion(1));
        let (tx, mut rx) = mpsc::channel(8);
        let cfg = PipelineConfig {
            predict_timeout: Duration::from_millis(200),
            ..config()
        };
        let handle = ServingPipeline::new(cfg, Arc::new(HangingModel), version)
            .unwrap()
            .start(Arc::new(tx));
        let ingress = handle.ingress();
        ingress.offer(request(0, 0, CompressionMethod::Lz4)).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.stats().predict_error.get() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handle.stats().batches.get(), 1);

        // the dispatcher is free again: the next batch is taken too
        ingress.offer(request(0, 1, CompressionMethod::Lz4)).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.stats().predict_error.get() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(handle.stats().batches.get(), 2);
        handle.shutdown().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_results_are_delivered_and_counted_stale() {
        let version = VersionCounter::shared(ModelVersion(1));
        let (tx, mut rx) = mpsc::channel(8);
        let model = Arc::new(EchoModel::with_delay(Duration::from_millis(50)));
        let handle = ServingPipeline::new(config(), model, Arc::clone(&version))
            .unwrap()
            .start(Arc::new(tx));
        handle.ingress().offer(request(0, 0, CompressionMethod::Lz4)).unwrap();
        // dispatch happened under v1; switch while the model is busy
        tokio::time::sleep(Duration::from_millis(20)).await;
        version.advance_to(ModelVersion(2));

        let frames = collect(&mut rx, 1).await;
        assert_eq!(frames[0].model_version, ModelVersion(1));
        assert_eq!(handle.stats().stale_results.get(), 1);
        assert_eq!(handle.stats().sent.get(), 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_accepted_requests() {
        let version = VersionCounter::shared(ModelVersion(1));
        let (tx, mut rx) = mpsc::channel(64);
        let handle = ServingPipeline::new(config(), Arc::new(EchoModel::new()), version)
            .unwrap()
            .start(Arc::new(tx));
        for seq in 0..10 {
            handle.ingress().offer(request(1, seq, CompressionMethod::Lz4)).unwrap();
        }
        handle.shutdown().await;
        let mut delivered = 0;
        while let Ok(frame) = rx.try_recv() {
            delivered += frame.result_count;
        }
        assert_eq!(delivered, 10);
    }
}
