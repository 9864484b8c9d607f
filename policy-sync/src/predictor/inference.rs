//! Inference traffic between gateways and a predictor.
//!
//! A gateway opens a channel to the predictor's inference endpoint and streams
//! [`SyncMessage::InferenceRequest`]s into [`Ingress::offer`]. Result sets go
//! back as [`SyncMessage::InferenceResults`] on the channel the connection's
//! requests arrived on; a [`ResponseRouter`] keeps that mapping.

use std::collections::{hash_map::Entry, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use policy_sync_net::protocol::{Envelope, SyncMessage};
use policy_sync_net::traits::{ChannelListener, HeartbeatChannel, RecvMode};

use super::pipeline::{EgressFrame, InboundRequest, Ingress, PipelineError, ResponseSink};
use crate::serve::SERVE_POLL;

/// Result frames buffered per served channel
const RESULT_BUFFER: usize = 64;

impl InboundRequest {
    /// Wire form sent by a gateway
    pub fn into_message(self) -> SyncMessage {
        SyncMessage::InferenceRequest {
            key: self.key,
            model_version: self.model_version,
            payload: self.payload,
        }
    }
}

impl EgressFrame {
    /// Wire form sent back to the gateway
    pub fn into_message(self) -> SyncMessage {
        SyncMessage::InferenceResults {
            connection_id: self.connection_id,
            model_version: self.model_version,
            result_count: u32::try_from(self.result_count).unwrap_or(u32::MAX),
            payload: self.payload,
        }
    }

    /// Parse a results message; `None` for any other message
    pub fn from_message(message: SyncMessage) -> Option<Self> {
        match message {
            SyncMessage::InferenceResults {
                connection_id,
                model_version,
                result_count,
                payload,
            } => Some(Self {
                connection_id,
                model_version,
                result_count: result_count as usize,
                payload,
            }),
            _ => None,
        }
    }
}

/// Sends each egress frame to the channel its connection is served on.
///
/// Cheap to clone; hand one clone to [`ServingPipeline::start`] and the
/// others to [`serve_inference`].
///
/// [`ServingPipeline::start`]: super::ServingPipeline::start
#[derive(Debug, Clone, Default)]
pub struct ResponseRouter {
    routes: Arc<Mutex<HashMap<u64, mpsc::Sender<EgressFrame>>>>,
}

impl ResponseRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, mpsc::Sender<EgressFrame>>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Connections that currently have a route
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point `connection_id` at `tx`. The most recent channel wins.
    fn route(&self, connection_id: u64, tx: &mpsc::Sender<EgressFrame>) {
        match self.lock().entry(connection_id) {
            Entry::Occupied(mut e) => {
                if !e.get().same_channel(tx) {
                    tracing::debug!(connection = connection_id, "connection moved to another channel");
                    e.insert(tx.clone());
                }
            }
            Entry::Vacant(e) => {
                e.insert(tx.clone());
            }
        }
    }

    /// Drop the routes `tx` still owns
    fn unroute(&self, connections: &HashSet<u64>, tx: &mpsc::Sender<EgressFrame>) {
        self.lock()
            .retain(|id, route| !(connections.contains(id) && route.same_channel(tx)));
    }
}

#[async_trait]
impl ResponseSink for ResponseRouter {
    async fn send(&self, frame: EgressFrame) -> Result<(), PipelineError> {
        let route = self.lock().get(&frame.connection_id).cloned();
        let Some(tx) = route else {
            return Err(PipelineError::Sink(format!(
                "no channel for connection {}",
                frame.connection_id
            )));
        };
        tx.send(frame)
            .await
            .map_err(|_| PipelineError::Sink("inference channel closed".to_string()))
    }
}

/// Serve one gateway's inference channel until it closes or errors
pub async fn serve_inference_channel(
    ingress: Ingress,
    router: ResponseRouter,
    mut channel: Box<dyn HeartbeatChannel>,
) {
    let peer = channel.endpoint().clone();
    let (tx, mut results) = mpsc::channel::<EgressFrame>(RESULT_BUFFER);
    let mut connections = HashSet::new();

    loop {
        tokio::select! {
            Some(frame) = results.recv() => {
                let connection = frame.connection_id;
                let envelope = Envelope::new(EgressFrame::into_message(frame));
                if let Err(e) = channel.send(&envelope).await {
                    tracing::warn!(%peer, connection, error = %e, "failed to send results");
                    break;
                }
            }
            received = channel.recv(RecvMode::Timeout(SERVE_POLL)) => match received {
                Ok(Some(envelope)) => match envelope.message {
                    SyncMessage::InferenceRequest { key, model_version, payload } => {
                        if connections.insert(key.connection_id) {
                            router.route(key.connection_id, &tx);
                        }
                        let request = InboundRequest { key, model_version, payload };
                        if let Err(e) = ingress.offer(request) {
                            tracing::debug!(%peer, connection = key.connection_id, error = %e, "request refused");
                        }
                    }
                    other => {
                        tracing::warn!(%peer, kind = other.message_type().as_str(), "unexpected message on inference channel");
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    tracing::info!(%peer, error = %e, "inference channel ended");
                    break;
                }
            },
        }
    }
    router.unroute(&connections, &tx);
}

/// Accept inference channels on `listener` and serve each on its own task.
///
/// Returns when the listener fails; abort the task to stop serving.
pub async fn serve_inference<L: ChannelListener>(ingress: Ingress, router: ResponseRouter, listener: L) {
    let local = listener.local_endpoint();
    tracing::info!(%local, "serving inference channel");
    loop {
        match listener.accept().await {
            Ok(channel) => {
                tokio::spawn(serve_inference_channel(ingress.clone(), router.clone(), channel));
            }
            Err(e) => {
                tracing::warn!(%local, error = %e, "inference listener stopped");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use policy_sync_core::compression::{compress, CompressionMethod};
    use policy_sync_core::config::PipelineConfig;
    use policy_sync_core::item::RequestKey;
    use policy_sync_core::version::{ModelVersion, VersionCounter};
    use policy_sync_net::memory::MemoryNetwork;
    use policy_sync_net::traits::{Connector, Endpoint};

    use crate::predictor::{EchoModel, ServingPipeline};

    const WAIT: RecvMode = RecvMode::Timeout(Duration::from_secs(5));

    fn request(conn: u64, seq: u64) -> SyncMessage {
        InboundRequest {
            key: RequestKey::new(conn, 1, seq),
            model_version: ModelVersion(3),
            payload: compress(CompressionMethod::Lz4, format!("obs-{conn}-{seq}").as_bytes()).unwrap(),
        }
        .into_message()
    }

    async fn results(channel: &mut Box<dyn HeartbeatChannel>, expected: usize) -> Vec<EgressFrame> {
        let mut frames = Vec::new();
        let mut seen = 0;
        while seen < expected {
            let env = channel.recv(WAIT).await.unwrap().unwrap();
            let frame = EgressFrame::from_message(env.message).unwrap();
            seen += frame.result_count;
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn results_return_on_the_channel_their_requests_came_in() {
        let net = MemoryNetwork::new();
        let version = VersionCounter::shared(ModelVersion(3));
        let config = PipelineConfig {
            max_batch_wait: Duration::from_millis(2),
            stage_poll: Duration::from_millis(20),
            ..PipelineConfig::default()
        };
        let router = ResponseRouter::new();
        let handle = ServingPipeline::new(config, Arc::new(EchoModel::new()), version)
            .unwrap()
            .start(Arc::new(router.clone()));
        let server = tokio::spawn(serve_inference(
            handle.ingress(),
            router.clone(),
            net.listen("predictor-data"),
        ));

        let endpoint = Endpoint::from("predictor-data");
        let mut gw_a = net.connect(&endpoint).await.unwrap();
        let mut gw_b = net.connect(&endpoint).await.unwrap();
        for seq in 0..3 {
            gw_a.send(&Envelope::new(request(1, seq))).await.unwrap();
        }
        for seq in 0..2 {
            gw_b.send(&Envelope::new(request(2, seq))).await.unwrap();
        }

        for (channel, conn, count) in [(&mut gw_a, 1, 3), (&mut gw_b, 2, 2)] {
            let frames = results(channel, count).await;
            let mut sequences = Vec::new();
            for frame in frames {
                assert_eq!(frame.connection_id, conn);
                assert_eq!(frame.model_version, ModelVersion(3));
                let set = frame.decode(CompressionMethod::Lz4).unwrap();
                for r in set.results {
                    assert_eq!(r.payload, format!("obs-{conn}-{}", r.key.sequence).into_bytes());
                    sequences.push(r.key.sequence);
                }
            }
            sequences.sort_unstable();
            assert_eq!(sequences, (0..count as u64).collect::<Vec<_>>());
        }
        assert_eq!(router.len(), 2);

        // a closed gateway channel gives up its route
        drop(gw_a);
        tokio::time::timeout(Duration::from_secs(5), async {
            while router.len() != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        server.abort();
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn unrouted_results_are_refused() {
        let router = ResponseRouter::new();
        let frame = EgressFrame {
            connection_id: 9,
            model_version: ModelVersion(1),
            result_count: 1,
            payload: vec![1],
        };
        assert!(matches!(
            router.send(frame).await,
            Err(PipelineError::Sink(_))
        ));
    }

    #[tokio::test]
    async fn non_inference_messages_are_ignored() {
        let (gateway, predictor) = MemoryNetwork::pair("predictor-data");
        let mut gateway: Box<dyn HeartbeatChannel> = Box::new(gateway);
        let version = VersionCounter::shared(ModelVersion(1));
        let router = ResponseRouter::new();
        let handle = ServingPipeline::new(
            PipelineConfig::default(),
            Arc::new(EchoModel::new()),
            version,
        )
        .unwrap()
        .start(Arc::new(router.clone()));
        let served = tokio::spawn(serve_inference_channel(
            handle.ingress(),
            router.clone(),
            Box::new(predictor),
        ));

        gateway
            .send(&Envelope::new(SyncMessage::HeartbeatRequest))
            .await
            .unwrap();
        assert!(gateway
            .recv(RecvMode::Timeout(Duration::from_millis(50)))
            .await
            .unwrap()
            .is_none());
        assert_eq!(handle.stats().ingress_accepted.get(), 0);
        assert!(router.is_empty());

        drop(gateway);
        tokio::time::timeout(Duration::from_secs(5), served)
            .await
            .unwrap()
            .unwrap();
        handle.shutdown().await;
    }
}
