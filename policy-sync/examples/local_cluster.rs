//! Local Cluster Example
//!
//! Runs a trainer, two predictors and two gateways in one process over the
//! in-memory network. Gateway workers step through episodes while the
//! trainer rolls out a new model version every few hundred milliseconds,
//! and one predictor serves a stream of inference requests, sent over an
//! inference channel, throughout.

use std::sync::Arc;
use std::time::Duration;

use policy_sync::core::compression::{compress, CompressionMethod};
use policy_sync::core::metrics::{MetricsSink, TracingSink};
use policy_sync::predictor::EgressFrame;
use policy_sync::prelude::*;
use policy_sync::trainer::TrainError;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("Policy Sync Local Cluster Example");
    println!("=================================");

    let node = NodeConfig::from_json_str(r#"{ "model_plugin": "echo", "model_params": { "delay_ms": 2 } }"#)?;
    let sync = SyncConfig::builder()
        .trigger(TriggerMode::Interval)
        .sync_interval(Duration::from_millis(300))
        .per_phase_timeout(Duration::from_millis(500))
        .round_deadline(Duration::from_secs(5))
        .heartbeat(Duration::from_millis(50), Duration::from_millis(200))
        .build()?;
    let net = MemoryNetwork::new();
    let store = Arc::new(MemoryModelStore::new());

    // Predictors
    let model = model_from_config(&node)?;
    let mut predictors = Vec::new();
    for i in 0..2 {
        let name = format!("predictor-{i}");
        let agent = Arc::new(PredictorAgent::new(
            &sync,
            store.clone(),
            Arc::clone(&model),
            ModelVersion::INITIAL,
        ));
        tokio::spawn(serve_participant(Arc::clone(&agent), net.listen(name.as_str())));
        predictors.push((Endpoint::new(name), agent));
    }

    // Gateways, four episode workers each
    let mut gateways = Vec::new();
    for i in 0..2 {
        let name = format!("gateway-{i}");
        let agent = Arc::new(GatewayAgent::new(&sync, ModelVersion::INITIAL));
        for _ in 0..4 {
            let mut worker = agent.barrier().register();
            tokio::spawn(async move {
                loop {
                    if let Checkpoint::Resumed { version } = worker.checkpoint(SafePoint::Step).await {
                        tracing::debug!(worker = ?worker.id(), %version, "worker resumed");
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            });
        }
        tokio::spawn(serve_participant(Arc::clone(&agent), net.listen(name.as_str())));
        gateways.push((Endpoint::new(name), agent));
    }

    // Serving pipeline on the first predictor, fed by a gateway over an inference channel
    let pipeline = ServingPipeline::new(
        node.pipeline.clone(),
        Arc::clone(&model),
        predictors[0].1.shared_version(),
    )?;
    let router = ResponseRouter::new();
    let serving = pipeline.start(Arc::new(router.clone()));
    tokio::spawn(serve_inference(
        serving.ingress(),
        router,
        net.listen("predictor-0/inference"),
    ));
    let mut link = net.connect(&Endpoint::from("predictor-0/inference")).await?;
    let client = tokio::spawn(async move {
        let mut received = 0usize;
        for seq in 0u64..1500 {
            let request = InboundRequest {
                key: RequestKey::new(seq % 3, seq % 7, seq),
                model_version: ModelVersion::INITIAL,
                payload: compress(CompressionMethod::Lz4, format!("obs-{seq}").as_bytes())
                    .unwrap_or_default(),
            };
            if link.send(&Envelope::new(request.into_message())).await.is_err() {
                break;
            }
            while let Ok(Some(envelope)) = link.recv(RecvMode::NonBlocking).await {
                if let Some(frame) = EgressFrame::from_message(envelope.message) {
                    received += frame.result_count;
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        received
    });

    // Trainer
    let trainer = |next: ModelVersion| -> Result<Option<Vec<u8>>, TrainError> {
        Ok(Some(format!("weights for {next}").into_bytes()))
    };
    let mut coordinator = Coordinator::new(
        sync.clone(),
        Box::new(trainer),
        store.clone(),
        Arc::new(net.clone()),
        Arc::new(StaticDiscovery::new(
            predictors.iter().map(|(e, _)| e.clone()),
            gateways.iter().map(|(e, _)| e.clone()),
        )),
        ModelVersion::INITIAL,
    )?;

    let (stop, shutdown) = tokio::sync::watch::channel(false);
    let runner = tokio::spawn(async move {
        coordinator.run(shutdown).await;
        coordinator
    });
    tokio::time::sleep(Duration::from_secs(2)).await;
    stop.send(true)?;
    let coordinator = runner.await?;

    println!("\nTrainer at version {}", coordinator.version());
    for (endpoint, agent) in &predictors {
        println!("  {endpoint}: version {}", agent.version());
    }
    for (endpoint, agent) in &gateways {
        println!("  {endpoint}: version {}", agent.version());
    }

    let sink = TracingSink;
    let _ = sink.emit(&coordinator.metrics());
    let _ = sink.emit(&serving.metrics());
    let received = client.await?;
    serving.shutdown().await;
    println!("\nServed {received} inference results");

    Ok(())
}
