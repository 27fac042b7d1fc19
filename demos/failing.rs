//! Failing Worker - how handler failures reach the caller.
//!
//! A handler that streams a little and then fails still ends its request
//! with exactly one final envelope, carrying `error` instead of `data`.
//! Requests for events nobody handles get no response at all; the worker
//! logs and drops them.
//!
//! Run with `RELAY_LOG=debug cargo run --example failing`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use relay_worker::transport::{MemoryBroker, MemoryCaller, MemoryTransport};
use relay_worker::{telemetry, ChunkEmitter, Payload, RelayClient, RelayError, Worker, WorkerConfig};
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize, Debug)]
struct ImportInput {
    rows: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env()?;
    telemetry::init(&config.telemetry)?;

    let worker = Worker::builder()
        .config(config.clone())
        .handle("import", |input: ImportInput, emit: ChunkEmitter| async move {
            for (line, row) in input.rows.iter().enumerate() {
                let value: i64 = row
                    .parse()
                    .with_context(|| format!("row {} is not a number", line + 1))?;
                if value < 0 {
                    bail!("row {} is negative", line + 1);
                }
                emit.emit(&json!({ "row": line + 1, "value": value })).await?;
            }
            Ok(input.rows.len())
        })
        .build()?;

    let broker = MemoryBroker::new();
    let transport = Arc::new(MemoryTransport::connect(&broker, &worker.topology())?);
    let caller = MemoryCaller::connect(&broker, &config.request_exchange, &config.response_exchange)?;
    let handle = worker.spawn(transport);
    let client = RelayClient::start(Arc::new(caller), config.routing);

    let mut payload = Payload::new();
    payload.insert("rows".into(), json!(["1", "2", "three"]));
    let mut stream = client.request("import", payload).await?;
    while let Some(envelope) = stream.next().await {
        println!("{:?}", envelope.body());
    }

    // Malformed payload: the handler never runs, the error is still final.
    let mut payload = Payload::new();
    payload.insert("rows".into(), json!(42));
    match client.request("import", payload).await?.finish().await {
        Err(RelayError::Remote(message)) => println!("rejected: {}", message),
        other => println!("unexpected: {:?}", other),
    }

    // Unknown event: dropped by the worker, so give up after a moment.
    let stream = client.request("export", Payload::new()).await?;
    match tokio::time::timeout(Duration::from_millis(200), stream.finish()).await {
        Ok(result) => println!("unexpected response: {:?}", result),
        Err(_) => println!("no response for unregistered event"),
    }

    client.shutdown().await?;
    handle.shutdown();
    handle.join().await?;

    Ok(())
}
