//! Echo Worker - simple request/response example.
//!
//! This example demonstrates:
//! - Creating a worker with the builder pattern
//! - Registering a handler with typed input/output
//! - Awaiting the final result with `ResponseStream::finish`
//!
//! Run with `cargo run --example echo`.

use std::sync::Arc;

use relay_worker::transport::{MemoryBroker, MemoryCaller, MemoryTransport};
use relay_worker::{telemetry, ChunkEmitter, Payload, RelayClient, Worker, WorkerConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Input structure for the echo event.
#[derive(Deserialize, Debug)]
struct EchoInput {
    message: String,
}

/// Output structure for the echo event.
#[derive(Serialize, Debug)]
struct EchoOutput {
    echo: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env()?;
    telemetry::init(&config.telemetry)?;

    let worker = Worker::builder()
        .config(config.clone())
        .handle("echo", |input: EchoInput, _emit: ChunkEmitter| async move {
            Ok(EchoOutput {
                echo: input.message,
            })
        })
        .build()?;

    let broker = MemoryBroker::new();
    let transport = Arc::new(MemoryTransport::connect(&broker, &worker.topology())?);
    let caller = MemoryCaller::connect(&broker, &config.request_exchange, &config.response_exchange)?;
    let handle = worker.spawn(transport);
    let client = RelayClient::start(Arc::new(caller), config.routing);

    let mut payload = Payload::new();
    payload.insert("message".into(), json!("hello"));
    let response = client.request("echo", payload).await?.finish().await?;
    println!("{} -> {}", response.request_id, response.data); // {"echo":"hello"}

    client.shutdown().await?;
    handle.shutdown();
    handle.join().await?;

    Ok(())
}
