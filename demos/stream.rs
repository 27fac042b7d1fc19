//! Stream Worker - example of streaming chunks before a final result.
//!
//! This example demonstrates:
//! - Registering a handler that emits chunks with `emit.emit()`
//! - Returning the final result from the handler
//! - Reading the response stream envelope by envelope on the caller side
//!
//! Configuration is read from the environment (a `.env` file is honoured):
//!
//! ```text
//! RABBITMQ_REQUEST_EXCHANGE=requests
//! RABBITMQ_RESPONSE_EXCHANGE=responses
//! RELAY_LOG=debug
//! ```
//!
//! Run with `cargo run --example stream`.

use std::sync::Arc;
use std::time::Duration;

use relay_worker::transport::{MemoryBroker, MemoryCaller, MemoryTransport};
use relay_worker::{telemetry, ChunkEmitter, Payload, RelayClient, ResponseBody, Worker, WorkerConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Input structure for the generate event.
#[derive(Deserialize, Debug)]
struct GenerateInput {
    count: usize,
}

/// Chunk structure sent in the stream.
#[derive(Serialize, Debug)]
struct Chunk {
    index: usize,
    data: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = WorkerConfig::from_env()?;
    telemetry::init(&config.telemetry)?;

    let worker = Worker::builder()
        .config(config.clone())
        .handle("generate", |input: GenerateInput, emit: ChunkEmitter| async move {
            for i in 0..input.count {
                emit.emit(&Chunk {
                    index: i,
                    data: format!("Chunk {}", i),
                })
                .await?;

                // Simulate some work
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            Ok(json!({ "generated": input.count }))
        })
        .build()?;

    let broker = MemoryBroker::new();
    let transport = Arc::new(MemoryTransport::connect(&broker, &worker.topology())?);
    let caller = MemoryCaller::connect(&broker, &config.request_exchange, &config.response_exchange)?;
    let handle = worker.spawn(transport);
    let client = RelayClient::start(Arc::new(caller), config.routing);

    let mut payload = Payload::new();
    payload.insert("count".into(), json!(5));
    let mut stream = client.request("generate", payload).await?;

    while let Some(envelope) = stream.next().await {
        match envelope.body() {
            ResponseBody::Chunk(data) => println!("chunk: {}", data),
            ResponseBody::Success(data) => println!("final: {}", data),
            ResponseBody::Failure(message) => println!("error: {}", message),
        }
    }

    client.shutdown().await?;
    handle.shutdown();
    handle.join().await?;

    Ok(())
}
