//! # relay-worker
//!
//! Request/response relay over a message broker with streaming responses.
//!
//! Callers publish a request envelope to the request exchange. A worker
//! routes it by `eventName` to a registered handler, which may stream any
//! number of chunks before returning a final result. Every chunk and final
//! envelope goes to a fan-out response exchange, correlated by `requestId`.
//!
//! ## Architecture
//!
//! - **Envelope codec** ([`envelope`], [`codec`]): JSON request/response
//!   bodies; string bodies travel raw
//! - **Handlers** ([`handler`]): typed registry plus a per-request
//!   [`ChunkEmitter`]
//! - **Dispatcher** ([`dispatcher`]): one final envelope per handled request,
//!   success or error
//! - **Publisher** ([`publisher`]): single writer task in front of the broker
//! - **Transport** ([`transport`]): broker seam, with an in-process broker
//! - **Worker** / **RelayClient**: the two ends of the relay
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use relay_worker::transport::{MemoryBroker, MemoryCaller, MemoryTransport};
//! use relay_worker::{ChunkEmitter, Payload, RelayClient, Worker};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> relay_worker::Result<()> {
//! let worker = Worker::builder()
//!     .handle("testRequest", |_: Payload, emit: ChunkEmitter| async move {
//!         emit.emit("Chunk 1").await?;
//!         emit.emit("Chunk 2").await?;
//!         Ok("Final Chunk")
//!     })
//!     .build()?;
//!
//! let broker = MemoryBroker::new();
//! let config = worker.config().clone();
//! let transport = Arc::new(MemoryTransport::connect(&broker, &worker.topology())?);
//! let caller = MemoryCaller::connect(&broker, &config.request_exchange, &config.response_exchange)?;
//! let handle = worker.spawn(transport);
//!
//! let client = RelayClient::start(Arc::new(caller), config.routing);
//! let response = client.request("testRequest", Payload::new()).await?.finish().await?;
//! assert_eq!(response.chunks.len(), 2);
//! assert_eq!(response.data, "Final Chunk");
//!
//! client.shutdown().await?;
//! handle.shutdown();
//! handle.join().await?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod publisher;
pub mod telemetry;
pub mod transport;

mod client;
mod worker;

pub use client::{CompletedResponse, RelayClient, ResponseStream};
pub use config::{RoutingMode, WorkerConfig};
pub use envelope::{Payload, RequestEnvelope, ResponseBody, ResponseEnvelope};
pub use error::{DecodeError, RelayError, Result};
pub use handler::{ChunkEmitter, HandlerRegistry, HandlerResult};
pub use worker::{Worker, WorkerBuilder, WorkerHandle};
