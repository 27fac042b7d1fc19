//! Handler module - event registration and per-request streaming.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps event names to handlers
//! - [`ChunkEmitter`] - lets a running handler stream intermediate chunks
//!
//! # Example
//!
//! ```
//! use relay_worker::handler::{ChunkEmitter, HandlerRegistry};
//! use serde_json::{Map, Value};
//!
//! let mut registry = HandlerRegistry::new();
//!
//! // Echo the payload back as the final result
//! registry.register("echo", |payload: Map<String, Value>, _emit: ChunkEmitter| async move {
//!     Ok(payload)
//! });
//!
//! // Stream a count, then finish
//! registry.register("count", |input: Value, emit: ChunkEmitter| async move {
//!     let n = input["n"].as_u64().unwrap_or(3);
//!     for i in 0..n {
//!         emit.emit(&i).await?;
//!     }
//!     Ok(format!("counted {}", n))
//! });
//!
//! assert!(registry.contains("echo"));
//! assert!(registry.lookup("missing").is_err());
//! ```

mod emitter;
mod registry;

pub use emitter::ChunkEmitter;
pub use registry::{BoxFuture, Handler, HandlerRegistry, HandlerResult, TypedHandler};
