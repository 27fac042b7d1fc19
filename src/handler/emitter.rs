//! Per-request chunk emitter for handlers.
//!
//! A [`ChunkEmitter`] is created by the dispatcher for every request, bound
//! to that request's id, and handed to the handler alongside the payload.
//! Each `emit` publishes one non-final response envelope.
//!
//! # Example
//!
//! ```ignore
//! async fn progress(payload: Payload, emit: ChunkEmitter) -> HandlerResult<String> {
//!     for step in 1..=3 {
//!         emit.emit(&format!("step {step}")).await?;
//!     }
//!     Ok("done".into())
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::codec::JsonCodec;
use crate::envelope::ResponseEnvelope;
use crate::error::{RelayError, Result};
use crate::publisher::Publisher;

/// Sends intermediate chunks for one request.
///
/// # Ordering
///
/// Emits from clones of the same emitter are serialized by a fair lock held
/// until the envelope is queued, so chunks are published in the order they
/// were issued. Once the dispatcher has closed the emitter, every `emit`
/// fails with [`RelayError::EmitterClosed`].
#[derive(Clone)]
pub struct ChunkEmitter {
    inner: Arc<EmitterInner>,
}

struct EmitterInner {
    request_id: String,
    /// Publisher for chunks; `None` when detached.
    publisher: Option<Publisher>,
    /// `true` while chunks are accepted. Held across the enqueue.
    open: Mutex<bool>,
    closed: AtomicBool,
}

impl ChunkEmitter {
    /// Create an emitter that accepts and discards chunks (for testing
    /// handlers without a publisher).
    pub fn detached(request_id: impl Into<String>) -> Self {
        Self::build(request_id.into(), None)
    }

    /// Create an emitter that publishes chunks through `publisher`.
    pub fn with_publisher(request_id: impl Into<String>, publisher: Publisher) -> Self {
        Self::build(request_id.into(), Some(publisher))
    }

    fn build(request_id: String, publisher: Option<Publisher>) -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                request_id,
                publisher,
                open: Mutex::new(true),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The request this emitter is bound to.
    #[inline]
    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    /// Send a chunk.
    ///
    /// Serializes `chunk` to JSON and publishes
    /// `{requestId, data: chunk, isFinal: false}`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Json`] if `chunk` cannot be serialized and
    /// [`RelayError::EmitterClosed`] after the final response was sent.
    /// A failed publish is only logged.
    pub async fn emit<T: Serialize + ?Sized>(&self, chunk: &T) -> Result<()> {
        let data = JsonCodec::to_value(chunk)?;
        self.emit_value(data).await
    }

    /// Send a chunk that is already a JSON value.
    pub async fn emit_value(&self, data: Value) -> Result<()> {
        let open = self.inner.open.lock().await;
        if !*open {
            tracing::error!(
                request_id = %self.inner.request_id,
                "chunk emitted after the final response was sent"
            );
            return Err(RelayError::EmitterClosed(self.inner.request_id.clone()));
        }

        let Some(publisher) = &self.inner.publisher else {
            return Ok(());
        };

        let envelope = ResponseEnvelope::chunk(self.inner.request_id.clone(), data);
        if let Err(e) = publisher.send(&envelope).await {
            tracing::error!(
                request_id = %self.inner.request_id,
                "failed to publish chunk: {}",
                e
            );
        }
        Ok(())
    }

    /// Stop accepting chunks. Waits for an in-flight emit to be queued.
    pub(crate) async fn close(&self) {
        let mut open = self.inner.open.lock().await;
        *open = false;
        self.inner.closed.store(true, Ordering::Release);
    }

    /// Whether the final response for this request has been sent.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ChunkEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkEmitter")
            .field("request_id", &self.inner.request_id)
            .field("detached", &self.inner.publisher.is_none())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::BoxFuture;
    use crate::publisher::{spawn_publisher_task, PublisherConfig};
    use crate::transport::ResponseSink;
    use bytes::Bytes;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct CollectSink {
        bodies: std::sync::Mutex<Vec<Bytes>>,
    }

    impl ResponseSink for CollectSink {
        fn publish(&self, body: Bytes) -> BoxFuture<'_, Result<()>> {
            Box::pin(async move {
                self.bodies.lock().unwrap().push(body);
                Ok(())
            })
        }
    }

    #[test]
    fn test_emitter_creation() {
        let emitter = ChunkEmitter::detached("req-1");
        assert_eq!(emitter.request_id(), "req-1");
        assert!(!emitter.is_closed());
    }

    #[tokio::test]
    async fn test_detached_emit_is_ok() {
        let emitter = ChunkEmitter::detached("req-1");

        assert!(emitter.emit(&1i32).await.is_ok());
        assert!(emitter.emit("text").await.is_ok());
        assert!(emitter.emit_value(json!({ "k": "v" })).await.is_ok());
    }

    #[tokio::test]
    async fn test_emit_after_close_fails() {
        let emitter = ChunkEmitter::detached("req-1");
        emitter.close().await;

        assert!(emitter.is_closed());
        let result = emitter.emit(&"late").await;
        assert!(matches!(result, Err(RelayError::EmitterClosed(id)) if id == "req-1"));
    }

    #[tokio::test]
    async fn test_close_is_shared_by_clones() {
        let emitter = ChunkEmitter::detached("req-1");
        let kept_by_handler = emitter.clone();
        emitter.close().await;

        assert!(kept_by_handler.is_closed());
        assert!(kept_by_handler.emit(&1).await.is_err());
    }

    #[tokio::test]
    async fn test_emit_with_publisher() {
        let sink = Arc::new(CollectSink::default());
        let (publisher, task) =
            spawn_publisher_task(sink.clone(), PublisherConfig::default(), CancellationToken::new());

        let emitter = ChunkEmitter::with_publisher("abc", publisher);
        emitter.emit("Chunk 1").await.unwrap();
        emitter.emit("Chunk 2").await.unwrap();
        drop(emitter);
        task.await.unwrap();

        let bodies = sink.bodies.lock().unwrap().clone();
        let values: Vec<Value> = bodies
            .iter()
            .map(|b| serde_json::from_slice(b).unwrap())
            .collect();
        assert_eq!(
            values,
            vec![
                json!({ "requestId": "abc", "data": "Chunk 1", "isFinal": false }),
                json!({ "requestId": "abc", "data": "Chunk 2", "isFinal": false }),
            ]
        );
    }

    #[tokio::test]
    async fn test_publish_failure_is_not_surfaced() {
        let sink = Arc::new(CollectSink::default());
        let token = CancellationToken::new();
        let (publisher, task) =
            spawn_publisher_task(sink, PublisherConfig::default(), token.clone());
        token.cancel();
        task.await.unwrap();

        let emitter = ChunkEmitter::with_publisher("abc", publisher);
        assert!(emitter.emit(&1).await.is_ok());
    }
}
