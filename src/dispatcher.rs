//! Request dispatch: routing, handler invocation, and the final envelope.
//!
//! Per request the dispatcher moves through
//! `RECEIVED -> ROUTED -> RUNNING -> COMPLETED`. A body that cannot be
//! decoded, or that names an unregistered event, is dropped with an error
//! log and nothing is published. Every request that reaches `RUNNING`
//! produces exactly one final envelope, published after all of the
//! handler's chunks.

use std::any::Any;
use std::sync::Arc;

use tracing::Instrument;

use crate::codec::decode_body;
use crate::envelope::{decode_request_routed, RequestEnvelope, ResponseEnvelope};
use crate::handler::{ChunkEmitter, HandlerRegistry, HandlerResult};
use crate::publisher::Publisher;

/// Why a delivery produced no response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Body was not a valid request envelope.
    Decode,
    /// No handler registered for the event name.
    Routing,
}

/// Result of dispatching one inbound body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler ran and a final envelope was enqueued.
    Completed { request_id: String, success: bool },
    /// Nothing was published.
    Dropped(DropReason),
}

impl DispatchOutcome {
    /// Whether the delivery should be acknowledged (as opposed to
    /// rejected without requeue).
    pub fn should_ack(&self) -> bool {
        matches!(self, DispatchOutcome::Completed { .. })
    }
}

/// Routes requests to handlers and publishes their responses.
///
/// Cheap to clone; each clone shares the registry and the publisher.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    publisher: Publisher,
}

impl Dispatcher {
    pub fn new(registry: Arc<HandlerRegistry>, publisher: Publisher) -> Self {
        Self {
            registry,
            publisher,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Decode an inbound body and dispatch it.
    pub async fn dispatch_bytes(&self, body: &[u8]) -> DispatchOutcome {
        self.dispatch_bytes_routed(body, None).await
    }

    /// Like [`dispatch_bytes`](Self::dispatch_bytes), with the delivery's
    /// routing key standing in for a missing `eventName`.
    pub async fn dispatch_bytes_routed(
        &self,
        body: &[u8],
        routing_key: Option<&str>,
    ) -> DispatchOutcome {
        match decode_request_routed(body, routing_key) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                tracing::error!(error = %e, body_len = body.len(), "dropping undecodable request");
                tracing::debug!(body = %decode_body(body), "undecodable request body");
                DispatchOutcome::Dropped(DropReason::Decode)
            }
        }
    }

    /// Dispatch a decoded request and wait for its final envelope to be
    /// enqueued.
    pub async fn dispatch(&self, request: RequestEnvelope) -> DispatchOutcome {
        let span = tracing::info_span!(
            "dispatch",
            request_id = %request.request_id,
            event_name = %request.event_name,
        );
        self.run(request).instrument(span).await
    }

    async fn run(&self, request: RequestEnvelope) -> DispatchOutcome {
        let RequestEnvelope {
            event_name,
            request_id,
            payload,
        } = request;

        if let Err(e) = self.registry.lookup(&event_name) {
            tracing::error!("dropping request: {}", e);
            return DispatchOutcome::Dropped(DropReason::Routing);
        }
        tracing::debug!("request routed");

        let emitter = ChunkEmitter::with_publisher(request_id.clone(), self.publisher.clone());

        // Own task, so a panicking handler cannot take the worker down.
        let registry = self.registry.clone();
        let handler_emitter = emitter.clone();
        let task = tokio::spawn(
            async move {
                registry
                    .lookup(&event_name)?
                    .call(payload, handler_emitter)
                    .await
            }
            .in_current_span(),
        );

        let result: HandlerResult = match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(anyhow::anyhow!(
                "handler panicked: {}",
                panic_message(e.into_panic().as_ref())
            )),
            Err(_) => Err(anyhow::anyhow!("handler task was cancelled")),
        };

        // No chunk may follow the final envelope.
        emitter.close().await;

        let (envelope, success) = match result {
            Ok(data) => (ResponseEnvelope::success(request_id.clone(), data), true),
            Err(e) => {
                let message = format!("{:#}", e);
                tracing::warn!(error = %message, "handler failed");
                (ResponseEnvelope::failure(request_id.clone(), message), false)
            }
        };

        if let Err(e) = self.publisher.send(&envelope).await {
            tracing::error!("failed to publish final response: {}", e);
        }
        tracing::debug!(success, "request completed");

        DispatchOutcome::Completed {
            request_id,
            success,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
