//! Caller side of the relay.
//!
//! A [`RelayClient`] publishes request envelopes and demultiplexes the
//! fan-out response stream by `requestId`. Every caller sees every
//! response; envelopes for ids this client did not issue are ignored.
//!
//! ```text
//! request()  ──► CallerTransport::publish_request
//!
//! CallerTransport::next_response ─► router task ─┬─► ResponseStream (id a)
//!                                                ├─► ResponseStream (id b)
//!                                                └─► (unknown id: ignored)
//! ```
//!
//! # Example
//!
//! ```ignore
//! let client = RelayClient::start(Arc::new(caller), RoutingMode::Shared);
//! let mut stream = client.request("count", payload).await?;
//! while let Some(envelope) = stream.next().await {
//!     println!("{:?}", envelope.body());
//! }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RoutingMode;
use crate::envelope::{decode_response, Payload, RequestEnvelope, ResponseBody, ResponseEnvelope};
use crate::error::{RelayError, Result};
use crate::transport::CallerTransport;

type Routes = HashMap<String, mpsc::UnboundedSender<ResponseEnvelope>>;
type PendingMap = Mutex<Routes>;

fn lock(pending: &PendingMap) -> MutexGuard<'_, Routes> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publishes requests and routes responses back to their callers.
pub struct RelayClient {
    transport: Arc<dyn CallerTransport>,
    routing: RoutingMode,
    pending: Arc<PendingMap>,
    shutdown: CancellationToken,
    router: Mutex<Option<JoinHandle<()>>>,
}

impl RelayClient {
    /// Spawn the response router and return the client.
    ///
    /// `routing` must match the worker's so requests reach its queue.
    pub fn start(transport: Arc<dyn CallerTransport>, routing: RoutingMode) -> Self {
        let pending: Arc<PendingMap> = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();
        let router = tokio::spawn(route_responses(
            transport.clone(),
            pending.clone(),
            shutdown.clone(),
        ));

        Self {
            transport,
            routing,
            pending,
            shutdown,
            router: Mutex::new(Some(router)),
        }
    }

    /// Send a request with a fresh UUID v4 `requestId`.
    pub async fn request(&self, event_name: &str, payload: Payload) -> Result<ResponseStream> {
        let request_id = Uuid::new_v4().to_string();
        self.request_with_id(event_name, &request_id, payload).await
    }

    /// Send a request with a caller-chosen `requestId`.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::DuplicateRequest`] if the id is still awaiting
    /// responses, or the transport error if publication fails.
    pub async fn request_with_id(
        &self,
        event_name: &str,
        request_id: &str,
        payload: Payload,
    ) -> Result<ResponseStream> {
        if request_id.is_empty() {
            return Err(RelayError::Config("request id must not be empty".into()));
        }

        // Register before publishing so an early response is not missed.
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut pending = lock(&self.pending);
            if pending.contains_key(request_id) {
                return Err(RelayError::DuplicateRequest(request_id.to_string()));
            }
            pending.insert(request_id.to_string(), tx);
        }

        let envelope = RequestEnvelope::new(event_name, request_id, payload);
        let routing_key = self.routing.routing_key(event_name);
        if let Err(e) = self.transport.publish_request(routing_key, envelope.encode()).await {
            lock(&self.pending).remove(request_id);
            return Err(e);
        }
        tracing::debug!(request_id, event_name, "request published");

        Ok(ResponseStream {
            request_id: request_id.to_string(),
            rx,
            done: false,
            pending: self.pending.clone(),
        })
    }

    /// Number of requests still waiting for their final envelope.
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Stop routing responses and close the transport. Open streams end
    /// without a final envelope.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let router = self
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(router) = router {
            router.await?;
        }
        self.transport.close().await
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn route_responses(
    transport: Arc<dyn CallerTransport>,
    pending: Arc<PendingMap>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = transport.next_response() => next,
        };

        let body = match next {
            Ok(Some(body)) => body,
            Ok(None) => {
                tracing::debug!("response subscription closed");
                break;
            }
            Err(e) => {
                tracing::error!("failed to receive response: {}", e);
                break;
            }
        };

        let envelope = match decode_response(&body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!("ignoring undecodable response: {}", e);
                continue;
            }
        };

        let mut routes = lock(&pending);
        let id = envelope.request_id().to_string();
        let is_final = envelope.is_final();
        match routes.get(&id).map(|tx| tx.send(envelope).is_ok()) {
            // Receiver gone means the stream was dropped; forget it.
            Some(delivered) if !delivered || is_final => {
                routes.remove(&id);
            }
            Some(_) => {}
            None => tracing::trace!(request_id = %id, "ignoring response for another caller"),
        }
    }

    // Dropping the senders ends every open stream.
    lock(&pending).clear();
}

/// Responses for one request, in publication order.
pub struct ResponseStream {
    request_id: String,
    rx: mpsc::UnboundedReceiver<ResponseEnvelope>,
    done: bool,
    pending: Arc<PendingMap>,
}

/// A request that finished successfully.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedResponse {
    pub request_id: String,
    /// Chunk `data` values in the order they were emitted.
    pub chunks: Vec<Value>,
    /// Final `data`.
    pub data: Value,
}

impl ResponseStream {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Next envelope, or `None` after the final one (or if the client shut
    /// down first).
    pub async fn next(&mut self) -> Option<ResponseEnvelope> {
        if self.done {
            return None;
        }
        let envelope = self.rx.recv().await;
        match &envelope {
            Some(e) if e.is_final() => self.done = true,
            None => self.done = true,
            _ => {}
        }
        envelope
    }

    /// Collect the whole stream.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Remote`] when the handler failed and
    /// [`RelayError::ConnectionClosed`] if the stream ended without a final
    /// envelope.
    pub async fn finish(mut self) -> Result<CompletedResponse> {
        let mut chunks = Vec::new();
        while let Some(envelope) = self.next().await {
            match envelope.into_body() {
                ResponseBody::Chunk(data) => chunks.push(data),
                ResponseBody::Success(data) => {
                    return Ok(CompletedResponse {
                        request_id: self.request_id.clone(),
                        chunks,
                        data,
                    })
                }
                ResponseBody::Failure(message) => return Err(RelayError::Remote(message)),
            }
        }
        Err(RelayError::ConnectionClosed)
    }
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("request_id", &self.request_id)
            .field("done", &self.done)
            .finish()
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        if !self.done {
            lock(&self.pending).remove(&self.request_id);
        }
    }
}
