//! Dedicated publisher task for response envelopes.
//!
//! Every response (chunk or final) reaches the broker through one task that
//! owns the [`ResponseSink`]. Handlers and the dispatcher hold cloneable
//! [`Publisher`] handles feeding an mpsc queue, so writes to the underlying
//! channel are serialized without a lock around the connection.
//!
//! ```text
//! Request 1 (chunks, final) ─┐
//! Request 2 (chunks, final) ─┼─► mpsc::Sender<OutboundEnvelope> ─► Publisher Task ─► Sink
//! Request N (chunks, final) ─┘
//! ```
//!
//! Publishing is FIFO: envelopes leave in the order they were enqueued. A
//! failed publish is retried with exponential backoff up to
//! [`PublisherConfig::publish_retries`] times, then logged and dropped.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::envelope::{encode_response, ResponseEnvelope};
use crate::error::{RelayError, Result};
use crate::transport::ResponseSink;

/// Default queue capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default number of retries after a failed publish.
pub const DEFAULT_PUBLISH_RETRIES: u32 = 3;

/// Default delay before the first retry; doubles on each attempt.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// An encoded envelope waiting to be published.
#[derive(Debug)]
pub struct OutboundEnvelope {
    /// Correlation id, kept for logging.
    pub request_id: String,
    /// Whether this is the terminal envelope.
    pub is_final: bool,
    /// Encoded body.
    pub body: Bytes,
}

impl OutboundEnvelope {
    pub fn new(envelope: &ResponseEnvelope) -> Self {
        Self {
            request_id: envelope.request_id().to_string(),
            is_final: envelope.is_final(),
            body: encode_response(envelope),
        }
    }
}

/// Configuration for the publisher task.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Channel capacity for the envelope queue.
    pub channel_capacity: usize,
    /// Retries after the first failed attempt.
    pub publish_retries: u32,
    /// Delay before the first retry.
    pub retry_backoff: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            publish_retries: DEFAULT_PUBLISH_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// Handle for enqueueing envelopes. Cheap to clone.
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::Sender<OutboundEnvelope>,
}

impl Publisher {
    /// Enqueue an envelope for publication.
    ///
    /// Resolves once the envelope is queued, not once the broker has it.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::ConnectionClosed`] if the publisher task has
    /// shut down.
    pub async fn send(&self, envelope: &ResponseEnvelope) -> Result<()> {
        self.tx
            .send(OutboundEnvelope::new(envelope))
            .await
            .map_err(|_| RelayError::ConnectionClosed)
    }

    /// Whether the publisher task has stopped accepting envelopes.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the publisher task.
///
/// When `shutdown` is cancelled, the task stops accepting new envelopes,
/// publishes what is already queued, and exits. It also exits once every
/// [`Publisher`] handle has been dropped.
pub fn spawn_publisher_task<S>(
    sink: Arc<S>,
    config: PublisherConfig,
    shutdown: CancellationToken,
) -> (Publisher, JoinHandle<()>)
where
    S: ResponseSink + ?Sized,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let task = tokio::spawn(publisher_loop(rx, sink, config, shutdown));
    (Publisher { tx }, task)
}

async fn publisher_loop<S>(
    mut rx: mpsc::Receiver<OutboundEnvelope>,
    sink: Arc<S>,
    config: PublisherConfig,
    shutdown: CancellationToken,
) where
    S: ResponseSink + ?Sized,
{
    loop {
        let next = tokio::select! {
            biased;
            next = rx.recv() => next,
            _ = shutdown.cancelled() => break,
        };

        match next {
            Some(envelope) => publish_with_retry(sink.as_ref(), envelope, &config).await,
            // All handles dropped
            None => return,
        }
    }

    // Shutdown: refuse new envelopes, flush what is queued.
    rx.close();
    let mut drained = 0usize;
    while let Some(envelope) = rx.recv().await {
        publish_with_retry(sink.as_ref(), envelope, &config).await;
        drained += 1;
    }
    tracing::debug!(drained, "publisher drained queue on shutdown");
}

/// Publish one envelope, retrying with exponential backoff.
async fn publish_with_retry<S>(sink: &S, envelope: OutboundEnvelope, config: &PublisherConfig)
where
    S: ResponseSink + ?Sized,
{
    let mut delay = config.retry_backoff;
    let mut attempt = 0u32;

    loop {
        // Bytes clone is a refcount bump
        match sink.publish(envelope.body.clone()).await {
            Ok(()) => return,
            Err(e) if attempt < config.publish_retries => {
                attempt += 1;
                tracing::warn!(
                    request_id = %envelope.request_id,
                    attempt,
                    "publish failed, retrying in {:?}: {}",
                    delay,
                    e
                );
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
            }
            Err(e) => {
                tracing::error!(
                    request_id = %envelope.request_id,
                    is_final = envelope.is_final,
                    "dropping response after {} attempts: {}",
                    attempt + 1,
                    e
                );
                return;
            }
        }
    }
}
