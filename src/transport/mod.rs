//! Transport module - the seam between the relay and a message broker.
//!
//! The relay never talks to a broker directly. A worker consumes inbound
//! request bodies through [`Transport`] and publishes response bodies
//! through [`ResponseSink`]; a caller uses [`CallerTransport`]. A
//! deployment backed by RabbitMQ supplies its own implementation of these
//! traits; [`memory`] provides an in-process broker with the same exchange
//! and queue semantics for tests, demos and single-process setups.

pub mod memory;

use bytes::Bytes;

use crate::error::Result;
use crate::handler::BoxFuture;

pub use memory::{BrokerStats, ExchangeKind, MemoryBroker, MemoryCaller, MemoryTransport, QueueConsumer};

/// Exchange and queue layout a worker expects the broker to have.
///
/// Request exchange is `direct`, response exchange is `fanout`. The worker
/// queue is bound to the request exchange once per routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub request_exchange: String,
    pub response_exchange: String,
    pub queue: String,
    pub routing_keys: Vec<String>,
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned tag used to ack or reject.
    pub delivery_tag: u64,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key used at publication.
    pub routing_key: String,
    /// Raw body.
    pub body: Bytes,
    /// Set when the broker delivers the message again after a requeue.
    pub redelivered: bool,
}

/// Accepts encoded response bodies for the response exchange.
pub trait ResponseSink: Send + Sync + 'static {
    /// Publish one body to the response exchange.
    fn publish(&self, body: Bytes) -> BoxFuture<'_, Result<()>>;
}

/// Worker-side broker connection.
///
/// `next_delivery` is only polled from the worker's receive loop; `ack`,
/// `reject` and `publish` are called concurrently from request tasks.
pub trait Transport: ResponseSink {
    /// Wait for the next inbound request. `Ok(None)` means the consumer is
    /// gone and the worker should stop.
    fn next_delivery(&self) -> BoxFuture<'_, Result<Option<Delivery>>>;

    /// Acknowledge a delivery.
    fn ack(&self, delivery_tag: u64) -> BoxFuture<'_, Result<()>>;

    /// Reject a delivery, optionally returning it to its queue.
    fn reject(&self, delivery_tag: u64, requeue: bool) -> BoxFuture<'_, Result<()>>;

    /// Release the connection.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Caller-side broker connection.
pub trait CallerTransport: Send + Sync + 'static {
    /// Publish an encoded request to the request exchange.
    fn publish_request<'a>(&'a self, routing_key: &'a str, body: Bytes)
        -> BoxFuture<'a, Result<()>>;

    /// Wait for the next body on the response exchange.
    fn next_response(&self) -> BoxFuture<'_, Result<Option<Bytes>>>;

    /// Release the connection.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}
