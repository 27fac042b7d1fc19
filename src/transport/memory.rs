//! In-process broker with AMQP-style exchanges and queues.
//!
//! - Exchanges are `direct` (deliver to queues whose binding key equals the
//!   routing key) or `fanout` (deliver to every bound queue).
//! - Queues buffer messages until a consumer takes them. A queue has at
//!   most one consumer; when the consumer goes away, its unacked messages
//!   are requeued with `redelivered` set. Exclusive queues are deleted
//!   instead.
//! - Deliveries taken by an acking consumer stay unacked until
//!   [`MemoryBroker::ack`] or [`MemoryBroker::reject`].
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use relay_worker::transport::{ExchangeKind, MemoryBroker};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> relay_worker::Result<()> {
//! let broker = MemoryBroker::new();
//! broker.declare_exchange("responses", ExchangeKind::Fanout)?;
//! let queue = broker.declare_queue("", true);
//! broker.bind_queue(&queue, "responses", "")?;
//!
//! let mut consumer = broker.consume(&queue, true)?;
//! broker.publish("responses", "", Bytes::from_static(b"hi"))?;
//! assert_eq!(&consumer.recv().await.unwrap().body[..], b"hi");
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::ready;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{CallerTransport, Delivery, ResponseSink, Topology, Transport};
use crate::error::{RelayError, Result};
use crate::handler::BoxFuture;

/// Routing behaviour of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

/// Counters for observing broker traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Publish calls accepted by an existing exchange.
    pub published: u64,
    /// Copies placed on queues.
    pub routed: u64,
    /// Publishes that matched no queue.
    pub unroutable: u64,
    pub acked: u64,
    pub rejected: u64,
    pub requeued: u64,
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct Exchange {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

struct QueueEntry {
    tx: mpsc::UnboundedSender<Delivery>,
    /// Taken while a consumer is attached.
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
    exclusive: bool,
}

struct Unacked {
    queue: String,
    delivery: Delivery,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, QueueEntry>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    next_queue: u64,
    stats: BrokerStats,
}

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        // State stays consistent across a panicking holder: every mutation
        // is a single insert/remove.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Declare an exchange. Re-declaring with the same kind is a no-op.
    ///
    /// # Errors
    ///
    /// Fails for an empty name or a kind that differs from an earlier
    /// declaration.
    pub fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        if name.is_empty() {
            return Err(RelayError::Transport("exchange name must not be empty".into()));
        }

        let mut state = self.state();
        match state.exchanges.get(name).map(|e| e.kind) {
            Some(existing) if existing != kind => Err(RelayError::Transport(format!(
                "exchange '{}' already declared as {:?}",
                name, existing
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    Exchange {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                tracing::debug!(exchange = name, ?kind, "exchange declared");
                Ok(())
            }
        }
    }

    /// Declare a queue and return its name. An empty name asks the broker to
    /// generate one.
    pub fn declare_queue(&self, name: &str, exclusive: bool) -> String {
        let mut state = self.state();
        let name = if name.is_empty() {
            state.next_queue += 1;
            format!("amq.gen-{}", state.next_queue)
        } else {
            name.to_string()
        };

        state.queues.entry(name.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            QueueEntry {
                tx,
                rx: Some(rx),
                exclusive,
            }
        });
        name
    }

    /// Bind a queue to an exchange. Duplicate bindings are ignored.
    ///
    /// # Errors
    ///
    /// Fails if either the queue or the exchange does not exist.
    pub fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.state();
        if !state.queues.contains_key(queue) {
            return Err(RelayError::Transport(format!("no queue '{}'", queue)));
        }
        let target = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| RelayError::Transport(format!("no exchange '{}'", exchange)))?;

        let exists = target
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !exists {
            target.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    /// Attach the single consumer of a queue.
    ///
    /// With `no_ack`, deliveries count as acknowledged when received.
    ///
    /// # Errors
    ///
    /// Fails if the queue does not exist or already has a consumer.
    pub fn consume(&self, queue: &str, no_ack: bool) -> Result<QueueConsumer> {
        let mut state = self.state();
        let entry = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| RelayError::Transport(format!("no queue '{}'", queue)))?;
        let rx = entry.rx.take().ok_or_else(|| {
            RelayError::Transport(format!("queue '{}' already has a consumer", queue))
        })?;

        Ok(QueueConsumer {
            broker: self.clone(),
            queue: queue.to_string(),
            rx: Some(rx),
            no_ack,
        })
    }

    /// Publish a body and return how many queues received a copy.
    ///
    /// Unroutable messages are dropped, as a broker does for non-mandatory
    /// publishes.
    ///
    /// # Errors
    ///
    /// Fails if the exchange does not exist.
    pub fn publish(&self, exchange: &str, routing_key: &str, body: Bytes) -> Result<usize> {
        let mut guard = self.state();
        let state = &mut *guard;

        let target = state
            .exchanges
            .get(exchange)
            .ok_or_else(|| RelayError::Transport(format!("no exchange '{}'", exchange)))?;

        let mut queues: Vec<&str> = target
            .bindings
            .iter()
            .filter(|b| target.kind == ExchangeKind::Fanout || b.routing_key == routing_key)
            .map(|b| b.queue.as_str())
            .collect();
        // One copy per queue even when bound under several keys
        queues.sort_unstable();
        queues.dedup();

        state.stats.published += 1;
        let mut routed = 0usize;
        for queue in queues {
            let Some(entry) = state.queues.get(queue) else {
                continue;
            };
            state.next_tag += 1;
            let delivery = Delivery {
                delivery_tag: state.next_tag,
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                body: body.clone(),
                redelivered: false,
            };
            if entry.tx.send(delivery).is_ok() {
                routed += 1;
            }
        }

        if routed == 0 {
            state.stats.unroutable += 1;
            tracing::debug!(exchange, routing_key, "message unroutable, dropped");
        }
        state.stats.routed += routed as u64;
        Ok(routed)
    }

    /// Acknowledge a delivery.
    ///
    /// # Errors
    ///
    /// Fails for an unknown or already settled tag.
    pub fn ack(&self, delivery_tag: u64) -> Result<()> {
        let mut state = self.state();
        state
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| RelayError::Transport(format!("unknown delivery tag {}", delivery_tag)))?;
        state.stats.acked += 1;
        Ok(())
    }

    /// Reject a delivery, optionally putting it back on its queue.
    ///
    /// # Errors
    ///
    /// Fails for an unknown or already settled tag.
    pub fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let mut guard = self.state();
        let state = &mut *guard;
        let Unacked { queue, mut delivery } = state
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| RelayError::Transport(format!("unknown delivery tag {}", delivery_tag)))?;
        state.stats.rejected += 1;

        if requeue {
            delivery.redelivered = true;
            if let Some(entry) = state.queues.get(&queue) {
                if entry.tx.send(delivery).is_ok() {
                    state.stats.requeued += 1;
                }
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> BrokerStats {
        self.state().stats
    }

    /// Deliveries handed to acking consumers and not yet settled.
    pub fn unacked_count(&self) -> usize {
        self.state().unacked.len()
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.state().queues.contains_key(queue)
    }

    fn track(&self, queue: &str, delivery: &Delivery) {
        self.state().unacked.insert(
            delivery.delivery_tag,
            Unacked {
                queue: queue.to_string(),
                delivery: delivery.clone(),
            },
        );
    }

    /// Consumer went away: exclusive queues are deleted, others get their
    /// receiver back and their unacked messages requeued.
    fn release_consumer(&self, queue: &str, rx: mpsc::UnboundedReceiver<Delivery>) {
        let mut guard = self.state();
        let state = &mut *guard;

        let pending: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.queue == queue)
            .map(|(tag, _)| *tag)
            .collect();

        let exclusive = state.queues.get(queue).map_or(true, |e| e.exclusive);
        if exclusive {
            state.queues.remove(queue);
            for exchange in state.exchanges.values_mut() {
                exchange.bindings.retain(|b| b.queue != queue);
            }
            for tag in pending {
                state.unacked.remove(&tag);
            }
            tracing::debug!(queue, "exclusive queue deleted");
            return;
        }

        let Some(entry) = state.queues.get_mut(queue) else {
            return;
        };
        for tag in pending {
            if let Some(Unacked { mut delivery, .. }) = state.unacked.remove(&tag) {
                delivery.redelivered = true;
                if entry.tx.send(delivery).is_ok() {
                    state.stats.requeued += 1;
                }
            }
        }
        entry.rx = Some(rx);
    }
}

/// The consumer attached to one queue.
pub struct QueueConsumer {
    broker: MemoryBroker,
    queue: String,
    rx: Option<mpsc::UnboundedReceiver<Delivery>>,
    no_ack: bool,
}

impl QueueConsumer {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait for the next delivery. `None` once the queue is deleted.
    ///
    /// Cancel-safe: a delivery is only tracked after it has been received.
    pub async fn recv(&mut self) -> Option<Delivery> {
        let rx = self.rx.as_mut()?;
        let delivery = rx.recv().await?;
        if !self.no_ack {
            self.broker.track(&self.queue, &delivery);
        }
        Some(delivery)
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() {
            self.broker.release_consumer(&self.queue, rx);
        }
    }
}

/// Worker-side [`Transport`] over a [`MemoryBroker`].
pub struct MemoryTransport {
    broker: MemoryBroker,
    response_exchange: String,
    consumer: tokio::sync::Mutex<Option<QueueConsumer>>,
}

impl MemoryTransport {
    /// Declare the topology and attach to the worker queue.
    ///
    /// # Errors
    ///
    /// Fails if an exchange exists with a conflicting kind or the worker
    /// queue already has a consumer.
    pub fn connect(broker: &MemoryBroker, topology: &Topology) -> Result<Self> {
        broker.declare_exchange(&topology.request_exchange, ExchangeKind::Direct)?;
        broker.declare_exchange(&topology.response_exchange, ExchangeKind::Fanout)?;

        let queue = broker.declare_queue(&topology.queue, false);
        for key in &topology.routing_keys {
            broker.bind_queue(&queue, &topology.request_exchange, key)?;
        }
        let consumer = broker.consume(&queue, false)?;

        tracing::info!(
            queue = %queue,
            request_exchange = %topology.request_exchange,
            response_exchange = %topology.response_exchange,
            bindings = topology.routing_keys.len(),
            "memory transport connected"
        );

        Ok(Self {
            broker: broker.clone(),
            response_exchange: topology.response_exchange.clone(),
            consumer: tokio::sync::Mutex::new(Some(consumer)),
        })
    }
}

impl ResponseSink for MemoryTransport {
    fn publish(&self, body: Bytes) -> BoxFuture<'_, Result<()>> {
        let result = self
            .broker
            .publish(&self.response_exchange, "", body)
            .map(|_| ());
        Box::pin(ready(result))
    }
}

impl Transport for MemoryTransport {
    fn next_delivery(&self) -> BoxFuture<'_, Result<Option<Delivery>>> {
        Box::pin(async move {
            let mut consumer = self.consumer.lock().await;
            match consumer.as_mut() {
                Some(c) => Ok(c.recv().await),
                None => Ok(None),
            }
        })
    }

    fn ack(&self, delivery_tag: u64) -> BoxFuture<'_, Result<()>> {
        Box::pin(ready(self.broker.ack(delivery_tag)))
    }

    fn reject(&self, delivery_tag: u64, requeue: bool) -> BoxFuture<'_, Result<()>> {
        Box::pin(ready(self.broker.reject(delivery_tag, requeue)))
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            // Dropping the consumer requeues anything still unacked
            self.consumer.lock().await.take();
            Ok(())
        })
    }
}

/// Caller-side [`CallerTransport`] over a [`MemoryBroker`].
///
/// Owns an exclusive, auto-named queue bound to the response exchange, so
/// every caller sees every response.
pub struct MemoryCaller {
    broker: MemoryBroker,
    request_exchange: String,
    consumer: tokio::sync::Mutex<Option<QueueConsumer>>,
}

impl MemoryCaller {
    /// Declare both exchanges and subscribe to the response exchange.
    ///
    /// # Errors
    ///
    /// Fails if an exchange exists with a conflicting kind.
    pub fn connect(
        broker: &MemoryBroker,
        request_exchange: &str,
        response_exchange: &str,
    ) -> Result<Self> {
        broker.declare_exchange(request_exchange, ExchangeKind::Direct)?;
        broker.declare_exchange(response_exchange, ExchangeKind::Fanout)?;

        let queue = broker.declare_queue("", true);
        broker.bind_queue(&queue, response_exchange, "")?;
        let consumer = broker.consume(&queue, true)?;

        Ok(Self {
            broker: broker.clone(),
            request_exchange: request_exchange.to_string(),
            consumer: tokio::sync::Mutex::new(Some(consumer)),
        })
    }
}

impl CallerTransport for MemoryCaller {
    fn publish_request<'a>(
        &'a self,
        routing_key: &'a str,
        body: Bytes,
    ) -> BoxFuture<'a, Result<()>> {
        // Behaves like a mandatory publish: nobody listening is an error
        // rather than a request that never gets an answer.
        let result = match self.broker.publish(&self.request_exchange, routing_key, body) {
            Ok(0) => Err(RelayError::Transport(format!(
                "no queue bound to '{}' for routing key '{}'",
                self.request_exchange, routing_key
            ))),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        Box::pin(ready(result))
    }

    fn next_response(&self) -> BoxFuture<'_, Result<Option<bytes::Bytes>>> {
        Box::pin(async move {
            let mut consumer = self.consumer.lock().await;
            match consumer.as_mut() {
                Some(c) => Ok(c.recv().await.map(|d| d.body)),
                None => Ok(None),
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.consumer.lock().await.take();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker_with_exchanges() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.declare_exchange("requests", ExchangeKind::Direct).unwrap();
        broker.declare_exchange("responses", ExchangeKind::Fanout).unwrap();
        broker
    }

    #[test]
    fn test_redeclare_exchange() {
        let broker = broker_with_exchanges();
        assert!(broker.declare_exchange("requests", ExchangeKind::Direct).is_ok());
        assert!(broker.declare_exchange("requests", ExchangeKind::Fanout).is_err());
        assert!(broker.declare_exchange("", ExchangeKind::Direct).is_err());
    }

    #[test]
    fn test_auto_named_queues_are_unique() {
        let broker = MemoryBroker::new();
        let a = broker.declare_queue("", true);
        let b = broker.declare_queue("", true);
        assert_ne!(a, b);
        assert!(a.starts_with("amq.gen-"));
    }

    #[tokio::test]
    async fn test_direct_routes_by_key() {
        let broker = broker_with_exchanges();
        let q1 = broker.declare_queue("q1", false);
        let q2 = broker.declare_queue("q2", false);
        broker.bind_queue(&q1, "requests", "alpha").unwrap();
        broker.bind_queue(&q2, "requests", "beta").unwrap();

        assert_eq!(broker.publish("requests", "alpha", Bytes::from_static(b"a")).unwrap(), 1);
        assert_eq!(broker.publish("requests", "gamma", Bytes::from_static(b"g")).unwrap(), 0);

        let mut c1 = broker.consume(&q1, true).unwrap();
        assert_eq!(&c1.recv().await.unwrap().body[..], b"a");

        let stats = broker.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.routed, 1);
        assert_eq!(stats.unroutable, 1);
    }

    #[tokio::test]
    async fn test_fanout_copies_to_every_queue() {
        let broker = broker_with_exchanges();
        let q1 = broker.declare_queue("", true);
        let q2 = broker.declare_queue("", true);
        broker.bind_queue(&q1, "responses", "").unwrap();
        broker.bind_queue(&q2, "responses", "ignored").unwrap();

        assert_eq!(broker.publish("responses", "any", Bytes::from_static(b"x")).unwrap(), 2);

        let mut c1 = broker.consume(&q1, true).unwrap();
        let mut c2 = broker.consume(&q2, true).unwrap();
        assert_eq!(&c1.recv().await.unwrap().body[..], b"x");
        assert_eq!(&c2.recv().await.unwrap().body[..], b"x");
    }

    #[test]
    fn test_publish_to_unknown_exchange() {
        let broker = MemoryBroker::new();
        assert!(broker.publish("nope", "", Bytes::new()).is_err());
    }

    #[test]
    fn test_single_consumer_per_queue() {
        let broker = MemoryBroker::new();
        let q = broker.declare_queue("work", false);
        let _first = broker.consume(&q, false).unwrap();
        assert!(broker.consume(&q, false).is_err());
    }

    #[tokio::test]
    async fn test_ack_and_reject_settle_deliveries() {
        let broker = broker_with_exchanges();
        let q = broker.declare_queue("work", false);
        broker.bind_queue(&q, "requests", "").unwrap();
        broker.publish("requests", "", Bytes::from_static(b"1")).unwrap();
        broker.publish("requests", "", Bytes::from_static(b"2")).unwrap();

        let mut consumer = broker.consume(&q, false).unwrap();
        let first = consumer.recv().await.unwrap();
        let second = consumer.recv().await.unwrap();
        assert_eq!(broker.unacked_count(), 2);

        broker.ack(first.delivery_tag).unwrap();
        broker.reject(second.delivery_tag, false).unwrap();
        assert_eq!(broker.unacked_count(), 0);
        assert!(broker.ack(first.delivery_tag).is_err());

        let stats = broker.stats();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.requeued, 0);
    }

    #[tokio::test]
    async fn test_reject_with_requeue_redelivers() {
        let broker = broker_with_exchanges();
        let q = broker.declare_queue("work", false);
        broker.bind_queue(&q, "requests", "").unwrap();
        broker.publish("requests", "", Bytes::from_static(b"again")).unwrap();

        let mut consumer = broker.consume(&q, false).unwrap();
        let delivery = consumer.recv().await.unwrap();
        assert!(!delivery.redelivered);
        broker.reject(delivery.delivery_tag, true).unwrap();

        let again = consumer.recv().await.unwrap();
        assert!(again.redelivered);
        assert_eq!(&again.body[..], b"again");
    }

    #[tokio::test]
    async fn test_dropped_consumer_requeues_unacked() {
        let broker = broker_with_exchanges();
        let q = broker.declare_queue("work", false);
        broker.bind_queue(&q, "requests", "").unwrap();
        broker.publish("requests", "", Bytes::from_static(b"inflight")).unwrap();

        let mut consumer = broker.consume(&q, false).unwrap();
        let _ = consumer.recv().await.unwrap();
        drop(consumer);
        assert_eq!(broker.unacked_count(), 0);

        let mut consumer = broker.consume(&q, false).unwrap();
        let delivery = consumer.recv().await.unwrap();
        assert!(delivery.redelivered);
        assert_eq!(broker.stats().requeued, 1);
    }

    #[test]
    fn test_dropped_exclusive_consumer_deletes_queue() {
        let broker = broker_with_exchanges();
        let q = broker.declare_queue("", true);
        broker.bind_queue(&q, "responses", "").unwrap();

        let consumer = broker.consume(&q, true).unwrap();
        drop(consumer);

        assert!(!broker.has_queue(&q));
        assert_eq!(broker.publish("responses", "", Bytes::new()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transport_and_caller_round_trip() {
        let broker = MemoryBroker::new();
        let topology = Topology {
            request_exchange: "requests".into(),
            response_exchange: "responses".into(),
            queue: "worker".into(),
            routing_keys: vec![String::new()],
        };
        let transport = MemoryTransport::connect(&broker, &topology).unwrap();
        let caller = MemoryCaller::connect(&broker, "requests", "responses").unwrap();

        caller
            .publish_request("", Bytes::from_static(b"req"))
            .await
            .unwrap();
        let delivery = transport.next_delivery().await.unwrap().unwrap();
        assert_eq!(&delivery.body[..], b"req");

        transport.publish(Bytes::from_static(b"resp")).await.unwrap();
        transport.ack(delivery.delivery_tag).await.unwrap();

        let response = caller.next_response().await.unwrap().unwrap();
        assert_eq!(&response[..], b"resp");
        assert_eq!(broker.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_caller_publish_unroutable_is_error() {
        let broker = MemoryBroker::new();
        let caller = MemoryCaller::connect(&broker, "requests", "responses").unwrap();
        let result = caller
            .publish_request("nobody", Bytes::from_static(b"{}"))
            .await;
        assert!(matches!(result, Err(RelayError::Transport(_))));
    }

    #[tokio::test]
    async fn test_closed_transport_yields_none() {
        let broker = MemoryBroker::new();
        let topology = Topology {
            request_exchange: "requests".into(),
            response_exchange: "responses".into(),
            queue: "worker".into(),
            routing_keys: vec![String::new()],
        };
        let transport = MemoryTransport::connect(&broker, &topology).unwrap();
        transport.close().await.unwrap();
        assert!(transport.next_delivery().await.unwrap().is_none());
        // Durable queue survives the consumer
        assert!(broker.has_queue("worker"));
    }
}
