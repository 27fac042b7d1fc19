//! Integration tests for relay-worker.
//!
//! These run a worker and callers against the in-process broker and check
//! what actually crosses the response exchange.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::time::timeout;

use relay_worker::transport::{ExchangeKind, MemoryBroker, MemoryCaller, MemoryTransport, QueueConsumer};
use relay_worker::{
    ChunkEmitter, Payload, RelayClient, RelayError, RoutingMode, Worker, WorkerConfig, WorkerHandle,
};

const WAIT: Duration = Duration::from_secs(5);

struct Relay {
    broker: MemoryBroker,
    config: WorkerConfig,
    handle: WorkerHandle,
}

impl Relay {
    fn start(worker: Worker) -> Self {
        let broker = MemoryBroker::new();
        let config = worker.config().clone();
        let transport = Arc::new(MemoryTransport::connect(&broker, &worker.topology()).unwrap());
        let handle = worker.spawn(transport);
        Self {
            broker,
            config,
            handle,
        }
    }

    fn client(&self) -> RelayClient {
        let caller = MemoryCaller::connect(
            &self.broker,
            &self.config.request_exchange,
            &self.config.response_exchange,
        )
        .unwrap();
        RelayClient::start(Arc::new(caller), self.config.routing)
    }

    /// A raw subscriber on the response exchange.
    fn observe(&self) -> QueueConsumer {
        let queue = self.broker.declare_queue("", true);
        self.broker
            .bind_queue(&queue, &self.config.response_exchange, "")
            .unwrap();
        self.broker.consume(&queue, true).unwrap()
    }

    fn publish_raw(&self, routing_key: &str, body: Value) {
        let bytes = Bytes::from(serde_json::to_vec(&body).unwrap());
        self.broker
            .publish(&self.config.request_exchange, routing_key, bytes)
            .unwrap();
    }

    async fn settled(&self, count: u64) {
        timeout(WAIT, async {
            loop {
                let stats = self.broker.stats();
                if stats.acked + stats.rejected >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("deliveries were not settled in time");
    }

    async fn stop(self) {
        self.handle.shutdown();
        self.handle.join().await.unwrap();
    }
}

async fn next_json(consumer: &mut QueueConsumer) -> Value {
    let delivery = timeout(WAIT, consumer.recv())
        .await
        .expect("timed out waiting for a response")
        .expect("response queue closed");
    serde_json::from_slice(&delivery.body).unwrap()
}

async fn assert_silent(consumer: &mut QueueConsumer) {
    let next = timeout(Duration::from_millis(50), consumer.recv()).await;
    assert!(next.is_err(), "unexpected response: {:?}", next);
}

fn streaming_worker() -> Worker {
    Worker::builder()
        .handle("testRequest", |_: Payload, emit: ChunkEmitter| async move {
            emit.emit("Chunk 1").await?;
            emit.emit("Chunk 2").await?;
            Ok("Final Chunk")
        })
        .build()
        .unwrap()
}

/// The canonical three-envelope stream, observed on the wire.
#[tokio::test]
async fn test_chunk_stream_on_the_wire() {
    let relay = Relay::start(streaming_worker());
    let mut observer = relay.observe();

    relay.publish_raw(
        "",
        json!({ "eventName": "testRequest", "requestId": "abc123", "payload": {} }),
    );

    assert_eq!(
        next_json(&mut observer).await,
        json!({ "requestId": "abc123", "data": "Chunk 1", "isFinal": false })
    );
    assert_eq!(
        next_json(&mut observer).await,
        json!({ "requestId": "abc123", "data": "Chunk 2", "isFinal": false })
    );
    assert_eq!(
        next_json(&mut observer).await,
        json!({ "requestId": "abc123", "data": "Final Chunk", "isFinal": true })
    );
    assert_silent(&mut observer).await;

    relay.settled(1).await;
    assert_eq!(relay.broker.stats().acked, 1);
    assert_eq!(relay.broker.unacked_count(), 0);

    relay.stop().await;
}

#[tokio::test]
async fn test_missing_request_id_is_dropped() {
    let relay = Relay::start(streaming_worker());
    let mut observer = relay.observe();

    relay.publish_raw("", json!({ "eventName": "testRequest", "payload": {} }));
    relay.settled(1).await;

    assert_silent(&mut observer).await;
    let stats = relay.broker.stats();
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.requeued, 0);
    assert_eq!(stats.acked, 0);

    relay.stop().await;
}

#[tokio::test]
async fn test_unregistered_event_is_dropped() {
    let relay = Relay::start(streaming_worker());
    let mut observer = relay.observe();

    relay.publish_raw("", json!({ "eventName": "nope", "requestId": "x1", "payload": {} }));
    relay.settled(1).await;

    assert_silent(&mut observer).await;
    assert_eq!(relay.broker.stats().rejected, 1);

    relay.stop().await;
}

#[tokio::test]
async fn test_malformed_body_is_dropped() {
    let relay = Relay::start(streaming_worker());
    let mut observer = relay.observe();

    relay
        .broker
        .publish(&relay.config.request_exchange, "", Bytes::from_static(b"plain text"))
        .unwrap();
    relay.settled(1).await;

    assert_silent(&mut observer).await;
    relay.stop().await;
}

#[tokio::test]
async fn test_client_round_trip() {
    let relay = Relay::start(streaming_worker());
    let client = relay.client();

    let response = client
        .request("testRequest", Payload::new())
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();

    assert_eq!(response.chunks, vec![json!("Chunk 1"), json!("Chunk 2")]);
    assert_eq!(response.data, json!("Final Chunk"));
    assert_eq!(client.pending_count(), 0);

    client.shutdown().await.unwrap();
    relay.stop().await;
}

#[tokio::test]
async fn test_failure_mid_stream_reaches_client() {
    let worker = Worker::builder()
        .handle("flaky", |_: Payload, emit: ChunkEmitter| async move {
            emit.emit(&"partial").await?;
            Err::<(), _>(anyhow::anyhow!("database timed out"))
        })
        .build()
        .unwrap();
    let relay = Relay::start(worker);
    let client = relay.client();

    let mut stream = client.request("flaky", Payload::new()).await.unwrap();
    let first = stream.next().await.unwrap();
    assert_eq!(first.data(), Some(&json!("partial")));
    let last = stream.next().await.unwrap();
    assert!(last.is_final());
    assert_eq!(last.error(), Some("database timed out"));
    assert!(stream.next().await.is_none());

    client.shutdown().await.unwrap();
    relay.stop().await;
}

#[tokio::test]
async fn test_remote_error_from_finish() {
    let worker = Worker::builder()
        .handle("fail", |_: Payload, _emit| async {
            Err::<(), _>(anyhow::anyhow!("nope"))
        })
        .build()
        .unwrap();
    let relay = Relay::start(worker);
    let client = relay.client();

    let err = client
        .request("fail", Payload::new())
        .await
        .unwrap()
        .finish()
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Remote(msg) if msg == "nope"));

    client.shutdown().await.unwrap();
    relay.stop().await;
}

#[tokio::test]
async fn test_concurrent_requests_do_not_mix() {
    let worker = Worker::builder()
        .handle("tick", |payload: Payload, emit: ChunkEmitter| async move {
            let label = payload["label"].as_str().unwrap_or("?").to_string();
            for i in 0..10 {
                emit.emit(&format!("{}{}", label, i)).await?;
                tokio::task::yield_now().await;
            }
            Ok(label)
        })
        .build()
        .unwrap();
    let relay = Relay::start(worker);
    let client = relay.client();

    let mut a_payload = Payload::new();
    a_payload.insert("label".into(), json!("a"));
    let mut b_payload = Payload::new();
    b_payload.insert("label".into(), json!("b"));

    let a = client.request_with_id("tick", "a", a_payload).await.unwrap();
    let b = client.request_with_id("tick", "b", b_payload).await.unwrap();
    let (a, b) = tokio::join!(a.finish(), b.finish());

    let a = a.unwrap();
    let b = b.unwrap();
    assert_eq!(a.chunks, (0..10).map(|i| json!(format!("a{}", i))).collect::<Vec<_>>());
    assert_eq!(b.chunks, (0..10).map(|i| json!(format!("b{}", i))).collect::<Vec<_>>());
    assert_eq!(a.data, json!("a"));
    assert_eq!(b.data, json!("b"));

    client.shutdown().await.unwrap();
    relay.stop().await;
}

#[tokio::test]
async fn test_every_caller_sees_every_response() {
    let relay = Relay::start(streaming_worker());
    let asking = relay.client();
    let mut bystander = relay.observe();

    asking
        .request_with_id("testRequest", "shared-1", Payload::new())
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();

    for _ in 0..3 {
        assert_eq!(next_json(&mut bystander).await["requestId"], json!("shared-1"));
    }

    asking.shutdown().await.unwrap();
    relay.stop().await;
}

#[tokio::test]
async fn test_per_event_routing() {
    let worker = Worker::builder()
        .handle("double", |input: Value, _emit| async move {
            Ok(input["n"].as_i64().unwrap_or(0) * 2)
        })
        .routing(RoutingMode::PerEvent)
        .queue("per_event_worker")
        .build()
        .unwrap();
    let relay = Relay::start(worker);
    let client = relay.client();

    let mut payload = Payload::new();
    payload.insert("n".into(), json!(21));
    let response = client
        .request("double", payload)
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();
    assert_eq!(response.data, json!(42));

    // No binding for an unregistered event name
    let err = client.request("triple", Payload::new()).await.unwrap_err();
    assert!(matches!(err, RelayError::Transport(_)));

    client.shutdown().await.unwrap();
    relay.stop().await;
}

#[tokio::test]
async fn test_per_event_routing_key_names_the_event() {
    let worker = Worker::builder()
        .handle("testRequest", |_: Payload, emit: ChunkEmitter| async move {
            emit.emit("Chunk 1").await?;
            Ok("Final Chunk")
        })
        .routing(RoutingMode::PerEvent)
        .queue("keyed_worker")
        .build()
        .unwrap();
    let relay = Relay::start(worker);
    let mut observer = relay.observe();

    // Body without eventName; the binding carries it.
    relay.publish_raw("testRequest", json!({ "requestId": "abc123", "payload": {} }));

    assert_eq!(
        next_json(&mut observer).await,
        json!({ "requestId": "abc123", "data": "Chunk 1", "isFinal": false })
    );
    assert_eq!(
        next_json(&mut observer).await,
        json!({ "requestId": "abc123", "data": "Final Chunk", "isFinal": true })
    );

    relay.settled(1).await;
    let stats = relay.broker.stats();
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.rejected, 0);

    relay.stop().await;
}

#[tokio::test]
async fn test_shared_routing_still_needs_event_name() {
    let relay = Relay::start(streaming_worker());
    let mut observer = relay.observe();

    relay.publish_raw("", json!({ "requestId": "abc123", "payload": {} }));
    relay.settled(1).await;

    assert_silent(&mut observer).await;
    assert_eq!(relay.broker.stats().rejected, 1);

    relay.stop().await;
}

#[tokio::test]
async fn test_exchanges_are_declared_with_kinds() {
    let relay = Relay::start(streaming_worker());

    // Re-declaring with the same kinds succeeds, a different kind does not.
    relay
        .broker
        .declare_exchange(&relay.config.request_exchange, ExchangeKind::Direct)
        .unwrap();
    relay
        .broker
        .declare_exchange(&relay.config.response_exchange, ExchangeKind::Fanout)
        .unwrap();
    assert!(relay
        .broker
        .declare_exchange(&relay.config.response_exchange, ExchangeKind::Direct)
        .is_err());

    relay.stop().await;
}

#[tokio::test]
async fn test_shutdown_releases_consumer() {
    let relay = Relay::start(streaming_worker());
    let broker = relay.broker.clone();
    let queue = relay.config.queue.clone();

    relay.stop().await;

    // Queue survives, and a new worker can attach to it.
    assert!(broker.has_queue(&queue));
    let consumer = broker.consume(&queue, false);
    assert!(consumer.is_ok());
}

#[tokio::test]
async fn test_request_queued_before_worker_starts() {
    let broker = MemoryBroker::new();
    let worker = streaming_worker();
    let config = worker.config().clone();
    let transport = Arc::new(MemoryTransport::connect(&broker, &worker.topology()).unwrap());

    let caller = MemoryCaller::connect(&broker, &config.request_exchange, &config.response_exchange)
        .unwrap();
    let client = RelayClient::start(Arc::new(caller), config.routing);
    let stream = client.request("testRequest", Payload::new()).await.unwrap();

    let handle = worker.spawn(transport);
    let response = stream.finish().await.unwrap();
    assert_eq!(response.data, json!("Final Chunk"));

    client.shutdown().await.unwrap();
    handle.shutdown();
    handle.join().await.unwrap();
}
