//! Worker builder and receive loop.
//!
//! The [`WorkerBuilder`] provides a fluent API for registering handlers and
//! tuning configuration. A built [`Worker`] consumes deliveries from a
//! [`Transport`]:
//! 1. Spawn the publisher task on the transport's response side
//! 2. Receive deliveries until the shutdown token fires or the consumer ends
//! 3. Dispatch each delivery in its own task, then ack (or reject when
//!    nothing was published)
//! 4. On shutdown, flush queued responses and close the transport
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use relay_worker::transport::{MemoryBroker, MemoryTransport};
//! use relay_worker::{ChunkEmitter, Payload, Worker};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> relay_worker::Result<()> {
//! let worker = Worker::builder()
//!     .handle("echo", |payload: Payload, _emit: ChunkEmitter| async move { Ok(payload) })
//!     .build()?;
//!
//! let broker = MemoryBroker::new();
//! let transport = Arc::new(MemoryTransport::connect(&broker, &worker.topology())?);
//!
//! let handle = worker.spawn(transport);
//! handle.shutdown();
//! handle.join().await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{RoutingMode, WorkerConfig};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::handler::{ChunkEmitter, HandlerRegistry, HandlerResult};
use crate::publisher::spawn_publisher_task;
use crate::transport::{Delivery, Topology, Transport};

/// Builder for configuring and creating a [`Worker`].
pub struct WorkerBuilder {
    registry: HandlerRegistry,
    config: WorkerConfig,
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            config: WorkerConfig::default(),
        }
    }

    /// Register a handler for an event name.
    ///
    /// The handler receives the deserialized payload and the request's
    /// [`ChunkEmitter`]; its return value becomes the final `data`.
    pub fn handle<F, T, R, Fut>(mut self, event_name: &str, handler: F) -> Self
    where
        F: Fn(T, ChunkEmitter) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        self.registry.register(event_name, handler);
        self
    }

    /// Use a prebuilt registry, replacing handlers registered so far.
    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the routing mode.
    ///
    /// Default: [`RoutingMode::Shared`]
    pub fn routing(mut self, routing: RoutingMode) -> Self {
        self.config.routing = routing;
        self
    }

    /// Set the worker queue name.
    pub fn queue(mut self, queue: &str) -> Self {
        self.config.queue = queue.to_string();
        self
    }

    /// Set the request and response exchange names.
    pub fn exchanges(mut self, request_exchange: &str, response_exchange: &str) -> Self {
        self.config.request_exchange = request_exchange.to_string();
        self.config.response_exchange = response_exchange.to_string();
        self
    }

    /// Set the number of retries for a failed publish.
    ///
    /// Default: 3
    pub fn publish_retries(mut self, retries: u32) -> Self {
        self.config.publish_retries = retries;
        self
    }

    /// Set the delay before the first publish retry.
    ///
    /// Default: 100 ms, doubling per attempt. Sub-millisecond values round
    /// up to 1 ms.
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        let millis = backoff.as_nanos().div_ceil(1_000_000);
        self.config.retry_backoff_ms = u64::try_from(millis).unwrap_or(u64::MAX);
        self
    }

    /// Set the response queue capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Validate the configuration and freeze the registry.
    pub fn build(self) -> Result<Worker> {
        self.config.validate()?;
        if self.registry.is_empty() {
            tracing::warn!("building a worker with no handlers");
        }
        Ok(Worker {
            registry: Arc::new(self.registry),
            config: self.config,
        })
    }
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A configured worker, ready to consume from a transport.
pub struct Worker {
    registry: Arc<HandlerRegistry>,
    config: WorkerConfig,
}

impl Worker {
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder::new()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Exchanges, queue and bindings this worker expects.
    pub fn topology(&self) -> Topology {
        self.config.topology(&self.registry)
    }

    /// Consume until `shutdown` is cancelled or the transport ends.
    ///
    /// In-flight handlers are not awaited; responses already queued are
    /// flushed before the transport is closed.
    ///
    /// # Errors
    ///
    /// Returns the transport error that ended the receive loop, if any.
    pub async fn run<T>(&self, transport: Arc<T>, shutdown: CancellationToken) -> Result<()>
    where
        T: Transport + ?Sized,
    {
        let publisher_token = CancellationToken::new();
        let (publisher, publisher_task) = spawn_publisher_task(
            transport.clone(),
            self.config.publisher_config(),
            publisher_token.clone(),
        );
        let dispatcher = Dispatcher::new(self.registry.clone(), publisher);

        tracing::info!(
            queue = %self.config.queue,
            routing = ?self.config.routing,
            handlers = self.registry.len(),
            "worker started"
        );

        let result = receive_loop(&transport, &dispatcher, self.config.routing, &shutdown).await;

        drop(dispatcher);
        publisher_token.cancel();
        if let Err(e) = publisher_task.await {
            tracing::error!("publisher task failed: {}", e);
        }
        if let Err(e) = transport.close().await {
            tracing::warn!("failed to close transport: {}", e);
        }

        tracing::info!("worker stopped");
        result
    }

    /// Run on a background task.
    pub fn spawn<T>(self, transport: Arc<T>) -> WorkerHandle
    where
        T: Transport + ?Sized,
    {
        let token = CancellationToken::new();
        let run_token = token.clone();
        let task = tokio::spawn(async move { self.run(transport, run_token).await });
        WorkerHandle {
            token,
            task: Some(task),
        }
    }
}

async fn receive_loop<T>(
    transport: &Arc<T>,
    dispatcher: &Dispatcher,
    routing: RoutingMode,
    shutdown: &CancellationToken,
) -> Result<()>
where
    T: Transport + ?Sized,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                tracing::info!("shutdown requested");
                return Ok(());
            }
            next = transport.next_delivery() => next,
        };

        let delivery = match next {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                tracing::info!("consumer closed");
                return Ok(());
            }
            Err(e) => {
                tracing::error!("receive failed: {}", e);
                return Err(e);
            }
        };

        let dispatcher = dispatcher.clone();
        let transport = transport.clone();
        tokio::spawn(async move {
            settle(transport.as_ref(), &dispatcher, routing, delivery).await;
        });
    }
}

/// Dispatch one delivery, then ack or reject it.
///
/// Under per-event routing the routing key names the event when the body
/// does not.
async fn settle<T>(transport: &T, dispatcher: &Dispatcher, routing: RoutingMode, delivery: Delivery)
where
    T: Transport + ?Sized,
{
    let tag = delivery.delivery_tag;
    if delivery.redelivered {
        tracing::debug!(delivery_tag = tag, "processing redelivered message");
    }

    let routing_key = match routing {
        RoutingMode::PerEvent => Some(delivery.routing_key.as_str()),
        RoutingMode::Shared => None,
    };
    let outcome = dispatcher
        .dispatch_bytes_routed(&delivery.body, routing_key)
        .await;
    let settled = if outcome.should_ack() {
        transport.ack(tag).await
    } else {
        transport.reject(tag, false).await
    };

    if let Err(e) = settled {
        tracing::warn!(delivery_tag = tag, "failed to settle delivery: {}", e);
    }
}

/// Handle to a worker running on a background task.
///
/// Dropping the handle requests shutdown.
pub struct WorkerHandle {
    token: CancellationToken,
    task: Option<JoinHandle<Result<()>>>,
}

impl WorkerHandle {
    /// Request shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Token that stops the worker when cancelled.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for the worker to stop.
    pub async fn join(mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => task.await?,
            None => Ok(()),
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
