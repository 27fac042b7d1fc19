//! Handler registry for routing requests by event name.
//!
//! The registry is filled once at startup and then shared read-only (behind
//! an `Arc`) with every request task, so lookups need no lock.
//!
//! # Example
//!
//! ```
//! use relay_worker::handler::{ChunkEmitter, HandlerRegistry};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct Greet {
//!     name: String,
//! }
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register("greet", |input: Greet, _emit: ChunkEmitter| async move {
//!     Ok(format!("hello {}", input.name))
//! });
//!
//! assert_eq!(registry.event_names(), vec!["greet"]);
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::ChunkEmitter;
use crate::envelope::Payload;
use crate::error::{RelayError, Result};

/// Result type for handler functions.
///
/// Any error converts with `?`; its message (including context) becomes the
/// `error` field of the final response.
pub type HandlerResult<T = Value> = anyhow::Result<T>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle a request payload. The returned value becomes the `data` of
    /// the final response.
    fn call(&self, payload: Payload, emitter: ChunkEmitter) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that deserializes the payload before calling the handler and
/// serializes its result afterwards.
pub struct TypedHandler<F, T, R, Fut>
where
    F: Fn(T, ChunkEmitter) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = HandlerResult<R>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> (R, Fut)>,
}

impl<F, T, R, Fut> TypedHandler<F, T, R, Fut>
where
    F: Fn(T, ChunkEmitter) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = HandlerResult<R>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> Handler for TypedHandler<F, T, R, Fut>
where
    F: Fn(T, ChunkEmitter) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = HandlerResult<R>> + Send + 'static,
{
    fn call(&self, payload: Payload, emitter: ChunkEmitter) -> BoxFuture<'static, HandlerResult> {
        let input: T = match serde_json::from_value(Value::Object(payload)) {
            Ok(v) => v,
            Err(e) => {
                let err = anyhow::Error::new(e).context("invalid payload");
                return Box::pin(async move { Err(err) });
            }
        };

        let fut = (self.handler)(input, emitter);
        Box::pin(async move {
            let result = fut.await?;
            Ok(serde_json::to_value(result)?)
        })
    }
}

/// Registry mapping event names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Box<dyn Handler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event name.
    ///
    /// The handler receives the payload decoded into `T` and the request's
    /// [`ChunkEmitter`]. Registering the same name twice replaces the
    /// earlier handler.
    pub fn register<F, T, R, Fut>(&mut self, event_name: &str, handler: F)
    where
        F: Fn(T, ChunkEmitter) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = HandlerResult<R>> + Send + 'static,
    {
        self.register_handler(event_name, TypedHandler::new(handler));
    }

    /// Register a custom [`Handler`] implementation.
    pub fn register_handler<H: Handler>(&mut self, event_name: &str, handler: H) {
        let replaced = self
            .handlers
            .insert(event_name.to_string(), Box::new(handler))
            .is_some();
        if replaced {
            tracing::warn!(event_name, "handler re-registered, previous one replaced");
        } else {
            tracing::debug!(event_name, "handler registered");
        }
    }

    /// Find the handler for an event name.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::HandlerNotFound`] for unregistered names.
    pub fn lookup(&self, event_name: &str) -> Result<&dyn Handler> {
        self.get(event_name)
            .ok_or_else(|| RelayError::HandlerNotFound(event_name.to_string()))
    }

    pub fn get(&self, event_name: &str) -> Option<&dyn Handler> {
        self.handlers.get(event_name).map(|h| h.as_ref())
    }

    pub fn contains(&self, event_name: &str) -> bool {
        self.handlers.contains_key(event_name)
    }

    /// Registered event names, sorted.
    pub fn event_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
