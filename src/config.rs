//! Worker configuration.
//!
//! Values come from the environment (see [`WorkerConfig::from_env`]) or any
//! serde source; every field has a default so a bare environment yields a
//! worker talking to a local broker.
//!
//! | Variable                      | Default                  |
//! |-------------------------------|--------------------------|
//! | `RABBITMQ_REQUEST_EXCHANGE`   | `requests`               |
//! | `RABBITMQ_RESPONSE_EXCHANGE`  | `responses`              |
//! | `RELAY_WORKER_QUEUE`          | `relay_worker`           |
//! | `RELAY_ROUTING`               | `shared`                 |
//! | `RELAY_PUBLISH_RETRIES`       | `3`                      |
//! | `RELAY_RETRY_BACKOFF_MS`      | `100`                    |
//! | `RELAY_CHANNEL_CAPACITY`      | `1024`                   |
//! | `RELAY_LOG`                   | `info`                   |
//! | `RELAY_LOG_FORMAT`            | `compact`                |

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RelayError, Result};
use crate::handler::HandlerRegistry;
use crate::publisher::{
    PublisherConfig, DEFAULT_CHANNEL_CAPACITY, DEFAULT_PUBLISH_RETRIES, DEFAULT_RETRY_BACKOFF,
};
use crate::transport::Topology;

pub const DEFAULT_REQUEST_EXCHANGE: &str = "requests";
pub const DEFAULT_RESPONSE_EXCHANGE: &str = "responses";
pub const DEFAULT_WORKER_QUEUE: &str = "relay_worker";
pub const DEFAULT_LOG_FILTER: &str = "info";

/// How requests reach the worker queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingMode {
    /// One binding with the empty routing key; the worker inspects
    /// `eventName` after decoding.
    #[default]
    Shared,
    /// One binding per registered event name; callers publish with the
    /// event name as routing key.
    PerEvent,
}

impl RoutingMode {
    /// Routing key a caller publishes a request for `event_name` with.
    pub fn routing_key<'a>(&self, event_name: &'a str) -> &'a str {
        match self {
            RoutingMode::Shared => "",
            RoutingMode::PerEvent => event_name,
        }
    }

    /// Keys the worker queue is bound with.
    pub fn binding_keys(&self, registry: &HandlerRegistry) -> Vec<String> {
        match self {
            RoutingMode::Shared => vec![String::new()],
            RoutingMode::PerEvent => registry
                .event_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

impl FromStr for RoutingMode {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" => Ok(RoutingMode::Shared),
            "per-event" | "per_event" => Ok(RoutingMode::PerEvent),
            other => Err(RelayError::Config(format!(
                "unknown routing mode '{}' (expected 'shared' or 'per-event')",
                other
            ))),
        }
    }
}

/// Log output format.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single line output.
    #[default]
    Compact,
    /// Structured JSON suitable for ingestion by logging stacks.
    Json,
}

impl FromStr for LogFormat {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            other => Err(RelayError::Config(format!("unknown log format '{}'", other))),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Compact => f.write_str("compact"),
            LogFormat::Json => f.write_str("json"),
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive, e.g. `info,relay_worker=debug`.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
            format: LogFormat::default(),
        }
    }
}

/// Everything a worker needs besides its handlers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub request_exchange: String,
    pub response_exchange: String,
    /// Worker queue name.
    pub queue: String,
    pub routing: RoutingMode,
    pub publish_retries: u32,
    pub retry_backoff_ms: u64,
    pub channel_capacity: usize,
    pub telemetry: TelemetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            request_exchange: DEFAULT_REQUEST_EXCHANGE.to_string(),
            response_exchange: DEFAULT_RESPONSE_EXCHANGE.to_string(),
            queue: DEFAULT_WORKER_QUEUE.to_string(),
            routing: RoutingMode::default(),
            publish_retries: DEFAULT_PUBLISH_RETRIES,
            retry_backoff_ms: DEFAULT_RETRY_BACKOFF.as_millis() as u64,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Load from process environment variables and validate.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup and validate.
    ///
    /// Unset and blank variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();
        if let Some(v) = get("RABBITMQ_REQUEST_EXCHANGE") {
            config.request_exchange = v;
        }
        if let Some(v) = get("RABBITMQ_RESPONSE_EXCHANGE") {
            config.response_exchange = v;
        }
        if let Some(v) = get("RELAY_WORKER_QUEUE") {
            config.queue = v;
        }
        if let Some(v) = get("RELAY_ROUTING") {
            config.routing = v.parse()?;
        }
        if let Some(v) = get("RELAY_PUBLISH_RETRIES") {
            config.publish_retries = parse_number("RELAY_PUBLISH_RETRIES", &v)?;
        }
        if let Some(v) = get("RELAY_RETRY_BACKOFF_MS") {
            config.retry_backoff_ms = parse_number("RELAY_RETRY_BACKOFF_MS", &v)?;
        }
        if let Some(v) = get("RELAY_CHANNEL_CAPACITY") {
            config.channel_capacity = parse_number("RELAY_CHANNEL_CAPACITY", &v)?;
        }
        if let Some(v) = get("RELAY_LOG") {
            config.telemetry.filter = v;
        }
        if let Some(v) = get("RELAY_LOG_FORMAT") {
            config.telemetry.format = v.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check invariants the broker topology depends on.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Config`] for empty names, identical request and
    /// response exchanges, or a zero channel capacity.
    pub fn validate(&self) -> Result<()> {
        if self.request_exchange.is_empty() {
            return Err(RelayError::Config("request exchange name is empty".into()));
        }
        if self.response_exchange.is_empty() {
            return Err(RelayError::Config("response exchange name is empty".into()));
        }
        if self.request_exchange == self.response_exchange {
            return Err(RelayError::Config(format!(
                "request and response exchanges must differ (both '{}')",
                self.request_exchange
            )));
        }
        if self.queue.is_empty() {
            return Err(RelayError::Config("worker queue name is empty".into()));
        }
        if self.channel_capacity == 0 {
            return Err(RelayError::Config("channel capacity must be positive".into()));
        }
        Ok(())
    }

    /// Broker layout for a worker serving `registry`.
    pub fn topology(&self, registry: &HandlerRegistry) -> Topology {
        Topology {
            request_exchange: self.request_exchange.clone(),
            response_exchange: self.response_exchange.clone(),
            queue: self.queue.clone(),
            routing_keys: self.routing.binding_keys(registry),
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            channel_capacity: self.channel_capacity,
            publish_retries: self.publish_retries,
            retry_backoff: self.retry_backoff(),
        }
    }
}

fn parse_number<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .parse()
        .map_err(|e| RelayError::Config(format!("{}: {}", key, e)))
}
