//! Error types for relay-worker.

use thiserror::Error;

/// Main error type for all relay operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No handler registered for the given event name.
    #[error("Handler not found for event: {0}")]
    HandlerNotFound(String),

    /// Chunk emitter used after the final envelope was sent.
    #[error("Chunk emitter for request {0} is closed")]
    EmitterClosed(String),

    /// Broker-side failure (publish, ack, declare).
    #[error("Transport error: {0}")]
    Transport(String),

    /// Publisher queue or broker connection closed unexpectedly.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The remote handler finished with an error envelope.
    #[error("Remote handler failed: {0}")]
    Remote(String),

    /// A request with this id is already awaiting responses.
    #[error("Request {0} is already in flight")]
    DuplicateRequest(String),

    /// A background task panicked or was aborted.
    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Reasons an inbound body is rejected before routing.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Body is not valid JSON.
    #[error("malformed body: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Body is valid JSON but not an object.
    #[error("body is not an object")]
    NotAnObject,

    /// `requestId` absent or empty.
    #[error("missing requestId")]
    MissingRequestId,

    /// `eventName` absent.
    #[error("missing eventName")]
    MissingEventName,

    /// A field is present with the wrong JSON type.
    #[error("field `{0}` has an invalid type")]
    InvalidField(&'static str),
}

/// Result type alias using RelayError.
pub type Result<T> = std::result::Result<T, RelayError>;
