//! Request and response envelopes exchanged over the broker.
//!
//! Wire shape (JSON, camelCase):
//!
//! ```text
//! request:  { "eventName": "...", "requestId": "...", "payload": { ... } }
//! chunk:    { "requestId": "...", "data": <any>,    "isFinal": false }
//! success:  { "requestId": "...", "data": <any>,    "isFinal": true }
//! failure:  { "requestId": "...", "error": "...",   "isFinal": true }
//! ```
//!
//! A response carries either `data` or `error`, never both. That is encoded
//! in [`ResponseBody`], so an invalid combination cannot be constructed.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::codec::{encode_body, JsonCodec};
use crate::error::DecodeError;

/// Handler payload: a mapping from string keys to JSON values.
pub type Payload = Map<String, Value>;

/// Decoded inbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    /// Selects the handler.
    pub event_name: String,
    /// Caller-supplied correlation id. Never empty.
    pub request_id: String,
    /// Handler input. Empty when the caller sent none.
    pub payload: Payload,
}

impl RequestEnvelope {
    /// Build a request envelope.
    pub fn new(
        event_name: impl Into<String>,
        request_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            event_name: event_name.into(),
            request_id: request_id.into(),
            payload,
        }
    }

    /// Encode for publication on the request exchange.
    pub fn encode(&self) -> Bytes {
        let mut body = Map::with_capacity(3);
        body.insert("eventName".into(), Value::String(self.event_name.clone()));
        body.insert("requestId".into(), Value::String(self.request_id.clone()));
        body.insert("payload".into(), Value::Object(self.payload.clone()));
        encode_body(&Value::Object(body))
    }
}

/// Decode an inbound request body.
///
/// # Errors
///
/// Returns [`DecodeError`] for non-JSON or non-object bodies, a missing or
/// empty `requestId`, a missing `eventName`, or a `payload` that is not an
/// object.
pub fn decode_request(bytes: &[u8]) -> Result<RequestEnvelope, DecodeError> {
    decode_request_routed(bytes, None)
}

/// Decode a request that arrived under a per-event binding.
///
/// A body without `eventName` takes it from `routing_key`; an explicit
/// `eventName` in the body wins.
///
/// # Errors
///
/// As [`decode_request`], except that a missing `eventName` is only an error
/// when `routing_key` is `None` or empty.
pub fn decode_request_routed(
    bytes: &[u8],
    routing_key: Option<&str>,
) -> Result<RequestEnvelope, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Object(mut body) = value else {
        return Err(DecodeError::NotAnObject);
    };

    let request_id = match body.remove("requestId") {
        None | Some(Value::Null) => return Err(DecodeError::MissingRequestId),
        Some(Value::String(id)) if id.is_empty() => return Err(DecodeError::MissingRequestId),
        Some(Value::String(id)) => id,
        Some(_) => return Err(DecodeError::InvalidField("requestId")),
    };

    let event_name = match body.remove("eventName") {
        None | Some(Value::Null) => match routing_key {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => return Err(DecodeError::MissingEventName),
        },
        Some(Value::String(name)) => name,
        Some(_) => return Err(DecodeError::InvalidField("eventName")),
    };

    let payload = match body.remove("payload") {
        None | Some(Value::Null) => Payload::new(),
        Some(Value::Object(map)) => map,
        Some(_) => return Err(DecodeError::InvalidField("payload")),
    };

    Ok(RequestEnvelope {
        event_name,
        request_id,
        payload,
    })
}

/// What a response envelope carries.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// Intermediate chunk (`isFinal: false`).
    Chunk(Value),
    /// Handler result (`isFinal: true`).
    Success(Value),
    /// Handler failure message (`isFinal: true`).
    Failure(String),
}

/// Outbound response, correlated to one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireResponse", try_from = "WireResponse")]
pub struct ResponseEnvelope {
    request_id: String,
    body: ResponseBody,
}

impl ResponseEnvelope {
    /// Non-final chunk.
    pub fn chunk(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            request_id: request_id.into(),
            body: ResponseBody::Chunk(data),
        }
    }

    /// Final success envelope.
    pub fn success(request_id: impl Into<String>, data: Value) -> Self {
        Self {
            request_id: request_id.into(),
            body: ResponseBody::Success(data),
        }
    }

    /// Final error envelope.
    pub fn failure(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            body: ResponseBody::Failure(message.into()),
        }
    }

    #[inline]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    #[inline]
    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    #[inline]
    pub fn is_final(&self) -> bool {
        !matches!(self.body, ResponseBody::Chunk(_))
    }

    /// `data` for chunks and successes.
    pub fn data(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Chunk(data) | ResponseBody::Success(data) => Some(data),
            ResponseBody::Failure(_) => None,
        }
    }

    /// `error` for failures.
    pub fn error(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Failure(message) => Some(message),
            _ => None,
        }
    }

    pub fn into_body(self) -> ResponseBody {
        self.body
    }
}

/// Encode a response envelope for the response exchange.
pub fn encode_response(envelope: &ResponseEnvelope) -> Bytes {
    let wire = WireResponse::from(envelope.clone());
    let mut body = Map::with_capacity(3);
    body.insert("requestId".into(), Value::String(wire.request_id));
    if let Some(data) = wire.data {
        body.insert("data".into(), data);
    }
    if let Some(error) = wire.error {
        body.insert("error".into(), Value::String(error));
    }
    body.insert("isFinal".into(), Value::Bool(wire.is_final));
    encode_body(&Value::Object(body))
}

/// Decode a response body observed on the response exchange.
///
/// # Errors
///
/// Returns an error when the body is not a well-formed response envelope.
pub fn decode_response(bytes: &[u8]) -> crate::error::Result<ResponseEnvelope> {
    JsonCodec::decode(bytes)
}

/// Flat wire form used by serde.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireResponse {
    request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    is_final: bool,
}

impl From<ResponseEnvelope> for WireResponse {
    fn from(envelope: ResponseEnvelope) -> Self {
        let (data, error, is_final) = match envelope.body {
            ResponseBody::Chunk(data) => (Some(data), None, false),
            ResponseBody::Success(data) => (Some(data), None, true),
            ResponseBody::Failure(message) => (None, Some(message), true),
        };
        Self {
            request_id: envelope.request_id,
            data,
            error,
            is_final,
        }
    }
}

impl TryFrom<WireResponse> for ResponseEnvelope {
    type Error = String;

    fn try_from(wire: WireResponse) -> Result<Self, Self::Error> {
        if wire.request_id.is_empty() {
            return Err("response without requestId".into());
        }
        let body = match (wire.error, wire.is_final) {
            (Some(_), false) => return Err("error on a non-final response".into()),
            (Some(message), true) if wire.data.is_none() => ResponseBody::Failure(message),
            (Some(_), true) => return Err("response carries both data and error".into()),
            // `"data": null` deserializes to None
            (None, false) => ResponseBody::Chunk(wire.data.unwrap_or(Value::Null)),
            (None, true) => ResponseBody::Success(wire.data.unwrap_or(Value::Null)),
        };
        Ok(Self {
            request_id: wire.request_id,
            body,
        })
    }
}
