//! Codec module - body serialization for broker messages.
//!
//! Broker bodies are bytes. Two codecs cover what travels over the exchanges:
//!
//! - [`JsonCodec`] - structured values (envelopes, payload objects)
//! - [`RawCodec`] - string bodies that go on the wire untouched
//!
//! [`encode_body`] and [`decode_body`] pick between them so publishers in
//! other languages interoperate: a string value is sent as its raw UTF-8
//! bytes, anything else as JSON. On the read side, a body that is not JSON
//! comes back as a string value.
//!
//! # Example
//!
//! ```
//! use relay_worker::codec::{decode_body, encode_body};
//! use serde_json::json;
//!
//! let raw = encode_body(&json!("plain text"));
//! assert_eq!(&raw[..], b"plain text");
//!
//! let structured = encode_body(&json!({ "a": 1 }));
//! assert_eq!(decode_body(&structured), json!({ "a": 1 }));
//! ```

mod json;
mod raw;

use bytes::Bytes;
use serde_json::Value;

pub use json::JsonCodec;
pub use raw::RawCodec;

/// Encode a body value for publication.
pub fn encode_body(value: &Value) -> Bytes {
    match value {
        Value::String(text) => RawCodec::serialize_str(text),
        other => JsonCodec::encode_value(other),
    }
}

/// Decode a received body, falling back to a string value for non-JSON input.
pub fn decode_body(bytes: &[u8]) -> Value {
    match JsonCodec::decode::<Value>(bytes) {
        Ok(value) => value,
        Err(_) => Value::String(String::from_utf8_lossy(RawCodec::deserialize(bytes)).into_owned()),
    }
}
