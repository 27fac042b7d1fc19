//! JSON codec using `serde_json`.
//!
//! Every structured body on the request and response exchanges is JSON with
//! camelCase keys.
//!
//! # Example
//!
//! ```
//! use relay_worker::codec::JsonCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let msg = Message { id: 42, content: "hello".to_string() };
//! let encoded = JsonCodec::encode(&msg).unwrap();
//! let decoded: Message = JsonCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use bytes::Bytes;
use serde_json::Value;

use crate::error::Result;

/// JSON codec for structured data.
pub struct JsonCodec;

impl JsonCodec {
    /// Encode a value to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be serialized (e.g. a map with
    /// non-string keys).
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    /// Encode an already-built JSON value. Infallible.
    pub fn encode_value(value: &Value) -> Bytes {
        // Display for Value cannot fail, unlike the generic serializer path.
        Bytes::from(value.to_string())
    }

    /// Decode JSON bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Convert any serializable value into a JSON value tree.
    ///
    /// # Errors
    ///
    /// Returns error if the value cannot be represented as JSON.
    pub fn to_value<T: serde::Serialize + ?Sized>(value: &T) -> Result<Value> {
        Ok(serde_json::to_value(value)?)
    }
}
