//! Raw codec - pass-through for string bodies.
//!
//! A body that is already a string is published as its UTF-8 bytes with no
//! JSON quoting, which is what non-Rust consumers of the exchanges expect.

use bytes::Bytes;

/// Raw codec that passes bytes through without transformation.
pub struct RawCodec;

impl RawCodec {
    /// Serialize a string body (copies into Bytes).
    #[inline]
    pub fn serialize_str(text: &str) -> Bytes {
        Bytes::copy_from_slice(text.as_bytes())
    }

    /// Deserialize - returns a reference to the input (zero-copy).
    #[inline]
    pub fn deserialize(data: &[u8]) -> &[u8] {
        data
    }
}
