//! Payload serialization codecs and the layout descriptor.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use spine_types::{SpineError, SpineResult};

/// Turns typed values into payload bytes and back.
///
/// The core never looks inside a payload; any codec works as long as both
/// ends of a connection agree on it (see [`Layout`]).
pub trait Codec: Clone + Send + Sync + 'static {
    /// Stable identifier included in the layout handshake.
    fn name(&self) -> &'static str;

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> SpineResult<Vec<u8>>;

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> SpineResult<T>;
}

/// MessagePack with named struct fields. The default codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl Codec for MsgPackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> SpineResult<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(|e| SpineError::Codec(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> SpineResult<T> {
        rmp_serde::from_slice(bytes).map_err(|e| SpineError::Codec(e.to_string()))
    }
}

/// JSON, for debugging or interop with non-Rust peers.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> SpineResult<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| SpineError::Codec(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> SpineResult<T> {
        serde_json::from_slice(bytes).map_err(|e| SpineError::Codec(e.to_string()))
    }
}

/// Describes the wire shape of a service: codec plus request and response types.
///
/// Callers and services exchange layouts before the first call so that a
/// mismatched payload shape fails with a descriptive error instead of a
/// decode failure on every request. Type names come from
/// [`std::any::type_name`], which is only stable within one toolchain; use
/// [`Layout::new`] with explicit names when peers are built separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layout {
    pub codec: String,
    pub request: String,
    pub response: String,
}

impl Layout {
    pub fn new(
        codec: impl Into<String>,
        request: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        Self {
            codec: codec.into(),
            request: request.into(),
            response: response.into(),
        }
    }

    /// Layout for a `K -> V` service using `codec`.
    pub fn of<K: ?Sized, V: ?Sized>(codec: &impl Codec) -> Self {
        Self::new(
            codec.name(),
            std::any::type_name::<K>(),
            std::any::type_name::<V>(),
        )
    }

    /// Layouts travel as JSON regardless of the payload codec.
    pub fn to_bytes(&self) -> SpineResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SpineError::Codec(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> SpineResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| SpineError::CorruptPayload(e.to_string()))
    }
}

impl std::fmt::Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}->{}", self.codec, self.request, self.response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Reading {
        sensor: String,
        value: f64,
    }

    #[test]
    fn test_msgpack_struct() {
        let codec = MsgPackCodec;
        let reading = Reading {
            sensor: "lidar".to_string(),
            value: 1.5,
        };
        let bytes = codec.encode(&reading).unwrap();
        let decoded: Reading = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, reading);
    }

    #[test]
    fn test_decode_into_wrong_type_fails() {
        let codec = MsgPackCodec;
        let bytes = codec.encode("amir").unwrap();
        let err = codec.decode::<Reading>(&bytes).unwrap_err();
        assert!(matches!(err, SpineError::Codec(_)));

        let err = JsonCodec.decode::<u32>(b"{not json").unwrap_err();
        assert!(matches!(err, SpineError::Codec(_)));
    }

    #[test]
    fn test_layout_identity() {
        let a = Layout::of::<String, i32>(&MsgPackCodec);
        let b = Layout::of::<String, i32>(&MsgPackCodec);
        let c = Layout::of::<String, i64>(&MsgPackCodec);
        let d = Layout::of::<String, i32>(&JsonCodec);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        let shown = a.to_string();
        assert!(shown.starts_with("msgpack:"));
        assert!(shown.ends_with("->i32"));

        let parsed = Layout::from_bytes(&a.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, a);
    }
}
