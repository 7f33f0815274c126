//! Serialization layer.
//!
//! `encode`/`decode` turn cached values into the opaque byte payload stored
//! in the `value` column. The default codec is self-describing: its first
//! byte identifies the wire format, so a future format can be introduced
//! without breaking readers of rows written by an older client.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CacheError, Result};

/// The wire format tag written as the first byte of every encoded payload.
const FORMAT_BINCODE_V1: u8 = 1;

/// Pluggable value serialization. `decode(encode(v)) == v` must hold for
/// every value a caller stores.
pub trait Codec<V>: Send + Sync {
    /// Encode a value to its opaque byte representation.
    fn encode(&self, value: &V) -> Result<Vec<u8>>;

    /// Decode a previously encoded value.
    fn decode(&self, bytes: &[u8]) -> Result<V>;
}

/// Default codec: a version-tagged bincode payload.
///
/// Byte layout: `[format_tag: u8][bincode-encoded value]`. Unknown format
/// tags are rejected with [`CacheError::EncodingError`] rather than
/// misinterpreted, so a future format change is detectable at decode time.
#[derive(Debug, Default, Clone, Copy)]
pub struct BincodeCodec;

impl<V> Codec<V> for BincodeCodec
where
    V: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &V) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(64);
        out.push(FORMAT_BINCODE_V1);
        bincode::serialize_into(&mut out, value)?;
        Ok(out)
    }

    fn decode(&self, bytes: &[u8]) -> Result<V> {
        let (tag, body) = bytes
            .split_first()
            .ok_or_else(|| CacheError::EncodingError("empty payload".to_string()))?;
        if *tag != FORMAT_BINCODE_V1 {
            return Err(CacheError::EncodingError(format!(
                "unsupported codec format tag {tag}"
            )));
        }
        Ok(bincode::deserialize(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
    struct Widget {
        id: u64,
        name: String,
        tags: Vec<String>,
    }

    #[test]
    fn round_trip_preserves_value() {
        let codec = BincodeCodec;
        let widget = Widget {
            id: 42,
            name: "sprocket".to_string(),
            tags: vec!["metal".to_string(), "small".to_string()],
        };
        let encoded = codec.encode(&widget).unwrap();
        let decoded: Widget = codec.decode(&encoded).unwrap();
        assert_eq!(widget, decoded);
    }

    #[test]
    fn round_trip_preserves_primitive_string() {
        let codec = BincodeCodec;
        let value = "hello world".to_string();
        let encoded = codec.encode(&value).unwrap();
        let decoded: String = codec.decode(&encoded).unwrap();
        assert_eq!(value, decoded);
    }

    #[test]
    fn empty_payload_is_rejected() {
        let codec = BincodeCodec;
        let err = Codec::<String>::decode(&codec, &[]).unwrap_err();
        assert!(matches!(err, CacheError::EncodingError(_)));
    }

    #[test]
    fn unknown_format_tag_is_rejected() {
        let codec = BincodeCodec;
        let err = Codec::<String>::decode(&codec, &[99, 1, 2, 3]).unwrap_err();
        assert!(matches!(err, CacheError::EncodingError(_)));
    }

    proptest::proptest! {
        #[test]
        fn round_trip_any_string(s in ".*") {
            let codec = BincodeCodec;
            let encoded = codec.encode(&s).unwrap();
            let decoded: String = codec.decode(&encoded).unwrap();
            proptest::prop_assert_eq!(s, decoded);
        }
    }
}
