use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Trait for encoding and decoding request and result payloads
pub trait Codec: Send + Sync + Clone + std::fmt::Debug + 'static {
    /// Encode a serializable value into bytes
    fn encode<T: Serialize>(&self, data: &T) -> Result<Vec<u8>>;

    /// Decode bytes into a deserializable value
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T>;
}

/// A value that can cross the process boundary.
///
/// `TYPE_NAME` is the logical type identifier sent next to the serialized
/// bytes; the receiving side resolves handlers by it, so it must be the same
/// in both processes.
///
/// ```
/// use rxipc::Payload;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct CountRequest {
///     count: u32,
/// }
///
/// impl Payload for CountRequest {
///     const TYPE_NAME: &'static str = "demo.CountRequest";
/// }
/// ```
pub trait Payload: Serialize + DeserializeOwned + Send + 'static {
    const TYPE_NAME: &'static str;
}

macro_rules! impl_payload {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl Payload for $ty {
                const TYPE_NAME: &'static str = $name;
            }
        )*
    };
}

impl_payload!(
    () => "unit",
    bool => "bool",
    i32 => "i32",
    i64 => "i64",
    u32 => "u32",
    u64 => "u64",
    f64 => "f64",
    String => "string",
);

/// JSON codec, the default
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, data: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(data)?)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Bincode codec
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec;

impl Codec for BincodeCodec {
    fn encode<T: Serialize>(&self, data: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(data)?)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(data)?)
    }
}

/// MessagePack codec - compact binary, cross-language compatible
#[cfg(feature = "codec-messagepack")]
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackCodec;

#[cfg(feature = "codec-messagepack")]
impl Codec for MessagePackCodec {
    fn encode<T: Serialize>(&self, data: &T) -> Result<Vec<u8>> {
        rmp_serde::to_vec(data).map_err(|e| crate::error::RpcError::Serialization(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        rmp_serde::from_slice(data)
            .map_err(|e| crate::error::RpcError::Serialization(e.to_string()))
    }
}

/// CBOR codec - binary JSON (RFC 8949), self-describing
#[cfg(feature = "codec-cbor")]
#[derive(Debug, Clone, Copy, Default)]
pub struct CborCodec;

#[cfg(feature = "codec-cbor")]
impl Codec for CborCodec {
    fn encode<T: Serialize>(&self, data: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(data, &mut buf)
            .map_err(|e| crate::error::RpcError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        ciborium::from_reader(data)
            .map_err(|e| crate::error::RpcError::Serialization(e.to_string()))
    }
}

/// Postcard codec - minimal binary
#[cfg(feature = "codec-postcard")]
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardCodec;

#[cfg(feature = "codec-postcard")]
impl Codec for PostcardCodec {
    fn encode<T: Serialize>(&self, data: &T) -> Result<Vec<u8>> {
        postcard::to_allocvec(data)
            .map_err(|e| crate::error::RpcError::Serialization(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        postcard::from_bytes(data).map_err(|e| crate::error::RpcError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Progress {
        name: String,
        number: u32,
    }

    impl Payload for Progress {
        const TYPE_NAME: &'static str = "test.Progress";
    }

    #[test]
    fn test_json_codec_is_textual() {
        let codec = JsonCodec;
        let bytes = codec
            .encode(&Progress {
                name: "job".into(),
                number: 3,
            })
            .unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            r#"{"name":"job","number":3}"#
        );
    }

    #[test]
    fn test_bincode_codec() {
        let codec = BincodeCodec;
        let value = Progress {
            name: "job".into(),
            number: 7,
        };
        let decoded: Progress = codec.decode(&codec.encode(&value).unwrap()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_decode_failure_is_serialization_error() {
        let result: Result<Progress> = JsonCodec.decode(b"not json");
        assert!(matches!(result, Err(RpcError::Serialization(_))));
    }

    #[test]
    fn test_type_names() {
        assert_eq!(<String as Payload>::TYPE_NAME, "string");
        assert_eq!(<u32 as Payload>::TYPE_NAME, "u32");
        assert_eq!(Progress::TYPE_NAME, "test.Progress");
    }
}
