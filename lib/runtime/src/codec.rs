// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Message codecs.
//!
//! A [`Codec`] maps a typed message to a byte sequence and back. Codecs know
//! nothing about framing; message boundaries are kept by the link layer
//! ([`crate::link::LengthPrefixedCodec`]).
//!
//! Operator specifications name a codec through [`CodecKind`] so that they stay
//! serializable. A payload type opts into the kinds it can be carried by via
//! [`Payload`].

use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::CodecError;

pub trait Codec<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> Result<Bytes, CodecError>;

    fn decode(&self, data: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec backed by `serde_json`; carries any serde type.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Codec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, data: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Identity codec for raw byte payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec<Bytes> for BytesCodec {
    fn encode(&self, value: &Bytes) -> Result<Bytes, CodecError> {
        Ok(value.clone())
    }

    fn decode(&self, data: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(data))
    }
}

/// UTF-8 string codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Codec<String> for Utf8Codec {
    fn encode(&self, value: &String) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }

    fn decode(&self, data: &[u8]) -> Result<String, CodecError> {
        String::from_utf8(data.to_vec()).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Fixed-width big-endian `i64` codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntegerCodec;

impl Codec<i64> for IntegerCodec {
    fn encode(&self, value: &i64) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(&value.to_be_bytes()))
    }

    fn decode(&self, data: &[u8]) -> Result<i64, CodecError> {
        let raw: [u8; 8] = data.try_into().map_err(|_| {
            CodecError::Decode(format!("expected 8 bytes for an integer, got {}", data.len()))
        })?;
        Ok(i64::from_be_bytes(raw))
    }
}

/// Fixed-width big-endian IEEE-754 codec for `f64` and `f32`.
///
/// Carries the raw bits, so infinities and NaN payloads survive the trip,
/// which JSON cannot represent.
#[derive(Debug, Clone, Copy, Default)]
pub struct DoubleCodec;

impl Codec<f64> for DoubleCodec {
    fn encode(&self, value: &f64) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(&value.to_bits().to_be_bytes()))
    }

    fn decode(&self, data: &[u8]) -> Result<f64, CodecError> {
        let raw: [u8; 8] = data.try_into().map_err(|_| {
            CodecError::Decode(format!("expected 8 bytes for a double, got {}", data.len()))
        })?;
        Ok(f64::from_bits(u64::from_be_bytes(raw)))
    }
}

impl Codec<f32> for DoubleCodec {
    fn encode(&self, value: &f32) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(&value.to_bits().to_be_bytes()))
    }

    fn decode(&self, data: &[u8]) -> Result<f32, CodecError> {
        let raw: [u8; 4] = data.try_into().map_err(|_| {
            CodecError::Decode(format!("expected 4 bytes for a float, got {}", data.len()))
        })?;
        Ok(f32::from_bits(u32::from_be_bytes(raw)))
    }
}

// ============================================================================
// Codec selection
// ============================================================================

/// Serializable name of a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Json,
    Bytes,
    Utf8,
    Integer,
    Double,
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CodecKind::Json => "json",
            CodecKind::Bytes => "bytes",
            CodecKind::Utf8 => "utf8",
            CodecKind::Integer => "integer",
            CodecKind::Double => "double",
        };
        f.write_str(name)
    }
}

impl FromStr for CodecKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(CodecKind::Json),
            "bytes" => Ok(CodecKind::Bytes),
            "utf8" | "string" => Ok(CodecKind::Utf8),
            "integer" | "int" => Ok(CodecKind::Integer),
            "double" | "float" => Ok(CodecKind::Double),
            _ => anyhow::bail!(
                "unknown codec '{s}'; expected json, bytes, utf8, integer or double"
            ),
        }
    }
}

/// A type that can travel through a collective operator.
///
/// Resolves the codec named by a [`CodecKind`] for `Self`, or fails with
/// [`CodecError::Unsupported`] when the pairing makes no sense.
pub trait Payload: Send + Sync + Sized + 'static {
    fn codec(kind: CodecKind) -> Result<Arc<dyn Codec<Self>>, CodecError>;
}

fn unsupported<T>(kind: CodecKind) -> CodecError {
    CodecError::Unsupported {
        kind: kind.to_string(),
        type_name: std::any::type_name::<T>(),
    }
}

macro_rules! json_payload {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Payload for $ty {
                fn codec(kind: CodecKind) -> Result<Arc<dyn Codec<Self>>, CodecError> {
                    match kind {
                        CodecKind::Json => Ok(Arc::new(JsonCodec::<$ty>::new())),
                        other => Err(unsupported::<$ty>(other)),
                    }
                }
            }
        )*
    };
}

json_payload!(i32, u32, u64, bool);

macro_rules! float_payload {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Payload for $ty {
                fn codec(kind: CodecKind) -> Result<Arc<dyn Codec<Self>>, CodecError> {
                    match kind {
                        CodecKind::Json => Ok(Arc::new(JsonCodec::<$ty>::new())),
                        CodecKind::Double => Ok(Arc::new(DoubleCodec)),
                        other => Err(unsupported::<$ty>(other)),
                    }
                }
            }
        )*
    };
}

float_payload!(f32, f64);

impl Payload for i64 {
    fn codec(kind: CodecKind) -> Result<Arc<dyn Codec<Self>>, CodecError> {
        match kind {
            CodecKind::Json => Ok(Arc::new(JsonCodec::<i64>::new())),
            CodecKind::Integer => Ok(Arc::new(IntegerCodec)),
            other => Err(unsupported::<i64>(other)),
        }
    }
}

impl Payload for String {
    fn codec(kind: CodecKind) -> Result<Arc<dyn Codec<Self>>, CodecError> {
        match kind {
            CodecKind::Json => Ok(Arc::new(JsonCodec::<String>::new())),
            CodecKind::Utf8 => Ok(Arc::new(Utf8Codec)),
            other => Err(unsupported::<String>(other)),
        }
    }
}

impl Payload for Bytes {
    fn codec(kind: CodecKind) -> Result<Arc<dyn Codec<Self>>, CodecError> {
        match kind {
            CodecKind::Bytes => Ok(Arc::new(BytesCodec)),
            other => Err(unsupported::<Bytes>(other)),
        }
    }
}

impl<E> Payload for Vec<E>
where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn codec(kind: CodecKind) -> Result<Arc<dyn Codec<Self>>, CodecError> {
        match kind {
            CodecKind::Json => Ok(Arc::new(JsonCodec::<Vec<E>>::new())),
            other => Err(unsupported::<Vec<E>>(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Sample {
        id: u32,
        name: String,
        values: Vec<f64>,
    }

    #[test]
    fn test_json_round_trip() {
        let codec = JsonCodec::<Sample>::new();
        let value = Sample {
            id: 7,
            name: "node-a".to_string(),
            values: vec![1.5, -2.0],
        };
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn test_json_decode_garbage() {
        let codec = JsonCodec::<Sample>::new();
        let err = codec.decode(b"{not json").unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }

    #[test]
    fn test_integer_round_trip_extremes() {
        for value in [0i64, 1, -1, 42, i64::MIN, i64::MAX] {
            let bytes = IntegerCodec.encode(&value).unwrap();
            assert_eq!(bytes.len(), 8);
            assert_eq!(IntegerCodec.decode(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn test_integer_rejects_wrong_width() {
        assert!(IntegerCodec.decode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_double_keeps_non_finite_values() {
        for value in [0.0f64, -0.0, 1.5, f64::MAX, f64::INFINITY, f64::NEG_INFINITY] {
            let bytes = Codec::<f64>::encode(&DoubleCodec, &value).unwrap();
            assert_eq!(bytes.len(), 8);
            let back = Codec::<f64>::decode(&DoubleCodec, &bytes).unwrap();
            assert_eq!(back.to_bits(), value.to_bits());
        }

        let nan = f64::from_bits(0x7ff8_0000_0000_beef);
        let bytes = Codec::<f64>::encode(&DoubleCodec, &nan).unwrap();
        let back = Codec::<f64>::decode(&DoubleCodec, &bytes).unwrap();
        assert_eq!(back.to_bits(), nan.to_bits());

        let bytes = Codec::<f32>::encode(&DoubleCodec, &f32::NEG_INFINITY).unwrap();
        assert_eq!(bytes.len(), 4);
        let back = Codec::<f32>::decode(&DoubleCodec, &bytes).unwrap();
        assert_eq!(back, f32::NEG_INFINITY);
    }

    #[test]
    fn test_double_rejects_wrong_width() {
        assert!(Codec::<f64>::decode(&DoubleCodec, &[0; 4]).is_err());
        assert!(Codec::<f32>::decode(&DoubleCodec, &[0; 8]).is_err());
    }

    #[test]
    fn test_utf8_rejects_invalid() {
        assert!(Utf8Codec.decode(&[0xff, 0xfe]).is_err());
        let text = "héllo".to_string();
        let bytes = Utf8Codec.encode(&text).unwrap();
        assert_eq!(Utf8Codec.decode(&bytes).unwrap(), text);
    }

    #[test]
    fn test_bytes_identity() {
        let payload = Bytes::from_static(b"\x00\x01raw");
        let encoded = BytesCodec.encode(&payload).unwrap();
        assert_eq!(encoded, payload);
        assert_eq!(BytesCodec.decode(&encoded).unwrap(), payload);
    }

    #[test]
    fn test_payload_resolution() {
        let codec = <i64 as Payload>::codec(CodecKind::Integer).unwrap();
        assert_eq!(codec.decode(&codec.encode(&42).unwrap()).unwrap(), 42);

        let codec = <Vec<i32> as Payload>::codec(CodecKind::Json).unwrap();
        let values = vec![3, 1, 2];
        assert_eq!(codec.decode(&codec.encode(&values).unwrap()).unwrap(), values);

        let codec = <f64 as Payload>::codec(CodecKind::Double).unwrap();
        let infinity = codec.decode(&codec.encode(&f64::INFINITY).unwrap()).unwrap();
        assert_eq!(infinity, f64::INFINITY);

        assert!(matches!(
            <f64 as Payload>::codec(CodecKind::Integer),
            Err(CodecError::Unsupported { .. })
        ));
        assert!(<Bytes as Payload>::codec(CodecKind::Json).is_err());
    }

    #[test]
    fn test_codec_kind_parse_and_display() {
        for kind in [
            CodecKind::Json,
            CodecKind::Bytes,
            CodecKind::Utf8,
            CodecKind::Integer,
            CodecKind::Double,
        ] {
            assert_eq!(kind.to_string().parse::<CodecKind>().unwrap(), kind);
        }
        assert!("avro".parse::<CodecKind>().is_err());
        assert_eq!(
            serde_json::to_string(&CodecKind::Integer).unwrap(),
            "\"integer\""
        );
    }
}
