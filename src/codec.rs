// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Payload Codecs
//!
//! Serializer/deserializer strategies used by producers and consumers, and
//! the zlib compression applied to RPC replies.

use crate::errors::AmqpError;
use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use std::{
    io::{Read, Write},
    sync::Arc,
};

/// Turns a structured payload into bytes before publishing.
pub type Serializer = Arc<dyn Fn(&serde_json::Value) -> Result<Vec<u8>, AmqpError> + Send + Sync>;

/// Reverses a [`Serializer`] on the consuming side.
pub type Deserializer = Arc<dyn Fn(&[u8]) -> Result<serde_json::Value, AmqpError> + Send + Sync>;

/// JSON serializer used when none is configured.
pub fn json_serializer() -> Serializer {
    Arc::new(|value: &serde_json::Value| {
        serde_json::to_vec(value).map_err(|e| AmqpError::SerializationError(e.to_string()))
    })
}

/// JSON deserializer used when none is configured.
pub fn json_deserializer() -> Deserializer {
    Arc::new(|data: &[u8]| {
        serde_json::from_slice(data).map_err(|e| AmqpError::SerializationError(e.to_string()))
    })
}

/// Compresses `data` with zlib framing.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, AmqpError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| AmqpError::CompressionError(e.to_string()))?;

    encoder
        .finish()
        .map_err(|e| AmqpError::CompressionError(e.to_string()))
}

/// Inflates a zlib body produced by [`compress`].
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, AmqpError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| AmqpError::CompressionError(e.to_string()))?;

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn compressed_body_inflates_to_original() {
        let original = b"some response body that is long enough, long enough, long enough".to_vec();

        let compressed = compress(&original).unwrap();

        assert_ne!(compressed, original);
        assert_eq!(decompress(&compressed).unwrap(), original);
    }

    #[test]
    fn garbage_fails_to_decompress() {
        let err = decompress(b"not zlib").unwrap_err();
        assert!(matches!(err, AmqpError::CompressionError(_)));
    }

    #[test]
    fn json_codec_reverses() {
        let value = json!({"params": {"facilityId": 1013}});

        let bytes = json_serializer()(&value).unwrap();

        assert_eq!(json_deserializer()(&bytes).unwrap(), value);
    }

    #[test]
    fn json_deserializer_rejects_invalid_input() {
        assert!(matches!(
            json_deserializer()(b"{"),
            Err(AmqpError::SerializationError(_))
        ));
    }
}
