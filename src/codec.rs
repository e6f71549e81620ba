// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Payload codecs.

use crate::errors::BrokerError;
use serde::{de::DeserializeOwned, Serialize};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Turns typed values into payload bytes and back.
pub trait Codec: Clone + Send + Sync + 'static {
    fn content_type(&self) -> &'static str;

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, BrokerError>;

    /// Fails with [`BrokerError::Decode`] on malformed input.
    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, BrokerError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, BrokerError> {
        serde_json::to_vec(value).map_err(|err| BrokerError::Publish(err.to_string()))
    }

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, BrokerError> {
        serde_json::from_slice(payload).map_err(|err| BrokerError::Decode(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Purchase {
        id: String,
    }

    #[test]
    fn malformed_payload_is_decode_error() {
        let err = JsonCodec.decode::<Purchase>(b"{not json").unwrap_err();
        assert!(matches!(err, BrokerError::Decode(_)));
    }

    #[test]
    fn encodes_json() {
        let bytes = JsonCodec.encode(&Purchase { id: "abc".into() }).unwrap();
        assert_eq!(bytes, br#"{"id":"abc"}"#);
        assert_eq!(JsonCodec.content_type(), "application/json");
    }
}
