//! Value serializers.
//!
//! Only argument and reply values go through a [`Codec`]; call and reply
//! headers are always postcard. The encoding is not announced on the wire, so
//! a channel and the server it talks to must be built with the same codec.

use std::fmt;

use serde::{Serialize, de::DeserializeOwned};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Postcard,
    Json,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Encoding::Postcard => "postcard",
            Encoding::Json => "json",
        })
    }
}

/// Serializer for argument and reply values.
///
/// Channels and servers are generic over their codec so values are encoded on
/// the calling thread, before anything reaches the dispatch loops.
pub trait Codec: Send + Sync + 'static {
    const ENCODING: Encoding;

    type EncodeError: std::error::Error + Send + Sync + 'static;
    type DecodeError: std::error::Error + Send + Sync + 'static;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError>;

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError>;
}

/// Compact binary values. The default for channels and servers.
pub struct PostcardCodec;

impl Codec for PostcardCodec {
    const ENCODING: Encoding = Encoding::Postcard;
    type EncodeError = postcard::Error;
    type DecodeError = postcard::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        postcard::to_allocvec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        postcard::from_bytes(buf)
    }
}

/// Values as JSON text, for reading traffic off the wire.
pub struct JsonCodec;

impl Codec for JsonCodec {
    const ENCODING: Encoding = Encoding::Json;
    type EncodeError = serde_json::Error;
    type DecodeError = serde_json::Error;

    fn encode<T: Serialize>(val: &T) -> Result<Vec<u8>, Self::EncodeError> {
        serde_json::to_vec(val)
    }

    fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, Self::DecodeError> {
        serde_json::from_slice(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reading {
        sensor: u32,
        label: String,
        note: Option<String>,
        samples: Vec<f64>,
    }

    fn reading() -> Reading {
        Reading {
            sensor: 7,
            label: "boiler".to_owned(),
            note: None,
            samples: vec![21.5, -3.0],
        }
    }

    #[test]
    fn codecs_name_their_encoding() {
        assert_eq!(PostcardCodec::ENCODING.to_string(), "postcard");
        assert_eq!(JsonCodec::ENCODING.to_string(), "json");
    }

    #[test]
    fn postcard_values() {
        let bytes = PostcardCodec::encode(&reading()).unwrap();
        assert_eq!(PostcardCodec::decode::<Reading>(&bytes).unwrap(), reading());
        assert!(PostcardCodec::decode::<Reading>(&[0xFF, 0xFF, 0xFF]).is_err());
    }

    #[test]
    fn json_values_are_text() {
        let bytes = JsonCodec::encode(&reading()).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("\"label\":\"boiler\""));
        assert!(text.contains("\"note\":null"));
        assert_eq!(JsonCodec::decode::<Reading>(&bytes).unwrap(), reading());
        assert!(JsonCodec::decode::<Reading>(b"{\"sensor\":").is_err());
    }

    #[test]
    fn postcard_is_smaller_than_json() {
        let postcard = PostcardCodec::encode(&reading()).unwrap();
        let json = JsonCodec::encode(&reading()).unwrap();
        assert!(postcard.len() < json.len());
    }
}
