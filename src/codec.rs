//! Pluggable codecs for the RPC wire format.
//!
//! A [`Codec`] bundles the two halves of the wire contract: a frame-boundary
//! layer (a `tokio_util` [`Decoder`]/[`Encoder`] pair splitting the byte
//! stream into header and body frames) and a serde-based value encoding
//! applied inside each frame. Servers are generic over their codec; the
//! default [`BincodeCodec`] uses a length-delimited binary layout and
//! [`JsonCodec`] is provided as the self-describing alternate.

use std::io;

use bytes::{Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

pub mod error;

pub use error::CodecError;

/// Minimum frame length in bytes accepted by the built-in codecs.
pub const MIN_FRAME_LENGTH: usize = 64;

/// Maximum frame length in bytes accepted by the built-in codecs (16 MiB).
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Default maximum frame length (1 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 1024 * 1024;

pub(crate) fn clamp_frame_length(value: usize) -> usize {
    value.clamp(MIN_FRAME_LENGTH, MAX_FRAME_LENGTH)
}

/// Reversible byte-level encoding over the `(header, body)` triple.
///
/// Implementors supply a fresh framer per connection plus value-level
/// encode/decode. Both built-in codecs share the 4-byte big-endian length
/// prefix; a custom codec may choose any frame layout as long as each
/// header frame is followed by exactly one body frame.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Frame-boundary layer instantiated once per connection.
    type Framer: Decoder<Item = BytesMut, Error = io::Error>
        + Encoder<Bytes, Error = io::Error>
        + Send
        + 'static;

    /// Create the frame-boundary codec for a new connection.
    fn framer(&self) -> Self::Framer;

    /// Serialize a header or body value into frame payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] when the value cannot be serialized.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Deserialize a header or body value from frame payload bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] when the bytes cannot be parsed.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;

    /// Maximum frame length this codec will accept.
    fn max_frame_length(&self) -> usize;
}

/// Default codec: bincode values inside length-delimited frames.
#[derive(Clone, Debug)]
pub struct BincodeCodec {
    max_frame_length: usize,
}

impl BincodeCodec {
    /// Construct a codec with a maximum frame length, clamped to
    /// [`MIN_FRAME_LENGTH`]..=[`MAX_FRAME_LENGTH`].
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length: clamp_frame_length(max_frame_length),
        }
    }
}

impl Default for BincodeCodec {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

fn length_delimited(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}

impl Codec for BincodeCodec {
    type Framer = LengthDelimitedCodec;

    fn framer(&self) -> Self::Framer {
        length_delimited(self.max_frame_length)
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        bincode::serde::encode_to_vec(value, bincode::config::standard())
            .map_err(CodecError::encode)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map(|(value, _)| value)
            .map_err(CodecError::decode)
    }

    fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

/// Self-describing alternate codec: JSON values inside length-delimited
/// frames.
#[derive(Clone, Debug)]
pub struct JsonCodec {
    max_frame_length: usize,
}

impl JsonCodec {
    /// Construct a codec with a maximum frame length, clamped to
    /// [`MIN_FRAME_LENGTH`]..=[`MAX_FRAME_LENGTH`].
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length: clamp_frame_length(max_frame_length),
        }
    }
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl Codec for JsonCodec {
    type Framer = LengthDelimitedCodec;

    fn framer(&self) -> Self::Framer {
        length_delimited(self.max_frame_length)
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(CodecError::encode)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::decode)
    }

    fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{RequestHeader, ResponseHeader};

    #[test]
    fn frame_length_is_clamped() {
        assert_eq!(BincodeCodec::new(1).max_frame_length(), MIN_FRAME_LENGTH);
        assert_eq!(
            JsonCodec::new(usize::MAX).max_frame_length(),
            MAX_FRAME_LENGTH
        );
    }

    #[test]
    fn bincode_headers_survive_a_round_trip() {
        let codec = BincodeCodec::default();
        let header = RequestHeader {
            service_method: "/arith/mul".into(),
            seq: 42,
        };
        let bytes = codec.encode(&header).expect("encode header");
        let back: RequestHeader = codec.decode(&bytes).expect("decode header");
        assert_eq!(back, header);
    }

    #[test]
    fn json_response_headers_are_self_describing() {
        let codec = JsonCodec::default();
        let header = ResponseHeader {
            service_method: "/arith/mul".into(),
            seq: 9,
            error: "boom".into(),
        };
        let bytes = codec.encode(&header).expect("encode header");
        assert!(bytes.starts_with(b"{"));
        let back: ResponseHeader = codec.decode(&bytes).expect("decode header");
        assert_eq!(back, header);
    }

    #[test]
    fn decode_rejects_garbage() {
        let codec = BincodeCodec::default();
        let err = codec.decode::<RequestHeader>(&[0xff; 3]).unwrap_err();
        assert!(matches!(err, CodecError::Decode(_)));
    }
}
