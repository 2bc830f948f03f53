//! Error taxonomy for the codec layer.

use std::{error::Error, io};

use thiserror::Error;

/// Errors raised while framing, encoding, or decoding call traffic.
///
/// The connection loop treats [`CodecError::Eof`] on a header read as a clean
/// peer departure; every other variant on the header path is
/// connection-fatal, while body-path errors stay call-local.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CodecError {
    /// Serializing a header or body value failed.
    #[error("encode error: {0}")]
    Encode(#[source] Box<dyn Error + Send + Sync>),

    /// Deserializing a header or body value failed.
    #[error("decode error: {0}")]
    Decode(#[source] Box<dyn Error + Send + Sync>),

    /// The underlying transport failed, including frame-boundary violations
    /// surfaced by the framer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the stream.
    #[error("connection closed")]
    Eof,
}

impl CodecError {
    /// Wrap a serializer error as [`CodecError::Encode`].
    pub fn encode<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Encode(Box::new(err))
    }

    /// Wrap a deserializer error as [`CodecError::Decode`].
    pub fn decode<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Decode(Box::new(err))
    }

    /// Whether this error is a clean end-of-stream.
    #[must_use]
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }
}
