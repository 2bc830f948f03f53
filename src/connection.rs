//! Codec-bound connection adapter.
//!
//! [`CodecConn`] wraps a duplex byte stream in the codec's framer and
//! exposes the four operations the connection loop needs: read one header
//! frame, read the body frame that must follow it, write a framed response,
//! and close. The ordering contract is the caller's responsibility: every
//! successful header read is followed by exactly one body read, even when
//! the call will be rejected, so the stream stays framed.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, FramedParts};

use crate::{
    codec::{Codec, CodecError},
    frame::{RequestHeader, ResponseHeader},
};

/// A duplex stream with a codec bound to it.
///
/// Constructed by the server when a connection is dispatched (the lazy
/// default-codec binding) or by callers that prepared the codec themselves
/// before handing the connection over via
/// [`RpcServer::serve_codec_conn`](crate::server::RpcServer::serve_codec_conn).
pub struct CodecConn<T, C: Codec> {
    pub(crate) reader: ConnReader<T, C>,
    pub(crate) writer: ConnWriter<T, C>,
}

impl<T, C> CodecConn<T, C>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    C: Codec,
{
    /// Bind `codec` to `io`.
    pub fn new(io: T, codec: C) -> Self {
        Self::from_framed(Framed::new(io, codec.framer()), codec)
    }

    /// Bind `codec` to `io`, replaying `read_buf` before any fresh bytes.
    ///
    /// Used by the HTTP CONNECT handshake, which may have buffered RPC bytes
    /// past the end of the request head.
    pub(crate) fn with_read_buffer(io: T, codec: C, read_buf: BytesMut) -> Self {
        let mut parts = FramedParts::new::<Bytes>(io, codec.framer());
        parts.read_buf = read_buf;
        Self::from_framed(Framed::from_parts(parts), codec)
    }

    fn from_framed(framed: Framed<T, C::Framer>, codec: C) -> Self {
        let (sink, stream) = framed.split();
        Self {
            reader: ConnReader {
                stream,
                codec: codec.clone(),
            },
            writer: ConnWriter {
                sink: Arc::new(Mutex::new(sink)),
                codec,
            },
        }
    }

    /// Read and decode the next request header.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly between
    /// calls.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Io`] when framing fails and
    /// [`CodecError::Decode`] when the frame does not parse as a header.
    pub async fn read_request_header(&mut self) -> Result<Option<RequestHeader>, CodecError> {
        self.reader.read_header().await
    }

    /// Read the raw body frame matched to the most recent header.
    ///
    /// Dropping the returned bytes discards the body without decoding it.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Eof`] when the stream ends mid-call.
    pub async fn read_request_body(&mut self) -> Result<Bytes, CodecError> {
        self.reader.read_body().await
    }

    /// Write a framed response: header frame, then body frame.
    ///
    /// # Errors
    ///
    /// Returns any encode or transport error from the write path.
    pub async fn write_response(
        &mut self,
        header: &ResponseHeader,
        body: &[u8],
    ) -> Result<(), CodecError> {
        self.writer.write_response(header, body, Duration::ZERO).await
    }

    /// Release the underlying stream. Safe to call more than once.
    pub async fn close(&mut self) {
        self.writer.close().await;
    }

    pub(crate) fn split(self) -> (ConnReader<T, C>, ConnWriter<T, C>) {
        (self.reader, self.writer)
    }
}

/// Read half of a [`CodecConn`], owned by the connection's reader task.
pub(crate) struct ConnReader<T, C: Codec> {
    stream: SplitStream<Framed<T, C::Framer>>,
    codec: C,
}

impl<T, C> ConnReader<T, C>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    C: Codec,
{
    pub(crate) async fn read_header(&mut self) -> Result<Option<RequestHeader>, CodecError> {
        match self.stream.next().await {
            None => Ok(None),
            Some(Err(err)) => Err(CodecError::Io(err)),
            Some(Ok(frame)) => self.codec.decode(&frame).map(Some),
        }
    }

    pub(crate) async fn read_body(&mut self) -> Result<Bytes, CodecError> {
        match self.stream.next().await {
            None => Err(CodecError::Eof),
            Some(Err(err)) => Err(CodecError::Io(err)),
            Some(Ok(frame)) => Ok(frame.freeze()),
        }
    }
}

/// Write half of a [`CodecConn`].
///
/// Clones share one send mutex, so concurrent call tasks never interleave
/// response frames at the byte level.
pub(crate) struct ConnWriter<T, C: Codec> {
    sink: Arc<Mutex<SplitSink<Framed<T, C::Framer>, Bytes>>>,
    codec: C,
}

impl<T, C: Codec> Clone for ConnWriter<T, C> {
    fn clone(&self) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            codec: self.codec.clone(),
        }
    }
}

impl<T, C> ConnWriter<T, C>
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    C: Codec,
{
    /// Write the header and body frames atomically under the send mutex.
    pub(crate) async fn write_response(
        &self,
        header: &ResponseHeader,
        body: &[u8],
        write_timeout: Duration,
    ) -> Result<(), CodecError> {
        let header_bytes = Bytes::from(self.codec.encode(header)?);
        let body_bytes = Bytes::copy_from_slice(body);
        let mut sink = self.sink.lock().await;
        let write = async {
            sink.feed(header_bytes).await?;
            sink.feed(body_bytes).await?;
            sink.flush().await?;
            Ok(())
        };
        if write_timeout.is_zero() {
            write.await
        } else {
            match tokio::time::timeout(write_timeout, write).await {
                Ok(result) => result,
                Err(_) => Err(CodecError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "response write timed out",
                ))),
            }
        }
    }

    pub(crate) async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }
}
