//! HTTP CONNECT handshake serving.
//!
//! RPC over HTTP works by hijacking: the client sends a CONNECT request to
//! the configured path, the server answers with the historical
//! `200 Connected to Go RPC` status line, and the raw stream then carries
//! the standard framed protocol. Only the request head is parsed; any
//! bytes buffered past it are replayed into the connection loop.

use std::sync::Arc;

use bytes::BytesMut;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::{codec::Codec, connection::CodecConn, frame::CONNECTED};

use super::{RpcServer, ServerError};

/// Upper bound on the request head; longer heads drop the connection.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

const METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Length: 17\r\n\
Connection: close\r\n\
\r\n\
405 must CONNECT\n";

const NOT_FOUND: &[u8] = b"HTTP/1.1 404 Not Found\r\n\
Content-Type: text/plain; charset=utf-8\r\n\
Content-Length: 19\r\n\
Connection: close\r\n\
\r\n\
404 page not found\n";

impl<C: Codec> RpcServer<C> {
    /// Serve RPC over HTTP CONNECT on `rpc_path`, or the configured path
    /// when `None`.
    ///
    /// Requests with any other method receive `405 must CONNECT`; CONNECT
    /// requests are hijacked into the standard connection loop.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Stopped`] when the server was already shut
    /// down.
    pub async fn serve_http(
        self: Arc<Self>,
        listener: TcpListener,
        rpc_path: Option<&str>,
    ) -> Result<(), ServerError> {
        self.start_listening(&listener)?;
        let rpc_path = rpc_path
            .map(str::to_owned)
            .unwrap_or_else(|| self.config.rpc_path.clone());
        let backoff = self.config.backoff.normalised();
        let mut delay = backoff.initial_delay;
        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _peer)) => {
                        delay = backoff.initial_delay;
                        let server = Arc::clone(&self);
                        let rpc_path = rpc_path.clone();
                        tokio::spawn(async move {
                            server.handshake_http(stream, &rpc_path).await;
                        });
                    }
                    Err(err) => {
                        debug!("rpc: accept: {err}");
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(backoff.max_delay);
                    }
                },
            }
        }
        Ok(())
    }

    async fn handshake_http(self: Arc<Self>, mut stream: TcpStream, rpc_path: &str) {
        let (head, leftover) = match read_request_head(&mut stream).await {
            Some(parts) => parts,
            None => return,
        };
        let (method, target) = match parse_request_line(&head) {
            Some(parts) => parts,
            None => return,
        };

        let path = target.split('?').next().unwrap_or(target.as_str());
        if path != rpc_path {
            let _ = stream.write_all(NOT_FOUND).await;
            return;
        }
        if method != "CONNECT" {
            let _ = stream.write_all(METHOD_NOT_ALLOWED).await;
            return;
        }

        let peer = stream.peer_addr().ok();
        if let Err(err) = self.plugins().do_post_conn_accept(peer).await {
            debug!("rpc: post-conn-accept: {err}");
            return;
        }

        let connected = format!("HTTP/1.0 {CONNECTED}\n\n");
        if let Err(err) = stream.write_all(connected.as_bytes()).await {
            debug!("rpc: hijacking {peer:?}: {err}");
            return;
        }

        let codec = self.codec.clone();
        let conn = CodecConn::with_read_buffer(stream, codec, leftover);
        self.serve_codec_conn(conn).await;
    }
}

/// Read up to and including the head terminator, returning the head and
/// any bytes buffered past it. The historical client terminates its
/// request with bare `\n\n`, so both terminators are accepted.
async fn read_request_head(stream: &mut TcpStream) -> Option<(BytesMut, BytesMut)> {
    let mut buf = BytesMut::with_capacity(1024);
    loop {
        if let Some(end) = head_end(&buf) {
            let head = buf.split_to(end);
            return Some((head, buf));
        }
        if buf.len() > MAX_REQUEST_HEAD {
            return None;
        }
        match stream.read_buf(&mut buf).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

fn head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
        .or_else(|| buf.windows(2).position(|w| w == b"\n\n").map(|i| i + 2))
}

fn parse_request_line(head: &[u8]) -> Option<(String, String)> {
    let text = std::str::from_utf8(head).ok()?;
    let line = text.lines().next()?.trim_end_matches('\r');
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_owned();
    let target = parts.next()?.to_owned();
    Some((method, target))
}
