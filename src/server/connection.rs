//! Per-connection read/dispatch/write state machine.
//!
//! One reader task drives each connection: it reads a header frame, runs
//! the header hooks, resolves the target service, always consumes the body
//! frame (so the stream stays framed even when dispatch fails), and spawns
//! one call task per decoded request. Call tasks invoke the service inside
//! a panic boundary and write their response under the connection's send
//! mutex, so slow calls never block decoding and responses never
//! interleave at the byte level.

use std::any::Any;
use std::io;
use std::sync::Arc;

use futures::FutureExt;
use log::{debug, error};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Semaphore;

use crate::{
    codec::{Codec, CodecError},
    connection::{CodecConn, ConnReader, ConnWriter},
    context::CallContext,
    frame::RpcErrorKind,
    metrics,
    plugin::PluginContainer,
    service::{InvokeError, Service},
};

use super::{RpcServer, ServerError};

/// Render a recovered panic payload for the log line. Panics raise either
/// a string literal or a formatted `String`; anything else is opaque.
pub(super) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Result of reading one request, mirroring the
/// `(keep_reading, suppress_response, error)` contract: `Call` and
/// `ErrorResponse` keep reading, `Suppressed` keeps reading without
/// writing, the last two terminate the loop.
enum ReadOutcome<C: Codec> {
    /// Header and body decoded; dispatch to the resolved service.
    Call(Arc<Service<C>>),
    /// Header was framed cleanly but the call cannot proceed; write an
    /// error response with the mirrored `seq`. When the target service was
    /// already resolved it rides along so its scoped write hooks still run.
    ErrorResponse {
        errmsg: String,
        service: Option<Arc<Service<C>>>,
    },
    /// A pre-read hook rejected the call; the request was consumed and
    /// nothing must be written for its `seq`.
    Suppressed(String),
    /// Peer closed between calls.
    CleanEof,
    /// Framing is corrupt or the header read timed out.
    Fatal(CodecError),
}

impl<C: Codec> RpcServer<C> {
    /// Serve one duplex stream with the server's codec bound to it.
    ///
    /// Blocks until the peer hangs up or the server stops running.
    pub async fn serve_conn<T>(self: Arc<Self>, io: T)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let codec = self.codec.clone();
        self.serve_codec_conn(CodecConn::new(io, codec)).await;
    }

    /// Serve a connection whose codec the caller has already bound.
    pub async fn serve_codec_conn<T>(self: Arc<Self>, conn: CodecConn<T, C>)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if !self.ensure_running() {
            let mut conn = conn;
            conn.close().await;
            return;
        }
        metrics::inc_connections();
        let (mut reader, writer) = conn.split();
        let limiter = self
            .config
            .max_inflight_calls
            .map(|n| Arc::new(Semaphore::new(n)));

        while self.is_running() {
            let mut ctx = self.ctx_pool.acquire();
            match self.read_request(&mut reader, &mut ctx).await {
                ReadOutcome::Call(service) => {
                    let permit = match &limiter {
                        Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
                        None => None,
                    };
                    let server = Arc::clone(&self);
                    let writer = writer.clone();
                    self.calls.spawn(async move {
                        let _permit = permit;
                        server.dispatch_call(&writer, &mut ctx, &service).await;
                        server.ctx_pool.release(ctx);
                    });
                }
                ReadOutcome::ErrorResponse { errmsg, service } => {
                    debug!("rpc: {errmsg}");
                    let scoped = service.as_ref().map(|s| s.plugins());
                    self.send_response(&writer, &mut ctx, &errmsg, scoped).await;
                    self.ctx_pool.release(ctx);
                }
                ReadOutcome::Suppressed(errmsg) => {
                    debug!("rpc: {errmsg}");
                    self.ctx_pool.release(ctx);
                }
                ReadOutcome::CleanEof => {
                    self.ctx_pool.release(ctx);
                    break;
                }
                ReadOutcome::Fatal(err) => {
                    debug!("rpc: {err}");
                    self.ctx_pool.release(ctx);
                    break;
                }
            }
        }
        // The stream closes once the reader half and the last call task's
        // writer clone drop, after every in-flight response is written.
        metrics::dec_connections();
    }

    /// Decode and dispatch exactly one request synchronously. Does not
    /// close the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Stopped`] after shutdown, and the read or
    /// dispatch failure otherwise. An error response is still written
    /// whenever the header was framed cleanly.
    pub async fn serve_request<T>(&self, conn: &mut CodecConn<T, C>) -> Result<(), ServerError>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if !self.ensure_running() {
            return Err(ServerError::Stopped);
        }
        let mut ctx = self.ctx_pool.acquire();
        let outcome = self.read_request(&mut conn.reader, &mut ctx).await;
        let result = match outcome {
            ReadOutcome::Call(service) => {
                let call = async {
                    self.dispatch_call(&conn.writer, &mut ctx, &service).await;
                };
                self.calls.track_future(call).await;
                Ok(())
            }
            ReadOutcome::ErrorResponse { errmsg, service } => {
                let scoped = service.as_ref().map(|s| s.plugins());
                self.send_response(&conn.writer, &mut ctx, &errmsg, scoped).await;
                Err(ServerError::Request(errmsg))
            }
            ReadOutcome::Suppressed(errmsg) => Err(ServerError::Request(errmsg)),
            ReadOutcome::CleanEof => Err(ServerError::Io(io::ErrorKind::UnexpectedEof.into())),
            ReadOutcome::Fatal(err) => Err(ServerError::Request(err.to_string())),
        };
        self.ctx_pool.release(ctx);
        result
    }

    async fn read_request<T>(
        &self,
        reader: &mut ConnReader<T, C>,
        ctx: &mut CallContext,
    ) -> ReadOutcome<C>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        // Runs before the header frame is pulled; a rejection still
        // consumes the whole request so the stream stays framed.
        let pre_err = self.plugins().do_pre_read_request_header(ctx).await.err();

        let read_timeout = self.config.effective_read_timeout();
        let header = if read_timeout.is_zero() {
            reader.read_header().await
        } else {
            match tokio::time::timeout(read_timeout, reader.read_header()).await {
                Ok(result) => result,
                Err(_) => {
                    return ReadOutcome::Fatal(CodecError::Io(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "header read timed out",
                    )))
                }
            }
        };
        ctx.req = match header {
            Ok(Some(header)) => header,
            Ok(None) => return ReadOutcome::CleanEof,
            Err(err @ CodecError::Decode(_)) => {
                // The frame arrived intact but did not parse as a header.
                // The stream is still framed: consume the matching body and
                // answer under the zero seq.
                let _ = reader.read_body().await;
                return ReadOutcome::ErrorResponse {
                    errmsg: format!("rpc: reading header: {err}"),
                    service: None,
                };
            }
            Err(err) => return ReadOutcome::Fatal(err),
        };

        if let Some(err) = pre_err {
            ctx.suppress_response = true;
            ctx.error_kind = RpcErrorKind::Plugin;
            if let Err(read_err) = reader.read_body().await {
                return ReadOutcome::Fatal(read_err);
            }
            return ReadOutcome::Suppressed(err.to_string());
        }

        let requested = ctx.req.service_method.clone();
        let service = match self.resolve(ctx) {
            Some(service) => service,
            None => return self.unknown_method(reader, ctx).await,
        };

        let hooks = match self.plugins().do_post_read_request_header(ctx).await {
            Ok(()) => service.plugins().do_post_read_request_header(ctx).await,
            Err(err) => Err(err),
        };
        if let Err(err) = hooks {
            ctx.error_kind = RpcErrorKind::Plugin;
            let _ = reader.read_body().await;
            return ReadOutcome::ErrorResponse {
                errmsg: err.to_string(),
                service: Some(service),
            };
        }

        // A header hook may have retargeted the call.
        let service = if ctx.req.service_method == requested {
            service
        } else {
            match self.resolve(ctx) {
                Some(service) => service,
                None => return self.unknown_method(reader, ctx).await,
            }
        };

        let hooks = match self.plugins().do_pre_read_request_body(ctx).await {
            Ok(()) => service.plugins().do_pre_read_request_body(ctx).await,
            Err(err) => Err(err),
        };
        if let Err(err) = hooks {
            ctx.error_kind = RpcErrorKind::Plugin;
            let _ = reader.read_body().await;
            return ReadOutcome::ErrorResponse {
                errmsg: err.to_string(),
                service: Some(service),
            };
        }

        match reader.read_body().await {
            Ok(body) => ctx.argument = body,
            Err(err) => {
                return ReadOutcome::ErrorResponse {
                    errmsg: format!("rpc: reading body: {err}"),
                    service: Some(service),
                }
            }
        }

        let hooks = match self.plugins().do_post_read_request_body(ctx).await {
            Ok(()) => service.plugins().do_post_read_request_body(ctx).await,
            Err(err) => Err(err),
        };
        if let Err(err) = hooks {
            ctx.error_kind = RpcErrorKind::Plugin;
            return ReadOutcome::ErrorResponse {
                errmsg: err.to_string(),
                service: Some(service),
            };
        }

        ReadOutcome::Call(service)
    }

    /// Discard the body to keep the stream framed, then report the miss.
    async fn unknown_method<T>(
        &self,
        reader: &mut ConnReader<T, C>,
        ctx: &mut CallContext,
    ) -> ReadOutcome<C>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        ctx.error_kind = RpcErrorKind::Dispatch;
        let _ = reader.read_body().await;
        ReadOutcome::ErrorResponse {
            errmsg: format!("rpc: can't find service/method '{}'", ctx.req.service_method),
            service: None,
        }
    }

    fn resolve(&self, ctx: &mut CallContext) -> Option<Arc<Service<C>>> {
        let service_method = ctx.req.service_method.clone();
        let (path, query) = match service_method.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (service_method.as_str(), None),
        };
        let service = self.lookup(path)?;
        ctx.service_path = path.to_owned();
        ctx.query.clear();
        if let Some(query) = query {
            ctx.parse_query(query);
        }
        Some(service)
    }

    pub(crate) async fn dispatch_call<T>(
        &self,
        writer: &ConnWriter<T, C>,
        ctx: &mut CallContext,
        service: &Arc<Service<C>>,
    ) where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        metrics::inc_calls();
        let invoked = std::panic::AssertUnwindSafe(service.invoke(&self.codec, ctx))
            .catch_unwind()
            .await;
        let errmsg = match invoked {
            Ok(Ok(reply)) => {
                ctx.reply = reply;
                String::new()
            }
            Ok(Err(InvokeError::Method(err))) => {
                metrics::inc_call_errors();
                ctx.error_kind = RpcErrorKind::Service;
                err.to_string()
            }
            Ok(Err(err)) => {
                metrics::inc_call_errors();
                err.to_string()
            }
            Err(payload) => {
                metrics::inc_call_panics();
                error!(
                    "rpc: ({path}) seq {seq}: panic: {msg}",
                    path = service.path(),
                    seq = ctx.req.seq,
                    msg = panic_message(payload.as_ref())
                );
                ctx.error_kind = RpcErrorKind::ServicePanic;
                "Service Panic!".to_owned()
            }
        };
        self.send_response(writer, ctx, &errmsg, Some(service.plugins()))
            .await;
    }

    /// Mirror the request identifiers into the response and write it.
    ///
    /// A non-empty `errmsg` replaces the reply body with the sentinel empty
    /// value; the client never decodes the body of an error response.
    pub(crate) async fn send_response<T>(
        &self,
        writer: &ConnWriter<T, C>,
        ctx: &mut CallContext,
        errmsg: &str,
        scoped: Option<&PluginContainer>,
    ) where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        ctx.resp.service_method = ctx.req.service_method.clone();
        ctx.resp.seq = ctx.req.seq;
        if !errmsg.is_empty() {
            ctx.resp.error = errmsg.to_owned();
            ctx.reply = self.codec.encode(&()).unwrap_or_default();
        }

        let hooks = match self.plugins().do_pre_write_response(ctx).await {
            Ok(()) => match scoped {
                Some(container) => container.do_pre_write_response(ctx).await,
                None => Ok(()),
            },
            Err(err) => Err(err),
        };
        if let Err(err) = hooks {
            debug!("rpc: pre-write hook aborted response: {err}");
            return;
        }

        let write_timeout = self.config.effective_write_timeout();
        match writer.write_response(&ctx.resp, &ctx.reply, write_timeout).await {
            Ok(()) => {
                let hooks = match self.plugins().do_post_write_response(ctx).await {
                    Ok(()) => match scoped {
                        Some(container) => container.do_post_write_response(ctx).await,
                        None => Ok(()),
                    },
                    Err(err) => Err(err),
                };
                if let Err(err) = hooks {
                    debug!("rpc: post-write hook: {err}");
                }
            }
            Err(err) => debug!("rpc: writing response: {err}"),
        }
    }
}
