//! Serve entry points, the accept loop, and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::time::{sleep, timeout};
use tokio_rustls::{rustls, TlsAcceptor};

use crate::codec::Codec;

use super::{connection::panic_message, RpcServer, ServerError};

impl<C: Codec> RpcServer<C> {
    /// Bind `addr` and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] when the listener cannot be created
    /// and [`ServerError::Stopped`] when the server was already shut down.
    pub async fn serve(self: Arc<Self>, addr: impl ToSocketAddrs) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
        self.serve_listener(listener).await
    }

    /// Bind `addr` and serve TLS connections until shutdown.
    ///
    /// The handshake runs per connection before the read loop; handshake
    /// failures drop the connection without affecting the accept loop.
    ///
    /// # Errors
    ///
    /// See [`RpcServer::serve`].
    pub async fn serve_tls(
        self: Arc<Self>,
        addr: impl ToSocketAddrs,
        tls: Arc<rustls::ServerConfig>,
    ) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;
        self.serve_tls_listener(listener, tls).await
    }

    /// Adopt a caller-supplied listener and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Stopped`] when the server was already shut
    /// down.
    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        self.start_listening(&listener)?;
        self.accept_loop(listener, |server, stream| async move {
            server.serve_accepted(stream, None).await;
        })
        .await;
        Ok(())
    }

    /// Adopt a caller-supplied listener, wrapping each connection in TLS.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Stopped`] when the server was already shut
    /// down.
    pub async fn serve_tls_listener(
        self: Arc<Self>,
        listener: TcpListener,
        tls: Arc<rustls::ServerConfig>,
    ) -> Result<(), ServerError> {
        self.start_listening(&listener)?;
        let acceptor = TlsAcceptor::from(tls);
        self.accept_loop(listener, move |server, stream| {
            let acceptor = acceptor.clone();
            async move {
                server.serve_accepted(stream, Some(acceptor)).await;
            }
        })
        .await;
        Ok(())
    }

    /// Accept connections until the shutdown token fires. Transient accept
    /// failures retry with exponential back-off; the post-shutdown accept
    /// error is swallowed by polling the token first.
    async fn accept_loop<H, Fut>(self: Arc<Self>, listener: TcpListener, handler: H)
    where
        H: Fn(Arc<Self>, TcpStream) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let backoff = self.config.backoff.normalised();
        let mut delay = backoff.initial_delay;
        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _peer)) => {
                        delay = backoff.initial_delay;
                        let conn = handler(Arc::clone(&self), stream);
                        tokio::spawn(async move {
                            if let Err(panic) =
                                std::panic::AssertUnwindSafe(conn).catch_unwind().await
                            {
                                error!(
                                    "rpc: connection task panicked: {}",
                                    panic_message(panic.as_ref())
                                );
                            }
                        });
                    }
                    Err(err) => {
                        warn!("rpc: accept error: {err}");
                        sleep(delay).await;
                        delay = (delay * 2).min(backoff.max_delay);
                    }
                },
            }
        }
    }

    /// Run the post-accept plugin chain (after TLS, when configured) and
    /// enter the connection loop. Rejections drop the connection silently.
    async fn serve_accepted(self: Arc<Self>, stream: TcpStream, tls: Option<TlsAcceptor>) {
        let peer = stream.peer_addr().ok();
        match tls {
            None => {
                if let Err(err) = self.plugins().do_post_conn_accept(peer).await {
                    debug!("rpc: post-conn-accept: {err}");
                    return;
                }
                self.serve_conn(stream).await;
            }
            Some(acceptor) => {
                let stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        debug!("rpc: tls handshake: {err}");
                        return;
                    }
                };
                if let Err(err) = self.plugins().do_post_conn_accept(peer).await {
                    debug!("rpc: post-conn-accept: {err}");
                    return;
                }
                self.serve_conn(stream).await;
            }
        }
    }

    pub(crate) fn start_listening(&self, listener: &TcpListener) -> Result<(), ServerError> {
        if !self.ensure_running() {
            return Err(ServerError::Stopped);
        }
        let addr = listener.local_addr().ok();
        self.set_local_addr(addr);
        if let Some(addr) = addr {
            info!("rpc: listening and serving TCP on {addr}");
        }
        Ok(())
    }

    /// Stop accepting, flip `running` off, and wait up to `deadline` for
    /// in-flight calls to drain.
    ///
    /// A fired deadline returns [`ServerError::ShutdownTimeout`] but does
    /// not terminate the remaining calls; their connections keep serving
    /// the requests they already decoded.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::ShutdownTimeout`] when calls were still in
    /// flight at the deadline.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), ServerError> {
        self.shutdown.cancel();
        if !self.stop_running() {
            return Ok(());
        }
        if let Some(addr) = self.local_addr() {
            info!("rpc: stopped listening on {addr}");
        }
        self.calls.close();
        match timeout(deadline, self.calls.wait()).await {
            Ok(()) => Ok(()),
            Err(_) => Err(ServerError::ShutdownTimeout),
        }
    }
}
