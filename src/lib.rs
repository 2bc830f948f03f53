//! Server core of a pluggable RPC framework.
//!
//! This crate provides the building blocks for a framed request/response
//! RPC server: a path-keyed service registry with group prefixes, a
//! swappable wire [`Codec`], an ordered [`Plugin`] pipeline with
//! request-lifecycle hooks, pooled per-call contexts, and a connection
//! loop with panic containment and graceful shutdown.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use callframe::{
//!     CallContext, HandlerFuture, Method, Receiver, RpcServer, ServerConfig,
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Args {
//!     a: i32,
//!     b: i32,
//! }
//!
//! fn mul<'a>(args: Args, _ctx: &'a mut CallContext) -> HandlerFuture<'a, i32> {
//!     Box::pin(async move { Ok(args.a * args.b) })
//! }
//!
//! struct Arith;
//!
//! impl<C: callframe::Codec> Receiver<C> for Arith {
//!     fn name(&self) -> &str {
//!         "Arith"
//!     }
//!
//!     fn methods(&self) -> Vec<Method<C>> {
//!         vec![Method::handler("Mul", mul)]
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = RpcServer::new(ServerConfig::default());
//! server.register(&Arith, &[])?;
//! Arc::new(server).serve("127.0.0.1:8972").await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod codec;
pub mod connection;
pub mod context;
pub mod frame;
pub mod metrics;
pub mod plugin;
pub mod server;
pub mod service;

pub use builder::{DottedPathScheme, PathScheme, UrlPathScheme};
pub use codec::{BincodeCodec, Codec, CodecError, JsonCodec};
pub use connection::CodecConn;
pub use context::CallContext;
pub use frame::{RequestHeader, ResponseHeader, RpcErrorKind, CONNECTED, DEFAULT_RPC_PATH};
pub use plugin::{HookPoint, Plugin, PluginContainer, PluginError};
pub use server::{
    BackoffConfig, RegisterError, RpcServer, ServerConfig, ServerError, ServiceGroup,
};
pub use service::{HandlerFuture, Method, MethodError, Receiver, Service};
