//! Errors raised by server configuration, registration, and serving.

use std::io;

use thiserror::Error;

use crate::plugin::PluginError;

/// Fatal registration failures. The server refuses to start rather than
/// serve a partial registry.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegisterError {
    /// A name segment contained characters outside `[A-Za-z0-9._-]`.
    #[error("rpc: invalid name '{0}'")]
    InvalidName(String),

    /// The receiver exposed no callable methods.
    #[error("rpc: can not register invalid service '{0}'")]
    NoMethods(String),

    /// The path is already present in the registry.
    #[error("rpc: service already exists at '{0}'")]
    DuplicatePath(String),

    /// A register hook rejected the path.
    #[error("rpc: {0}")]
    Plugin(#[from] PluginError),

    /// Several paths failed during one registration; all failures are
    /// reported together.
    #[error("rpc: {}", .0.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    Multi(Vec<RegisterError>),
}

/// Errors that may occur while configuring or running the server.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    /// Binding or configuring the listener failed.
    #[error("bind error: {0}")]
    Bind(#[source] io::Error),

    /// The server has been shut down (or never started) and cannot serve.
    #[error("rpc: server has stopped")]
    Stopped,

    /// The shutdown deadline fired before in-flight calls drained.
    #[error("rpc: shutdown deadline elapsed with calls still in flight")]
    ShutdownTimeout,

    /// A single synchronously served request failed.
    #[error("rpc: {0}")]
    Request(String),

    /// A registration failed.
    #[error(transparent)]
    Register(#[from] RegisterError),

    /// Transport failure outside the per-connection loop.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
