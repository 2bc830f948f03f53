//! Services, methods, and the typed-invoker seam.
//!
//! A [`Receiver`] is the user object offered for registration: it names
//! itself and enumerates its callable [`Method`]s. Each method wraps an
//! async handler behind an object-safe invoker that decodes the argument
//! and encodes the reply with the server's codec, so the registry and the
//! connection loop never see concrete argument or reply types. The handler
//! signature is the qualification rule: an argument that deserializes, a
//! reply that serializes, and an error return.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

use crate::{
    codec::{Codec, CodecError},
    context::CallContext,
    plugin::PluginContainer,
};

/// Future returned by a method handler, borrowing the call context.
pub type HandlerFuture<'a, Reply> = BoxFuture<'a, Result<Reply, MethodError>>;

/// Error returned by a method handler; its text becomes the response's
/// error string.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct MethodError {
    message: String,
}

impl MethodError {
    /// Build an error from any displayable message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&str> for MethodError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for MethodError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

#[derive(Debug, Error)]
pub(crate) enum InvokeError {
    #[error("rpc: decoding argument: {0}")]
    DecodeArgument(#[source] CodecError),
    #[error("rpc: encoding reply: {0}")]
    EncodeReply(#[source] CodecError),
    #[error("{0}")]
    Method(MethodError),
}

/// Object-safe call seam: decode the argument from the context, run the
/// handler, encode the reply.
#[async_trait]
pub(crate) trait Invoke<C: Codec>: Send + Sync {
    async fn invoke(&self, codec: &C, ctx: &mut CallContext) -> Result<Vec<u8>, InvokeError>;
}

struct HandlerInvoker<Arg, Reply, F> {
    handler: F,
    _types: PhantomData<fn(Arg) -> Reply>,
}

#[async_trait]
impl<C, Arg, Reply, F> Invoke<C> for HandlerInvoker<Arg, Reply, F>
where
    C: Codec,
    Arg: DeserializeOwned + Send + 'static,
    Reply: Serialize + Send + 'static,
    F: for<'a> Fn(Arg, &'a mut CallContext) -> HandlerFuture<'a, Reply> + Send + Sync + 'static,
{
    async fn invoke(&self, codec: &C, ctx: &mut CallContext) -> Result<Vec<u8>, InvokeError> {
        let arg: Arg = codec
            .decode(ctx.argument())
            .map_err(InvokeError::DecodeArgument)?;
        let reply = (self.handler)(arg, ctx)
            .await
            .map_err(InvokeError::Method)?;
        codec.encode(&reply).map_err(InvokeError::EncodeReply)
    }
}

/// One callable method extracted from a receiver.
pub struct Method<C: Codec> {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    invoker: Arc<dyn Invoke<C>>,
}

impl<C: Codec> Method<C> {
    /// Wrap an async handler as a routable method.
    ///
    /// `name` becomes the final path segment. The handler receives the
    /// decoded argument and mutable access to the call context for the
    /// duration of the call.
    pub fn handler<Arg, Reply, F>(name: impl Into<String>, handler: F) -> Self
    where
        Arg: DeserializeOwned + Send + 'static,
        Reply: Serialize + Send + 'static,
        F: for<'a> Fn(Arg, &'a mut CallContext) -> HandlerFuture<'a, Reply>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            arg_type: std::any::type_name::<Arg>(),
            reply_type: std::any::type_name::<Reply>(),
            invoker: Arc::new(HandlerInvoker {
                handler,
                _types: PhantomData,
            }),
        }
    }

    /// Method name before path normalisation.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The user object offered for registration.
pub trait Receiver<C: Codec>: Send + Sync + 'static {
    /// Type name used as the path segment ahead of each method name.
    fn name(&self) -> &str;

    /// The callable methods this receiver exposes. Registration fails when
    /// the set is empty.
    fn methods(&self) -> Vec<Method<C>>;
}

/// A registered, addressable unit of invocation. Immutable after
/// registration.
pub struct Service<C: Codec> {
    path: String,
    arg_type: &'static str,
    reply_type: &'static str,
    invoker: Arc<dyn Invoke<C>>,
    plugins: PluginContainer,
}

impl<C: Codec> Service<C> {
    pub(crate) fn new(path: String, method: &Method<C>, plugins: PluginContainer) -> Self {
        Self {
            path,
            arg_type: method.arg_type,
            reply_type: method.reply_type,
            invoker: Arc::clone(&method.invoker),
            plugins,
        }
    }

    /// Unique path the service is registered under.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Argument type descriptor, for diagnostics.
    #[must_use]
    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    /// Reply type descriptor, for diagnostics.
    #[must_use]
    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    /// Plugin container scoped to this service.
    #[must_use]
    pub fn plugins(&self) -> &PluginContainer {
        &self.plugins
    }

    pub(crate) async fn invoke(
        &self,
        codec: &C,
        ctx: &mut CallContext,
    ) -> Result<Vec<u8>, InvokeError> {
        self.invoker.invoke(codec, ctx).await
    }
}
