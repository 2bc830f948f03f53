//! Ordered plugin pipeline with request-lifecycle hook points.
//!
//! A [`Plugin`] overrides any subset of the hook methods; the defaults are
//! no-ops. [`PluginContainer`] keeps plugins in insertion order and stops a
//! hook chain at the first error. Containers compose hierarchically at
//! dispatch time: the server-wide container runs first, then the container
//! scoped to the resolved service.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::context::CallContext;

/// Positions in the request lifecycle at which plugins run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookPoint {
    /// Service registration; the only hook that runs outside a call.
    Register,
    /// After `accept()` (and TLS), before the read loop starts.
    PostConnAccept,
    /// Start of each call, before the header frame is read.
    PreReadRequestHeader,
    /// After the header decoded and the service resolved, before the body.
    PostReadRequestHeader,
    /// After the service resolved, before the body frame is read.
    PreReadRequestBody,
    /// After the body frame is read into the context.
    PostReadRequestBody,
    /// Before the response acquires the send lock.
    PreWriteResponse,
    /// After a successful response write.
    PostWriteResponse,
}

impl HookPoint {
    /// Every hook point, in lifecycle order.
    pub const ALL: &'static [HookPoint] = &[
        HookPoint::Register,
        HookPoint::PostConnAccept,
        HookPoint::PreReadRequestHeader,
        HookPoint::PostReadRequestHeader,
        HookPoint::PreReadRequestBody,
        HookPoint::PostReadRequestBody,
        HookPoint::PreWriteResponse,
        HookPoint::PostWriteResponse,
    ];

    /// Hooks that fire before a service path has been resolved. Installing
    /// them on a group container is legal but inert, so group construction
    /// logs a notice for each.
    #[must_use]
    pub fn is_connection_scoped(self) -> bool {
        matches!(
            self,
            HookPoint::PostConnAccept
                | HookPoint::PreReadRequestHeader
                | HookPoint::PostReadRequestHeader
        )
    }
}

/// Error returned by a plugin hook, attributed to the plugin that raised it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("plugin '{plugin}': {message}")]
pub struct PluginError {
    plugin: String,
    message: String,
}

impl PluginError {
    /// Build an error attributed to `plugin`.
    pub fn new(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Name of the plugin that raised the error.
    #[must_use]
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// Error text.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A named object observing or steering the request lifecycle.
///
/// Every hook has a no-op default, so implementors override only the points
/// they care about. [`Plugin::hooks`] declares which points the plugin
/// actually implements; the default claims all of them, which is always
/// safe but makes group registration log unreachable-hook notices. Declare
/// the real set to silence those.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique name used in diagnostics and duplicate detection.
    fn name(&self) -> &str;

    /// Hook points this plugin implements.
    fn hooks(&self) -> &[HookPoint] {
        HookPoint::ALL
    }

    /// Runs for every path a registration produces. Rejecting fails the
    /// whole registration.
    fn register(&self, path: &str, metadata: &[String]) -> Result<(), PluginError> {
        let _ = (path, metadata);
        Ok(())
    }

    /// Runs after a connection is accepted. Rejecting drops the connection
    /// silently.
    async fn post_conn_accept(&self, peer: Option<SocketAddr>) -> Result<(), PluginError> {
        let _ = peer;
        Ok(())
    }

    /// Runs before the header frame is read. Rejecting suppresses the
    /// response for the call: the request is still consumed to keep the
    /// stream framed, but nothing is written back.
    async fn pre_read_request_header(&self, ctx: &mut CallContext) -> Result<(), PluginError> {
        let _ = ctx;
        Ok(())
    }

    /// Runs once the header decoded and the target service resolved. May
    /// retarget the call via [`CallContext::set_service_method`]; rejecting
    /// produces an error response.
    async fn post_read_request_header(&self, ctx: &mut CallContext) -> Result<(), PluginError> {
        let _ = ctx;
        Ok(())
    }

    /// Runs before the body frame is read.
    async fn pre_read_request_body(&self, ctx: &mut CallContext) -> Result<(), PluginError> {
        let _ = ctx;
        Ok(())
    }

    /// Runs with the raw argument bytes in the context; may transform or
    /// validate them before the invoker decodes.
    async fn post_read_request_body(&self, ctx: &mut CallContext) -> Result<(), PluginError> {
        let _ = ctx;
        Ok(())
    }

    /// Runs before the response takes the send lock; may mutate the encoded
    /// reply. Rejecting aborts the write.
    async fn pre_write_response(&self, ctx: &mut CallContext) -> Result<(), PluginError> {
        let _ = ctx;
        Ok(())
    }

    /// Observes a successfully written response.
    async fn post_write_response(&self, ctx: &CallContext) -> Result<(), PluginError> {
        let _ = ctx;
        Ok(())
    }
}

/// Insertion-ordered plugin list with typed invocation per hook point.
#[derive(Clone, Default)]
pub struct PluginContainer {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl std::fmt::Debug for PluginContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.plugins.iter().map(|p| p.name().to_owned()))
            .finish()
    }
}

impl PluginContainer {
    /// Empty container.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a plugin, preserving insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error when a plugin with the same name is already present.
    pub fn add(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        if self.plugins.iter().any(|p| p.name() == plugin.name()) {
            return Err(PluginError::new(
                plugin.name(),
                "a plugin with this name is already installed",
            ));
        }
        self.plugins.push(plugin);
        Ok(())
    }

    /// Registered plugins in insertion order.
    #[must_use]
    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    /// Number of registered plugins.
    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Whether the container is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub(crate) fn do_register(&self, path: &str, metadata: &[String]) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            plugin.register(path, metadata)?;
        }
        Ok(())
    }

    pub(crate) async fn do_post_conn_accept(
        &self,
        peer: Option<SocketAddr>,
    ) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            plugin.post_conn_accept(peer).await?;
        }
        Ok(())
    }

    pub(crate) async fn do_pre_read_request_header(
        &self,
        ctx: &mut CallContext,
    ) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            plugin.pre_read_request_header(ctx).await?;
        }
        Ok(())
    }

    pub(crate) async fn do_post_read_request_header(
        &self,
        ctx: &mut CallContext,
    ) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            plugin.post_read_request_header(ctx).await?;
        }
        Ok(())
    }

    pub(crate) async fn do_pre_read_request_body(
        &self,
        ctx: &mut CallContext,
    ) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            plugin.pre_read_request_body(ctx).await?;
        }
        Ok(())
    }

    pub(crate) async fn do_post_read_request_body(
        &self,
        ctx: &mut CallContext,
    ) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            plugin.post_read_request_body(ctx).await?;
        }
        Ok(())
    }

    pub(crate) async fn do_pre_write_response(
        &self,
        ctx: &mut CallContext,
    ) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            plugin.pre_write_response(ctx).await?;
        }
        Ok(())
    }

    pub(crate) async fn do_post_write_response(&self, ctx: &CallContext) -> Result<(), PluginError> {
        for plugin in &self.plugins {
            plugin.post_write_response(ctx).await?;
        }
        Ok(())
    }
}
