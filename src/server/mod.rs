//! The RPC server: path-keyed registry, service groups, and serve modes.
//!
//! [`RpcServer`] owns the service map, the server-wide plugin container,
//! the context pool, and the shutdown lifecycle. Registration happens
//! before serving; once a serve loop is entered the registry is expected
//! to be frozen (correctness does not require it, dispatch performance
//! does).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};

use log::{info, warn};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    builder::{check_name, PathScheme, UrlPathScheme},
    codec::{BincodeCodec, Codec},
    context::ContextPool,
    plugin::{Plugin, PluginContainer, PluginError},
    service::{Receiver, Service},
};

mod config;
mod connection;
mod error;
mod http;
mod runtime;

pub use config::{BackoffConfig, ServerConfig};
pub use error::{RegisterError, ServerError};

struct RegistryState<C: Codec> {
    services: HashMap<String, Arc<Service<C>>>,
    routers: Vec<String>,
    running: bool,
    base_metadata: Vec<String>,
}

impl<C: Codec> Default for RegistryState<C> {
    fn default() -> Self {
        Self {
            services: HashMap::new(),
            routers: Vec::new(),
            running: false,
            base_metadata: Vec::new(),
        }
    }
}

/// Process-long RPC server generic over its wire codec.
pub struct RpcServer<C: Codec = BincodeCodec> {
    pub(crate) config: ServerConfig,
    pub(crate) codec: C,
    path_scheme: Arc<dyn PathScheme>,
    plugins: PluginContainer,
    state: RwLock<RegistryState<C>>,
    pub(crate) ctx_pool: ContextPool,
    pub(crate) shutdown: CancellationToken,
    pub(crate) calls: TaskTracker,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl RpcServer<BincodeCodec> {
    /// Server over the default binary codec.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self::with_codec(config, BincodeCodec::default())
    }
}

impl<C: Codec> RpcServer<C> {
    /// Server over a caller-supplied codec.
    #[must_use]
    pub fn with_codec(config: ServerConfig, codec: C) -> Self {
        Self {
            config,
            codec,
            path_scheme: Arc::new(UrlPathScheme),
            plugins: PluginContainer::new(),
            state: RwLock::new(RegistryState::default()),
            ctx_pool: ContextPool::default(),
            shutdown: CancellationToken::new(),
            calls: TaskTracker::new(),
            local_addr: Mutex::new(None),
        }
    }

    /// Replace the path construction scheme. Must happen before any
    /// registration.
    #[must_use]
    pub fn with_path_scheme(mut self, scheme: impl PathScheme) -> Self {
        self.path_scheme = Arc::new(scheme);
        self
    }

    /// Install a server-wide plugin. Plugins are append-only and must be in
    /// place before serving starts.
    ///
    /// # Errors
    ///
    /// Returns an error when a plugin with the same name is already
    /// installed.
    pub fn add_plugin(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        self.plugins.add(plugin)
    }

    /// The server-wide plugin container.
    #[must_use]
    pub fn plugins(&self) -> &PluginContainer {
        &self.plugins
    }

    /// Default metadata appended after call-supplied metadata on every
    /// registration. Must be set before registering services.
    pub fn set_base_metadata(&self, metadata: impl Into<String>) {
        self.state
            .write()
            .expect("registry lock poisoned")
            .base_metadata
            .push(metadata.into());
    }

    /// Registered paths in sorted order.
    #[must_use]
    pub fn routers(&self) -> Vec<String> {
        self.state
            .read()
            .expect("registry lock poisoned")
            .routers
            .clone()
    }

    /// Address of the bound listener, once a serve loop has started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("address lock poisoned")
    }

    /// Register every method of `receiver` under its own name.
    ///
    /// # Errors
    ///
    /// Fails when the name is invalid, the receiver exposes no methods, a
    /// produced path is already registered, or a register hook rejects the
    /// registration. All per-path failures are reported together.
    pub fn register<R: Receiver<C>>(
        &self,
        receiver: &R,
        metadata: &[&str],
    ) -> Result<(), RegisterError> {
        let name = receiver.name().to_owned();
        self.named_register(&name, receiver, metadata)
    }

    /// Like [`RpcServer::register`] with an explicit name for the type
    /// segment.
    ///
    /// # Errors
    ///
    /// See [`RpcServer::register`].
    pub fn named_register<R: Receiver<C>>(
        &self,
        name: &str,
        receiver: &R,
        metadata: &[&str],
    ) -> Result<(), RegisterError> {
        self.register_scoped(&[], name, receiver, PluginContainer::new(), metadata)
    }

    /// Open a service group under `prefix`, carrying `plugins` for every
    /// service registered through it.
    ///
    /// # Errors
    ///
    /// Fails on an invalid prefix or a duplicate plugin name.
    pub fn group(
        &self,
        prefix: &str,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<ServiceGroup<'_, C>, RegisterError> {
        ServiceGroup {
            server: self,
            prefixes: Vec::new(),
            plugins: PluginContainer::new(),
        }
        .group(prefix, plugins)
    }

    fn register_scoped<R: Receiver<C>>(
        &self,
        prefixes: &[String],
        name: &str,
        receiver: &R,
        scoped: PluginContainer,
        metadata: &[&str],
    ) -> Result<(), RegisterError> {
        check_name(name)?;
        let methods = receiver.methods();
        if methods.is_empty() {
            return Err(RegisterError::NoMethods(name.to_owned()));
        }

        let mut state = self.state.write().expect("registry lock poisoned");
        let mut metadata: Vec<String> = metadata.iter().map(|m| (*m).to_owned()).collect();
        metadata.extend(state.base_metadata.iter().cloned());

        let mut errs = Vec::new();
        for method in &methods {
            let mut segments: Vec<&str> = prefixes.iter().map(String::as_str).collect();
            segments.push(name);
            segments.push(method.name());
            let path = self.path_scheme.assemble(&segments);

            if state.services.contains_key(&path) {
                errs.push(RegisterError::DuplicatePath(path));
                continue;
            }
            if let Err(err) = self.plugins.do_register(&path, &metadata) {
                errs.push(RegisterError::Plugin(err));
            }
            if let Err(err) = scoped.do_register(&path, &metadata) {
                errs.push(RegisterError::Plugin(err));
            }

            let service = Arc::new(Service::new(path.clone(), method, scoped.clone()));
            info!("rpc: route -> {path}");
            state.routers.push(path.clone());
            state.services.insert(path, service);
        }
        state.routers.sort();

        match errs.len() {
            0 => Ok(()),
            1 => Err(errs.remove(0)),
            _ => Err(RegisterError::Multi(errs)),
        }
    }

    pub(crate) fn lookup(&self, path: &str) -> Option<Arc<Service<C>>> {
        self.state
            .read()
            .expect("registry lock poisoned")
            .services
            .get(path)
            .cloned()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.read().expect("registry lock poisoned").running
    }

    /// Flip `running` to true unless the server has already been shut
    /// down. Returns the resulting flag.
    pub(crate) fn ensure_running(&self) -> bool {
        let mut state = self.state.write().expect("registry lock poisoned");
        if !state.running && !self.shutdown.is_cancelled() {
            state.running = true;
        }
        state.running
    }

    pub(crate) fn set_local_addr(&self, addr: Option<SocketAddr>) {
        *self.local_addr.lock().expect("address lock poisoned") = addr;
    }

    pub(crate) fn stop_running(&self) -> bool {
        let mut state = self.state.write().expect("registry lock poisoned");
        std::mem::replace(&mut state.running, false)
    }
}

/// Registration-time binding of a path prefix and a plugin container.
///
/// Groups are ephemeral builders: they exist only to compute the final
/// path and plugin chain when a service is registered through them.
pub struct ServiceGroup<'s, C: Codec> {
    server: &'s RpcServer<C>,
    prefixes: Vec<String>,
    plugins: PluginContainer,
}

impl<'s, C: Codec> ServiceGroup<'s, C> {
    /// Open a nested group, concatenating prefixes and composing parent
    /// plugins with `plugins`.
    ///
    /// # Errors
    ///
    /// Fails on an invalid prefix or a duplicate plugin name.
    pub fn group(
        self,
        prefix: &str,
        plugins: Vec<Arc<dyn Plugin>>,
    ) -> Result<ServiceGroup<'s, C>, RegisterError> {
        check_name(prefix)?;
        let mut combined = self.plugins.clone();
        let mut prefixes = self.prefixes;
        prefixes.push(prefix.to_owned());

        let segments: Vec<&str> = prefixes.iter().map(String::as_str).collect();
        let group_path = self.server.path_scheme.assemble(&segments);
        for plugin in plugins {
            for hook in plugin.hooks() {
                if hook.is_connection_scoped() {
                    warn!(
                        "rpc: '{hook:?}' of '{name}' plugin in '{group_path}' group is \
                         unreachable",
                        name = plugin.name(),
                    );
                }
            }
            combined.add(plugin).map_err(RegisterError::Plugin)?;
        }

        Ok(ServiceGroup {
            server: self.server,
            prefixes,
            plugins: combined,
        })
    }

    /// Register every method of `receiver` under this group's prefixes.
    ///
    /// # Errors
    ///
    /// See [`RpcServer::register`].
    pub fn register<R: Receiver<C>>(
        &self,
        receiver: &R,
        metadata: &[&str],
    ) -> Result<(), RegisterError> {
        let name = receiver.name().to_owned();
        self.named_register(&name, receiver, metadata)
    }

    /// Like [`ServiceGroup::register`] with an explicit type-segment name.
    ///
    /// # Errors
    ///
    /// See [`RpcServer::register`].
    pub fn named_register<R: Receiver<C>>(
        &self,
        name: &str,
        receiver: &R,
        metadata: &[&str],
    ) -> Result<(), RegisterError> {
        self.server
            .register_scoped(&self.prefixes, name, receiver, self.plugins.clone(), metadata)
    }

    /// Plugins every service registered through this group will carry.
    #[must_use]
    pub fn plugins(&self) -> &PluginContainer {
        &self.plugins
    }
}
