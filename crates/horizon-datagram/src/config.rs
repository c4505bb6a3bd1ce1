//! Server configuration.
//!
//! [`UdpServerConfig`] is an immutable value. Every mutator consumes the
//! config and returns a new one; the underlying data is shared until a
//! mutation actually happens, so a config that was handed to a server (or
//! cloned anywhere else) never changes underneath its holder.
//!
//! # Example
//!
//! ```no_run
//! use horizon_datagram::{UdpServerConfig, options::keys};
//! use futures_util::StreamExt;
//!
//! let base = UdpServerConfig::new()
//!     .host("127.0.0.1")
//!     .port(0)
//!     .option(keys::SO_RCVBUF, 1 << 20)
//!     .unwrap();
//!
//! let echo = base.clone().handle(|inbound, outbound| async move {
//!     outbound
//!         .send(inbound.map(|d| d.map(|d| d.reply(d.payload.clone()))))
//!         .await
//! });
//!
//! assert!(!base.has_handler());
//! assert!(echo.has_handler());
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use horizon_datagram_core::{EventLoopGroup, HookError, HookRegistry};

use crate::bridge::{FlowControl, Inbound, Outbound};
use crate::connection::Connection;
use crate::error::{ConfigError, FlowError};
use crate::options::{ChannelOptions, OptionValue};
use crate::settings::ServerSettings;

/// Default bind host.
pub const DEFAULT_HOST: &str = "localhost";
/// Default bind port.
pub const DEFAULT_PORT: u16 = 12012;

/// The future returned by a handler.
///
/// It resolves when the connection's data plane has shut down. It runs on
/// the channel's event loop and need not be `Send`.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), FlowError>>>>;

/// A connection handler: wires the outbound side from the inbound side.
pub type Handler = Arc<dyn Fn(Inbound, Outbound) -> HandlerFuture + Send + Sync>;

/// Where the server's event loop comes from.
#[derive(Clone)]
pub(crate) enum LoopResources {
    /// The process-wide shared group.
    Global,
    /// A caller-supplied group. Never shut down by the server.
    Shared(EventLoopGroup),
    /// A group of this many loops, created and owned by the server.
    Dedicated(usize),
}

impl fmt::Debug for LoopResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopResources::Global => write!(f, "Global"),
            LoopResources::Shared(group) => write!(f, "Shared({})", group.config().name_prefix),
            LoopResources::Dedicated(n) => write!(f, "Dedicated({n})"),
        }
    }
}

/// Lifecycle hook registries.
#[derive(Clone)]
pub(crate) struct LifecycleHooks {
    pub(crate) on_bind: HookRegistry<UdpServerConfig>,
    pub(crate) on_bound: HookRegistry<Connection>,
    pub(crate) on_unbound: HookRegistry<Connection>,
}

impl Default for LifecycleHooks {
    fn default() -> Self {
        Self {
            on_bind: HookRegistry::named("on_bind"),
            on_bound: HookRegistry::named("on_bound"),
            on_unbound: HookRegistry::named("on_unbound"),
        }
    }
}

#[derive(Clone)]
struct ConfigInner {
    host: String,
    port: u16,
    options: ChannelOptions,
    wiretap: bool,
    loops: LoopResources,
    handler: Option<Handler>,
    flow: FlowControl,
    hooks: LifecycleHooks,
}

/// Immutable, copy-on-write UDP server configuration.
#[derive(Clone)]
pub struct UdpServerConfig {
    inner: Arc<ConfigInner>,
}

impl Default for UdpServerConfig {
    fn default() -> Self {
        Self {
            inner: Arc::new(ConfigInner {
                host: DEFAULT_HOST.to_string(),
                port: DEFAULT_PORT,
                options: ChannelOptions::new(),
                wiretap: false,
                loops: LoopResources::Global,
                handler: None,
                flow: FlowControl::default(),
                hooks: LifecycleHooks::default(),
            }),
        }
    }
}

impl UdpServerConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    fn update(mut self, f: impl FnOnce(&mut ConfigInner)) -> Self {
        f(Arc::make_mut(&mut self.inner));
        self
    }

    /// Set the host to bind. Resolved only at bind time.
    pub fn host(self, host: impl Into<String>) -> Self {
        let host = host.into();
        self.update(|c| c.host = host)
    }

    /// Set the port to bind. `0` picks an ephemeral port.
    pub fn port(self, port: u16) -> Self {
        self.update(|c| c.port = port)
    }

    /// Set one channel option. A later value for the same key wins.
    pub fn option(
        self,
        key: impl Into<String>,
        value: impl Into<OptionValue>,
    ) -> Result<Self, ConfigError> {
        let mut options = self.inner.options.clone();
        options.set(key, value)?;
        Ok(self.update(|c| c.options = options))
    }

    /// Merge a set of channel options over the current ones.
    pub fn options(self, options: &ChannelOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        let mut merged = self.inner.options.clone();
        merged.merge(options);
        Ok(self.update(|c| c.options = merged))
    }

    /// Log every datagram crossing the channel.
    pub fn wiretap(self, enabled: bool) -> Self {
        self.update(|c| c.wiretap = enabled)
    }

    /// Run on a caller-supplied loop group.
    ///
    /// The server never shuts this group down.
    pub fn loop_group(self, group: EventLoopGroup) -> Self {
        self.update(|c| c.loops = LoopResources::Shared(group))
    }

    /// Run on a group of `threads` loops created for, and owned by, the
    /// server. The group is shut down once the server is disposed.
    pub fn dedicated_loops(self, threads: usize) -> Result<Self, ConfigError> {
        if threads == 0 {
            return Err(ConfigError::InvalidOption {
                key: "loop_threads".into(),
                reason: "at least one loop is required".into(),
            });
        }
        Ok(self.update(|c| c.loops = LoopResources::Dedicated(threads)))
    }

    /// Run on the process-wide shared loop group (the default).
    pub fn global_loops(self) -> Self {
        self.update(|c| c.loops = LoopResources::Global)
    }

    /// Set the inbound queue's water marks.
    pub fn flow_control(
        self,
        high_water_mark: usize,
        low_water_mark: usize,
    ) -> Result<Self, ConfigError> {
        let flow = FlowControl::new(high_water_mark, low_water_mark)?;
        Ok(self.update(|c| c.flow = flow))
    }

    /// Set the connection handler.
    ///
    /// The handler receives the channel's inbound and outbound ends once the
    /// socket is bound and returns a future that completes when the data
    /// plane is done.
    pub fn handle<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(Inbound, Outbound) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), FlowError>> + 'static,
    {
        let handler: Handler =
            Arc::new(move |inbound: Inbound, outbound: Outbound| -> HandlerFuture {
                Box::pin(handler(inbound, outbound))
            });
        self.update(|c| c.handler = Some(handler))
    }

    /// Register a hook that runs on the owning loop before the socket opens.
    pub fn on_bind<F>(self, hook: F) -> Self
    where
        F: Fn(&UdpServerConfig) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.update(|c| {
            c.hooks.on_bind.add(hook);
        })
    }

    /// Register a hook that runs once the socket is bound.
    pub fn on_bound<F>(self, hook: F) -> Self
    where
        F: Fn(&Connection) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.update(|c| {
            c.hooks.on_bound.add(hook);
        })
    }

    /// Register a hook that runs during disposal, before the socket is
    /// released.
    pub fn on_unbound<F>(self, hook: F) -> Self
    where
        F: Fn(&Connection) -> Result<(), HookError> + Send + Sync + 'static,
    {
        self.update(|c| {
            c.hooks.on_unbound.add(hook);
        })
    }

    /// Apply a settings document over this configuration.
    pub fn apply_settings(self, settings: &ServerSettings) -> Result<Self, ConfigError> {
        let mut config = self;
        if let Some(host) = &settings.host {
            config = config.host(host.clone());
        }
        if let Some(port) = settings.port {
            config = config.port(port);
        }
        if let Some(wiretap) = settings.wiretap {
            config = config.wiretap(wiretap);
        }
        if let Some(threads) = settings.loop_threads {
            config = config.dedicated_loops(threads)?;
        }
        if settings.high_water_mark.is_some() || settings.low_water_mark.is_some() {
            let current = config.flow();
            config = config.flow_control(
                settings.high_water_mark.unwrap_or(current.high_water_mark()),
                settings.low_water_mark.unwrap_or(current.low_water_mark()),
            )?;
        }
        config.options(&settings.options)
    }

    /// The configured host.
    pub fn host_name(&self) -> &str {
        &self.inner.host
    }

    /// The configured port.
    pub fn port_number(&self) -> u16 {
        self.inner.port
    }

    /// The configured channel options.
    pub fn channel_options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    /// Whether the wiretap is enabled.
    pub fn is_wiretapped(&self) -> bool {
        self.inner.wiretap
    }

    /// The inbound flow control thresholds.
    pub fn flow(&self) -> FlowControl {
        self.inner.flow
    }

    /// Whether a handler is set.
    pub fn has_handler(&self) -> bool {
        self.inner.handler.is_some()
    }

    /// Number of registered lifecycle hooks, across all events.
    pub fn hook_count(&self) -> usize {
        let hooks = &self.inner.hooks;
        hooks.on_bind.len() + hooks.on_bound.len() + hooks.on_unbound.len()
    }

    pub(crate) fn handler(&self) -> Option<Handler> {
        self.inner.handler.clone()
    }

    pub(crate) fn loops(&self) -> &LoopResources {
        &self.inner.loops
    }

    pub(crate) fn hooks(&self) -> &LifecycleHooks {
        &self.inner.hooks
    }

    /// Check everything that can be checked before resolving the address.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.inner.host.trim().is_empty() {
            return Err(ConfigError::InvalidOption {
                key: "host".into(),
                reason: "host is empty".into(),
            });
        }
        if self.inner.handler.is_none() {
            return Err(ConfigError::MissingHandler);
        }
        self.inner.options.validate()
    }
}

impl fmt::Debug for UdpServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UdpServerConfig")
            .field("host", &self.inner.host)
            .field("port", &self.inner.port)
            .field("options", &self.inner.options)
            .field("wiretap", &self.inner.wiretap)
            .field("loops", &self.inner.loops)
            .field("flow", &self.inner.flow)
            .field("handler", &self.inner.handler.is_some())
            .field("hooks", &self.hook_count())
            .finish()
    }
}

static_assertions::assert_impl_all!(UdpServerConfig: Send, Sync, Clone);
