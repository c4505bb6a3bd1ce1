//! The server lifecycle.
//!
//! A [`UdpServer`] moves through
//! `Unconfigured -> Binding -> Bound -> Disposing -> Disposed`, or
//! `Binding -> BindFailed` when the socket cannot be opened. The state is
//! guarded by a lock so that any thread can observe it, but every step that
//! touches the channel runs on the channel's event loop.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use futures_util::StreamExt;
//! use horizon_datagram::{UdpServer, UdpServerConfig};
//!
//! let config = UdpServerConfig::new()
//!     .host("127.0.0.1")
//!     .port(0)
//!     .handle(|inbound, outbound| async move {
//!         outbound
//!             .send(inbound.map(|d| d.map(|d| d.reply(d.payload.clone()))))
//!             .await
//!     });
//!
//! let server = UdpServer::with_config(config);
//! let connection = server.bind_now(Duration::from_secs(5)).unwrap();
//! println!("echoing on {}", connection.local_address());
//!
//! connection.dispose_now(Duration::from_secs(5)).unwrap();
//! ```

use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::FutureExt;
use horizon_datagram_core::hooks::panic_message;
use horizon_datagram_core::logging::span_names;
use horizon_datagram_core::{
    Completion, DEFAULT_SHUTDOWN_TIMEOUT, EventLoop, EventLoopGroup, EventLoopGroupConfig,
    HookFailure, local,
};
use parking_lot::Mutex;

use crate::channel::DatagramChannel;
use crate::config::{LoopResources, UdpServerConfig};
use crate::connection::{Connection, ConnectionShared, Termination};
use crate::error::{BindError, HandlerError, ServerError};
use crate::registry::{self, BoundEntry, ChannelKey};
use crate::state::ServerState;
use crate::targets;
use crate::transport::{DatagramTransport, bind_udp};
use crate::wiretap::Wiretap;

type BindResult = Completion<Result<Connection, ServerError>>;

struct Lifecycle {
    state: ServerState,
    config: UdpServerConfig,
    /// A dedicated group created for a bind in progress.
    owned_group: Option<EventLoopGroup>,
    connection: Option<Connection>,
}

impl Lifecycle {
    fn transition(&mut self, to: ServerState) {
        tracing::debug!(target: targets::SERVER, from = %self.state, %to, "server state changed");
        self.state = to;
    }
}

pub(crate) struct ServerShared {
    lifecycle: Mutex<Lifecycle>,
    hook_failures: Arc<Mutex<Vec<HookFailure>>>,
}

impl ServerShared {
    pub(crate) fn state(&self) -> ServerState {
        self.lifecycle.lock().state
    }

    fn record_hook_failures(&self, failures: Vec<HookFailure>) {
        if !failures.is_empty() {
            self.hook_failures.lock().extend(failures);
        }
    }
}

/// A UDP server.
///
/// Cloning yields another handle to the same server.
#[derive(Clone)]
pub struct UdpServer {
    shared: Arc<ServerShared>,
}

impl Default for UdpServer {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpServer {
    /// Create a server with the default configuration.
    pub fn new() -> Self {
        Self::with_config(UdpServerConfig::new())
    }

    /// Create a server with the given configuration.
    pub fn with_config(config: UdpServerConfig) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                lifecycle: Mutex::new(Lifecycle {
                    state: ServerState::Unconfigured,
                    config,
                    owned_group: None,
                    connection: None,
                }),
                hook_failures: Arc::new(Mutex::new(Vec::new())),
            }),
        }
    }

    /// Replace the configuration. Only valid before bind.
    pub fn configure(&self, config: UdpServerConfig) -> Result<(), ServerError> {
        let mut lifecycle = self.shared.lifecycle.lock();
        if lifecycle.state != ServerState::Unconfigured {
            return Err(ServerError::InvalidState {
                operation: "configure",
                state: lifecycle.state,
            });
        }
        lifecycle.config = config;
        Ok(())
    }

    /// The current configuration.
    pub fn config(&self) -> UdpServerConfig {
        self.shared.lifecycle.lock().config.clone()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    /// The connection, once bound.
    pub fn connection(&self) -> Option<Connection> {
        self.shared.lifecycle.lock().connection.clone()
    }

    /// Lifecycle hook failures recorded so far.
    pub fn hook_failures(&self) -> Vec<HookFailure> {
        self.shared.hook_failures.lock().clone()
    }

    /// Start binding.
    ///
    /// The configuration is snapshotted now. Configuration errors resolve
    /// the returned [`PendingBind`] immediately and leave the server
    /// `Unconfigured`; every other failure leaves it `BindFailed`.
    pub fn bind(&self) -> PendingBind {
        let result = BindResult::new();

        let config = {
            let mut lifecycle = self.shared.lifecycle.lock();
            if lifecycle.state != ServerState::Unconfigured {
                result.complete(Err(ServerError::InvalidState {
                    operation: "bind",
                    state: lifecycle.state,
                }));
                return PendingBind::new(self.shared.clone(), result, None);
            }
            if let Err(e) = lifecycle.config.validate() {
                result.complete(Err(e.into()));
                return PendingBind::new(self.shared.clone(), result, None);
            }
            lifecycle.transition(ServerState::Binding);
            lifecycle.config.clone()
        };

        let (event_loop, owned_group) = match acquire_loop(config.loops()) {
            Ok(acquired) => acquired,
            Err(e) => {
                fail_bind(&self.shared, &result, e.into());
                return PendingBind::new(self.shared.clone(), result, None);
            }
        };
        if let Some(group) = owned_group {
            self.shared.lifecycle.lock().owned_group = Some(group);
        }

        let shared = self.shared.clone();
        let signal = result.clone();
        let submitted = event_loop.execute(move || run_bind(shared, config, signal));
        if let Err(e) = submitted {
            fail_bind(&self.shared, &result, BindError::ResourceExhausted(e.to_string()).into());
        }
        PendingBind::new(self.shared.clone(), result, Some(event_loop))
    }

    /// Bind and block until the server is bound, binding fails, or
    /// `timeout` elapses. On timeout the bind is cancelled.
    pub fn bind_now(&self, timeout: Duration) -> Result<Connection, ServerError> {
        self.bind().wait_timeout(timeout)
    }
}

impl fmt::Debug for UdpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifecycle = self.shared.lifecycle.lock();
        f.debug_struct("UdpServer")
            .field("state", &lifecycle.state)
            .field("config", &lifecycle.config)
            .finish()
    }
}

static_assertions::assert_impl_all!(UdpServer: Send, Sync, Clone);

/// A bind in progress.
///
/// Await it from async code, or block on it with [`wait`](Self::wait) or
/// [`wait_timeout`](Self::wait_timeout).
pub struct PendingBind {
    shared: Arc<ServerShared>,
    result: BindResult,
    event_loop: Option<EventLoop>,
    waiting: Option<Pin<Box<dyn Future<Output = Result<Connection, ServerError>> + Send>>>,
}

impl PendingBind {
    fn new(shared: Arc<ServerShared>, result: BindResult, event_loop: Option<EventLoop>) -> Self {
        Self {
            shared,
            result,
            event_loop,
            waiting: None,
        }
    }

    /// Whether the bind has resolved.
    pub fn is_complete(&self) -> bool {
        self.result.is_complete()
    }

    /// Block until the bind resolves.
    pub fn wait(&self) -> Result<Connection, ServerError> {
        self.check_deadlock()?;
        self.result.wait()
    }

    /// Block until the bind resolves or `timeout` elapses, in which case
    /// the bind is cancelled and [`ServerError::BindTimeout`] returned.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Connection, ServerError> {
        self.check_deadlock()?;
        match self.result.wait_timeout(timeout) {
            Some(result) => result,
            None => self.cancel(timeout),
        }
    }

    fn check_deadlock(&self) -> Result<(), ServerError> {
        let on_target = self.event_loop.as_ref().is_some_and(EventLoop::in_event_loop);
        if on_target && !self.result.is_complete() {
            return Err(ServerError::WouldDeadlock);
        }
        Ok(())
    }

    fn cancel(&self, timeout: Duration) -> Result<Connection, ServerError> {
        let owned = {
            let mut lifecycle = self.shared.lifecycle.lock();
            if lifecycle.state != ServerState::Binding {
                // Resolved while the wait was timing out.
                if let Some(result) = self.result.get() {
                    return result;
                }
                return lifecycle
                    .connection
                    .clone()
                    .ok_or(ServerError::BindTimeout(timeout));
            }
            lifecycle.transition(ServerState::BindFailed);
            self.result.complete(Err(ServerError::BindTimeout(timeout)));
            lifecycle.owned_group.take()
        };

        tracing::warn!(target: targets::SERVER, ?timeout, "bind timed out and was cancelled");
        if let Some(group) = owned {
            group.shutdown_gracefully(DEFAULT_SHUTDOWN_TIMEOUT);
        }
        Err(ServerError::BindTimeout(timeout))
    }
}

impl Future for PendingBind {
    type Output = Result<Connection, ServerError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let result = this.result.clone();
        let waiting = this
            .waiting
            .get_or_insert_with(|| Box::pin(async move { result.wait_async().await }));
        waiting.as_mut().poll(cx)
    }
}

impl fmt::Debug for PendingBind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingBind")
            .field("complete", &self.result.is_complete())
            .field("event_loop", &self.event_loop.as_ref().map(EventLoop::id))
            .finish()
    }
}

fn acquire_loop(
    resources: &LoopResources,
) -> Result<(EventLoop, Option<EventLoopGroup>), BindError> {
    let exhausted =
        |e: horizon_datagram_core::LoopError| BindError::ResourceExhausted(e.to_string());
    match resources {
        LoopResources::Global => {
            let group = EventLoopGroup::global().map_err(exhausted)?;
            Ok((group.assign_least_loaded().map_err(exhausted)?, None))
        }
        LoopResources::Shared(group) => Ok((group.assign_least_loaded().map_err(exhausted)?, None)),
        LoopResources::Dedicated(threads) => {
            let config = EventLoopGroupConfig::new()
                .name_prefix("horizon-udp-server")
                .threads(*threads);
            let group = EventLoopGroup::new(config).map_err(exhausted)?;
            let event_loop = group.assign_least_loaded().map_err(exhausted)?;
            Ok((event_loop, Some(group)))
        }
    }
}

fn fail_bind(shared: &ServerShared, result: &BindResult, error: ServerError) {
    let owned = {
        let mut lifecycle = shared.lifecycle.lock();
        if lifecycle.state != ServerState::Binding {
            return;
        }
        lifecycle.transition(ServerState::BindFailed);
        result.complete(Err(error.clone()));
        lifecycle.owned_group.take()
    };

    tracing::warn!(target: targets::SERVER, %error, "bind failed");
    if let Some(group) = owned {
        group.shutdown_gracefully(DEFAULT_SHUTDOWN_TIMEOUT);
    }
}

/// Open the socket and attach the handler. Runs on the target loop.
fn run_bind(shared: Arc<ServerShared>, config: UdpServerConfig, result: BindResult) {
    let span = tracing::debug_span!(
        target: targets::SERVER,
        span_names::BIND,
        host = config.host_name(),
        port = config.port_number()
    );
    let _enter = span.enter();

    shared.record_hook_failures(config.hooks().on_bind.run(&config));
    if shared.state() != ServerState::Binding {
        return;
    }

    let Some(owner) = local::current_loop() else {
        let error = BindError::ResourceExhausted("not on an event loop".into());
        fail_bind(&shared, &result, error.into());
        return;
    };
    let bound = bind_udp(
        config.host_name(),
        config.port_number(),
        config.channel_options(),
    );
    let socket = match bound {
        Ok(socket) => socket,
        Err(e) => {
            fail_bind(&shared, &result, e.into());
            return;
        }
    };
    let transport: Box<dyn DatagramTransport> = if config.is_wiretapped() {
        Box::new(Wiretap::new(socket))
    } else {
        Box::new(socket)
    };
    let channel = match DatagramChannel::attach(owner.clone(), transport, config.flow()) {
        Ok(channel) => channel,
        Err(e) => {
            fail_bind(&shared, &result, e.into());
            return;
        }
    };

    let key = {
        let mut lifecycle = shared.lifecycle.lock();
        if lifecycle.state != ServerState::Binding {
            drop(lifecycle);
            channel.close();
            return;
        }
        let owned_group = lifecycle.owned_group.take();
        let key = registry::insert_with_key(|key| BoundEntry {
            channel: channel.clone(),
            connection: Connection::new(ConnectionShared {
                id: channel.id(),
                local_address: channel.local_addr(),
                key,
                event_loop: owner.clone(),
                disposal: Completion::new(),
                server: Arc::downgrade(&shared),
                hook_failures: shared.hook_failures.clone(),
                failures: channel.core().failures().clone(),
                owned_group: Mutex::new(owned_group),
            }),
            config: config.clone(),
            handler: None,
            shutdown_hook: None,
        });
        lifecycle.connection = registry::with_entry(key, |entry| entry.connection.clone());
        lifecycle.transition(ServerState::Bound);
        key
    };
    let Some(connection) = registry::with_entry(key, |entry| entry.connection.clone()) else {
        return;
    };

    let failing = owner.downgrade();
    channel.set_failure_hook(move |error| {
        if let Some(event_loop) = failing.upgrade() {
            let _ = event_loop.execute(move || {
                dispose_local(key, Termination::IoFailed(error));
            });
        }
    });

    shared.record_hook_failures(config.hooks().on_bound.run(&connection));
    if connection.is_disposed() {
        result.complete(Ok(connection));
        return;
    }

    let shutdown_hook = local::on_shutdown(move || {
        dispose_local(key, Termination::LoopShutdown);
    });
    let handler = attach_handler(&owner, &channel, &config, key);
    let attached = registry::with_entry(key, |entry| {
        entry.shutdown_hook = shutdown_hook;
        entry.handler = handler;
    });
    if attached.is_none() {
        tracing::debug!(
            target: targets::SERVER,
            "connection disposed while attaching its handler"
        );
    }

    tracing::info!(
        target: targets::SERVER,
        channel = %connection.id(),
        local = %connection.local_address(),
        loop_id = %owner.id(),
        "server bound"
    );
    result.complete(Ok(connection));
}

/// Run the handler and dispose the connection once its future resolves.
fn attach_handler(
    owner: &EventLoop,
    channel: &DatagramChannel,
    config: &UdpServerConfig,
    key: ChannelKey,
) -> Option<tokio::task::JoinHandle<()>> {
    let Some(handler) = config.handler() else {
        dispose_local(key, Termination::HandlerFailed(HandlerError::new("no handler configured")));
        return None;
    };

    let (inbound, outbound) = (channel.receive(), channel.outbound());
    let future = match catch_unwind(AssertUnwindSafe(|| handler(inbound, outbound))) {
        Ok(future) => future,
        Err(payload) => {
            let message = panic_message(&*payload);
            let error = HandlerError::new(format!("handler panicked: {message}"));
            tracing::warn!(target: targets::SERVER, %error, "handler failed");
            dispose_local(key, Termination::HandlerFailed(error));
            return None;
        }
    };

    let disposer = owner.downgrade();
    let task = async move {
        let cause = match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(())) => Termination::Completed,
            Ok(Err(error)) => Termination::from_flow_error(error),
            Err(payload) => Termination::HandlerFailed(HandlerError::new(format!(
                "handler panicked: {}",
                panic_message(&*payload)
            ))),
        };
        if cause.is_failure() {
            tracing::warn!(target: targets::SERVER, %cause, "handler failed");
        } else {
            tracing::debug!(target: targets::SERVER, "handler completed");
        }
        // Disposal aborts this task, so it runs as a separate loop task.
        if let Some(event_loop) = disposer.upgrade() {
            let _ = event_loop.execute(move || {
                dispose_local(key, cause);
            });
        }
    };

    match owner.spawn_local(task) {
        Ok(handle) => Some(handle),
        Err(e) => {
            dispose_local(key, Termination::HandlerFailed(HandlerError::from_error(e)));
            None
        }
    }
}

/// Dispose a bound channel. Runs on its owning loop.
///
/// Returns `false` if the channel was already disposed.
pub(crate) fn dispose_local(key: ChannelKey, cause: Termination) -> bool {
    let Some(entry) = registry::remove(key) else {
        return false;
    };
    let BoundEntry {
        channel,
        connection,
        config,
        handler,
        shutdown_hook,
    } = entry;
    let server = connection.shared().server.upgrade();

    if let Some(server) = &server {
        let mut lifecycle = server.lifecycle.lock();
        if lifecycle.state == ServerState::Bound {
            lifecycle.transition(ServerState::Disposing);
        }
    }

    let failures = config.hooks().on_unbound.run(&connection);
    if !failures.is_empty() {
        connection.shared().hook_failures.lock().extend(failures);
    }

    if let Some(handler) = handler {
        handler.abort();
    }
    channel.close();
    if let Some(id) = shutdown_hook {
        local::cancel_shutdown_hook(id);
    }

    if let Some(server) = &server {
        server.lifecycle.lock().transition(ServerState::Disposed);
    }
    connection.shared().disposal.complete(cause.clone());
    tracing::info!(
        target: targets::SERVER,
        channel = %connection.id(),
        local = %connection.local_address(),
        %cause,
        "server disposed"
    );

    let owned = connection.shared().owned_group.lock().take();
    if let Some(group) = owned {
        group.shutdown_gracefully(DEFAULT_SHUTDOWN_TIMEOUT);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConfigError;

    fn loopback() -> UdpServerConfig {
        UdpServerConfig::new()
            .host("127.0.0.1")
            .port(0)
            .handle(|_, _| futures_util::future::pending::<Result<(), crate::FlowError>>())
    }

    #[test]
    fn test_configure_only_before_bind() {
        let group = EventLoopGroup::with_threads(1).unwrap();
        let server = UdpServer::with_config(loopback().loop_group(group.clone()));
        server.configure(loopback().loop_group(group.clone()).port(0)).unwrap();

        let connection = server.bind_now(Duration::from_secs(5)).unwrap();
        assert_eq!(server.state(), ServerState::Bound);
        assert_eq!(server.connection(), Some(connection.clone()));
        assert!(matches!(
            server.configure(loopback()),
            Err(ServerError::InvalidState { operation: "configure", state: ServerState::Bound })
        ));
        assert!(matches!(
            server.bind_now(Duration::from_secs(1)),
            Err(ServerError::InvalidState { operation: "bind", .. })
        ));

        connection.dispose_now(Duration::from_secs(5)).unwrap();
        assert_eq!(server.state(), ServerState::Disposed);
        group.shutdown_gracefully(Duration::from_secs(1)).wait();
    }

    #[test]
    fn test_missing_handler_leaves_server_unconfigured() {
        let server = UdpServer::with_config(UdpServerConfig::new().host("127.0.0.1").port(0));
        let pending = server.bind();
        assert!(pending.is_complete());
        assert_eq!(
            pending.wait(),
            Err(ServerError::Config(ConfigError::MissingHandler))
        );
        assert_eq!(server.state(), ServerState::Unconfigured);
    }

    #[test]
    fn test_bind_failure_is_terminal() {
        let group = EventLoopGroup::with_threads(1).unwrap();
        let config = loopback().host("203.0.113.1").loop_group(group.clone());
        let server = UdpServer::with_config(config);

        let result = server.bind_now(Duration::from_secs(5));
        assert!(matches!(result, Err(ServerError::Bind(_))));
        assert_eq!(server.state(), ServerState::BindFailed);
        assert!(server.connection().is_none());
        assert_eq!(group.loops()[0].channel_count(), 0);
        group.shutdown_gracefully(Duration::from_secs(1)).wait();
    }

    #[test]
    fn test_bind_now_on_target_loop_would_deadlock() {
        let group = EventLoopGroup::with_threads(1).unwrap();
        let event_loop = group.assign_loop().unwrap();
        let done = Completion::new();
        let signal = done.clone();
        let config = loopback().loop_group(group.clone());

        event_loop
            .execute(move || {
                let server = UdpServer::with_config(config);
                let outcome = server.bind_now(Duration::from_secs(1));
                signal.complete(outcome.err());
            })
            .unwrap();

        assert_eq!(
            done.wait_timeout(Duration::from_secs(5)),
            Some(Some(ServerError::WouldDeadlock))
        );
        group.shutdown_gracefully(Duration::from_secs(1)).wait();
    }

    #[test]
    fn test_dispose_from_the_owning_loop() {
        let group = EventLoopGroup::with_threads(1).unwrap();
        let server = UdpServer::with_config(loopback().loop_group(group.clone()));
        let connection = server.bind_now(Duration::from_secs(5)).unwrap();

        let done = Completion::new();
        let signal = done.clone();
        let inner = connection.clone();
        connection
            .event_loop()
            .execute(move || {
                let first = inner.dispose_now(Duration::from_secs(1));
                let second = inner.dispose_now(Duration::from_secs(1));
                signal.complete((first, second, registry::len()));
            })
            .unwrap();

        let (first, second, remaining) = done.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(first, Ok(Termination::Disposed));
        assert_eq!(second, Ok(Termination::Disposed));
        assert_eq!(remaining, 0);
        group.shutdown_gracefully(Duration::from_secs(1)).wait();
    }
}
