//! Handles to bound servers.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use horizon_datagram_core::{Completion, EventLoop, EventLoopGroup, HookFailure};
use parking_lot::Mutex;

use crate::bridge::FailureLog;
use crate::channel::ChannelId;
use crate::datagram::Datagram;
use crate::error::{FlowError, HandlerError, SendError, ServerError};
use crate::registry::{self, ChannelKey};
use crate::server::{self, ServerShared};
use crate::state::ServerState;

/// Why a connection was disposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// `dispose` was called.
    Disposed,
    /// The handler's future completed successfully.
    Completed,
    /// The handler failed or panicked.
    HandlerFailed(HandlerError),
    /// The channel failed.
    IoFailed(SendError),
    /// The owning event loop shut down.
    LoopShutdown,
}

impl Termination {
    /// Whether the connection ended because something failed.
    pub fn is_failure(&self) -> bool {
        matches!(self, Termination::HandlerFailed(_) | Termination::IoFailed(_))
    }

    pub(crate) fn from_flow_error(error: FlowError) -> Self {
        match error {
            FlowError::Handler(e) => Termination::HandlerFailed(e),
            FlowError::Io(e) => Termination::IoFailed(e),
            FlowError::AlreadySubscribed => Termination::HandlerFailed(HandlerError::new(
                FlowError::AlreadySubscribed.to_string(),
            )),
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Disposed => write!(f, "disposed"),
            Termination::Completed => write!(f, "handler completed"),
            Termination::HandlerFailed(e) => write!(f, "handler failed: {e}"),
            Termination::IoFailed(e) => write!(f, "I/O failed: {e}"),
            Termination::LoopShutdown => write!(f, "event loop shut down"),
        }
    }
}

/// Completion of a marshalled send.
pub type SendReceipt = Completion<Result<(), SendError>>;

pub(crate) struct ConnectionShared {
    pub(crate) id: ChannelId,
    pub(crate) local_address: SocketAddr,
    pub(crate) key: ChannelKey,
    pub(crate) event_loop: EventLoop,
    pub(crate) disposal: Completion<Termination>,
    pub(crate) server: Weak<ServerShared>,
    pub(crate) hook_failures: Arc<Mutex<Vec<HookFailure>>>,
    pub(crate) failures: FailureLog,
    pub(crate) owned_group: Mutex<Option<EventLoopGroup>>,
}

/// A handle to a bound server's channel.
///
/// Connections are cheap to clone and may be used from any thread; every
/// operation is marshalled to the channel's event loop. Any number of
/// holders may wait for disposal.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    pub(crate) fn new(shared: ConnectionShared) -> Self {
        Self {
            shared: Arc::new(shared),
        }
    }

    pub(crate) fn shared(&self) -> &ConnectionShared {
        &self.shared
    }

    /// The channel's identifier.
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    /// The bound local address.
    pub fn local_address(&self) -> SocketAddr {
        self.shared.local_address
    }

    /// The event loop that owns the channel.
    pub fn event_loop(&self) -> &EventLoop {
        &self.shared.event_loop
    }

    /// The owning server's state.
    pub fn state(&self) -> ServerState {
        match self.shared.server.upgrade() {
            Some(server) => server.state(),
            None if self.is_disposed() => ServerState::Disposed,
            None => ServerState::Bound,
        }
    }

    /// Send one datagram from this connection's socket.
    ///
    /// The write runs on the owning loop and waits for the socket to become
    /// writable; the receipt resolves once it was attempted.
    pub fn send(&self, datagram: Datagram) -> SendReceipt {
        let receipt = SendReceipt::new();
        let resolve = receipt.clone();
        let key = self.shared.key;
        let owner = self.shared.event_loop.clone();

        let queued = self.shared.event_loop.execute(move || {
            let Some(core) = registry::with_entry(key, |entry| entry.channel.core().clone()) else {
                resolve.complete(Err(SendError::ChannelClosed));
                return;
            };
            let write = {
                let resolve = resolve.clone();
                async move {
                    let receipt = ReceiptGuard(resolve);
                    receipt.0.complete(core.write(&datagram).await);
                }
            };
            if owner.spawn_local(write).is_err() {
                resolve.complete(Err(SendError::ChannelClosed));
            }
        });
        if queued.is_err() {
            receipt.complete(Err(SendError::ChannelClosed));
        }
        receipt
    }

    /// Start disposal without waiting for it. Idempotent.
    pub fn dispose(&self) {
        if self.is_disposed() {
            return;
        }
        let key = self.shared.key;
        // A loop that is already stopping disposes its channels itself.
        let _ = self.shared.event_loop.execute(move || {
            server::dispose_local(key, Termination::Disposed);
        });
    }

    /// Dispose and wait up to `timeout` for disposal to finish.
    ///
    /// Returns the termination cause. Calling this again returns the same
    /// cause. On the owning loop itself disposal runs inline.
    pub fn dispose_now(&self, timeout: Duration) -> Result<Termination, ServerError> {
        if let Some(cause) = self.shared.disposal.get() {
            return Ok(cause);
        }
        if self.shared.event_loop.in_event_loop() {
            server::dispose_local(self.shared.key, Termination::Disposed);
            return self.shared.disposal.get().ok_or(ServerError::WouldDeadlock);
        }

        self.dispose();
        self.shared
            .disposal
            .wait_timeout(timeout)
            .ok_or(ServerError::DisposeTimeout(timeout))
    }

    /// Signal resolved with the termination cause once disposal finished.
    pub fn on_dispose(&self) -> Completion<Termination> {
        self.shared.disposal.clone()
    }

    /// Whether disposal has finished.
    pub fn is_disposed(&self) -> bool {
        self.shared.disposal.is_complete()
    }

    /// Lifecycle hook failures recorded for this server so far.
    pub fn hook_failures(&self) -> Vec<HookFailure> {
        self.shared.hook_failures.lock().clone()
    }

    /// Errors that ended inbound or outbound sequences on this channel.
    pub fn failures(&self) -> Vec<FlowError> {
        self.shared.failures.lock().clone()
    }
}

/// Resolves a receipt with `ChannelClosed` if its write is dropped before
/// finishing, e.g. when the loop stops.
struct ReceiptGuard(SendReceipt);

impl Drop for ReceiptGuard {
    fn drop(&mut self) {
        self.0.complete(Err(SendError::ChannelClosed));
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Connection {}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("local_address", &self.shared.local_address)
            .field("event_loop", &self.shared.event_loop.id())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

static_assertions::assert_impl_all!(Connection: Send, Sync, Clone);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_from_flow_error() {
        assert_eq!(
            Termination::from_flow_error(FlowError::handler("bad")),
            Termination::HandlerFailed(HandlerError::new("bad"))
        );
        assert_eq!(
            Termination::from_flow_error(FlowError::Io(SendError::ChannelClosed)),
            Termination::IoFailed(SendError::ChannelClosed)
        );
        assert!(Termination::from_flow_error(FlowError::AlreadySubscribed).is_failure());
        assert!(!Termination::Disposed.is_failure());
        assert!(!Termination::LoopShutdown.is_failure());
    }

    #[test]
    fn test_termination_display() {
        assert_eq!(Termination::Completed.to_string(), "handler completed");
        assert_eq!(
            Termination::IoFailed(SendError::WouldBlock).to_string(),
            "I/O failed: send would block"
        );
    }
}
