//! Error types for the UDP server runtime.
//!
//! Errors are plain values: they are `Clone` and `PartialEq` so they can be
//! stored in completion signals, handed to several waiters, and compared in
//! tests. I/O failures are captured as their [`io::ErrorKind`] and message.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::state::ServerState;

/// Invalid server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A channel option or server field has an unusable value.
    #[error("invalid option '{key}': {reason}")]
    InvalidOption {
        /// The option key.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// The flow control water marks are inconsistent.
    #[error("invalid flow control: high water mark {high}, low water mark {low}")]
    InvalidFlowControl {
        /// Requested high water mark.
        high: usize,
        /// Requested low water mark.
        low: usize,
    },
    /// No handler was configured before bind.
    #[error("no handler configured")]
    MissingHandler,
    /// A settings document could not be parsed.
    #[error("invalid settings: {0}")]
    Settings(String),
}

/// Failure to bind a UDP socket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindError {
    /// Another socket already owns the address.
    #[error("address in use: {0}")]
    AddressInUse(String),
    /// The process may not bind the address.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// The host/port pair could not be resolved or is not local.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// No event loop was available to own the channel.
    #[error("no event loop available: {0}")]
    ResourceExhausted(String),
    /// Any other socket error.
    #[error("bind failed ({kind:?}): {message}")]
    Io {
        /// The underlying error kind.
        kind: io::ErrorKind,
        /// The underlying error message.
        message: String,
    },
}

impl BindError {
    /// Classify an I/O error raised while opening a socket for `addr`.
    pub(crate) fn from_io(err: &io::Error, addr: impl std::fmt::Display) -> Self {
        let detail = format!("{addr}: {err}");
        match err.kind() {
            io::ErrorKind::AddrInUse => Self::AddressInUse(detail),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(detail),
            io::ErrorKind::AddrNotAvailable | io::ErrorKind::InvalidInput => {
                Self::InvalidAddress(detail)
            }
            kind => Self::Io {
                kind,
                message: detail,
            },
        }
    }
}

/// Failure to send a datagram.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The channel was closed.
    #[error("channel closed")]
    ChannelClosed,
    /// The socket's send buffer is full.
    #[error("send would block")]
    WouldBlock,
    /// The datagram carries no recipient address.
    #[error("datagram has no recipient")]
    NoRecipient,
    /// The socket reported an error.
    #[error("I/O failure ({kind:?}): {message}")]
    IoFailure {
        /// The underlying error kind.
        kind: io::ErrorKind,
        /// The underlying error message.
        message: String,
    },
}

impl From<io::Error> for SendError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => Self::WouldBlock,
            kind => Self::IoFailure {
                kind,
                message: err.to_string(),
            },
        }
    }
}

impl SendError {
    /// Whether the error is one a peer can provoke on an unconnected socket,
    /// such as a pending ICMP port-unreachable. The channel stays usable.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SendError::IoFailure {
                kind: io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::Interrupted,
                ..
            }
        )
    }
}

/// An error produced by handler code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    /// Create a handler error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Wrap any error value, keeping its rendered message.
    pub fn from_error<E: std::error::Error>(err: E) -> Self {
        Self::new(err.to_string())
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// The error carried by inbound and outbound datagram sequences.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// Application code signalled an error.
    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),
    /// The channel failed.
    #[error("I/O error: {0}")]
    Io(#[from] SendError),
    /// Another consumer is already subscribed to the inbound sequence.
    #[error("inbound already has a subscriber")]
    AlreadySubscribed,
}

impl FlowError {
    /// Shorthand for a handler error with the given message.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(HandlerError::new(message))
    }
}

/// Errors surfaced by the server lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerError {
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The socket could not be bound.
    #[error(transparent)]
    Bind(#[from] BindError),
    /// Bind did not finish within the timeout and was cancelled.
    #[error("bind timed out after {0:?}")]
    BindTimeout(Duration),
    /// The operation is not valid in the server's current state.
    #[error("cannot {operation} a server in state {state}")]
    InvalidState {
        /// The attempted operation.
        operation: &'static str,
        /// The state the server was in.
        state: ServerState,
    },
    /// Disposal did not finish within the timeout.
    #[error("dispose timed out after {0:?}")]
    DisposeTimeout(Duration),
    /// A blocking wait was issued on the loop that has to make progress.
    #[error("blocking on the channel's own event loop would deadlock")]
    WouldDeadlock,
}

/// A specialized Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
