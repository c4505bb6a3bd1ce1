//! State enumerations for channels and servers.

/// State of a datagram channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ChannelState {
    /// No socket is attached.
    #[default]
    Unbound,
    /// The socket is being opened.
    Binding,
    /// The socket is bound and may carry datagrams.
    Bound,
    /// The channel is releasing its socket.
    Closing,
    /// The socket has been released.
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelState::Unbound => write!(f, "Unbound"),
            ChannelState::Binding => write!(f, "Binding"),
            ChannelState::Bound => write!(f, "Bound"),
            ChannelState::Closing => write!(f, "Closing"),
            ChannelState::Closed => write!(f, "Closed"),
        }
    }
}

/// Lifecycle state of a UDP server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ServerState {
    /// Configuration may still change; nothing is bound.
    #[default]
    Unconfigured,
    /// A bind attempt is in flight.
    Binding,
    /// The socket is bound and the handler is attached.
    Bound,
    /// Disposal has started.
    Disposing,
    /// The server is disposed. Terminal.
    Disposed,
    /// Binding failed or was cancelled. Terminal.
    BindFailed,
}

impl ServerState {
    /// Check whether no further transitions can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerState::Disposed | ServerState::BindFailed)
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Unconfigured => write!(f, "Unconfigured"),
            ServerState::Binding => write!(f, "Binding"),
            ServerState::Bound => write!(f, "Bound"),
            ServerState::Disposing => write!(f, "Disposing"),
            ServerState::Disposed => write!(f, "Disposed"),
            ServerState::BindFailed => write!(f, "BindFailed"),
        }
    }
}
