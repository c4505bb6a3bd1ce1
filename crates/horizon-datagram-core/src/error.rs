//! Error types for Horizon Datagram core primitives.

use thiserror::Error;

/// Errors raised by event loops and event loop groups.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopError {
    /// The loop or group has begun shutting down and no longer accepts work.
    #[error("event loop is shut down")]
    Shutdown,
    /// No loop could be assigned from the group.
    #[error("no event loop available in group '{0}'")]
    ResourceExhausted(String),
    /// The loop thread could not be spawned.
    #[error("failed to spawn event loop thread: {0}")]
    SpawnFailed(String),
    /// The per-loop async runtime could not be created.
    #[error("failed to create event loop runtime: {0}")]
    RuntimeCreation(String),
    /// The group configuration is invalid.
    #[error("invalid event loop group configuration: {0}")]
    InvalidConfig(String),
    /// A blocking wait was requested on the loop that would have to resolve it.
    #[error("blocking on the owning event loop would deadlock")]
    WouldDeadlock,
}

/// A specialized Result type for event loop operations.
pub type Result<T> = std::result::Result<T, LoopError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(LoopError::Shutdown.to_string(), "event loop is shut down");
        assert_eq!(
            LoopError::ResourceExhausted("io".into()).to_string(),
            "no event loop available in group 'io'"
        );
    }
}
