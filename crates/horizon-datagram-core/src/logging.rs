//! Logging facilities for Horizon Datagram.
//!
//! Horizon Datagram uses the `tracing` crate for instrumentation. The library
//! never installs a subscriber; to see logs, install one in your application:
//!
//! ```ignore
//! fn main() {
//!     tracing_subscriber::fmt()
//!         .with_env_filter("horizon_datagram=debug,horizon_datagram_core=info")
//!         .init();
//! }
//! ```
//!
//! Every event carries an explicit target from [`targets`], so subsystems can
//! be filtered independently.

/// Span names used throughout Horizon Datagram for tracing.
pub mod span_names {
    /// Span entered by every loop thread for its whole lifetime.
    pub const EVENT_LOOP: &str = "horizon_datagram::loop";
    /// Span around a single bind attempt.
    pub const BIND: &str = "horizon_datagram::bind";
}

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Loop thread target.
    pub const EVENT_LOOP: &str = "horizon_datagram_core::event_loop";
    /// Loop group target.
    pub const GROUP: &str = "horizon_datagram_core::group";
    /// Lifecycle hook target.
    pub const HOOKS: &str = "horizon_datagram_core::hooks";
}
