//! Backpressure-aware UDP server runtime for Horizon Datagram.
//!
//! This crate binds UDP sockets on event loops from
//! [`horizon_datagram_core`] and exposes them to application code as a pair
//! of demand-driven ends:
//!
//! - **Inbound**: a [`Stream`](futures_util::Stream) of received
//!   [`Datagram`]s. Reading from the socket pauses once the inbound queue
//!   reaches its high-water mark and resumes when it drains.
//! - **Outbound**: a sink that pulls datagrams from a producer one at a
//!   time, waiting for the socket to be writable before asking for more.
//!
//! A [`UdpServer`] takes a [`UdpServerConfig`] through bind, runs the
//! configured handler against the bound channel, and hands back a
//! [`Connection`] that any thread can use to send, observe, or dispose it.
//!
//! # Echo server
//!
//! ```no_run
//! use std::time::Duration;
//! use futures_util::StreamExt;
//! use horizon_datagram::{UdpServer, UdpServerConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = UdpServerConfig::new()
//!         .host("127.0.0.1")
//!         .port(0)
//!         .wiretap(true)
//!         .handle(|inbound, outbound| async move {
//!             outbound
//!                 .send(inbound.map(|d| d.map(|d| d.reply(d.payload.clone()))))
//!                 .await
//!         });
//!
//!     let connection = UdpServer::with_config(config).bind_now(Duration::from_secs(5))?;
//!     println!("listening on {}", connection.local_address());
//!
//!     let cause = connection.on_dispose().wait();
//!     println!("stopped: {cause}");
//!     Ok(())
//! }
//! ```
//!
//! # Logging
//!
//! Everything is reported through `tracing` under the targets in
//! [`targets`]. The crate never installs a subscriber.

mod bridge;
mod channel;
mod config;
mod connection;
mod datagram;
mod error;
pub mod options;
mod registry;
mod server;
mod settings;
mod state;
mod transport;
mod wiretap;

pub use bridge::{
    DEFAULT_HIGH_WATER_MARK, DEFAULT_LOW_WATER_MARK, Delivery, FlowControl, Inbound,
    InboundBridge, InboundEnd, Outbound,
};
pub use channel::{ChannelId, DatagramChannel};
pub use config::{DEFAULT_HOST, DEFAULT_PORT, Handler, HandlerFuture, UdpServerConfig};
pub use connection::{Connection, SendReceipt, Termination};
pub use datagram::Datagram;
pub use error::{
    BindError, ConfigError, FlowError, HandlerError, Result, SendError, ServerError,
};
pub use server::{PendingBind, UdpServer};
pub use settings::ServerSettings;
pub use state::{ChannelState, ServerState};
pub use transport::{DatagramTransport, bind_udp};
pub use wiretap::{Direction, Wiretap};

/// Log targets used by this crate.
pub mod targets {
    /// Server lifecycle transitions, bind and disposal.
    pub const SERVER: &str = "horizon_datagram::server";
    /// Channel bind, close and read failures.
    pub const CHANNEL: &str = "horizon_datagram::channel";
    /// Flow control decisions.
    pub const BRIDGE: &str = "horizon_datagram::bridge";
    /// Per-datagram wiretap records.
    pub const WIRETAP: &str = "horizon_datagram::wiretap";
}
