//! Core systems for Horizon Datagram.
//!
//! This crate provides the execution primitives the UDP runtime is built on.
//! It knows nothing about sockets:
//!
//! - **Event loops**: single-threaded executors with a FIFO task queue
//! - **Event loop groups**: fixed-size pools of loops with round-robin and
//!   least-loaded assignment and graceful shutdown
//! - **Loop-local context**: per-loop shutdown hooks and current-loop lookup
//! - **Completions**: one-shot signals that many threads or tasks may await
//! - **Hook registries**: ordered, independently fallible lifecycle callbacks
//!
//! # Example
//!
//! ```no_run
//! use horizon_datagram_core::{Completion, EventLoopGroup};
//! use std::time::Duration;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let group = EventLoopGroup::with_threads(2)?;
//!     let event_loop = group.assign_loop()?;
//!
//!     let done = Completion::new();
//!     let signal = done.clone();
//!     event_loop.execute(move || {
//!         signal.complete("hello from the loop");
//!     })?;
//!
//!     println!("{}", done.wait());
//!     group.shutdown_gracefully(Duration::from_secs(1)).wait();
//!     Ok(())
//! }
//! ```

mod completion;
mod error;
mod event_loop;
mod group;
pub mod hooks;
pub mod local;
pub mod logging;

pub use completion::Completion;
pub use error::{LoopError, Result};
pub use event_loop::{EventLoop, LoopId, LoopReport, WeakEventLoop};
pub use group::{
    DEFAULT_SHUTDOWN_TIMEOUT, EventLoopGroup, EventLoopGroupConfig, ShutdownReport,
    default_threads,
};
pub use hooks::{HookError, HookFailure, HookId, HookRegistry};
pub use local::ShutdownHookId;
