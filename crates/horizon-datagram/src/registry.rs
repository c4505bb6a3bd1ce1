//! Loop-local table of bound channels.
//!
//! Each event loop thread keeps its own table. Tasks marshalled to a loop
//! refer to a channel by key only; once disposal removes the entry, any
//! task still queued with that key finds nothing and does nothing.

use std::cell::RefCell;

use horizon_datagram_core::ShutdownHookId;
use slotmap::{SlotMap, new_key_type};
use tokio::task::JoinHandle;

use crate::channel::DatagramChannel;
use crate::config::UdpServerConfig;
use crate::connection::Connection;

new_key_type! {
    /// Key of a bound channel in its loop's table.
    pub(crate) struct ChannelKey;
}

pub(crate) struct BoundEntry {
    pub(crate) channel: DatagramChannel,
    pub(crate) connection: Connection,
    pub(crate) config: UdpServerConfig,
    pub(crate) handler: Option<JoinHandle<()>>,
    pub(crate) shutdown_hook: Option<ShutdownHookId>,
}

thread_local! {
    static BOUND: RefCell<SlotMap<ChannelKey, BoundEntry>> = RefCell::new(SlotMap::with_key());
}

/// Insert an entry built from its own key.
pub(crate) fn insert_with_key(build: impl FnOnce(ChannelKey) -> BoundEntry) -> ChannelKey {
    BOUND.with(|bound| bound.borrow_mut().insert_with_key(build))
}

/// Run `f` against a live entry.
pub(crate) fn with_entry<R>(key: ChannelKey, f: impl FnOnce(&mut BoundEntry) -> R) -> Option<R> {
    BOUND.with(|bound| bound.borrow_mut().get_mut(key).map(f))
}

/// Remove an entry. Returns `None` if it was already removed.
pub(crate) fn remove(key: ChannelKey) -> Option<BoundEntry> {
    BOUND.with(|bound| bound.borrow_mut().remove(key))
}

/// Number of channels bound on the current thread.
#[cfg(test)]
pub(crate) fn len() -> usize {
    BOUND.with(|bound| bound.borrow().len())
}
