use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures_util::Stream;

use super::Delivery;
use crate::channel::ChannelCore;
use crate::datagram::Datagram;
use crate::error::FlowError;

/// The demand-driven sequence of datagrams received by a channel.
///
/// Polling the stream with no outstanding demand requests one datagram;
/// [`request`](Self::request) grants more up front. Datagrams arrive in the
/// order they were read from the socket. The sequence ends when the channel
/// closes, or yields one `Err` and then ends if the channel fails.
///
/// Dropping an `Inbound` withdraws its demand. Datagrams buffered at that
/// point are kept for the next subscriber.
pub struct Inbound {
    core: Rc<ChannelCore>,
    active: bool,
    done: bool,
}

impl Inbound {
    pub(crate) fn subscribe(core: Rc<ChannelCore>) -> Self {
        let active = core.subscribe();
        Self {
            core,
            active,
            done: false,
        }
    }

    /// Grant demand for `n` more datagrams.
    pub fn request(&self, n: u64) {
        if self.active && !self.done {
            self.core.request(n);
        }
    }

    /// Number of datagrams queued and waiting for demand.
    pub fn queued(&self) -> usize {
        self.core.queued()
    }

    /// The channel's local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr()
    }
}

impl Stream for Inbound {
    type Item = Result<Datagram, FlowError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if !this.active {
            this.done = true;
            return Poll::Ready(Some(Err(FlowError::AlreadySubscribed)));
        }

        match this.core.poll_delivery(cx) {
            Delivery::Item(datagram) => Poll::Ready(Some(Ok(datagram))),
            Delivery::Error(error) => Poll::Ready(Some(Err(error))),
            Delivery::Complete => {
                this.done = true;
                Poll::Ready(None)
            }
            Delivery::Pending => Poll::Pending,
        }
    }
}

impl Drop for Inbound {
    fn drop(&mut self) {
        if self.active {
            self.core.unsubscribe();
        }
    }
}

impl fmt::Debug for Inbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbound")
            .field("channel", &self.core.id())
            .field("active", &self.active)
            .field("done", &self.done)
            .finish()
    }
}
