use std::fmt;
use std::net::SocketAddr;
use std::pin::pin;
use std::rc::Rc;
use std::sync::Arc;

use futures_util::{Stream, StreamExt};
use parking_lot::Mutex;

use crate::channel::ChannelCore;
use crate::datagram::Datagram;
use crate::error::{FlowError, SendError};
use crate::targets;

/// Errors that ended outbound sequences, shared with the connection.
pub(crate) type FailureLog = Arc<Mutex<Vec<FlowError>>>;

/// The sink side of a channel.
///
/// [`send`](Self::send) pulls from a producer one datagram at a time: the
/// next item is requested only after the previous one has been written, and
/// each write waits for the socket to become writable. A slow socket
/// therefore slows the producer down instead of growing a queue.
pub struct Outbound {
    core: Rc<ChannelCore>,
}

impl Outbound {
    pub(crate) fn new(core: Rc<ChannelCore>) -> Self {
        Self { core }
    }

    /// Write every datagram produced by `datagrams`, in order.
    ///
    /// Resolves `Ok(())` when the producer ends. Stops at the first error
    /// the producer yields, or the first failed write, and returns it; the
    /// error is also recorded on the connection. Inbound is left open.
    ///
    /// A write refused because its peer is unreachable only drops that
    /// datagram.
    pub async fn send<S>(&self, datagrams: S) -> Result<(), FlowError>
    where
        S: Stream<Item = Result<Datagram, FlowError>>,
    {
        let mut datagrams = pin!(datagrams);
        let mut written: u64 = 0;

        while let Some(item) = datagrams.next().await {
            let result = match item {
                Ok(datagram) => match self.core.write(&datagram).await {
                    Err(error) if error.is_transient() => {
                        tracing::debug!(
                            target: targets::BRIDGE,
                            channel = %self.core.id(),
                            peer = ?datagram.recipient,
                            %error,
                            "dropped datagram for unreachable peer"
                        );
                        continue;
                    }
                    outcome => outcome.map_err(FlowError::Io),
                },
                Err(error) => Err(error),
            };
            if let Err(error) = result {
                tracing::warn!(
                    target: targets::BRIDGE,
                    channel = %self.core.id(),
                    written,
                    %error,
                    "outbound terminated"
                );
                self.core.failures().lock().push(error.clone());
                return Err(error);
            }
            written += 1;
        }

        tracing::trace!(
            target: targets::BRIDGE,
            channel = %self.core.id(),
            written,
            "outbound completed"
        );
        Ok(())
    }

    /// Write a single datagram, waiting for write readiness.
    pub async fn send_one(&self, datagram: Datagram) -> Result<(), SendError> {
        self.core.write(&datagram).await
    }

    /// The channel's local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr()
    }

    /// Whether the channel can still write.
    pub fn is_open(&self) -> bool {
        self.core.is_bound()
    }
}

impl fmt::Debug for Outbound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbound")
            .field("channel", &self.core.id())
            .field("open", &self.core.is_bound())
            .finish()
    }
}
