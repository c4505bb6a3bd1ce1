//! Logging decorator for datagram transports.

use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};

use tokio::io::ReadBuf;

use crate::targets;
use crate::transport::DatagramTransport;

/// Number of payload bytes rendered in the trace-level hex preview.
const PREVIEW_BYTES: usize = 32;

/// Direction of a recorded datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received from a peer.
    Inbound,
    /// Sent to a peer.
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// A transport decorator that logs every datagram it carries.
///
/// Records direction, peer and size at `debug` level and a hex preview of
/// the payload at `trace` level, on the `horizon_datagram::wiretap` target.
/// Payloads and call results pass through untouched.
pub struct Wiretap<T> {
    inner: T,
}

impl<T: DatagramTransport> Wiretap<T> {
    /// Wrap a transport.
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    /// The wrapped transport.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Unwrap the decorator.
    pub fn into_inner(self) -> T {
        self.inner
    }

    fn record(&self, direction: Direction, peer: SocketAddr, payload: &[u8]) {
        let local = self.inner.local_addr().ok();
        tracing::debug!(
            target: targets::WIRETAP,
            %direction,
            %peer,
            local = ?local,
            size = payload.len(),
            "datagram"
        );
        if tracing::enabled!(target: targets::WIRETAP, tracing::Level::TRACE) {
            tracing::trace!(
                target: targets::WIRETAP,
                %direction,
                %peer,
                preview = %hex_preview(payload)
            );
        }
    }
}

impl<T: DatagramTransport> DatagramTransport for Wiretap<T> {
    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<SocketAddr>> {
        let before = buf.filled().len();
        let result = self.inner.poll_recv_from(cx, buf);
        if let Poll::Ready(Ok(peer)) = &result {
            self.record(Direction::Inbound, *peer, &buf.filled()[before..]);
        }
        result
    }

    fn poll_send_to(
        &self,
        cx: &mut Context<'_>,
        buf: &[u8],
        target: SocketAddr,
    ) -> Poll<io::Result<usize>> {
        let result = self.inner.poll_send_to(cx, buf, target);
        if let Poll::Ready(Ok(sent)) = &result {
            self.record(Direction::Outbound, target, &buf[..*sent]);
        }
        result
    }

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let result = self.inner.try_send_to(buf, target);
        if let Ok(sent) = &result {
            self.record(Direction::Outbound, target, &buf[..*sent]);
        }
        result
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

fn hex_preview(payload: &[u8]) -> String {
    let mut out = String::with_capacity(PREVIEW_BYTES * 3);
    for (i, byte) in payload.iter().take(PREVIEW_BYTES).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    if payload.len() > PREVIEW_BYTES {
        out.push_str(" ..");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ChannelOptions;
    use crate::transport::bind_udp;

    #[test]
    fn test_hex_preview() {
        assert_eq!(hex_preview(b""), "");
        assert_eq!(hex_preview(&[0x00, 0xab, 0x10]), "00 ab 10");
        let long = vec![0xffu8; PREVIEW_BYTES + 4];
        assert!(hex_preview(&long).ends_with(" .."));
    }

    #[tokio::test]
    async fn test_wiretap_passes_payload_through() {
        let tapped = Wiretap::new(bind_udp("127.0.0.1", 0, &ChannelOptions::new()).unwrap());
        let peer = bind_udp("127.0.0.1", 0, &ChannelOptions::new()).unwrap();

        let sent = tapped.try_send_to(b"tap", peer.local_addr().unwrap()).unwrap();
        assert_eq!(sent, 3);

        let mut buf = [0u8; 8];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"tap");
        assert_eq!(from, tapped.local_addr().unwrap());

        peer.send_to(b"back", from).await.unwrap();
        let mut storage = [0u8; 8];
        let mut read = ReadBuf::new(&mut storage);
        let sender = std::future::poll_fn(|cx| tapped.poll_recv_from(cx, &mut read))
            .await
            .unwrap();
        assert_eq!(sender, peer.local_addr().unwrap());
        assert_eq!(read.filled(), b"back");
    }
}
