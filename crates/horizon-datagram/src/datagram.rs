//! The datagram value type.

use std::net::{Ipv4Addr, SocketAddr};

use bytes::Bytes;

/// A single UDP payload together with its addresses.
///
/// Inbound datagrams carry the peer as `sender` and the channel's local
/// address as `recipient`. Outbound datagrams must carry a `recipient`; their
/// `sender` is informational only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// The payload. May be empty.
    pub payload: Bytes,
    /// Where the datagram came from.
    pub sender: SocketAddr,
    /// Where the datagram is going.
    pub recipient: Option<SocketAddr>,
}

impl Datagram {
    /// Create a datagram received from `sender`.
    pub fn new(payload: impl Into<Bytes>, sender: SocketAddr) -> Self {
        Self {
            payload: payload.into(),
            sender,
            recipient: None,
        }
    }

    /// Create an outbound datagram addressed to `recipient`.
    pub fn to(payload: impl Into<Bytes>, recipient: SocketAddr) -> Self {
        Self {
            payload: payload.into(),
            sender: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            recipient: Some(recipient),
        }
    }

    /// Build a reply to this datagram, addressed to its sender.
    pub fn reply(&self, payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            sender: self
                .recipient
                .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))),
            recipient: Some(self.sender),
        }
    }

    /// Set the recipient address.
    pub fn with_recipient(mut self, recipient: SocketAddr) -> Self {
        self.recipient = Some(recipient);
        self
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Check whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_swaps_addresses() {
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let local: SocketAddr = "127.0.0.1:12012".parse().unwrap();

        let inbound = Datagram::new(&b"ping"[..], peer).with_recipient(local);
        let reply = inbound.reply(inbound.payload.clone());

        assert_eq!(reply.recipient, Some(peer));
        assert_eq!(reply.sender, local);
        assert_eq!(reply.payload, Bytes::from_static(b"ping"));
    }

    #[test]
    fn test_zero_length_payload() {
        let peer: SocketAddr = "[::1]:5000".parse().unwrap();
        let datagram = Datagram::to(Bytes::new(), peer);
        assert!(datagram.is_empty());
        assert_eq!(datagram.len(), 0);
        assert_eq!(datagram.recipient, Some(peer));
    }
}
