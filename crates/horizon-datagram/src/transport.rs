//! Raw datagram transports.
//!
//! [`DatagramTransport`] is the capability a channel needs from a socket:
//! receive bytes plus the peer address, send bytes to an address. The trait
//! is implemented for [`tokio::net::UdpSocket`]; [`Wiretap`](crate::Wiretap)
//! decorates any implementation.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::task::{Context, Poll};

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;

use crate::error::BindError;
use crate::options::{ChannelOptions, keys};
use crate::targets;

/// Send/receive capability of a datagram socket.
///
/// Methods take `&self`: a transport is owned by one channel on one loop.
pub trait DatagramTransport {
    /// Poll for the next datagram, filling `buf` and returning the sender.
    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<SocketAddr>>;

    /// Poll until `buf` is written to `target`.
    fn poll_send_to(
        &self,
        cx: &mut Context<'_>,
        buf: &[u8],
        target: SocketAddr,
    ) -> Poll<io::Result<usize>>;

    /// Write `buf` to `target` without waiting for write readiness.
    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// The bound local address.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramTransport for UdpSocket {
    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<SocketAddr>> {
        UdpSocket::poll_recv_from(self, cx, buf)
    }

    fn poll_send_to(
        &self,
        cx: &mut Context<'_>,
        buf: &[u8],
        target: SocketAddr,
    ) -> Poll<io::Result<usize>> {
        UdpSocket::poll_send_to(self, cx, buf, target)
    }

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        // Tokio's own try_send_to reports WouldBlock until the reactor has
        // seen the socket writable once; the socket is non-blocking, so
        // write to it directly.
        SockRef::from(self).send_to(buf, &target.into())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

impl<T: DatagramTransport + ?Sized> DatagramTransport for Box<T> {
    fn poll_recv_from(
        &self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<SocketAddr>> {
        (**self).poll_recv_from(cx, buf)
    }

    fn poll_send_to(
        &self,
        cx: &mut Context<'_>,
        buf: &[u8],
        target: SocketAddr,
    ) -> Poll<io::Result<usize>> {
        (**self).poll_send_to(cx, buf, target)
    }

    fn try_send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        (**self).try_send_to(buf, target)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        (**self).local_addr()
    }
}

/// Resolve `host:port` and bind a UDP socket to the first address that
/// accepts it.
///
/// Must run inside a Tokio runtime, since the socket is registered with the
/// current reactor. If every candidate fails, the first failure is returned.
pub fn bind_udp(host: &str, port: u16, options: &ChannelOptions) -> Result<UdpSocket, BindError> {
    if host.is_empty() {
        return Err(BindError::InvalidAddress("host is empty".into()));
    }

    let candidates: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| BindError::InvalidAddress(format!("{host}:{port}: {e}")))?
        .collect();

    let mut first_error = None;
    for addr in candidates {
        match open(addr, options) {
            Ok(socket) => return Ok(socket),
            Err(e) => {
                tracing::debug!(
                    target: targets::CHANNEL,
                    %addr,
                    error = %e,
                    "bind candidate failed"
                );
                first_error.get_or_insert(e);
            }
        }
    }

    Err(first_error.unwrap_or_else(|| {
        BindError::InvalidAddress(format!("{host}:{port} resolved to no addresses"))
    }))
}

fn open(addr: SocketAddr, options: &ChannelOptions) -> Result<UdpSocket, BindError> {
    let io_err = |e: io::Error| BindError::from_io(&e, addr);

    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(io_err)?;

    if let Some(reuse) = options.get_bool(keys::SO_REUSEADDR) {
        socket.set_reuse_address(reuse).map_err(io_err)?;
    }
    if let Some(size) = buffer_size(options, keys::SO_RCVBUF) {
        socket.set_recv_buffer_size(size).map_err(io_err)?;
    }
    if let Some(size) = buffer_size(options, keys::SO_SNDBUF) {
        socket.set_send_buffer_size(size).map_err(io_err)?;
    }
    if addr.is_ipv6()
        && let Some(only_v6) = options.get_bool(keys::IPV6_ONLY)
    {
        socket.set_only_v6(only_v6).map_err(io_err)?;
    }

    socket.bind(&addr.into()).map_err(io_err)?;
    socket.set_nonblocking(true).map_err(io_err)?;

    let std_socket: std::net::UdpSocket = socket.into();
    let socket = UdpSocket::from_std(std_socket).map_err(io_err)?;

    if let Some(broadcast) = options.get_bool(keys::SO_BROADCAST) {
        socket.set_broadcast(broadcast).map_err(io_err)?;
    }
    if let Some(ttl) = options.get_int(keys::IP_TTL).and_then(|t| u32::try_from(t).ok()) {
        socket.set_ttl(ttl).map_err(io_err)?;
    }
    if let Some(multicast_loop) = options.get_bool(keys::IP_MULTICAST_LOOP) {
        if addr.is_ipv4() {
            socket.set_multicast_loop_v4(multicast_loop).map_err(io_err)?;
        } else {
            socket.set_multicast_loop_v6(multicast_loop).map_err(io_err)?;
        }
    }

    Ok(socket)
}

fn buffer_size(options: &ChannelOptions, key: &str) -> Option<usize> {
    options.get_int(key).and_then(|size| usize::try_from(size).ok())
}
