//! Datagram channels.
//!
//! A [`DatagramChannel`] is one bound UDP socket owned by exactly one event
//! loop. It is created on that loop and, being `!Send`, can only ever be
//! touched there: all of its state lives in `Cell`/`RefCell`s without locks.
//! Other threads reach a channel by submitting tasks to its loop.
//!
//! While bound, a read driver (a local future on the loop) moves datagrams
//! from the socket into the channel's [`InboundBridge`](crate::InboundBridge)
//! whenever the bridge has read interest.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll, Waker, ready};

use bytes::Bytes;
use horizon_datagram_core::{EventLoop, WeakEventLoop, local};
use tokio::io::ReadBuf;
use tokio::task::JoinHandle;

use crate::bridge::{
    Delivery, FailureLog, FlowControl, Inbound, InboundBridge, InboundEnd, Outbound,
};
use crate::datagram::Datagram;
use crate::error::{BindError, FlowError, SendError};
use crate::options::ChannelOptions;
use crate::state::ChannelState;
use crate::targets;
use crate::transport::{DatagramTransport, bind_udp};

/// Largest possible UDP payload.
const MAX_DATAGRAM_SIZE: usize = 65_535;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    fn next() -> Self {
        Self(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel-{}", self.0)
    }
}

type FailureHook = Box<dyn FnOnce(SendError)>;

pub(crate) struct ChannelCore {
    id: ChannelId,
    local_addr: SocketAddr,
    state: Cell<ChannelState>,
    transport: RefCell<Option<Box<dyn DatagramTransport>>>,
    bridge: RefCell<InboundBridge>,
    subscribed: Cell<bool>,
    consumer: RefCell<Option<Waker>>,
    reader: RefCell<Option<Waker>>,
    driver: RefCell<Option<JoinHandle<()>>>,
    on_failure: RefCell<Option<FailureHook>>,
    failures: FailureLog,
    event_loop: WeakEventLoop,
}

impl ChannelCore {
    pub(crate) fn id(&self) -> ChannelId {
        self.id
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn is_bound(&self) -> bool {
        self.state.get() == ChannelState::Bound
    }

    pub(crate) fn failures(&self) -> &FailureLog {
        &self.failures
    }

    pub(crate) fn subscribe(&self) -> bool {
        !self.subscribed.replace(true)
    }

    pub(crate) fn unsubscribe(&self) {
        self.subscribed.set(false);
        self.bridge.borrow_mut().cancel();
        self.consumer.borrow_mut().take();
    }

    pub(crate) fn request(&self, n: u64) {
        let rearmed = self.bridge.borrow_mut().request(n);
        if rearmed {
            self.wake_reader();
        }
    }

    pub(crate) fn queued(&self) -> usize {
        self.bridge.borrow().buffered()
    }

    /// Hand the consumer its next delivery, granting one item of demand if
    /// none is outstanding.
    pub(crate) fn poll_delivery(&self, cx: &mut Context<'_>) -> Delivery {
        let (delivery, rearmed) = {
            let mut bridge = self.bridge.borrow_mut();
            let was_reading = bridge.read_interest();
            if bridge.demand() == 0 {
                bridge.request(1);
            }
            let delivery = bridge.poll_delivery();
            (delivery, !was_reading && bridge.read_interest())
        };

        if delivery == Delivery::Pending {
            *self.consumer.borrow_mut() = Some(cx.waker().clone());
        }
        if rearmed {
            tracing::trace!(
                target: targets::BRIDGE,
                channel = %self.id,
                "read interest re-armed"
            );
            self.wake_reader();
        }
        delivery
    }

    pub(crate) async fn write(&self, datagram: &Datagram) -> Result<(), SendError> {
        let target = datagram.recipient.ok_or(SendError::NoRecipient)?;
        poll_fn(|cx| self.poll_write(cx, &datagram.payload, target)).await
    }

    fn poll_write(
        &self,
        cx: &mut Context<'_>,
        payload: &Bytes,
        target: SocketAddr,
    ) -> Poll<Result<(), SendError>> {
        if !self.is_bound() {
            return Poll::Ready(Err(SendError::ChannelClosed));
        }
        let transport = self.transport.borrow();
        let Some(transport) = transport.as_ref() else {
            return Poll::Ready(Err(SendError::ChannelClosed));
        };
        let sent = ready!(transport.poll_send_to(cx, payload, target));
        Poll::Ready(sent.map(|_| ()).map_err(SendError::from))
    }

    fn try_write(&self, datagram: &Datagram) -> Result<(), SendError> {
        if !self.is_bound() {
            return Err(SendError::ChannelClosed);
        }
        let target = datagram.recipient.ok_or(SendError::NoRecipient)?;
        let transport = self.transport.borrow();
        let transport = transport.as_ref().ok_or(SendError::ChannelClosed)?;
        transport
            .try_send_to(&datagram.payload, target)
            .map(|_| ())
            .map_err(SendError::from)
    }

    fn poll_read(
        &self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Option<io::Result<Datagram>>> {
        if !self.is_bound() {
            return Poll::Ready(None);
        }
        if !self.bridge.borrow().read_interest() {
            *self.reader.borrow_mut() = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let transport = self.transport.borrow();
        let Some(transport) = transport.as_ref() else {
            return Poll::Ready(None);
        };
        let mut read = ReadBuf::new(buf);
        let sender = match ready!(transport.poll_recv_from(cx, &mut read)) {
            Ok(sender) => sender,
            Err(e) => return Poll::Ready(Some(Err(e))),
        };
        Poll::Ready(Some(Ok(Datagram {
            payload: Bytes::copy_from_slice(read.filled()),
            sender,
            recipient: Some(self.local_addr),
        })))
    }

    fn on_datagram(&self, datagram: Datagram) {
        let accepted = self.bridge.borrow_mut().on_datagram(datagram);
        if !accepted {
            tracing::trace!(
                target: targets::BRIDGE,
                channel = %self.id,
                "datagram refused by full queue"
            );
        } else if !self.bridge.borrow().read_interest() {
            tracing::trace!(
                target: targets::BRIDGE,
                channel = %self.id,
                "high water mark reached, reading paused"
            );
        }
        self.wake_consumer();
    }

    fn fail(&self, error: SendError) {
        if !self.bridge.borrow_mut().terminate(InboundEnd::Failed(error.clone())) {
            return;
        }
        tracing::warn!(target: targets::CHANNEL, channel = %self.id, %error, "channel read failed");
        self.failures.lock().push(FlowError::Io(error.clone()));
        self.wake_consumer();

        let hook = self.on_failure.borrow_mut().take();
        if let Some(hook) = hook {
            hook(error);
        }
    }

    fn close(&self) {
        let previous = self.state.get();
        if matches!(previous, ChannelState::Closing | ChannelState::Closed) {
            return;
        }
        self.state.set(ChannelState::Closing);

        self.bridge.borrow_mut().terminate(InboundEnd::Completed);
        self.wake_consumer();
        self.reader.borrow_mut().take();
        if let Some(driver) = self.driver.borrow_mut().take() {
            driver.abort();
        }
        self.on_failure.borrow_mut().take();
        let transport = self.transport.borrow_mut().take();
        drop(transport);

        self.state.set(ChannelState::Closed);
        if previous == ChannelState::Bound
            && let Some(event_loop) = self.event_loop.upgrade()
        {
            event_loop.deregister_channel();
        }
        tracing::debug!(
            target: targets::CHANNEL,
            channel = %self.id,
            local = %self.local_addr,
            "channel closed"
        );
    }

    fn wake_consumer(&self) {
        let waker = self.consumer.borrow_mut().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn wake_reader(&self) {
        let waker = self.reader.borrow_mut().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        self.close();
    }
}

/// One bound UDP socket owned by an event loop.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct DatagramChannel {
    core: Rc<ChannelCore>,
}

impl DatagramChannel {
    /// Bind a UDP socket on the current event loop.
    ///
    /// Uses the default flow control. Must be called from an event loop
    /// thread, which becomes the channel's owner.
    pub fn bind(host: &str, port: u16, options: &ChannelOptions) -> Result<Self, BindError> {
        let owner = current_owner()?;
        let socket = bind_udp(host, port, options)?;
        Self::attach(owner, Box::new(socket), FlowControl::default())
    }

    /// Open a channel over an already bound transport on the current event
    /// loop.
    pub fn open(
        transport: Box<dyn DatagramTransport>,
        flow: FlowControl,
    ) -> Result<Self, BindError> {
        let owner = current_owner()?;
        Self::attach(owner, transport, flow)
    }

    pub(crate) fn attach(
        owner: EventLoop,
        transport: Box<dyn DatagramTransport>,
        flow: FlowControl,
    ) -> Result<Self, BindError> {
        let local_addr = transport
            .local_addr()
            .map_err(|e| BindError::from_io(&e, "local address"))?;

        let core = Rc::new(ChannelCore {
            id: ChannelId::next(),
            local_addr,
            state: Cell::new(ChannelState::Binding),
            transport: RefCell::new(Some(transport)),
            bridge: RefCell::new(InboundBridge::new(flow)),
            subscribed: Cell::new(false),
            consumer: RefCell::new(None),
            reader: RefCell::new(None),
            driver: RefCell::new(None),
            on_failure: RefCell::new(None),
            failures: FailureLog::default(),
            event_loop: owner.downgrade(),
        });

        let driver = owner
            .spawn_local(read_loop(Rc::downgrade(&core)))
            .map_err(|e| BindError::ResourceExhausted(e.to_string()))?;
        *core.driver.borrow_mut() = Some(driver);

        core.state.set(ChannelState::Bound);
        owner.register_channel();
        tracing::debug!(
            target: targets::CHANNEL,
            channel = %core.id,
            local = %local_addr,
            loop_id = %owner.id(),
            "channel bound"
        );
        Ok(Self { core })
    }

    pub(crate) fn core(&self) -> &Rc<ChannelCore> {
        &self.core
    }

    /// The channel's identifier.
    pub fn id(&self) -> ChannelId {
        self.core.id
    }

    /// The bound local address.
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr
    }

    /// The channel's current state.
    pub fn state(&self) -> ChannelState {
        self.core.state.get()
    }

    /// The loop that owns this channel, if it is still alive.
    pub fn event_loop(&self) -> Option<EventLoop> {
        self.core.event_loop.upgrade()
    }

    /// Number of datagrams queued and waiting for demand.
    pub fn queued(&self) -> usize {
        self.core.queued()
    }

    /// Whether the channel is currently reading from its socket.
    pub fn is_reading(&self) -> bool {
        self.core.bridge.borrow().read_interest()
    }

    /// Subscribe to inbound datagrams.
    ///
    /// Only one subscriber is served at a time; a second concurrent
    /// subscriber yields [`FlowError::AlreadySubscribed`] and ends.
    pub fn receive(&self) -> Inbound {
        Inbound::subscribe(self.core.clone())
    }

    /// Get an outbound sink for this channel.
    pub fn outbound(&self) -> Outbound {
        Outbound::new(self.core.clone())
    }

    /// Write a datagram without waiting.
    ///
    /// Fails with [`SendError::WouldBlock`] if the socket's send buffer is
    /// full and [`SendError::ChannelClosed`] once the channel is closed.
    pub fn send(&self, datagram: &Datagram) -> Result<(), SendError> {
        self.core.try_write(datagram)
    }

    /// Release the socket and end the inbound sequence. Idempotent.
    pub fn close(&self) {
        self.core.close();
    }

    pub(crate) fn set_failure_hook(&self, hook: impl FnOnce(SendError) + 'static) {
        *self.core.on_failure.borrow_mut() = Some(Box::new(hook));
    }
}

impl fmt::Debug for DatagramChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramChannel")
            .field("id", &self.core.id)
            .field("local_addr", &self.core.local_addr)
            .field("state", &self.core.state.get())
            .field("queued", &self.core.queued())
            .finish()
    }
}

fn current_owner() -> Result<EventLoop, BindError> {
    local::current_loop().ok_or_else(|| {
        BindError::ResourceExhausted("channels must be opened on an event loop thread".into())
    })
}

async fn read_loop(channel: Weak<ChannelCore>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let outcome = poll_fn(|cx| match channel.upgrade() {
            Some(core) => core.poll_read(cx, &mut buf),
            None => Poll::Ready(None),
        })
        .await;

        let Some(core) = channel.upgrade() else {
            return;
        };
        match outcome {
            None => return,
            Some(Ok(datagram)) => core.on_datagram(datagram),
            Some(Err(e)) => {
                let error = SendError::from(e);
                if !error.is_transient() {
                    core.fail(error);
                    return;
                }
                tracing::debug!(
                    target: targets::CHANNEL,
                    channel = %core.id,
                    %error,
                    "ignoring transient receive error"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use horizon_datagram_core::{Completion, EventLoopGroup};
    use std::time::Duration;

    /// Run `f` on a fresh loop and return its result.
    fn on_loop<T, F>(f: F) -> T
    where
        T: Clone + Send + 'static,
        F: FnOnce(Completion<T>) + Send + 'static,
    {
        let group = EventLoopGroup::with_threads(1).unwrap();
        let event_loop = group.assign_loop().unwrap();
        let result = Completion::new();
        let signal = result.clone();
        event_loop.execute(move || f(signal)).unwrap();
        let value = result.wait_timeout(Duration::from_secs(5)).unwrap();
        group.shutdown_gracefully(Duration::from_secs(1)).wait();
        value
    }

    #[test]
    fn test_bind_requires_event_loop() {
        let result = DatagramChannel::bind("127.0.0.1", 0, &ChannelOptions::new());
        assert!(matches!(result, Err(BindError::ResourceExhausted(_))));
    }

    #[test]
    fn test_close_is_idempotent() {
        let states = on_loop(|done| {
            let channel = DatagramChannel::bind("127.0.0.1", 0, &ChannelOptions::new()).unwrap();
            let owner = channel.event_loop().unwrap();
            let bound = (channel.state(), owner.channel_count());
            channel.close();
            channel.close();
            let target = channel.local_addr();
            let send = channel.send(&Datagram::to(&b"x"[..], target));
            done.complete((bound, channel.state(), owner.channel_count(), send));
        });

        assert_eq!(states.0, (ChannelState::Bound, 1));
        assert_eq!(states.1, ChannelState::Closed);
        assert_eq!(states.2, 0);
        assert_eq!(states.3, Err(SendError::ChannelClosed));
    }

    #[test]
    fn test_send_without_recipient() {
        let result = on_loop(|done| {
            let channel = DatagramChannel::bind("127.0.0.1", 0, &ChannelOptions::new()).unwrap();
            let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
            let mut datagram = Datagram::new(&b"x"[..], peer);
            datagram.recipient = None;
            done.complete(channel.send(&datagram));
            channel.close();
        });
        assert_eq!(result, Err(SendError::NoRecipient));
    }

    #[test]
    fn test_receive_in_order_and_close_ends_stream() {
        let client = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let client_addr = client.local_addr().unwrap();
        let (addr_tx, addr_rx) = std::sync::mpsc::channel();

        let group = EventLoopGroup::with_threads(1).unwrap();
        let event_loop = group.assign_loop().unwrap();
        let received = Completion::new();
        let signal = received.clone();

        let owner = event_loop.clone();
        event_loop
            .execute(move || {
                let channel =
                    DatagramChannel::bind("127.0.0.1", 0, &ChannelOptions::new()).unwrap();
                addr_tx.send(channel.local_addr()).unwrap();
                let mut inbound = channel.receive();
                owner
                    .spawn_local(async move {
                        let mut payloads = Vec::new();
                        while payloads.len() < 3 {
                            match inbound.next().await {
                                Some(Ok(d)) => payloads.push((d.payload.to_vec(), d.sender)),
                                _ => break,
                            }
                        }
                        channel.close();
                        let after_close = inbound.next().await;
                        signal.complete((payloads, after_close.is_none()));
                    })
                    .unwrap();
            })
            .unwrap();

        let server = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        for payload in [&b"a"[..], b"", b"c"] {
            client.send_to(payload, server).unwrap();
        }

        let (payloads, ended) = received.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            payloads,
            vec![
                (b"a".to_vec(), client_addr),
                (Vec::new(), client_addr),
                (b"c".to_vec(), client_addr),
            ]
        );
        assert!(ended);
        group.shutdown_gracefully(Duration::from_secs(1)).wait();
    }

    #[test]
    fn test_second_subscriber_is_rejected() {
        let outcome = on_loop(|done| {
            let channel = DatagramChannel::bind("127.0.0.1", 0, &ChannelOptions::new()).unwrap();
            let first = channel.receive();
            let mut second = channel.receive();
            let owner = channel.event_loop().unwrap();
            owner
                .spawn_local(async move {
                    let rejected = second.next().await;
                    let ended = second.next().await.is_none();
                    drop(first);
                    let third_ok = channel.core().subscribe();
                    channel.close();
                    done.complete((rejected, ended, third_ok));
                })
                .unwrap();
        });

        assert_eq!(outcome.0, Some(Err(FlowError::AlreadySubscribed)));
        assert!(outcome.1);
        assert!(outcome.2);
    }
}
