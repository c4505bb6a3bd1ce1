//! Flow control between the socket and the handler.
//!
//! The socket pushes datagrams whenever they arrive; the handler pulls them
//! by granting demand. [`InboundBridge`] reconciles the two with a bounded
//! queue, a demand counter and a read-interest flag:
//!
//! - arrivals are queued in arrival order;
//! - once the queue holds `high_water_mark` datagrams, read interest is
//!   dropped and the channel stops reading from the socket;
//! - datagrams are handed out only against demand, oldest first;
//! - read interest comes back once the queue is at or below
//!   `low_water_mark` and the consumer still has demand outstanding;
//! - a terminal signal (completion or error) replaces all further values and
//!   is delivered once.
//!
//! The bridge itself is a plain state machine with no I/O; the channel
//! drives it from its event loop. [`Inbound`] and [`Outbound`] are the
//! handler-facing ends.

mod inbound;
mod outbound;

use std::collections::VecDeque;

pub use inbound::Inbound;
pub use outbound::Outbound;
pub(crate) use outbound::FailureLog;

use crate::datagram::Datagram;
use crate::error::{ConfigError, FlowError, SendError};

/// Default high-water mark of the inbound queue.
pub const DEFAULT_HIGH_WATER_MARK: usize = 256;
/// Default low-water mark of the inbound queue.
pub const DEFAULT_LOW_WATER_MARK: usize = 64;

/// Inbound queue thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    high_water_mark: usize,
    low_water_mark: usize,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self {
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
        }
    }
}

impl FlowControl {
    /// Create thresholds. Requires `high >= 1` and `low < high`.
    pub fn new(high_water_mark: usize, low_water_mark: usize) -> Result<Self, ConfigError> {
        if high_water_mark == 0 || low_water_mark >= high_water_mark {
            return Err(ConfigError::InvalidFlowControl {
                high: high_water_mark,
                low: low_water_mark,
            });
        }
        Ok(Self {
            high_water_mark,
            low_water_mark,
        })
    }

    /// Queue length at which reading pauses.
    pub fn high_water_mark(&self) -> usize {
        self.high_water_mark
    }

    /// Queue length at or below which reading may resume.
    pub fn low_water_mark(&self) -> usize {
        self.low_water_mark
    }
}

/// How the inbound sequence ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEnd {
    /// The channel closed normally.
    Completed,
    /// The channel failed.
    Failed(SendError),
}

/// What the consumer should see next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The next datagram.
    Item(Datagram),
    /// The terminal error. Delivered once; [`Delivery::Complete`] follows.
    Error(FlowError),
    /// The sequence is over.
    Complete,
    /// Nothing to deliver until more demand or data arrives.
    Pending,
}

/// The inbound flow-control state machine.
#[derive(Debug)]
pub struct InboundBridge {
    flow: FlowControl,
    queue: VecDeque<Datagram>,
    demand: u64,
    read_interest: bool,
    end: Option<InboundEnd>,
    end_delivered: bool,
    refused: u64,
}

impl InboundBridge {
    /// Create a bridge with read interest asserted and no demand.
    pub fn new(flow: FlowControl) -> Self {
        Self {
            flow,
            queue: VecDeque::with_capacity(flow.high_water_mark.min(1024)),
            demand: 0,
            read_interest: true,
            end: None,
            end_delivered: false,
            refused: 0,
        }
    }

    /// The configured thresholds.
    pub fn flow_control(&self) -> FlowControl {
        self.flow
    }

    /// Number of buffered datagrams.
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }

    /// Outstanding demand.
    pub fn demand(&self) -> u64 {
        self.demand
    }

    /// Whether the channel should keep reading from the socket.
    pub fn read_interest(&self) -> bool {
        self.read_interest && self.end.is_none()
    }

    /// Whether a terminal signal has been recorded.
    pub fn is_terminated(&self) -> bool {
        self.end.is_some()
    }

    /// Datagrams refused because the queue was full or the bridge had ended.
    pub fn refused(&self) -> u64 {
        self.refused
    }

    /// Buffer an arrived datagram.
    ///
    /// Returns `false` if the datagram was refused. Read interest drops once
    /// the queue reaches the high-water mark.
    pub fn on_datagram(&mut self, datagram: Datagram) -> bool {
        if self.end.is_some() || self.queue.len() >= self.flow.high_water_mark {
            self.refused += 1;
            return false;
        }
        self.queue.push_back(datagram);
        if self.queue.len() >= self.flow.high_water_mark {
            self.read_interest = false;
        }
        true
    }

    /// Grant `n` more items of demand.
    ///
    /// Returns `true` if this re-armed read interest.
    pub fn request(&mut self, n: u64) -> bool {
        if self.end.is_some() {
            return false;
        }
        self.demand = self.demand.saturating_add(n);
        self.maybe_rearm()
    }

    /// Withdraw all outstanding demand, e.g. when the consumer goes away.
    /// Buffered datagrams stay queued for a later consumer.
    pub fn cancel(&mut self) {
        self.demand = 0;
    }

    /// Record the terminal signal. Only the first call has any effect.
    ///
    /// Returns `true` if this call terminated the bridge.
    pub fn terminate(&mut self, end: InboundEnd) -> bool {
        if self.end.is_some() {
            return false;
        }
        self.queue.clear();
        self.read_interest = false;
        self.end = Some(end);
        true
    }

    /// Take the next thing to deliver to the consumer.
    pub fn poll_delivery(&mut self) -> Delivery {
        if let Some(end) = &self.end {
            if self.end_delivered {
                return Delivery::Complete;
            }
            self.end_delivered = true;
            return match end {
                InboundEnd::Completed => Delivery::Complete,
                InboundEnd::Failed(e) => Delivery::Error(FlowError::Io(e.clone())),
            };
        }

        if self.demand == 0 {
            return Delivery::Pending;
        }
        match self.queue.pop_front() {
            Some(datagram) => {
                self.demand -= 1;
                self.maybe_rearm();
                Delivery::Item(datagram)
            }
            None => Delivery::Pending,
        }
    }

    fn maybe_rearm(&mut self) -> bool {
        if !self.read_interest && self.demand > 0 && self.queue.len() <= self.flow.low_water_mark {
            self.read_interest = true;
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn datagram(n: u8) -> Datagram {
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        Datagram::new(vec![n], peer)
    }

    fn bridge(high: usize, low: usize) -> InboundBridge {
        InboundBridge::new(FlowControl::new(high, low).unwrap())
    }

    #[test]
    fn test_flow_control_validation() {
        assert!(FlowControl::new(0, 0).is_err());
        assert!(FlowControl::new(4, 4).is_err());
        assert!(FlowControl::new(4, 5).is_err());
        let flow = FlowControl::new(1, 0).unwrap();
        assert_eq!(flow.high_water_mark(), 1);
        assert_eq!(FlowControl::default().high_water_mark(), DEFAULT_HIGH_WATER_MARK);
    }

    #[test]
    fn test_delivers_in_arrival_order() {
        let mut bridge = bridge(16, 4);
        bridge.request(10);
        for n in 0..10 {
            assert!(bridge.on_datagram(datagram(n)));
        }

        let delivered: Vec<u8> = std::iter::from_fn(|| match bridge.poll_delivery() {
            Delivery::Item(d) => Some(d.payload[0]),
            _ => None,
        })
        .collect();

        assert_eq!(delivered, (0..10).collect::<Vec<_>>());
        assert_eq!(bridge.demand(), 0);
    }

    #[test]
    fn test_no_delivery_without_demand() {
        let mut bridge = bridge(8, 2);
        bridge.on_datagram(datagram(1));
        assert_eq!(bridge.poll_delivery(), Delivery::Pending);

        bridge.request(1);
        assert_eq!(bridge.poll_delivery(), Delivery::Item(datagram(1)));
        assert_eq!(bridge.poll_delivery(), Delivery::Pending);
    }

    #[test]
    fn test_high_water_mark_is_a_ceiling() {
        let mut bridge = bridge(4, 1);
        for n in 0..4 {
            assert!(bridge.read_interest());
            assert!(bridge.on_datagram(datagram(n)));
        }
        assert!(!bridge.read_interest());
        assert_eq!(bridge.buffered(), 4);

        // A datagram already in flight when interest dropped is refused.
        assert!(!bridge.on_datagram(datagram(9)));
        assert_eq!(bridge.buffered(), 4);
        assert_eq!(bridge.refused(), 1);
    }

    #[test]
    fn test_rearms_only_at_low_water_mark() {
        let mut bridge = bridge(4, 1);
        for n in 0..4 {
            bridge.on_datagram(datagram(n));
        }

        // Demand alone does not re-arm while the queue is above the low mark.
        assert!(!bridge.request(10));
        assert!(!bridge.read_interest());

        assert!(matches!(bridge.poll_delivery(), Delivery::Item(_)));
        assert!(matches!(bridge.poll_delivery(), Delivery::Item(_)));
        assert!(!bridge.read_interest());
        assert_eq!(bridge.buffered(), 2);

        assert!(matches!(bridge.poll_delivery(), Delivery::Item(_)));
        assert_eq!(bridge.buffered(), 1);
        assert!(bridge.read_interest());
    }

    #[test]
    fn test_rearm_needs_outstanding_demand() {
        let mut bridge = bridge(2, 0);
        bridge.on_datagram(datagram(0));
        bridge.on_datagram(datagram(1));
        bridge.request(2);
        bridge.poll_delivery();
        bridge.poll_delivery();

        // Queue is empty but demand is spent.
        assert!(!bridge.read_interest());
        assert!(bridge.request(1));
        assert!(bridge.read_interest());
    }

    #[test]
    fn test_completion_discards_buffer_and_is_delivered_once() {
        let mut bridge = bridge(8, 2);
        bridge.request(1);
        bridge.on_datagram(datagram(1));
        bridge.on_datagram(datagram(2));

        assert!(bridge.terminate(InboundEnd::Completed));
        assert!(!bridge.terminate(InboundEnd::Failed(SendError::ChannelClosed)));
        assert_eq!(bridge.buffered(), 0);
        assert!(!bridge.read_interest());

        assert_eq!(bridge.poll_delivery(), Delivery::Complete);
        assert_eq!(bridge.poll_delivery(), Delivery::Complete);
        assert!(!bridge.on_datagram(datagram(3)));
    }

    #[test]
    fn test_error_is_delivered_once() {
        let mut bridge = bridge(8, 2);
        bridge.request(5);
        bridge.terminate(InboundEnd::Failed(SendError::ChannelClosed));

        assert_eq!(
            bridge.poll_delivery(),
            Delivery::Error(FlowError::Io(SendError::ChannelClosed))
        );
        assert_eq!(bridge.poll_delivery(), Delivery::Complete);
        assert!(!bridge.request(1));
    }

    #[test]
    fn test_zero_length_payload_passes_through() {
        let mut bridge = bridge(8, 2);
        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        bridge.on_datagram(Datagram::new(Vec::new(), peer));
        bridge.request(1);

        match bridge.poll_delivery() {
            Delivery::Item(d) => {
                assert!(d.is_empty());
                assert_eq!(d.sender, peer);
            }
            other => panic!("unexpected delivery: {other:?}"),
        }
    }

    #[test]
    fn test_cancel_keeps_buffer() {
        let mut bridge = bridge(8, 2);
        bridge.request(3);
        bridge.on_datagram(datagram(7));
        bridge.cancel();
        assert_eq!(bridge.poll_delivery(), Delivery::Pending);
        assert_eq!(bridge.buffered(), 1);

        bridge.request(1);
        assert_eq!(bridge.poll_delivery(), Delivery::Item(datagram(7)));
    }
}
