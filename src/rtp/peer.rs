use std::fmt::{Display, Formatter};
use std::net::SocketAddr;

/// 16-bit RTP sequence number with wrap-around ordering.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct SequenceNumber(u16);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(self) -> u16 {
        self.0
    }

    pub fn next(self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(1))
    }

    /// Signed distance from `other` to `self`, modulo 2^16. Positive means
    /// `self` is newer than `other`.
    pub fn delta(self, other: SequenceNumber) -> i16 {
        self.0.wrapping_sub(other.0) as i16
    }
}

/// Outcome of feeding an inbound sequence number to a peer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SequenceCheck {
    /// The packet advances (or starts) the sequence.
    InOrder,
    /// The packet arrived late but within the reordering tolerance window;
    /// it is delivered, the high-water mark does not move.
    Late,
    /// Older than the tolerance window, or a duplicate of the newest
    /// packet; the packet is dropped.
    Stale,
}

/// A remote endpoint of an RTP session.
#[derive(Debug)]
pub struct RtpPeer {
    ssrc: u32,
    address: SocketAddr,
    send_sequence: SequenceNumber,
    recv_sequence: Option<SequenceNumber>,
    timestamp_diff: i64,
}

impl RtpPeer {
    /// Late packets no older than this many sequence numbers below the
    /// newest one are still delivered.
    pub const REORDER_TOLERANCE: i16 = 16;

    pub fn new(ssrc: u32, address: SocketAddr) -> RtpPeer {
        RtpPeer {
            ssrc,
            address,
            send_sequence: SequenceNumber::ZERO,
            recv_sequence: None,
            timestamp_diff: 0,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn send_sequence(&self) -> SequenceNumber {
        self.send_sequence
    }

    pub fn recv_sequence(&self) -> Option<SequenceNumber> {
        self.recv_sequence
    }

    /// Estimated offset between the peer's clock and the local clock, in
    /// timestamp units. Set by clock synchronization.
    pub fn timestamp_diff(&self) -> i64 {
        self.timestamp_diff
    }

    pub fn set_timestamp_diff(&mut self, diff: i64) {
        self.timestamp_diff = diff;
    }

    /// Claim the next outgoing sequence number for this peer.
    pub fn advance_send_sequence(&mut self) -> SequenceNumber {
        let seq = self.send_sequence;
        self.send_sequence = seq.next();
        seq
    }

    /// Register an inbound sequence number, applying the stale/reordering
    /// rule and advancing the receive high-water mark for in-order packets.
    pub fn note_received(&mut self, sequence: SequenceNumber) -> SequenceCheck {
        match self.recv_sequence {
            None => {
                self.recv_sequence = Some(sequence);
                SequenceCheck::InOrder
            }
            Some(newest) => {
                let delta = sequence.delta(newest);
                if delta > 0 {
                    self.recv_sequence = Some(sequence);
                    SequenceCheck::InOrder
                } else if delta >= -Self::REORDER_TOLERANCE && delta != 0 {
                    SequenceCheck::Late
                } else {
                    SequenceCheck::Stale
                }
            }
        }
    }
}
