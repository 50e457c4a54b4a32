use thiserror::Error;

/// Error taxonomy of the crate.
///
/// Codec errors are returned to the caller. Protocol violations never
/// propagate out of the session engine: they are logged and the offending
/// datagram is dropped. An I/O error on a single datagram does not abort a
/// tick, other peers remain serviceable.
#[derive(Debug, Error)]
pub enum RtpMidiError {
    /// A property key or value a message format cannot accept, or a buffer
    /// too small for the requested operation.
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// A packet that fails structural validation: wrong RTP version,
    /// unknown AppleMIDI command, truncated header, echoed own ssrc.
    #[error("protocol violation: {reason}")]
    ProtocolViolation { reason: String },

    /// An address or ssrc lookup miss for an operation that requires a peer.
    #[error("no peer {reason}")]
    NoPeer { reason: String },

    /// Underlying datagram send/receive failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The queue is at capacity; the pushed message was not accepted.
    #[error("queue full at capacity {capacity}")]
    QueueFull { capacity: usize },
}

impl RtpMidiError {
    pub fn invalid_argument(reason: impl Into<String>) -> RtpMidiError {
        RtpMidiError::InvalidArgument { reason: reason.into() }
    }

    pub fn protocol_violation(reason: impl Into<String>) -> RtpMidiError {
        RtpMidiError::ProtocolViolation { reason: reason.into() }
    }

    pub fn no_peer(reason: impl Into<String>) -> RtpMidiError {
        RtpMidiError::NoPeer { reason: reason.into() }
    }
}

/// A truncated read through [`bytes::Buf`] means the datagram ended before
/// the header it claimed to carry.
impl From<bytes::TryGetError> for RtpMidiError {
    fn from(e: bytes::TryGetError) -> Self {
        RtpMidiError::ProtocolViolation { reason: format!("truncated packet: {}", e) }
    }
}

pub type Result<T> = std::result::Result<T, RtpMidiError>;
