use std::time::Duration;

use anyhow::bail;

use crate::rtp::journal::SendJournal;
use crate::util::clock::MediaClock;

use super::command::MAX_NAME_LEN;

/// Configuration of an [`AppleMidiDriver`](super::AppleMidiDriver).
///
/// The control socket binds to `port`, the data socket to `port + 1`.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub port: u16,
    /// Session name sent in invitations, at most 15 bytes.
    pub name: String,

    /// Rate of the media clock in timestamp units per second.
    pub timestamp_rate: u32,
    /// Messages are delivered upstream once their timestamp is within this
    /// many timestamp units of now.
    pub latency_budget: u64,

    /// How long to wait for an invitation reply before retransmitting.
    pub invitation_timeout: Duration,
    /// After this many unanswered retransmits the peer is declared dead.
    pub max_invitation_retries: u32,

    /// An unanswered synchronization round is abandoned after this long.
    pub sync_timeout: Duration,
    /// Peers are re-synchronized when their last completed round is older
    /// than this.
    pub resync_interval: Duration,
    /// Receiver feedback is sent at most this often per peer.
    pub feedback_interval: Duration,

    /// Maximum datagrams processed per socket in one `tick_receive`.
    pub receive_batch: usize,
    /// Maximum messages drained from the out-queue into one payload.
    pub send_batch: usize,

    pub in_queue_capacity: usize,
    pub out_queue_capacity: usize,
    /// Journalled packets retained per peer.
    pub journal_capacity: usize,
}

impl DriverConfig {
    pub const DEFAULT_PORT: u16 = 5004;

    pub fn new(port: u16) -> DriverConfig {
        DriverConfig {
            port,
            name: "rtpmidi".to_string(),
            timestamp_rate: MediaClock::DEFAULT_RATE,
            latency_budget: 0,
            invitation_timeout: Duration::from_secs(5),
            max_invitation_retries: 3,
            sync_timeout: Duration::from_secs(3),
            resync_interval: Duration::from_secs(10),
            feedback_interval: Duration::from_secs(1),
            receive_batch: 16,
            send_batch: 8,
            in_queue_capacity: 256,
            out_queue_capacity: 256,
            journal_capacity: SendJournal::DEFAULT_CAPACITY,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port == u16::MAX {
            bail!("the data port would overflow, the control port must be below {}", u16::MAX);
        }
        if self.name.len() > MAX_NAME_LEN {
            bail!("session name exceeds {} bytes", MAX_NAME_LEN);
        }
        if self.receive_batch == 0 || self.send_batch == 0 {
            bail!("batch sizes must be positive");
        }
        if self.timestamp_rate == 0 {
            bail!("timestamp rate must be positive");
        }
        Ok(())
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfig::new(Self::DEFAULT_PORT)
    }
}
