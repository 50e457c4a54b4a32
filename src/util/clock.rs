use std::time::Duration;
use tokio::time::Instant;

/// Media timestamp clock: a monotonic reference instant plus a tick rate.
///
/// Timestamps are expressed in ticks of the configured rate (44.1 kHz by
/// default, the RTP-MIDI convention) since the clock was created. The clock
/// is handed to the sessions at construction, there is no process-wide
/// clock.
#[derive(Debug, Clone)]
pub struct MediaClock {
    reference: Instant,
    rate: u32,
}

impl MediaClock {
    pub const DEFAULT_RATE: u32 = 44_100;

    pub fn new(rate: u32) -> MediaClock {
        MediaClock {
            reference: Instant::now(),
            rate,
        }
    }

    pub fn rate(&self) -> u32 {
        self.rate
    }

    /// Current time in timestamp ticks.
    pub fn now(&self) -> u64 {
        self.ticks(self.reference.elapsed())
    }

    /// Convert a duration into timestamp ticks at this clock's rate.
    pub fn ticks(&self, duration: Duration) -> u64 {
        duration.as_secs() * self.rate as u64
            + duration.subsec_nanos() as u64 * self.rate as u64 / 1_000_000_000
    }
}

impl Default for MediaClock {
    fn default() -> Self {
        MediaClock::new(Self::DEFAULT_RATE)
    }
}
