use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use super::command::SyncData;

/// Where one peer stands in the three-round `CK` exchange.
///
/// The initiator walks `Idle → Ck0Sent → Ck2Sent`, the responder
/// `Idle → Ck1Sent → Synced`. Both ends know the clock offset once they
/// leave the pending phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Ck0Sent,
    Ck1Sent,
    Ck2Sent,
    Synced,
}

/// What to do after feeding an inbound `CK` to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Send this reply and keep waiting.
    Reply(SyncData),
    /// The round finished; `offset` is the peer's clock minus ours, in
    /// timestamp units. The initiator still owes the final `CK2` reply.
    Complete { offset: i64, reply: Option<SyncData> },
    /// The command does not fit the current phase and is dropped.
    Ignored,
}

/// Per-peer clock synchronization state.
///
/// Cristian-style: the initiator samples `t1`, the responder answers with
/// `t2`, the initiator closes with `t3`. Both sides then estimate the
/// peer's offset as `(t3 - t1) / 2 + (t2 - t3)` with a one-way delay of
/// `(t3 - t1) / 2`.
#[derive(Debug)]
pub struct ClockSync {
    phase: SyncPhase,
    started_at: Option<Instant>,
    last_synced_at: Option<Instant>,
}

impl ClockSync {
    pub fn new() -> ClockSync {
        ClockSync {
            phase: SyncPhase::Idle,
            started_at: None,
            last_synced_at: None,
        }
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
    }

    /// A round is underway and a reply is still outstanding.
    pub fn is_pending(&self) -> bool {
        matches!(self.phase, SyncPhase::Ck0Sent | SyncPhase::Ck1Sent)
    }

    /// Start a round as initiator; returns the `CK0` to send.
    pub fn begin(&mut self, local_ssrc: u32, now: u64, at: Instant) -> SyncData {
        self.phase = SyncPhase::Ck0Sent;
        self.started_at = Some(at);
        SyncData {
            ssrc: local_ssrc,
            count: 0,
            timestamp1: now,
            timestamp2: 0,
            timestamp3: 0,
        }
    }

    /// Feed an inbound `CK` (already checked not to be our own echo).
    pub fn on_sync(&mut self, local_ssrc: u32, data: &SyncData, now: u64, at: Instant) -> SyncOutcome {
        match data.count {
            0 => {
                // responder: answer regardless of phase, a peer may start
                // over at any time
                self.phase = SyncPhase::Ck1Sent;
                self.started_at = Some(at);
                SyncOutcome::Reply(SyncData {
                    ssrc: local_ssrc,
                    count: 1,
                    timestamp1: data.timestamp1,
                    timestamp2: now,
                    timestamp3: 0,
                })
            }
            1 => {
                if self.phase != SyncPhase::Ck0Sent {
                    trace!("CK1 outside of a round we initiated, ignoring");
                    return SyncOutcome::Ignored;
                }
                let timestamp3 = now;
                let offset = Self::offset(data.timestamp1, data.timestamp2, timestamp3);
                self.phase = SyncPhase::Ck2Sent;
                self.started_at = None;
                self.last_synced_at = Some(at);
                SyncOutcome::Complete {
                    offset,
                    reply: Some(SyncData {
                        ssrc: local_ssrc,
                        count: 2,
                        timestamp1: data.timestamp1,
                        timestamp2: data.timestamp2,
                        timestamp3,
                    }),
                }
            }
            2 => {
                if self.phase != SyncPhase::Ck1Sent {
                    trace!("CK2 without a preceding CK0, ignoring");
                    return SyncOutcome::Ignored;
                }
                let offset = Self::offset(data.timestamp1, data.timestamp2, data.timestamp3);
                self.phase = SyncPhase::Synced;
                self.started_at = None;
                self.last_synced_at = Some(at);
                SyncOutcome::Complete {
                    offset,
                    reply: None,
                }
            }
            _ => SyncOutcome::Ignored,
        }
    }

    fn offset(t1: u64, t2: u64, t3: u64) -> i64 {
        let (t1, t2, t3) = (t1 as i64, t2 as i64, t3 as i64);
        (t3 - t1) / 2 + (t2 - t3)
    }

    /// Abandon a round whose reply is overdue. Returns true if a round was
    /// abandoned; the peer goes back to idle and is retried on the next
    /// idle tick.
    pub fn expire(&mut self, at: Instant, timeout: Duration) -> bool {
        if !self.is_pending() {
            return false;
        }
        match self.started_at {
            Some(started) if at.duration_since(started) >= timeout => {
                self.phase = SyncPhase::Idle;
                self.started_at = None;
                true
            }
            _ => false,
        }
    }

    /// Is it time for a fresh round? True when no round is pending and the
    /// last completed one is older than `interval` (or never happened).
    pub fn needs_resync(&self, at: Instant, interval: Duration) -> bool {
        if self.is_pending() {
            return false;
        }
        match self.last_synced_at {
            None => true,
            Some(last) => at.duration_since(last) >= interval,
        }
    }
}

impl Default for ClockSync {
    fn default() -> Self {
        ClockSync::new()
    }
}
