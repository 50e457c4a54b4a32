//! MIDI networking over UDP.
//!
//! The crate has three layers, leaves first:
//!
//! * [`message`] — the MIDI message codec: a fixed registry of message
//!   formats that detect, size, encode, decode and mutate every MIDI
//!   message variant, plus bounded message queues.
//! * [`rtp`] — the RTP transport: peer table, 16-bit sequence numbers,
//!   media timestamps, the RTP-MIDI payload layer and the per-peer
//!   recovery journal.
//! * [`applemidi`] — the session engine: a two-socket (control + data)
//!   peer-to-peer state machine performing invitation, clock
//!   synchronization, teardown and receiver feedback.
//!
//! The crate owns no event loop. The host drives an
//! [`applemidi::AppleMidiDriver`] through its `tick_receive`, `tick_send`
//! and `tick_idle` entry points; all socket I/O is non-blocking.

pub mod applemidi;
pub mod error;
pub mod message;
pub mod rtp;
pub mod util;
