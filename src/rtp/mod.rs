//! The RTP transport layer: bit-exact packet headers, a peer table with
//! wrapping sequence numbers, the RTP-MIDI payload layer and the per-peer
//! recovery journal.

pub mod journal;
pub mod midi;
pub mod packet;
pub mod peer;
pub mod session;
