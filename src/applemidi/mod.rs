//! The AppleMIDI session engine.
//!
//! AppleMIDI manages RTP-MIDI sessions over a pair of UDP ports: a control
//! port `P` and a data port `P + 1`. Control packets carry the `0xffff`
//! signature and a two-letter ASCII command; everything else on the data
//! port is RTP-MIDI. The [`AppleMidiDriver`] owns both sockets and is
//! driven by its host through `tick_receive` / `tick_send` / `tick_idle`.

pub mod command;
pub mod config;
pub mod driver;
pub mod sync;

pub use command::{AppleMidiCommand, FeedbackData, SessionDetails, SyncData};
pub use config::DriverConfig;
pub use driver::{AcceptAll, AppleMidiDriver, InvitationPolicy, MessageHandler};
