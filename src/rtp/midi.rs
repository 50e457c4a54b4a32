//! The RTP-MIDI payload layer.
//!
//! Outgoing messages are batched into a single payload (their wire forms
//! back to back) and sent once per connected peer; every transmission is
//! recorded in that peer's recovery journal. Inbound payloads are split
//! back into messages by walking the statuses.

use bytes::BytesMut;
use rustc_hash::FxHashMap;
use tracing::{trace, warn};

use crate::error::{Result, RtpMidiError};
use crate::message::{status, MidiMessage};

use super::journal::SendJournal;
use super::packet::RtpPacketInfo;
use super::peer::SequenceNumber;
use super::session::RtpSession;

pub struct RtpMidiSession {
    journals: FxHashMap<u32, SendJournal>,
    journal_capacity: usize,
}

impl RtpMidiSession {
    pub fn new(journal_capacity: usize) -> RtpMidiSession {
        RtpMidiSession {
            journals: FxHashMap::default(),
            journal_capacity,
        }
    }

    /// Encode `messages` into one payload and send it to every peer of the
    /// RTP session, journalling per peer.
    ///
    /// Returns false when at least one send hit an unwritable socket; the
    /// caller should stop draining for this tick. A send failure towards
    /// one peer is logged and does not affect the others.
    pub fn send(&mut self, rtp: &mut RtpSession, messages: &[MidiMessage]) -> Result<bool> {
        let mut payload = BytesMut::new();
        for message in messages {
            payload.extend_from_slice(&message.encoded()?);
        }

        let mut all_writable = true;
        for ssrc in rtp.peer_ssrcs() {
            match rtp.send_payload(ssrc, &payload) {
                Ok(Some(sequence)) => {
                    self.journal_for(ssrc).append(sequence, messages.to_vec());
                }
                Ok(None) => {
                    trace!("socket not writable towards peer {:08x}", ssrc);
                    all_writable = false;
                }
                Err(e) => {
                    warn!("failed to send RTP-MIDI payload to peer {:08x}: {}", ssrc, e);
                }
            }
        }
        Ok(all_writable)
    }

    /// Split a received packet's payload back into messages.
    pub fn receive(&self, info: &RtpPacketInfo) -> Result<Vec<MidiMessage>> {
        split_payload(&info.payload)
    }

    /// Drop journal entries up to and including `up_to` for the given
    /// peer. Called on receiver feedback.
    pub fn truncate_journal(&mut self, ssrc: u32, up_to: SequenceNumber) {
        if let Some(journal) = self.journals.get_mut(&ssrc) {
            journal.truncate(up_to);
        }
    }

    pub fn journal(&self, ssrc: u32) -> Option<&SendJournal> {
        self.journals.get(&ssrc)
    }

    pub fn remove_peer(&mut self, ssrc: u32) {
        self.journals.remove(&ssrc);
    }

    fn journal_for(&mut self, ssrc: u32) -> &mut SendJournal {
        self.journals
            .entry(ssrc)
            .or_insert_with(|| SendJournal::with_capacity(self.journal_capacity))
    }
}

/// Walk the statuses in a payload and decode each message in turn.
///
/// Channel voice and system common messages have fixed sizes determined by
/// their status; a system exclusive message extends through its 0xf7
/// end-of-exclusive byte (or the end of the payload for an unterminated
/// first fragment).
pub fn split_payload(payload: &[u8]) -> Result<Vec<MidiMessage>> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset < payload.len() {
        let rest = &payload[offset..];
        let wire_len = message_wire_len(rest)?;
        if wire_len > rest.len() {
            return Err(RtpMidiError::protocol_violation(format!(
                "message of {} bytes truncated after {} bytes",
                wire_len,
                rest.len()
            )));
        }
        messages.push(MidiMessage::decode(&rest[..wire_len])?);
        offset += wire_len;
    }

    Ok(messages)
}

fn message_wire_len(buffer: &[u8]) -> Result<usize> {
    let len = match buffer[0] {
        0x80..=0xbf | 0xe0..=0xef => 3,
        0xc0..=0xdf => 2,
        status::SYSTEM_EXCLUSIVE => buffer
            .iter()
            .position(|&b| b == status::END_OF_EXCLUSIVE)
            .map(|p| p + 1)
            .unwrap_or(buffer.len()),
        status::TIME_CODE_QUARTER_FRAME => 2,
        status::SONG_POSITION_POINTER => 3,
        status::SONG_SELECT => 2,
        status::TUNE_REQUEST => 1,
        status::TIMING_CLOCK | 0xfa..=0xfc | status::ACTIVE_SENSING | status::RESET => 1,
        other => {
            return Err(RtpMidiError::protocol_violation(format!(
                "unknown status byte 0x{:02x} in payload",
                other
            )))
        }
    };
    Ok(len)
}

/// Split a system exclusive body (without the trailing 0xf7) into message
/// fragments of at most `max_fragment_payload` payload bytes each.
///
/// Fragment 0 carries status and manufacturer id on the wire; the last
/// fragment's payload is terminated with 0xf7. A body that fits produces a
/// single complete message.
pub fn fragment_sysex(
    manufacturer_id: u8,
    body: &[u8],
    max_fragment_payload: usize,
) -> Result<Vec<MidiMessage>> {
    if max_fragment_payload == 0 {
        return Err(RtpMidiError::invalid_argument(
            "fragment payload size must be positive",
        ));
    }

    let mut fragments = Vec::new();
    let mut remaining = body;
    let mut ordinal = 0u8;

    loop {
        let take = remaining.len().min(max_fragment_payload);
        let (chunk, rest) = remaining.split_at(take);
        let mut payload = chunk.to_vec();
        let last = rest.is_empty() && payload.len() < max_fragment_payload;
        if last {
            payload.push(status::END_OF_EXCLUSIVE);
        }

        fragments.push(MidiMessage::system_exclusive_fragment(
            manufacturer_id,
            ordinal,
            payload,
        )?);

        if last {
            return Ok(fragments);
        }
        remaining = rest;
        ordinal = ordinal.checked_add(1).ok_or_else(|| {
            RtpMidiError::invalid_argument("system exclusive body needs more than 255 fragments")
        })?;
    }
}

/// Reassemble the wire forms of a fragment sequence into one complete
/// system exclusive message.
pub fn reassemble_sysex(fragments: &[MidiMessage]) -> Result<MidiMessage> {
    let mut wire = Vec::new();
    for fragment in fragments {
        wire.extend_from_slice(&fragment.encoded()?);
    }
    MidiMessage::decode(&wire)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use tokio::net::UdpSocket;

    use crate::message::{Property, PropertyValue};
    use crate::util::clock::MediaClock;

    use super::*;

    #[test]
    fn test_split_batch_of_mixed_messages() {
        let batch = vec![
            MidiMessage::note_on(3, 60, 100).unwrap(),
            MidiMessage::program_change(1, 7).unwrap(),
            MidiMessage::real_time(status::TIMING_CLOCK).unwrap(),
            MidiMessage::pitch_wheel_change(0, 0x1234).unwrap(),
        ];

        let mut payload = Vec::new();
        for message in &batch {
            payload.extend_from_slice(&message.encoded().unwrap());
        }

        let split = split_payload(&payload).unwrap();
        assert_eq!(split, batch);
    }

    #[test]
    fn test_split_sysex_between_other_messages() {
        let batch = vec![
            MidiMessage::note_off(2, 40, 0).unwrap(),
            MidiMessage::system_exclusive(0x41, vec![9, 8, 7, status::END_OF_EXCLUSIVE]).unwrap(),
            MidiMessage::note_on(2, 40, 90).unwrap(),
        ];

        let mut payload = Vec::new();
        for message in &batch {
            payload.extend_from_slice(&message.encoded().unwrap());
        }

        let split = split_payload(&payload).unwrap();
        assert_eq!(split, batch);
    }

    #[test]
    fn test_split_rejects_unknown_status() {
        assert!(matches!(
            split_payload(&[0xf4, 0x00]),
            Err(RtpMidiError::ProtocolViolation { .. })
        ));
        // a data byte where a status is expected
        assert!(split_payload(&[0x90, 60, 100, 0x33]).is_err());
    }

    #[test]
    fn test_split_rejects_truncated_message() {
        assert!(matches!(
            split_payload(&[0x90, 60]),
            Err(RtpMidiError::ProtocolViolation { .. })
        ));
    }

    #[rstest]
    #[case::single(64)]
    #[case::two_fragments(10)]
    #[case::five_fragments(4)]
    #[case::many_fragments(1)]
    fn test_sysex_fragment_roundtrip(#[case] max_fragment_payload: usize) {
        let body: Vec<u8> = (0u8..18).collect();
        let fragments = fragment_sysex(0x7e, &body, max_fragment_payload).unwrap();

        // fragment ordinals count up from 0, only fragment 0 carries the prefix
        for (i, fragment) in fragments.iter().enumerate() {
            assert_eq!(
                fragment.get(Property::SysexFragment).unwrap(),
                PropertyValue::U8(i as u8)
            );
        }

        let reassembled = reassemble_sysex(&fragments).unwrap();
        let mut expected_payload = body.clone();
        expected_payload.push(status::END_OF_EXCLUSIVE);
        assert_eq!(
            reassembled,
            MidiMessage::system_exclusive(0x7e, expected_payload).unwrap()
        );
    }

    #[test]
    fn test_fragment_boundary_lands_on_chunk_edge() {
        // body length is an exact multiple of the fragment size; the 0xf7
        // terminator must still get a (final, otherwise empty) fragment
        let body: Vec<u8> = (0u8..8).collect();
        let fragments = fragment_sysex(0x10, &body, 4).unwrap();
        assert_eq!(fragments.len(), 3);

        let reassembled = reassemble_sysex(&fragments).unwrap();
        assert_eq!(
            reassembled.get(Property::SysexSize).unwrap(),
            PropertyValue::Size(9)
        );
    }

    #[tokio::test]
    async fn test_send_journals_per_peer() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut rtp = RtpSession::new(socket, MediaClock::default());
        let mut rtp_midi = RtpMidiSession::new(SendJournal::DEFAULT_CAPACITY);

        let sink_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sink_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        rtp.add_peer(0xaa, sink_a.local_addr().unwrap());
        rtp.add_peer(0xbb, sink_b.local_addr().unwrap());

        let batch = vec![MidiMessage::note_on(0, 64, 100).unwrap()];
        for _ in 0..3 {
            assert!(rtp_midi.send(&mut rtp, &batch).unwrap());
        }

        for ssrc in [0xaa, 0xbb] {
            let journal = rtp_midi.journal(ssrc).unwrap();
            assert_eq!(journal.len(), 3);
            assert_eq!(
                journal.sequences(),
                vec![
                    SequenceNumber::from_raw(0),
                    SequenceNumber::from_raw(1),
                    SequenceNumber::from_raw(2)
                ]
            );
        }

        rtp_midi.truncate_journal(0xaa, SequenceNumber::from_raw(1));
        assert_eq!(rtp_midi.journal(0xaa).unwrap().len(), 1);
        assert_eq!(rtp_midi.journal(0xbb).unwrap().len(), 3);
    }
}
