use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;

use bytes::{Buf, BufMut};

use crate::error::{Result, RtpMidiError};

use super::peer::SequenceNumber;

pub const RTP_VERSION: u8 = 2;

/// Dynamic payload type used for RTP-MIDI streams.
pub const PAYLOAD_TYPE_MIDI: u8 = 97;

/// The fixed RTP header plus the contributing-source list.
///
/// Wire layout (all integers big-endian):
/// ```ascii
/// 0:      V (2 bits) | P (1) | X (1) | CC (4)
/// 1:      M (1) | PT (7)
/// 2..4:   sequence number
/// 4..8:   timestamp
/// 8..12:  ssrc
/// 12..:   CC contributing-source identifiers, 4 bytes each
/// ```
/// If P is set, the last byte of the packet is the number of padding bytes
/// (including itself) appended after the payload.
#[derive(Clone, Eq, PartialEq)]
pub struct RtpHeader {
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: SequenceNumber,
    pub timestamp: u32,
    pub ssrc: u32,
    pub csrc: Vec<u32>,
}

impl Debug for RtpHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RTP{{pt:{} seq:{} ts:{} ssrc:{:08x} cc:{}{}{}}}",
            self.payload_type,
            self.sequence_number,
            self.timestamp,
            self.ssrc,
            self.csrc.len(),
            if self.marker { " M" } else { "" },
            if self.padding { " P" } else { "" },
        )
    }
}

impl RtpHeader {
    pub const MIN_LEN: usize = 12;

    pub fn new(ssrc: u32, sequence_number: SequenceNumber, timestamp: u32) -> RtpHeader {
        RtpHeader {
            padding: false,
            extension: false,
            marker: false,
            payload_type: PAYLOAD_TYPE_MIDI,
            sequence_number,
            timestamp,
            ssrc,
            csrc: Vec::new(),
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::MIN_LEN + self.csrc.len() * 4
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert!(self.csrc.len() <= 0x0f);
        debug_assert!(self.payload_type <= 0x7f);

        let mut byte0 = RTP_VERSION << 6;
        if self.padding {
            byte0 |= 0x20;
        }
        if self.extension {
            byte0 |= 0x10;
        }
        byte0 |= self.csrc.len() as u8 & 0x0f;
        buf.put_u8(byte0);

        let mut byte1 = self.payload_type & 0x7f;
        if self.marker {
            byte1 |= 0x80;
        }
        buf.put_u8(byte1);

        buf.put_u16(self.sequence_number.to_raw());
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrc {
            buf.put_u32(*csrc);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> Result<RtpHeader> {
        let byte0 = buf.try_get_u8()?;
        let version = byte0 >> 6;
        if version != RTP_VERSION {
            return Err(RtpMidiError::protocol_violation(format!(
                "unsupported RTP version {}",
                version
            )));
        }
        let padding = byte0 & 0x20 != 0;
        let extension = byte0 & 0x10 != 0;
        let csrc_count = byte0 & 0x0f;

        let byte1 = buf.try_get_u8()?;
        let marker = byte1 & 0x80 != 0;
        let payload_type = byte1 & 0x7f;

        let sequence_number = SequenceNumber::from_raw(buf.try_get_u16()?);
        let timestamp = buf.try_get_u32()?;
        let ssrc = buf.try_get_u32()?;

        let mut csrc = Vec::with_capacity(csrc_count as usize);
        for _ in 0..csrc_count {
            csrc.push(buf.try_get_u32()?);
        }

        Ok(RtpHeader {
            padding,
            extension,
            marker,
            payload_type,
            sequence_number,
            timestamp,
            ssrc,
            csrc,
        })
    }
}

/// Everything known about one received (or sent) RTP packet.
#[derive(Debug, Clone)]
pub struct RtpPacketInfo {
    /// Synchronization source from the header.
    pub ssrc: u32,
    /// Network source of the datagram, preserved even when the sender is
    /// not a known peer.
    pub address: SocketAddr,
    /// Whether `address` resolved to a peer in the session's table.
    pub from_known_peer: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: SequenceNumber,
    pub timestamp: u32,
    /// Number of padding bytes stripped from the payload.
    pub padding: u8,
    pub csrc: Vec<u32>,
    pub payload: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::plain(RtpHeader::new(0xdeadbeef, SequenceNumber::from_raw(0x1234), 99))]
    #[case::marker(RtpHeader { marker: true, ..RtpHeader::new(1, SequenceNumber::ZERO, 0) })]
    #[case::padding(RtpHeader { padding: true, ..RtpHeader::new(2, SequenceNumber::from_raw(u16::MAX), u32::MAX) })]
    #[case::extension(RtpHeader { extension: true, ..RtpHeader::new(3, SequenceNumber::from_raw(7), 8) })]
    #[case::csrc(RtpHeader { csrc: vec![0x80706050, 0x04030201], ..RtpHeader::new(4, SequenceNumber::from_raw(9), 10) })]
    fn test_header_roundtrip(#[case] header: RtpHeader) {
        let mut buf = bytes::BytesMut::new();
        header.ser(&mut buf);
        assert_eq!(buf.len(), header.serialized_len());

        let mut parse: &[u8] = &buf;
        let deser = RtpHeader::deser(&mut parse).unwrap();
        assert!(parse.is_empty());
        assert_eq!(header, deser);
    }

    #[test]
    fn test_header_first_bytes_are_bit_exact() {
        let mut header = RtpHeader::new(0, SequenceNumber::from_raw(0x1234), 0);
        header.payload_type = 96;
        header.csrc = vec![1, 2];

        let mut buf = bytes::BytesMut::new();
        header.ser(&mut buf);

        // V=2, P=0, X=0, CC=2
        assert_eq!(buf[0], 0x82);
        // M=0, PT=96
        assert_eq!(buf[1], 96);
        // sequence number big-endian
        assert_eq!(&buf[2..4], &[0x12, 0x34]);
    }

    #[test]
    fn test_deser_rejects_wrong_version() {
        // top two bits 0b10 would be version 2; use 0b01
        let packet = [0x40u8, 97, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1];
        let mut parse: &[u8] = &packet;
        assert!(matches!(
            RtpHeader::deser(&mut parse),
            Err(RtpMidiError::ProtocolViolation { .. })
        ));
    }

    #[test]
    fn test_deser_rejects_truncated_header() {
        let packet = [0x80u8, 97, 0, 1, 0, 0];
        let mut parse: &[u8] = &packet;
        assert!(RtpHeader::deser(&mut parse).is_err());
    }

    #[test]
    fn test_deser_rejects_truncated_csrc_list() {
        let mut buf = bytes::BytesMut::new();
        RtpHeader {
            csrc: vec![1, 2, 3],
            ..RtpHeader::new(5, SequenceNumber::ZERO, 0)
        }
        .ser(&mut buf);
        let truncated = &buf[..buf.len() - 2];
        let mut parse: &[u8] = truncated;
        assert!(RtpHeader::deser(&mut parse).is_err());
    }
}
