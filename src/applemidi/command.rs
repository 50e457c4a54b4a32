use bytes::{Buf, BufMut};

use crate::error::{Result, RtpMidiError};

/// Every AppleMIDI control packet starts with this two-byte signature.
pub const SIGNATURE: u16 = 0xffff;

/// Protocol version carried in invitation commands.
pub const PROTOCOL_VERSION: u32 = 2;

/// Session names in invitations are capped at this many bytes.
pub const MAX_NAME_LEN: usize = 15;

const COMMAND_INVITATION: u16 = u16::from_be_bytes(*b"IN");
const COMMAND_INVITATION_ACCEPTED: u16 = u16::from_be_bytes(*b"OK");
const COMMAND_INVITATION_REJECTED: u16 = u16::from_be_bytes(*b"NO");
const COMMAND_END_SESSION: u16 = u16::from_be_bytes(*b"BY");
const COMMAND_SYNCHRONIZATION: u16 = u16::from_be_bytes(*b"CK");
const COMMAND_RECEIVER_FEEDBACK: u16 = u16::from_be_bytes(*b"RS");

/// Body of the invitation family of commands (`IN`, `OK`, `NO`, `BY`).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SessionDetails {
    pub version: u32,
    pub token: u32,
    pub ssrc: u32,
    /// NUL-terminated on the wire, at most [`MAX_NAME_LEN`] bytes, may be
    /// empty.
    pub name: String,
}

/// Body of a clock synchronization command (`CK`).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SyncData {
    pub ssrc: u32,
    pub count: u8,
    pub timestamp1: u64,
    pub timestamp2: u64,
    pub timestamp3: u64,
}

/// Body of a receiver feedback command (`RS`).
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FeedbackData {
    pub ssrc: u32,
    pub sequence: u32,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AppleMidiCommand {
    Invitation(SessionDetails),
    InvitationAccepted(SessionDetails),
    InvitationRejected(SessionDetails),
    EndSession(SessionDetails),
    Sync(SyncData),
    ReceiverFeedback(FeedbackData),
}

impl AppleMidiCommand {
    pub fn command_code(&self) -> u16 {
        match self {
            AppleMidiCommand::Invitation(_) => COMMAND_INVITATION,
            AppleMidiCommand::InvitationAccepted(_) => COMMAND_INVITATION_ACCEPTED,
            AppleMidiCommand::InvitationRejected(_) => COMMAND_INVITATION_REJECTED,
            AppleMidiCommand::EndSession(_) => COMMAND_END_SESSION,
            AppleMidiCommand::Sync(_) => COMMAND_SYNCHRONIZATION,
            AppleMidiCommand::ReceiverFeedback(_) => COMMAND_RECEIVER_FEEDBACK,
        }
    }

    /// The ssrc of the endpoint the command speaks for.
    pub fn ssrc(&self) -> u32 {
        match self {
            AppleMidiCommand::Invitation(d)
            | AppleMidiCommand::InvitationAccepted(d)
            | AppleMidiCommand::InvitationRejected(d)
            | AppleMidiCommand::EndSession(d) => d.ssrc,
            AppleMidiCommand::Sync(d) => d.ssrc,
            AppleMidiCommand::ReceiverFeedback(d) => d.ssrc,
        }
    }

    /// Quick test whether a datagram is an AppleMIDI control packet:
    /// signature plus one of the six known command codes.
    pub fn matches_signature(datagram: &[u8]) -> bool {
        if datagram.len() < 4 {
            return false;
        }
        if u16::from_be_bytes([datagram[0], datagram[1]]) != SIGNATURE {
            return false;
        }
        matches!(
            u16::from_be_bytes([datagram[2], datagram[3]]),
            COMMAND_INVITATION
                | COMMAND_INVITATION_ACCEPTED
                | COMMAND_INVITATION_REJECTED
                | COMMAND_END_SESSION
                | COMMAND_SYNCHRONIZATION
                | COMMAND_RECEIVER_FEEDBACK
        )
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u16(SIGNATURE);
        buf.put_u16(self.command_code());
        match self {
            AppleMidiCommand::Invitation(d)
            | AppleMidiCommand::InvitationAccepted(d)
            | AppleMidiCommand::InvitationRejected(d)
            | AppleMidiCommand::EndSession(d) => Self::ser_session_details(d, buf),
            AppleMidiCommand::Sync(d) => {
                buf.put_u32(d.ssrc);
                buf.put_u8(d.count);
                buf.put_bytes(0, 3);
                buf.put_u64(d.timestamp1);
                buf.put_u64(d.timestamp2);
                buf.put_u64(d.timestamp3);
            }
            AppleMidiCommand::ReceiverFeedback(d) => {
                buf.put_u32(d.ssrc);
                buf.put_u32(d.sequence);
            }
        }
    }

    fn ser_session_details(details: &SessionDetails, buf: &mut impl BufMut) {
        buf.put_u32(details.version);
        buf.put_u32(details.token);
        buf.put_u32(details.ssrc);
        if !details.name.is_empty() {
            let name = details.name.as_bytes();
            buf.put_slice(&name[..name.len().min(MAX_NAME_LEN)]);
            buf.put_u8(0);
        }
    }

    pub fn deser(buf: &mut impl Buf) -> Result<AppleMidiCommand> {
        let signature = buf.try_get_u16()?;
        if signature != SIGNATURE {
            return Err(RtpMidiError::protocol_violation(format!(
                "bad control packet signature 0x{:04x}",
                signature
            )));
        }

        match buf.try_get_u16()? {
            COMMAND_INVITATION => Ok(AppleMidiCommand::Invitation(Self::deser_session_details(buf)?)),
            COMMAND_INVITATION_ACCEPTED => Ok(AppleMidiCommand::InvitationAccepted(
                Self::deser_session_details(buf)?,
            )),
            COMMAND_INVITATION_REJECTED => Ok(AppleMidiCommand::InvitationRejected(
                Self::deser_session_details(buf)?,
            )),
            COMMAND_END_SESSION => Ok(AppleMidiCommand::EndSession(Self::deser_session_details(buf)?)),
            COMMAND_SYNCHRONIZATION => {
                let ssrc = buf.try_get_u32()?;
                let count = buf.try_get_u8()?;
                for _ in 0..3 {
                    buf.try_get_u8()?;
                }
                Ok(AppleMidiCommand::Sync(SyncData {
                    ssrc,
                    count,
                    timestamp1: buf.try_get_u64()?,
                    timestamp2: buf.try_get_u64()?,
                    timestamp3: buf.try_get_u64()?,
                }))
            }
            COMMAND_RECEIVER_FEEDBACK => Ok(AppleMidiCommand::ReceiverFeedback(FeedbackData {
                ssrc: buf.try_get_u32()?,
                sequence: buf.try_get_u32()?,
            })),
            code => Err(RtpMidiError::protocol_violation(format!(
                "unknown command code 0x{:04x}",
                code
            ))),
        }
    }

    fn deser_session_details(buf: &mut impl Buf) -> Result<SessionDetails> {
        let version = buf.try_get_u32()?;
        let token = buf.try_get_u32()?;
        let ssrc = buf.try_get_u32()?;

        let mut name_bytes = Vec::new();
        while buf.has_remaining() {
            let byte = buf.get_u8();
            if byte == 0 {
                break;
            }
            if name_bytes.len() < MAX_NAME_LEN {
                name_bytes.push(byte);
            }
        }
        let name = String::from_utf8_lossy(&name_bytes).into_owned();

        Ok(SessionDetails {
            version,
            token,
            ssrc,
            name,
        })
    }
}
