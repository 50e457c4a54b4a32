//! MIDI messages and their codec.
//!
//! A [`MidiMessage`] pairs raw [`MessageData`] with the
//! [`format::MessageFormat`] that knows how to size, access, encode and
//! decode it. Formats are looked up through [`format::detect`] (from wire
//! bytes) or [`format::for_status`] (from a known status).

pub mod format;
pub mod queue;

use std::fmt::{Debug, Formatter};

use crate::error::{Result, RtpMidiError};
use format::MessageFormat;

/// MIDI status values. Channel voice statuses are high-nibble values
/// (`0x8..=0xe`), system statuses are full bytes (`0xf0..=0xff`).
pub mod status {
    pub const NOTE_OFF: u8 = 0x8;
    pub const NOTE_ON: u8 = 0x9;
    pub const POLYPHONIC_KEY_PRESSURE: u8 = 0xa;
    pub const CONTROL_CHANGE: u8 = 0xb;
    pub const PROGRAM_CHANGE: u8 = 0xc;
    pub const CHANNEL_PRESSURE: u8 = 0xd;
    pub const PITCH_WHEEL_CHANGE: u8 = 0xe;

    pub const SYSTEM_EXCLUSIVE: u8 = 0xf0;
    pub const TIME_CODE_QUARTER_FRAME: u8 = 0xf1;
    pub const SONG_POSITION_POINTER: u8 = 0xf2;
    pub const SONG_SELECT: u8 = 0xf3;
    pub const TUNE_REQUEST: u8 = 0xf6;
    pub const END_OF_EXCLUSIVE: u8 = 0xf7;
    pub const TIMING_CLOCK: u8 = 0xf8;
    pub const START: u8 = 0xfa;
    pub const CONTINUE: u8 = 0xfb;
    pub const STOP: u8 = 0xfc;
    pub const ACTIVE_SENSING: u8 = 0xfe;
    pub const RESET: u8 = 0xff;
}

/// Raw storage for any MIDI message.
///
/// `bytes` holds the status byte and up to two data bytes. For system
/// exclusive messages `bytes[1]` is the manufacturer id and `bytes[2]` the
/// fragment ordinal (0 = first fragment or complete message); the payload
/// lives in `payload`. `bytes[3]` is reserved and always zero.
///
/// Invariant: `payload` is `Some` iff the message is system exclusive with
/// a non-empty body. Ownership of the payload is structural: whoever holds
/// the `MessageData` owns the buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageData {
    pub bytes: [u8; 4],
    pub payload: Option<Vec<u8>>,
}

impl MessageData {
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map(Vec::len).unwrap_or(0)
    }
}

/// Typed property keys. Each message format accepts only the keys that are
/// meaningful for its variant; all others fail with
/// [`RtpMidiError::InvalidArgument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Property {
    Status,
    Channel,
    Key,
    Velocity,
    Pressure,
    Control,
    Value,
    ValueLsb,
    ValueMsb,
    Program,
    ManufacturerId,
    SysexSize,
    SysexFragment,
    SysexData,
    TimeCodeType,
}

/// Values passed to and returned from property access.
///
/// `U16` carries the 14-bit long values of pitch wheel and song position
/// pointer. `Data` transfers ownership of a system exclusive payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    U8(u8),
    U16(u16),
    Size(usize),
    Data(Vec<u8>),
}

impl PropertyValue {
    pub fn as_u8(&self) -> Result<u8> {
        match self {
            PropertyValue::U8(v) => Ok(*v),
            other => Err(RtpMidiError::invalid_argument(format!(
                "expected a byte value, got {:?}",
                other
            ))),
        }
    }

    pub fn as_u16(&self) -> Result<u16> {
        match self {
            PropertyValue::U16(v) => Ok(*v),
            other => Err(RtpMidiError::invalid_argument(format!(
                "expected a 14-bit value, got {:?}",
                other
            ))),
        }
    }
}

/// A MIDI message: raw data plus the format that interprets it.
pub struct MidiMessage {
    format: &'static dyn MessageFormat,
    data: MessageData,
}

impl Debug for MidiMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MidiMessage{{{}:{:02x} {:02x} {:02x}",
            self.format.name(),
            self.data.bytes[0],
            self.data.bytes[1],
            self.data.bytes[2]
        )?;
        if let Some(payload) = &self.data.payload {
            write!(f, " +{}b", payload.len())?;
        }
        write!(f, "}}")
    }
}

impl Clone for MidiMessage {
    fn clone(&self) -> Self {
        MidiMessage {
            format: self.format,
            data: self.data.clone(),
        }
    }
}

impl PartialEq for MidiMessage {
    fn eq(&self, other: &Self) -> bool {
        self.format.name() == other.format.name() && self.data == other.data
    }
}
impl Eq for MidiMessage {}

impl MidiMessage {
    /// Create an empty message of the format matching `status` (channel
    /// statuses as high-nibble values, system statuses as full bytes).
    pub fn from_status(status: u8) -> Result<MidiMessage> {
        let format = format::for_status(status)?;
        let mut data = MessageData::default();
        format.set(&mut data, Property::Status, PropertyValue::U8(status))?;
        Ok(MidiMessage { format, data })
    }

    /// Decode a complete message from its wire form.
    pub fn decode(buffer: &[u8]) -> Result<MidiMessage> {
        let format = format::detect(buffer)?;
        let mut data = MessageData::default();
        format.decode(&mut data, buffer)?;
        Ok(MidiMessage { format, data })
    }

    pub fn format(&self) -> &'static dyn MessageFormat {
        self.format
    }

    pub fn data(&self) -> &MessageData {
        &self.data
    }

    /// The raw first byte as it appears on the wire.
    pub fn status_byte(&self) -> u8 {
        self.data.bytes[0]
    }

    pub fn size(&self) -> Result<usize> {
        self.format.size(&self.data)
    }

    pub fn get(&self, property: Property) -> Result<PropertyValue> {
        self.format.get(&self.data, property)
    }

    pub fn set(&mut self, property: Property, value: PropertyValue) -> Result<()> {
        self.format.set(&mut self.data, property, value)
    }

    /// Write the wire form into `buffer`; fails with invalid-argument if
    /// the buffer is shorter than [`size`](Self::size).
    pub fn encode(&self, buffer: &mut [u8]) -> Result<usize> {
        self.format.encode(&self.data, buffer)
    }

    /// The wire form in a fresh buffer of exactly [`size`](Self::size) bytes.
    pub fn encoded(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.size()?];
        self.format.encode(&self.data, &mut buf)?;
        Ok(buf)
    }

    pub fn note_on(channel: u8, key: u8, velocity: u8) -> Result<MidiMessage> {
        let mut msg = Self::from_status(status::NOTE_ON)?;
        msg.set(Property::Channel, PropertyValue::U8(channel))?;
        msg.set(Property::Key, PropertyValue::U8(key))?;
        msg.set(Property::Velocity, PropertyValue::U8(velocity))?;
        Ok(msg)
    }

    pub fn note_off(channel: u8, key: u8, velocity: u8) -> Result<MidiMessage> {
        let mut msg = Self::from_status(status::NOTE_OFF)?;
        msg.set(Property::Channel, PropertyValue::U8(channel))?;
        msg.set(Property::Key, PropertyValue::U8(key))?;
        msg.set(Property::Velocity, PropertyValue::U8(velocity))?;
        Ok(msg)
    }

    pub fn polyphonic_key_pressure(channel: u8, key: u8, pressure: u8) -> Result<MidiMessage> {
        let mut msg = Self::from_status(status::POLYPHONIC_KEY_PRESSURE)?;
        msg.set(Property::Channel, PropertyValue::U8(channel))?;
        msg.set(Property::Key, PropertyValue::U8(key))?;
        msg.set(Property::Pressure, PropertyValue::U8(pressure))?;
        Ok(msg)
    }

    pub fn control_change(channel: u8, control: u8, value: u8) -> Result<MidiMessage> {
        let mut msg = Self::from_status(status::CONTROL_CHANGE)?;
        msg.set(Property::Channel, PropertyValue::U8(channel))?;
        msg.set(Property::Control, PropertyValue::U8(control))?;
        msg.set(Property::Value, PropertyValue::U8(value))?;
        Ok(msg)
    }

    pub fn program_change(channel: u8, program: u8) -> Result<MidiMessage> {
        let mut msg = Self::from_status(status::PROGRAM_CHANGE)?;
        msg.set(Property::Channel, PropertyValue::U8(channel))?;
        msg.set(Property::Program, PropertyValue::U8(program))?;
        Ok(msg)
    }

    pub fn channel_pressure(channel: u8, pressure: u8) -> Result<MidiMessage> {
        let mut msg = Self::from_status(status::CHANNEL_PRESSURE)?;
        msg.set(Property::Channel, PropertyValue::U8(channel))?;
        msg.set(Property::Pressure, PropertyValue::U8(pressure))?;
        Ok(msg)
    }

    /// `value` is the 14-bit wheel position, 0x2000 = centered.
    pub fn pitch_wheel_change(channel: u8, value: u16) -> Result<MidiMessage> {
        let mut msg = Self::from_status(status::PITCH_WHEEL_CHANGE)?;
        msg.set(Property::Channel, PropertyValue::U8(channel))?;
        msg.set(Property::Value, PropertyValue::U16(value))?;
        Ok(msg)
    }

    pub fn time_code_quarter_frame(code_type: u8, value: u8) -> Result<MidiMessage> {
        let mut msg = Self::from_status(status::TIME_CODE_QUARTER_FRAME)?;
        msg.set(Property::TimeCodeType, PropertyValue::U8(code_type))?;
        msg.set(Property::Value, PropertyValue::U8(value))?;
        Ok(msg)
    }

    /// `value` is the 14-bit song position in MIDI beats.
    pub fn song_position_pointer(value: u16) -> Result<MidiMessage> {
        let mut msg = Self::from_status(status::SONG_POSITION_POINTER)?;
        msg.set(Property::Value, PropertyValue::U16(value))?;
        Ok(msg)
    }

    pub fn song_select(value: u8) -> Result<MidiMessage> {
        let mut msg = Self::from_status(status::SONG_SELECT)?;
        msg.set(Property::Value, PropertyValue::U8(value))?;
        Ok(msg)
    }

    pub fn tune_request() -> Result<MidiMessage> {
        Self::from_status(status::TUNE_REQUEST)
    }

    /// Any real-time status: timing clock, start, continue, stop, active
    /// sensing or reset.
    pub fn real_time(status: u8) -> Result<MidiMessage> {
        Self::from_status(status)
    }

    /// A complete (unfragmented) system exclusive message. The payload is
    /// the body after the manufacturer id; the final 0xf7 end-of-exclusive
    /// byte is part of the payload.
    pub fn system_exclusive(manufacturer_id: u8, payload: Vec<u8>) -> Result<MidiMessage> {
        let mut msg = Self::from_status(status::SYSTEM_EXCLUSIVE)?;
        msg.set(Property::ManufacturerId, PropertyValue::U8(manufacturer_id))?;
        msg.set(Property::SysexData, PropertyValue::Data(payload))?;
        Ok(msg)
    }

    /// One fragment of a fragmented system exclusive transmission.
    /// Fragment 0 carries status and manufacturer id on the wire; later
    /// fragments are raw payload. The fragment whose payload ends with
    /// 0xf7 is the last one.
    pub fn system_exclusive_fragment(
        manufacturer_id: u8,
        fragment: u8,
        payload: Vec<u8>,
    ) -> Result<MidiMessage> {
        let mut msg = Self::from_status(status::SYSTEM_EXCLUSIVE)?;
        msg.set(Property::ManufacturerId, PropertyValue::U8(manufacturer_id))?;
        msg.set(Property::SysexFragment, PropertyValue::U8(fragment))?;
        msg.set(Property::SysexData, PropertyValue::Data(payload))?;
        Ok(msg)
    }
}
