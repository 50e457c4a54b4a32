//! The message format registry.
//!
//! One [`MessageFormat`] per MIDI message variant, collected in a fixed
//! table. Detection walks the table in order and returns the first format
//! whose `test` matches the status byte; the channel voice entries come
//! before the system entries because their high-nibble pattern is
//! narrower.

use crate::error::{Result, RtpMidiError};

use super::{status, MessageData, Property, PropertyValue};

/// Capabilities of one message variant: detection, sizing, typed property
/// access and wire conversion. All implementations are stateless.
pub trait MessageFormat: Sync {
    fn name(&self) -> &'static str;

    /// Does the buffer hold a message of this variant? Only the status
    /// byte is inspected; the buffer must not be empty.
    fn test(&self, buffer: &[u8]) -> bool;

    /// Exact serialized length of the message.
    fn size(&self, data: &MessageData) -> Result<usize>;

    fn set(&self, data: &mut MessageData, property: Property, value: PropertyValue) -> Result<()>;

    fn get(&self, data: &MessageData, property: Property) -> Result<PropertyValue>;

    /// Write exactly [`size`](Self::size) bytes into `buffer`; fails if the
    /// buffer is shorter. Returns the number of bytes written.
    fn encode(&self, data: &MessageData, buffer: &mut [u8]) -> Result<usize>;

    /// Read one message from the entire buffer.
    fn decode(&self, data: &mut MessageData, buffer: &[u8]) -> Result<()>;
}

/// The registry, in detection order.
static FORMATS: [&'static dyn MessageFormat; 12] = [
    &NoteOffOn,
    &PolyphonicKeyPressure,
    &ControlChange,
    &ProgramChange,
    &ChannelPressure,
    &PitchWheelChange,
    &SystemExclusive,
    &TimeCodeQuarterFrame,
    &SongPositionPointer,
    &SongSelect,
    &TuneRequest,
    &RealTime,
];

/// Find the format for a message as it would appear on the wire.
pub fn detect(buffer: &[u8]) -> Result<&'static dyn MessageFormat> {
    if buffer.is_empty() {
        return Err(RtpMidiError::invalid_argument("empty buffer"));
    }
    FORMATS
        .iter()
        .find(|f| f.test(buffer))
        .copied()
        .ok_or_else(|| {
            RtpMidiError::invalid_argument(format!(
                "no message format for status byte 0x{:02x}",
                buffer[0]
            ))
        })
}

/// Find the format for a known status. Channel statuses are given as their
/// high nibble (`0x8..=0xe`), system statuses as full bytes (`0xf0..`).
pub fn for_status(status: u8) -> Result<&'static dyn MessageFormat> {
    let byte = if status >= 0x80 {
        if status < 0xf0 {
            return Err(RtpMidiError::invalid_argument(format!(
                "0x{:02x} is a channel status, pass its high nibble",
                status
            )));
        }
        status
    } else {
        let byte = status << 4;
        if byte < 0x80 {
            return Err(RtpMidiError::invalid_argument(format!(
                "0x{:02x} has no status bit",
                status
            )));
        }
        byte
    };
    detect(&[byte])
}

fn high_nibble(byte: u8) -> u8 {
    (byte >> 4) & 0x0f
}

fn low_nibble(byte: u8) -> u8 {
    byte & 0x0f
}

fn checked_data_byte(value: PropertyValue) -> Result<u8> {
    let v = value.as_u8()?;
    if v > 0x7f {
        return Err(RtpMidiError::invalid_argument(format!(
            "data byte 0x{:02x} exceeds 7 bits",
            v
        )));
    }
    Ok(v)
}

fn checked_nibble(value: PropertyValue) -> Result<u8> {
    let v = value.as_u8()?;
    if v > 0x0f {
        return Err(RtpMidiError::invalid_argument(format!(
            "nibble value 0x{:02x} exceeds 4 bits",
            v
        )));
    }
    Ok(v)
}

fn checked_three_bits(value: PropertyValue) -> Result<u8> {
    let v = value.as_u8()?;
    if v > 0x07 {
        return Err(RtpMidiError::invalid_argument(format!(
            "value 0x{:02x} exceeds 3 bits",
            v
        )));
    }
    Ok(v)
}

fn checked_long_value(value: PropertyValue) -> Result<u16> {
    let v = value.as_u16()?;
    if v > 0x3fff {
        return Err(RtpMidiError::invalid_argument(format!(
            "long value 0x{:04x} exceeds 14 bits",
            v
        )));
    }
    Ok(v)
}

fn set_status_nibble(data: &mut MessageData, value: PropertyValue) -> Result<()> {
    let v = checked_nibble(value)?;
    data.bytes[0] = (v << 4) | low_nibble(data.bytes[0]);
    Ok(())
}

fn set_channel(data: &mut MessageData, value: PropertyValue) -> Result<()> {
    let v = checked_nibble(value)?;
    data.bytes[0] = (data.bytes[0] & 0xf0) | v;
    Ok(())
}

fn set_long_value(data: &mut MessageData, value: PropertyValue) -> Result<()> {
    let v = checked_long_value(value)?;
    data.bytes[1] = (v & 0x7f) as u8;
    data.bytes[2] = ((v >> 7) & 0x7f) as u8;
    Ok(())
}

fn get_long_value(data: &MessageData) -> PropertyValue {
    PropertyValue::U16(((data.bytes[2] as u16) << 7) | data.bytes[1] as u16)
}

fn invalid_property(format: &dyn MessageFormat, property: Property) -> RtpMidiError {
    RtpMidiError::invalid_argument(format!(
        "property {:?} is not meaningful for {} messages",
        property,
        format.name()
    ))
}

fn encode_fixed(data: &MessageData, buffer: &mut [u8], len: usize) -> Result<usize> {
    if buffer.len() < len {
        return Err(RtpMidiError::invalid_argument(format!(
            "buffer of {} bytes is too small for a {} byte message",
            buffer.len(),
            len
        )));
    }
    buffer[..len].copy_from_slice(&data.bytes[..len]);
    Ok(len)
}

fn decode_fixed(data: &mut MessageData, buffer: &[u8], len: usize) -> Result<()> {
    if buffer.len() < len {
        return Err(RtpMidiError::invalid_argument(format!(
            "buffer of {} bytes is too small for a {} byte message",
            buffer.len(),
            len
        )));
    }
    data.bytes = [0; 4];
    data.bytes[..len].copy_from_slice(&buffer[..len]);
    data.payload = None;
    Ok(())
}

pub struct NoteOffOn;

impl MessageFormat for NoteOffOn {
    fn name(&self) -> &'static str {
        "note_off_on"
    }

    fn test(&self, buffer: &[u8]) -> bool {
        let nibble = buffer[0] & 0xf0;
        nibble == status::NOTE_OFF << 4 || nibble == status::NOTE_ON << 4
    }

    fn size(&self, _data: &MessageData) -> Result<usize> {
        Ok(3)
    }

    fn set(&self, data: &mut MessageData, property: Property, value: PropertyValue) -> Result<()> {
        match property {
            Property::Status => set_status_nibble(data, value),
            Property::Channel => set_channel(data, value),
            Property::Key => {
                data.bytes[1] = checked_data_byte(value)?;
                Ok(())
            }
            Property::Velocity => {
                data.bytes[2] = checked_data_byte(value)?;
                Ok(())
            }
            _ => Err(invalid_property(self, property)),
        }
    }

    fn get(&self, data: &MessageData, property: Property) -> Result<PropertyValue> {
        match property {
            Property::Status => Ok(PropertyValue::U8(high_nibble(data.bytes[0]))),
            Property::Channel => Ok(PropertyValue::U8(low_nibble(data.bytes[0]))),
            Property::Key => Ok(PropertyValue::U8(data.bytes[1])),
            Property::Velocity => Ok(PropertyValue::U8(data.bytes[2])),
            _ => Err(invalid_property(self, property)),
        }
    }

    fn encode(&self, data: &MessageData, buffer: &mut [u8]) -> Result<usize> {
        encode_fixed(data, buffer, 3)
    }

    fn decode(&self, data: &mut MessageData, buffer: &[u8]) -> Result<()> {
        decode_fixed(data, buffer, 3)
    }
}

pub struct PolyphonicKeyPressure;

impl MessageFormat for PolyphonicKeyPressure {
    fn name(&self) -> &'static str {
        "polyphonic_key_pressure"
    }

    fn test(&self, buffer: &[u8]) -> bool {
        buffer[0] & 0xf0 == status::POLYPHONIC_KEY_PRESSURE << 4
    }

    fn size(&self, _data: &MessageData) -> Result<usize> {
        Ok(3)
    }

    fn set(&self, data: &mut MessageData, property: Property, value: PropertyValue) -> Result<()> {
        match property {
            Property::Status => set_status_nibble(data, value),
            Property::Channel => set_channel(data, value),
            Property::Key => {
                data.bytes[1] = checked_data_byte(value)?;
                Ok(())
            }
            Property::Pressure => {
                data.bytes[2] = checked_data_byte(value)?;
                Ok(())
            }
            _ => Err(invalid_property(self, property)),
        }
    }

    fn get(&self, data: &MessageData, property: Property) -> Result<PropertyValue> {
        match property {
            Property::Status => Ok(PropertyValue::U8(high_nibble(data.bytes[0]))),
            Property::Channel => Ok(PropertyValue::U8(low_nibble(data.bytes[0]))),
            Property::Key => Ok(PropertyValue::U8(data.bytes[1])),
            Property::Pressure => Ok(PropertyValue::U8(data.bytes[2])),
            _ => Err(invalid_property(self, property)),
        }
    }

    fn encode(&self, data: &MessageData, buffer: &mut [u8]) -> Result<usize> {
        encode_fixed(data, buffer, 3)
    }

    fn decode(&self, data: &mut MessageData, buffer: &[u8]) -> Result<()> {
        decode_fixed(data, buffer, 3)
    }
}

pub struct ControlChange;

impl MessageFormat for ControlChange {
    fn name(&self) -> &'static str {
        "control_change"
    }

    fn test(&self, buffer: &[u8]) -> bool {
        buffer[0] & 0xf0 == status::CONTROL_CHANGE << 4
    }

    fn size(&self, _data: &MessageData) -> Result<usize> {
        Ok(3)
    }

    fn set(&self, data: &mut MessageData, property: Property, value: PropertyValue) -> Result<()> {
        match property {
            Property::Status => set_status_nibble(data, value),
            Property::Channel => set_channel(data, value),
            Property::Control => {
                data.bytes[1] = checked_data_byte(value)?;
                Ok(())
            }
            Property::Value => {
                data.bytes[2] = checked_data_byte(value)?;
                Ok(())
            }
            _ => Err(invalid_property(self, property)),
        }
    }

    fn get(&self, data: &MessageData, property: Property) -> Result<PropertyValue> {
        match property {
            Property::Status => Ok(PropertyValue::U8(high_nibble(data.bytes[0]))),
            Property::Channel => Ok(PropertyValue::U8(low_nibble(data.bytes[0]))),
            Property::Control => Ok(PropertyValue::U8(data.bytes[1])),
            Property::Value => Ok(PropertyValue::U8(data.bytes[2])),
            _ => Err(invalid_property(self, property)),
        }
    }

    fn encode(&self, data: &MessageData, buffer: &mut [u8]) -> Result<usize> {
        encode_fixed(data, buffer, 3)
    }

    fn decode(&self, data: &mut MessageData, buffer: &[u8]) -> Result<()> {
        decode_fixed(data, buffer, 3)
    }
}

pub struct ProgramChange;

impl MessageFormat for ProgramChange {
    fn name(&self) -> &'static str {
        "program_change"
    }

    fn test(&self, buffer: &[u8]) -> bool {
        buffer[0] & 0xf0 == status::PROGRAM_CHANGE << 4
    }

    fn size(&self, _data: &MessageData) -> Result<usize> {
        Ok(2)
    }

    fn set(&self, data: &mut MessageData, property: Property, value: PropertyValue) -> Result<()> {
        match property {
            Property::Status => set_status_nibble(data, value),
            Property::Channel => set_channel(data, value),
            Property::Program => {
                data.bytes[1] = checked_data_byte(value)?;
                Ok(())
            }
            _ => Err(invalid_property(self, property)),
        }
    }

    fn get(&self, data: &MessageData, property: Property) -> Result<PropertyValue> {
        match property {
            Property::Status => Ok(PropertyValue::U8(high_nibble(data.bytes[0]))),
            Property::Channel => Ok(PropertyValue::U8(low_nibble(data.bytes[0]))),
            Property::Program => Ok(PropertyValue::U8(data.bytes[1])),
            _ => Err(invalid_property(self, property)),
        }
    }

    fn encode(&self, data: &MessageData, buffer: &mut [u8]) -> Result<usize> {
        encode_fixed(data, buffer, 2)
    }

    fn decode(&self, data: &mut MessageData, buffer: &[u8]) -> Result<()> {
        decode_fixed(data, buffer, 2)
    }
}

pub struct ChannelPressure;

impl MessageFormat for ChannelPressure {
    fn name(&self) -> &'static str {
        "channel_pressure"
    }

    fn test(&self, buffer: &[u8]) -> bool {
        buffer[0] & 0xf0 == status::CHANNEL_PRESSURE << 4
    }

    fn size(&self, _data: &MessageData) -> Result<usize> {
        Ok(2)
    }

    fn set(&self, data: &mut MessageData, property: Property, value: PropertyValue) -> Result<()> {
        match property {
            Property::Status => set_status_nibble(data, value),
            Property::Channel => set_channel(data, value),
            Property::Pressure => {
                data.bytes[1] = checked_data_byte(value)?;
                Ok(())
            }
            _ => Err(invalid_property(self, property)),
        }
    }

    fn get(&self, data: &MessageData, property: Property) -> Result<PropertyValue> {
        match property {
            Property::Status => Ok(PropertyValue::U8(high_nibble(data.bytes[0]))),
            Property::Channel => Ok(PropertyValue::U8(low_nibble(data.bytes[0]))),
            Property::Pressure => Ok(PropertyValue::U8(data.bytes[1])),
            _ => Err(invalid_property(self, property)),
        }
    }

    fn encode(&self, data: &MessageData, buffer: &mut [u8]) -> Result<usize> {
        encode_fixed(data, buffer, 2)
    }

    fn decode(&self, data: &mut MessageData, buffer: &[u8]) -> Result<()> {
        decode_fixed(data, buffer, 2)
    }
}

pub struct PitchWheelChange;

impl MessageFormat for PitchWheelChange {
    fn name(&self) -> &'static str {
        "pitch_wheel_change"
    }

    fn test(&self, buffer: &[u8]) -> bool {
        buffer[0] & 0xf0 == status::PITCH_WHEEL_CHANGE << 4
    }

    fn size(&self, _data: &MessageData) -> Result<usize> {
        Ok(3)
    }

    fn set(&self, data: &mut MessageData, property: Property, value: PropertyValue) -> Result<()> {
        match property {
            Property::Status => set_status_nibble(data, value),
            Property::Channel => set_channel(data, value),
            Property::ValueLsb => {
                data.bytes[1] = checked_data_byte(value)?;
                Ok(())
            }
            Property::ValueMsb => {
                data.bytes[2] = checked_data_byte(value)?;
                Ok(())
            }
            Property::Value => set_long_value(data, value),
            _ => Err(invalid_property(self, property)),
        }
    }

    fn get(&self, data: &MessageData, property: Property) -> Result<PropertyValue> {
        match property {
            Property::Status => Ok(PropertyValue::U8(high_nibble(data.bytes[0]))),
            Property::Channel => Ok(PropertyValue::U8(low_nibble(data.bytes[0]))),
            Property::ValueLsb => Ok(PropertyValue::U8(data.bytes[1])),
            Property::ValueMsb => Ok(PropertyValue::U8(data.bytes[2])),
            Property::Value => Ok(get_long_value(data)),
            _ => Err(invalid_property(self, property)),
        }
    }

    fn encode(&self, data: &MessageData, buffer: &mut [u8]) -> Result<usize> {
        encode_fixed(data, buffer, 3)
    }

    fn decode(&self, data: &mut MessageData, buffer: &[u8]) -> Result<()> {
        decode_fixed(data, buffer, 3)
    }
}

pub struct SystemExclusive;

impl MessageFormat for SystemExclusive {
    fn name(&self) -> &'static str {
        "system_exclusive"
    }

    fn test(&self, buffer: &[u8]) -> bool {
        buffer[0] == status::SYSTEM_EXCLUSIVE
    }

    fn size(&self, data: &MessageData) -> Result<usize> {
        // the first fragment carries status and manufacturer id, later
        // fragments are pure payload
        if data.bytes[2] == 0 {
            Ok(data.payload_len() + 2)
        } else {
            Ok(data.payload_len())
        }
    }

    fn set(&self, data: &mut MessageData, property: Property, value: PropertyValue) -> Result<()> {
        match property {
            Property::Status => {
                data.bytes[0] = value.as_u8()?;
                Ok(())
            }
            Property::ManufacturerId => {
                data.bytes[1] = checked_data_byte(value)?;
                Ok(())
            }
            Property::SysexFragment => {
                data.bytes[2] = value.as_u8()?;
                Ok(())
            }
            Property::SysexSize => match value {
                PropertyValue::Size(n) => {
                    let mut payload = data.payload.take().unwrap_or_default();
                    payload.resize(n, 0);
                    data.payload = if payload.is_empty() { None } else { Some(payload) };
                    Ok(())
                }
                other => Err(RtpMidiError::invalid_argument(format!(
                    "expected a size value, got {:?}",
                    other
                ))),
            },
            Property::SysexData => match value {
                PropertyValue::Data(payload) => {
                    data.payload = if payload.is_empty() { None } else { Some(payload) };
                    Ok(())
                }
                other => Err(RtpMidiError::invalid_argument(format!(
                    "expected a data value, got {:?}",
                    other
                ))),
            },
            _ => Err(invalid_property(self, property)),
        }
    }

    fn get(&self, data: &MessageData, property: Property) -> Result<PropertyValue> {
        match property {
            Property::Status => Ok(PropertyValue::U8(data.bytes[0])),
            Property::ManufacturerId => Ok(PropertyValue::U8(data.bytes[1])),
            Property::SysexFragment => Ok(PropertyValue::U8(data.bytes[2])),
            Property::SysexSize => Ok(PropertyValue::Size(data.payload_len())),
            Property::SysexData => Ok(PropertyValue::Data(
                data.payload.clone().unwrap_or_default(),
            )),
            _ => Err(invalid_property(self, property)),
        }
    }

    fn encode(&self, data: &MessageData, buffer: &mut [u8]) -> Result<usize> {
        let size = self.size(data)?;
        if buffer.len() < size {
            return Err(RtpMidiError::invalid_argument(format!(
                "buffer of {} bytes is too small for a {} byte sysex fragment",
                buffer.len(),
                size
            )));
        }
        if data.bytes[2] == 0 {
            buffer[0] = data.bytes[0];
            buffer[1] = data.bytes[1];
            if let Some(payload) = &data.payload {
                buffer[2..2 + payload.len()].copy_from_slice(payload);
            }
        } else if let Some(payload) = &data.payload {
            buffer[..payload.len()].copy_from_slice(payload);
        }
        Ok(size)
    }

    /// Decodes the buffer as a first fragment: status, manufacturer id,
    /// then the payload, which is copied into a fresh owned buffer.
    fn decode(&self, data: &mut MessageData, buffer: &[u8]) -> Result<()> {
        if buffer.len() < 2 {
            return Err(RtpMidiError::invalid_argument(
                "system exclusive message is shorter than status and manufacturer id",
            ));
        }
        data.bytes = [buffer[0], buffer[1], 0, 0];
        data.payload = if buffer.len() > 2 {
            Some(buffer[2..].to_vec())
        } else {
            None
        };
        Ok(())
    }
}

pub struct TimeCodeQuarterFrame;

impl MessageFormat for TimeCodeQuarterFrame {
    fn name(&self) -> &'static str {
        "time_code_quarter_frame"
    }

    fn test(&self, buffer: &[u8]) -> bool {
        buffer[0] == status::TIME_CODE_QUARTER_FRAME
    }

    fn size(&self, _data: &MessageData) -> Result<usize> {
        Ok(2)
    }

    fn set(&self, data: &mut MessageData, property: Property, value: PropertyValue) -> Result<()> {
        match property {
            Property::Status => {
                data.bytes[0] = value.as_u8()?;
                Ok(())
            }
            Property::TimeCodeType => {
                let v = checked_three_bits(value)?;
                data.bytes[1] = (v << 4) | low_nibble(data.bytes[1]);
                Ok(())
            }
            Property::Value => {
                let v = checked_nibble(value)?;
                data.bytes[1] = (data.bytes[1] & 0xf0) | v;
                Ok(())
            }
            _ => Err(invalid_property(self, property)),
        }
    }

    fn get(&self, data: &MessageData, property: Property) -> Result<PropertyValue> {
        match property {
            Property::Status => Ok(PropertyValue::U8(data.bytes[0])),
            Property::TimeCodeType => Ok(PropertyValue::U8(high_nibble(data.bytes[1]))),
            Property::Value => Ok(PropertyValue::U8(low_nibble(data.bytes[1]))),
            _ => Err(invalid_property(self, property)),
        }
    }

    fn encode(&self, data: &MessageData, buffer: &mut [u8]) -> Result<usize> {
        encode_fixed(data, buffer, 2)
    }

    fn decode(&self, data: &mut MessageData, buffer: &[u8]) -> Result<()> {
        decode_fixed(data, buffer, 2)
    }
}

pub struct SongPositionPointer;

impl MessageFormat for SongPositionPointer {
    fn name(&self) -> &'static str {
        "song_position_pointer"
    }

    fn test(&self, buffer: &[u8]) -> bool {
        buffer[0] == status::SONG_POSITION_POINTER
    }

    fn size(&self, _data: &MessageData) -> Result<usize> {
        Ok(3)
    }

    fn set(&self, data: &mut MessageData, property: Property, value: PropertyValue) -> Result<()> {
        match property {
            Property::Status => {
                data.bytes[0] = value.as_u8()?;
                Ok(())
            }
            Property::ValueLsb => {
                data.bytes[1] = checked_data_byte(value)?;
                Ok(())
            }
            Property::ValueMsb => {
                data.bytes[2] = checked_data_byte(value)?;
                Ok(())
            }
            Property::Value => set_long_value(data, value),
            _ => Err(invalid_property(self, property)),
        }
    }

    fn get(&self, data: &MessageData, property: Property) -> Result<PropertyValue> {
        match property {
            Property::Status => Ok(PropertyValue::U8(data.bytes[0])),
            Property::ValueLsb => Ok(PropertyValue::U8(data.bytes[1])),
            Property::ValueMsb => Ok(PropertyValue::U8(data.bytes[2])),
            Property::Value => Ok(get_long_value(data)),
            _ => Err(invalid_property(self, property)),
        }
    }

    fn encode(&self, data: &MessageData, buffer: &mut [u8]) -> Result<usize> {
        encode_fixed(data, buffer, 3)
    }

    fn decode(&self, data: &mut MessageData, buffer: &[u8]) -> Result<()> {
        decode_fixed(data, buffer, 3)
    }
}

pub struct SongSelect;

impl MessageFormat for SongSelect {
    fn name(&self) -> &'static str {
        "song_select"
    }

    fn test(&self, buffer: &[u8]) -> bool {
        buffer[0] == status::SONG_SELECT
    }

    fn size(&self, _data: &MessageData) -> Result<usize> {
        Ok(2)
    }

    fn set(&self, data: &mut MessageData, property: Property, value: PropertyValue) -> Result<()> {
        match property {
            Property::Status => {
                data.bytes[0] = value.as_u8()?;
                Ok(())
            }
            Property::Value => {
                data.bytes[1] = checked_data_byte(value)?;
                Ok(())
            }
            _ => Err(invalid_property(self, property)),
        }
    }

    fn get(&self, data: &MessageData, property: Property) -> Result<PropertyValue> {
        match property {
            Property::Status => Ok(PropertyValue::U8(data.bytes[0])),
            Property::Value => Ok(PropertyValue::U8(data.bytes[1])),
            _ => Err(invalid_property(self, property)),
        }
    }

    fn encode(&self, data: &MessageData, buffer: &mut [u8]) -> Result<usize> {
        encode_fixed(data, buffer, 2)
    }

    fn decode(&self, data: &mut MessageData, buffer: &[u8]) -> Result<()> {
        decode_fixed(data, buffer, 2)
    }
}

pub struct TuneRequest;

impl MessageFormat for TuneRequest {
    fn name(&self) -> &'static str {
        "tune_request"
    }

    fn test(&self, buffer: &[u8]) -> bool {
        buffer[0] == status::TUNE_REQUEST
    }

    fn size(&self, _data: &MessageData) -> Result<usize> {
        Ok(1)
    }

    fn set(&self, data: &mut MessageData, property: Property, value: PropertyValue) -> Result<()> {
        match property {
            Property::Status => {
                data.bytes[0] = value.as_u8()?;
                Ok(())
            }
            _ => Err(invalid_property(self, property)),
        }
    }

    fn get(&self, data: &MessageData, property: Property) -> Result<PropertyValue> {
        match property {
            Property::Status => Ok(PropertyValue::U8(data.bytes[0])),
            _ => Err(invalid_property(self, property)),
        }
    }

    fn encode(&self, data: &MessageData, buffer: &mut [u8]) -> Result<usize> {
        encode_fixed(data, buffer, 1)
    }

    fn decode(&self, data: &mut MessageData, buffer: &[u8]) -> Result<()> {
        decode_fixed(data, buffer, 1)
    }
}

pub struct RealTime;

impl MessageFormat for RealTime {
    fn name(&self) -> &'static str {
        "real_time"
    }

    fn test(&self, buffer: &[u8]) -> bool {
        // 0xf9 and 0xfd are undefined
        let byte = buffer[0];
        byte == status::TIMING_CLOCK || (byte >= status::START && byte != 0xfd)
    }

    fn size(&self, _data: &MessageData) -> Result<usize> {
        Ok(1)
    }

    fn set(&self, data: &mut MessageData, property: Property, value: PropertyValue) -> Result<()> {
        match property {
            Property::Status => {
                data.bytes[0] = value.as_u8()?;
                Ok(())
            }
            _ => Err(invalid_property(self, property)),
        }
    }

    fn get(&self, data: &MessageData, property: Property) -> Result<PropertyValue> {
        match property {
            Property::Status => Ok(PropertyValue::U8(data.bytes[0])),
            _ => Err(invalid_property(self, property)),
        }
    }

    fn encode(&self, data: &MessageData, buffer: &mut [u8]) -> Result<usize> {
        encode_fixed(data, buffer, 1)
    }

    fn decode(&self, data: &mut MessageData, buffer: &[u8]) -> Result<()> {
        decode_fixed(data, buffer, 1)
    }
}
