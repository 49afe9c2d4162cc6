//! Wire shapes of the frames the receive side consumes and emits.
//!
//! All numbers are little endian. Every frame starts with the common 8 byte frame header;
//!  frames in the log are aligned to [FRAME_ALIGNMENT] bytes.
//!
//! ```ascii
//! 0               1               2               3
//! |  frame length (i32)                                           |
//! |  version      |  flags        |  type (u16)                   |
//! |  ... type specific fields                                     |
//! ```

use std::fmt::{Debug, Formatter};
use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const FRAME_ALIGNMENT: i32 = 32;
pub const CURRENT_VERSION: u8 = 0;

pub const FRAME_HEADER_LENGTH: usize = 8;
pub const DATA_HEADER_LENGTH: usize = 32;
pub const STATUS_MESSAGE_LENGTH: usize = 36;
pub const NAK_LENGTH: usize = 28;
pub const RTTM_LENGTH: usize = 40;

pub const FRAME_LENGTH_OFFSET: usize = 0;
pub const FLAGS_OFFSET: usize = 5;
pub const TYPE_OFFSET: usize = 6;
pub const TERM_OFFSET_OFFSET: usize = 8;
pub const SESSION_ID_OFFSET: usize = 12;
pub const STREAM_ID_OFFSET: usize = 16;
pub const TERM_ID_OFFSET: usize = 20;

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u16)]
pub enum FrameType {
    Padding = 0,
    Data = 1,
    Nak = 2,
    StatusMessage = 3,
    Error = 4,
    Setup = 5,
    Rttm = 6,
}

bitflags! {
    #[derive(Debug, PartialEq, Eq, Copy, Clone)]
    pub struct DataFlags: u8 {
        const BEGIN = 0b1000_0000;
        const END   = 0b0100_0000;
        const EOS   = 0b0010_0000;

        const UNFRAGMENTED = Self::BEGIN.bits() | Self::END.bits();
        const END_OF_STREAM = Self::BEGIN.bits() | Self::END.bits() | Self::EOS.bits();
    }
}

/// flag of an RTT measurement frame that marks it as the reply to a request
pub const RTTM_REPLY_FLAG: u8 = 0b1000_0000;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FrameHeader {
    pub frame_length: i32,
    pub version: u8,
    pub flags: u8,
    pub frame_type: u16,
}

impl FrameHeader {
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FrameHeader> {
        Ok(FrameHeader {
            frame_length: buf.try_get_i32_le()?,
            version: buf.try_get_u8()?,
            flags: buf.try_get_u8()?,
            frame_type: buf.try_get_u16_le()?,
        })
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.frame_length);
        buf.put_u8(self.version);
        buf.put_u8(self.flags);
        buf.put_u16_le(self.frame_type);
    }

    /// `None` for frame types this side does not know
    pub fn known_type(&self) -> Option<FrameType> {
        FrameType::try_from(self.frame_type).ok()
    }
}

#[derive(Clone, Copy, Eq, PartialEq)]
pub struct DataHeader {
    pub frame_length: i32,
    pub flags: DataFlags,
    pub frame_type: FrameType,
    pub term_offset: i32,
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub reserved_value: i64,
}
impl Debug for DataHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DATA{{{:?}:{}/{}@{}:{}+{}}}", self.frame_type, self.session_id, self.stream_id, self.term_id, self.term_offset, self.frame_length)
    }
}

impl DataHeader {
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<DataHeader> {
        let frame_header = FrameHeader::deser(buf)?;
        let frame_type = match frame_header.known_type() {
            Some(t @ (FrameType::Data | FrameType::Padding)) => t,
            _ => bail!("frame type {} is not a data frame", frame_header.frame_type),
        };

        Ok(DataHeader {
            frame_length: frame_header.frame_length,
            flags: DataFlags::from_bits_retain(frame_header.flags),
            frame_type,
            term_offset: buf.try_get_i32_le()?,
            session_id: buf.try_get_i32_le()?,
            stream_id: buf.try_get_i32_le()?,
            term_id: buf.try_get_i32_le()?,
            reserved_value: buf.try_get_i64_le()?,
        })
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        FrameHeader {
            frame_length: self.frame_length,
            version: CURRENT_VERSION,
            flags: self.flags.bits(),
            frame_type: self.frame_type.into(),
        }.ser(buf);
        buf.put_i32_le(self.term_offset);
        buf.put_i32_le(self.session_id);
        buf.put_i32_le(self.stream_id);
        buf.put_i32_le(self.term_id);
        buf.put_i64_le(self.reserved_value);
    }
}

/// Round trip time measurement. The receiver sends a request carrying its own timestamp, and
///  the sender echoes that timestamp with the reply flag set, together with the time it
///  spent between receiving the request and sending the reply.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RttmHeader {
    pub flags: u8,
    pub session_id: i32,
    pub stream_id: i32,
    pub echo_timestamp_ns: i64,
    pub reception_delta_ns: i64,
    pub receiver_id: i64,
}

impl RttmHeader {
    pub fn is_reply(&self) -> bool {
        self.flags & RTTM_REPLY_FLAG != 0
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<RttmHeader> {
        let frame_header = FrameHeader::deser(buf)?;
        if frame_header.known_type() != Some(FrameType::Rttm) {
            bail!("frame type {} is not an RTT measurement", frame_header.frame_type);
        }
        if frame_header.frame_length != RTTM_LENGTH as i32 {
            bail!("RTT measurement with frame length {}", frame_header.frame_length);
        }

        Ok(RttmHeader {
            flags: frame_header.flags,
            session_id: buf.try_get_i32_le()?,
            stream_id: buf.try_get_i32_le()?,
            echo_timestamp_ns: buf.try_get_i64_le()?,
            reception_delta_ns: buf.try_get_i64_le()?,
            receiver_id: buf.try_get_i64_le()?,
        })
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        FrameHeader {
            frame_length: RTTM_LENGTH as i32,
            version: CURRENT_VERSION,
            flags: self.flags,
            frame_type: FrameType::Rttm.into(),
        }.ser(buf);
        buf.put_i32_le(self.session_id);
        buf.put_i32_le(self.stream_id);
        buf.put_i64_le(self.echo_timestamp_ns);
        buf.put_i64_le(self.reception_delta_ns);
        buf.put_i64_le(self.receiver_id);
    }
}

/// Advertises the receive window: the sender may send up to
///  `position(consumption_term_id, consumption_term_offset) + receiver_window`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct StatusMessage {
    pub flags: u8,
    pub session_id: i32,
    pub stream_id: i32,
    pub consumption_term_id: i32,
    pub consumption_term_offset: i32,
    pub receiver_window: i32,
    pub receiver_id: i64,
}

impl StatusMessage {
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<StatusMessage> {
        let frame_header = FrameHeader::deser(buf)?;
        if frame_header.known_type() != Some(FrameType::StatusMessage) {
            bail!("frame type {} is not a status message", frame_header.frame_type);
        }

        Ok(StatusMessage {
            flags: frame_header.flags,
            session_id: buf.try_get_i32_le()?,
            stream_id: buf.try_get_i32_le()?,
            consumption_term_id: buf.try_get_i32_le()?,
            consumption_term_offset: buf.try_get_i32_le()?,
            receiver_window: buf.try_get_i32_le()?,
            receiver_id: buf.try_get_i64_le()?,
        })
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        FrameHeader {
            frame_length: STATUS_MESSAGE_LENGTH as i32,
            version: CURRENT_VERSION,
            flags: self.flags,
            frame_type: FrameType::StatusMessage.into(),
        }.ser(buf);
        buf.put_i32_le(self.session_id);
        buf.put_i32_le(self.stream_id);
        buf.put_i32_le(self.consumption_term_id);
        buf.put_i32_le(self.consumption_term_offset);
        buf.put_i32_le(self.receiver_window);
        buf.put_i64_le(self.receiver_id);
    }
}

/// Requests a re-send of a range of a term
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Nak {
    pub session_id: i32,
    pub stream_id: i32,
    pub term_id: i32,
    pub term_offset: i32,
    pub length: i32,
}

impl Nak {
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Nak> {
        let frame_header = FrameHeader::deser(buf)?;
        if frame_header.known_type() != Some(FrameType::Nak) {
            bail!("frame type {} is not a NAK", frame_header.frame_type);
        }

        Ok(Nak {
            session_id: buf.try_get_i32_le()?,
            stream_id: buf.try_get_i32_le()?,
            term_id: buf.try_get_i32_le()?,
            term_offset: buf.try_get_i32_le()?,
            length: buf.try_get_i32_le()?,
        })
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        FrameHeader {
            frame_length: NAK_LENGTH as i32,
            version: CURRENT_VERSION,
            flags: 0,
            frame_type: FrameType::Nak.into(),
        }.ser(buf);
        buf.put_i32_le(self.session_id);
        buf.put_i32_le(self.stream_id);
        buf.put_i32_le(self.term_id);
        buf.put_i32_le(self.term_offset);
        buf.put_i32_le(self.length);
    }
}

/// frame length as written in the header, 0 if the buffer is too short to hold one
pub fn frame_length_of(buffer: &[u8]) -> i32 {
    match buffer.get(FRAME_LENGTH_OFFSET..FRAME_LENGTH_OFFSET + 4) {
        Some(bytes) => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        None => 0,
    }
}

pub fn frame_type_of(buffer: &[u8]) -> Option<u16> {
    buffer.get(TYPE_OFFSET..TYPE_OFFSET + 2)
        .map(|bytes| u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn flags_of(buffer: &[u8]) -> u8 {
    buffer.get(FLAGS_OFFSET).copied().unwrap_or(0)
}

/// A heartbeat is a bare data header with a frame length of zero. It claims no space in the
///  term but signals liveness and the sender's current position.
pub fn is_heartbeat(buffer: &[u8]) -> bool {
    buffer.len() == DATA_HEADER_LENGTH && frame_length_of(buffer) == 0
}

pub fn is_end_of_stream(buffer: &[u8]) -> bool {
    DataFlags::from_bits_retain(flags_of(buffer)).contains(DataFlags::END_OF_STREAM)
}

pub fn is_padding(buffer: &[u8]) -> bool {
    frame_type_of(buffer) == Some(FrameType::Padding.into())
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    pub fn data_frame(frame_length: i32, flags: DataFlags, term_id: i32, term_offset: i32) -> BytesMut {
        let mut buf = BytesMut::new();
        DataHeader {
            frame_length,
            flags,
            frame_type: FrameType::Data,
            term_offset,
            session_id: 1,
            stream_id: 2,
            term_id,
            reserved_value: 0,
        }.ser(&mut buf);
        buf
    }

    #[test]
    fn test_data_header_layout() {
        let buf = data_frame(64, DataFlags::UNFRAGMENTED, 7, 1024);
        assert_eq!(buf.len(), DATA_HEADER_LENGTH);
        assert_eq!(frame_length_of(&buf), 64);
        assert_eq!(flags_of(&buf), 0b1100_0000);
        assert_eq!(frame_type_of(&buf), Some(1));
        assert_eq!(&buf[TERM_OFFSET_OFFSET..TERM_OFFSET_OFFSET + 4], &1024i32.to_le_bytes());
        assert_eq!(&buf[TERM_ID_OFFSET..TERM_ID_OFFSET + 4], &7i32.to_le_bytes());

        let header = DataHeader::deser(&mut buf.freeze()).unwrap();
        assert_eq!(header.term_id, 7);
        assert_eq!(header.term_offset, 1024);
        assert_eq!(header.session_id, 1);
        assert_eq!(header.stream_id, 2);
    }

    #[rstest]
    #[case::heartbeat(data_frame(0, DataFlags::empty(), 0, 0).to_vec(), true)]
    #[case::data(data_frame(32, DataFlags::UNFRAGMENTED, 0, 0).to_vec(), false)]
    #[case::zero_length_with_payload({ let mut v = data_frame(0, DataFlags::empty(), 0, 0).to_vec(); v.extend_from_slice(&[0; 32]); v }, false)]
    #[case::short(vec![0; 8], false)]
    fn test_is_heartbeat(#[case] buffer: Vec<u8>, #[case] expected: bool) {
        assert_eq!(is_heartbeat(&buffer), expected);
    }

    #[rstest]
    #[case::all_flags(DataFlags::END_OF_STREAM, true)]
    #[case::eos_only(DataFlags::EOS, false)]
    #[case::unfragmented(DataFlags::UNFRAGMENTED, false)]
    #[case::begin_eos(DataFlags::BEGIN | DataFlags::EOS, false)]
    fn test_is_end_of_stream(#[case] flags: DataFlags, #[case] expected: bool) {
        assert_eq!(is_end_of_stream(&data_frame(0, flags, 0, 0)), expected);
    }

    #[test]
    fn test_deser_rejects_non_data() {
        let mut buf = BytesMut::new();
        Nak { session_id: 1, stream_id: 2, term_id: 3, term_offset: 4, length: 5 }.ser(&mut buf);
        assert!(DataHeader::deser(&mut buf.freeze()).is_err());
    }

    #[test]
    fn test_deser_truncated() {
        let buf = data_frame(32, DataFlags::UNFRAGMENTED, 0, 0);
        assert!(DataHeader::deser(&mut &buf[..20]).is_err());
    }

    #[test]
    fn test_control_frame_lengths() {
        let mut buf = BytesMut::new();
        StatusMessage {
            flags: 0,
            session_id: 1,
            stream_id: 2,
            consumption_term_id: 3,
            consumption_term_offset: 4,
            receiver_window: 5,
            receiver_id: 6,
        }.ser(&mut buf);
        assert_eq!(buf.len(), STATUS_MESSAGE_LENGTH);
        assert_eq!(frame_length_of(&buf), STATUS_MESSAGE_LENGTH as i32);

        let mut buf = BytesMut::new();
        Nak { session_id: 1, stream_id: 2, term_id: 3, term_offset: 4, length: 5 }.ser(&mut buf);
        assert_eq!(buf.len(), NAK_LENGTH);

        let mut buf = BytesMut::new();
        RttmHeader {
            flags: RTTM_REPLY_FLAG,
            session_id: 1,
            stream_id: 2,
            echo_timestamp_ns: 3,
            reception_delta_ns: 4,
            receiver_id: 5,
        }.ser(&mut buf);
        assert_eq!(buf.len(), RTTM_LENGTH);
        let rttm = RttmHeader::deser(&mut buf.freeze()).unwrap();
        assert!(rttm.is_reply());
        assert_eq!(rttm.echo_timestamp_ns, 3);
    }
}
