//! Frame builders for tests. They are part of the regular code so that code driving an image
//!  from the outside (e.g. a sender simulation in an application's tests) can use them as well.

use bytes::BytesMut;
use crate::frame::{DataFlags, DataHeader, FrameType, DATA_HEADER_LENGTH};

/// A data frame of `frame_length` bytes, the payload filled with a recognizable pattern.
///  Lengths below the header length produce a bare header, i.e. a frame length of zero yields
///  a heartbeat.
pub fn data_frame(session_id: i32, stream_id: i32, term_id: i32, term_offset: i32, frame_length: i32, flags: DataFlags) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(frame_length.max(DATA_HEADER_LENGTH as i32) as usize);
    DataHeader {
        frame_length,
        flags,
        frame_type: FrameType::Data,
        term_offset,
        session_id,
        stream_id,
        term_id,
        reserved_value: 0,
    }.ser(&mut buf);
    buf.resize(frame_length.max(DATA_HEADER_LENGTH as i32) as usize, PAYLOAD_PATTERN);
    buf.to_vec()
}

pub const PAYLOAD_PATTERN: u8 = 0x5a;

pub fn heartbeat_frame(session_id: i32, stream_id: i32, term_id: i32, term_offset: i32, flags: DataFlags) -> Vec<u8> {
    data_frame(session_id, stream_id, term_id, term_offset, 0, flags)
}

/// A padding frame as it is sent: a bare header whose frame length covers the padded range
pub fn padding_frame(session_id: i32, stream_id: i32, term_id: i32, term_offset: i32, frame_length: i32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(DATA_HEADER_LENGTH);
    DataHeader {
        frame_length,
        flags: DataFlags::UNFRAGMENTED,
        frame_type: FrameType::Padding,
        term_offset,
        session_id,
        stream_id,
        term_id,
        reserved_value: 0,
    }.ser(&mut buf);
    buf.to_vec()
}
