//! Length-prefixed codec for the robot link
//!
//! All messages are framed as:
//! ```text
//! [ 4 bytes: length (u32, big-endian) ][ 1 byte: channel ][ payload ]
//! ```
//!
//! Payloads are fixed-width little-endian records:
//! ```text
//! request   (0x8B): origin u32 | timing u32 | phase u8 | action u8 | seq u8
//! response  (0x8C): timestamp u32 | vote u8 | seq u8 | reserved u16
//! direct    (0x8D): action u8
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::protocol::{Action, SyncPhase, SyncRequest, SyncResponse, SyncVote};

/// Maximum frame body size (channel byte + payload)
pub const MAX_MESSAGE_SIZE: u32 = 64;

pub const CHANNEL_REQUEST: u8 = 0x8B;
pub const CHANNEL_RESPONSE: u8 = 0x8C;
pub const CHANNEL_DIRECT: u8 = 0x8D;

pub const REQUEST_LEN: usize = 11;
pub const RESPONSE_LEN: usize = 8;
pub const DIRECT_LEN: usize = 1;

/// Errors that can occur during encoding/decoding
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid message length prefix: {0}")]
    InvalidLength(u32),

    #[error("Unknown channel 0x{0:02X}")]
    UnknownChannel(u8),

    #[error("Bad payload on channel 0x{channel:02X}: expected {expected} bytes, got {actual}")]
    BadPayload {
        channel: u8,
        expected: usize,
        actual: usize,
    },

    #[error("Unknown action code {0}")]
    UnknownAction(u8),
}

/// A message on the link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// Leader -> robot handshake write
    Request(SyncRequest),
    /// Robot -> leader handshake answer
    Response(SyncResponse),
    /// Leader -> robot unsynchronized command
    Direct(Action),
}

impl Frame {
    fn channel(&self) -> u8 {
        match self {
            Frame::Request(_) => CHANNEL_REQUEST,
            Frame::Response(_) => CHANNEL_RESPONSE,
            Frame::Direct(_) => CHANNEL_DIRECT,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Frame::Request(_) => REQUEST_LEN,
            Frame::Response(_) => RESPONSE_LEN,
            Frame::Direct(_) => DIRECT_LEN,
        }
    }
}

/// Encode a frame into a length-prefixed byte buffer
pub fn encode(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + 1 + frame.payload_len());
    encode_into(frame, &mut buf);
    buf.freeze()
}

/// Encode a frame directly into a provided buffer
pub fn encode_into(frame: &Frame, buf: &mut BytesMut) {
    let body_len = 1 + frame.payload_len();
    buf.reserve(4 + body_len);

    // Length prefix (big-endian u32)
    buf.put_u32(body_len as u32);
    buf.put_u8(frame.channel());

    match frame {
        Frame::Request(req) => {
            buf.put_u32_le(req.origin_timestamp);
            buf.put_u32_le(req.phase.timing_bits());
            buf.put_u8(req.phase.code());
            buf.put_u8(req.action_id);
            buf.put_u8(req.sequence);
        }
        Frame::Response(resp) => {
            buf.put_u32_le(resp.peripheral_timestamp);
            buf.put_u8(resp.vote.code());
            buf.put_u8(resp.sequence);
            buf.put_u16_le(0);
        }
        Frame::Direct(action) => buf.put_u8(action.code()),
    }
}

/// Try to decode a length-prefixed frame from a buffer
///
/// Returns:
/// - `Ok(Some(frame))` if a complete frame was decoded
/// - `Ok(None)` if more data is needed
/// - `Err(...)` if the data is invalid (the bad frame is consumed)
pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
    // Need at least 4 bytes for the length prefix
    if buf.len() < 4 {
        return Ok(None);
    }

    // Peek at the length prefix without consuming
    let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if body_len == 0 || body_len > MAX_MESSAGE_SIZE {
        return Err(CodecError::InvalidLength(body_len));
    }

    let total_len = 4 + body_len as usize;
    if buf.len() < total_len {
        return Ok(None);
    }

    buf.advance(4);
    let mut body = buf.split_to(body_len as usize);
    let channel = body.get_u8();

    let expected = match channel {
        CHANNEL_REQUEST => REQUEST_LEN,
        CHANNEL_RESPONSE => RESPONSE_LEN,
        CHANNEL_DIRECT => DIRECT_LEN,
        other => return Err(CodecError::UnknownChannel(other)),
    };
    if body.len() != expected {
        return Err(CodecError::BadPayload {
            channel,
            expected,
            actual: body.len(),
        });
    }

    let frame = match channel {
        CHANNEL_REQUEST => {
            let origin_timestamp = body.get_u32_le();
            let timing = body.get_u32_le();
            let phase = body.get_u8();
            let action_id = body.get_u8();
            let sequence = body.get_u8();
            Frame::Request(SyncRequest {
                origin_timestamp,
                phase: SyncPhase::from_wire(phase, timing),
                action_id,
                sequence,
            })
        }
        CHANNEL_RESPONSE => {
            let peripheral_timestamp = body.get_u32_le();
            let vote = SyncVote::from_code(body.get_u8());
            let sequence = body.get_u8();
            Frame::Response(SyncResponse {
                peripheral_timestamp,
                vote,
                sequence,
            })
        }
        _ => {
            let code = body.get_u8();
            Frame::Direct(Action::from_code(code).ok_or(CodecError::UnknownAction(code))?)
        }
    };

    Ok(Some(frame))
}

/// Decoder state machine for streaming decoding
#[derive(Debug, Default)]
pub struct FrameDecoder {
    /// Partial frame data being accumulated
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(256),
        }
    }

    /// Add data to the decoder buffer
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to decode the next frame from the buffer
    ///
    /// Call this repeatedly until it returns `Ok(None)` to drain all complete frames
    pub fn decode_next(&mut self) -> Result<Option<Frame>, CodecError> {
        decode(&mut self.buffer)
    }

    /// Get the current buffer length (for debugging)
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}
