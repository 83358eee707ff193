//! SPOP frame envelope: the length-prefixed binary unit every HELLO,
//! DISCONNECT, NOTIFY and ACK payload travels in.
//!
//! Parsing is split into two phases, mirroring how a stream codec checks
//! for a complete frame before committing to decode it: [`check`] reports
//! whether a full frame is buffered without touching its contents, and
//! [`parse`] decodes it once it is.

use crate::codec::{decode_u32, decode_varint, encode_u32, encode_varint};
use crate::errors::ProtocolError;
use crate::pool;
use bytes::{Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Protocol version this agent negotiates.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Maximum size of a frame's payload, after the 4-byte length prefix.
pub const MAX_FRAME_SIZE: u32 = 16_380;

pub const CAPABILITY_PIPELINING: &str = "pipelining";
pub const CAPABILITY_ASYNC: &str = "async";

pub const FLAG_FIN: u32 = 1;
pub const FLAG_ABRT: u32 = 2;

/// Frame type tag, occupying the first byte of a frame's body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameType {
    HaproxyHello = 1,
    HaproxyDiscon = 2,
    HaproxyNotify = 3,
    AgentHello = 101,
    AgentDiscon = 102,
    AgentAck = 103,
}

/// A single decoded SPOP frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub ftype: FrameType,
    pub flags: u32,
    pub stream_id: u64,
    pub frame_id: u64,
    pub data: Bytes,
}

impl Frame {
    pub fn is_fin(&self) -> bool {
        self.flags & FLAG_FIN != 0
    }

    pub fn is_abort(&self) -> bool {
        self.flags & FLAG_ABRT != 0
    }
}

/// Reports whether `buf` contains at least one complete length-prefixed
/// frame, returning the total byte length (prefix + body) if so.
pub fn check(buf: &[u8]) -> Option<usize> {
    if buf.len() < 4 {
        return None;
    }
    let (len, _) = decode_u32(&buf[..4]).ok()?;
    let total = 4 + len as usize;
    if buf.len() < total {
        return None;
    }
    Some(total)
}

/// Decode one complete length-prefixed frame from the front of `buf`.
///
/// Returns the parsed frame and the number of bytes consumed. Callers
/// must have already confirmed completeness with [`check`].
pub fn parse(buf: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    let (len, _) = decode_u32(&buf[..4])?;
    let len = len as usize;

    if len as u32 > MAX_FRAME_SIZE {
        return Err(ProtocolError::TooBig);
    }

    let body = &buf[4..4 + len];
    if body.is_empty() {
        return Err(ProtocolError::Invalid("empty frame".to_string()));
    }

    let ftype = FrameType::try_from_primitive(body[0])
        .map_err(|_| ProtocolError::Invalid(format!("unknown frame type {:#x}", body[0])))?;
    let mut off = 1;

    let (flags, n) = decode_u32(&body[off..])?;
    off += n;

    let (stream_id, n) = decode_varint(&body[off..])?;
    off += n;

    let (frame_id, n) = decode_varint(&body[off..])?;
    off += n;

    // Decoded straight into a pooled buffer rather than a fresh allocation
    // per frame; the caller recycles it once the frame's payload is done
    // with (handler return for a NOTIFY, socket flush for an ACK).
    let mut payload = pool::get();
    payload.extend_from_slice(&body[off..]);
    let data = payload.freeze();

    Ok((
        Frame {
            ftype,
            flags,
            stream_id,
            frame_id,
            data,
        },
        4 + len,
    ))
}

/// Encode a frame, including its 4-byte length prefix, into `out`.
pub fn encode(out: &mut BytesMut, frame: &Frame) -> Result<(), ProtocolError> {
    let mut body = BytesMut::new();
    body.extend_from_slice(&[frame.ftype.into()]);
    encode_u32(&mut body, frame.flags);
    encode_varint(&mut body, frame.stream_id);
    encode_varint(&mut body, frame.frame_id);
    body.extend_from_slice(&frame.data);

    if body.len() as u32 > MAX_FRAME_SIZE {
        return Err(ProtocolError::TooBig);
    }

    encode_u32(out, body.len() as u32);
    out.extend_from_slice(&body);
    Ok(())
}
