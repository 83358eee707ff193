//! DISCONNECT frame construction and parsing.
//!
//! Every connection ends with an agent-sent DISCONNECT carrying a
//! `status-code`/`message` pair, even on the clean-shutdown path (where the
//! code is [`StatusCode::None`]).

use crate::codec::{decode_kv, Value};
use crate::errors::{ProtocolError, StatusCode};
use crate::frame::{Frame, FrameType, FLAG_FIN};
use bytes::BytesMut;
use num_enum::TryFromPrimitive;

const KEY_STATUS_CODE: &str = "status-code";
const KEY_MESSAGE: &str = "message";

/// Build the AGENT-DISCONNECT frame for `code`.
pub fn build(code: StatusCode) -> Frame {
    let mut body = BytesMut::new();
    crate::codec::encode_kv(&mut body, KEY_STATUS_CODE, &Value::U64(code.into()));
    crate::codec::encode_kv(&mut body, KEY_MESSAGE, &Value::Str(code.message().to_string()));

    Frame {
        ftype: FrameType::AgentDiscon,
        flags: FLAG_FIN,
        stream_id: 0,
        frame_id: 0,
        data: body.freeze(),
    }
}

/// Parse a HAPROXY-DISCONNECT frame's payload, returning `Ok(())` for a
/// normal shutdown ([`StatusCode::None`]) or a peer-side timeout
/// ([`StatusCode::Timeout`]) — both are ordinary closures, not errors — and
/// `Err` with the peer's message for any other status code.
pub fn handle(frame: &Frame) -> Result<(), ProtocolError> {
    let mut buf = &frame.data[..];
    let mut code: Option<u64> = None;
    let mut message: Option<String> = None;

    while !buf.is_empty() {
        let (name, value, n) = decode_kv(buf)?;
        match name.as_str() {
            KEY_STATUS_CODE => code = value.as_u64(),
            KEY_MESSAGE => message = value.as_str().map(str::to_string),
            _ => {}
        }
        buf = &buf[n..];
    }

    match code.and_then(|c| StatusCode::try_from_primitive(c).ok()) {
        Some(StatusCode::None) | Some(StatusCode::Timeout) => Ok(()),
        _ => Err(ProtocolError::Invalid(
            message.unwrap_or_else(|| "unknown error".to_string()),
        )),
    }
}
