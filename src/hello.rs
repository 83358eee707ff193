//! HELLO frame negotiation.
//!
//! A pure function over a decoded HAPROXY-HELLO frame: validates the
//! peer's max-frame-size, supported-versions and capabilities fields and
//! builds the matching AGENT-HELLO reply.

use crate::codec::{decode_kv, encode_kv, Value};
use crate::errors::ProtocolError;
use crate::frame::{
    Frame, FrameType, CAPABILITY_ASYNC, CAPABILITY_PIPELINING, FLAG_FIN, MAX_FRAME_SIZE,
    PROTOCOL_VERSION,
};
use bytes::BytesMut;
use std::collections::{HashMap, HashSet};

const KEY_MAX_FRAME_SIZE: &str = "max-frame-size";
const KEY_SUPPORTED_VERSIONS: &str = "supported-versions";
const KEY_VERSION: &str = "version";
const KEY_CAPABILITIES: &str = "capabilities";
const KEY_HEALTHCHECK: &str = "healthcheck";
const KEY_ENGINE_ID: &str = "engine-id";

/// Result of successfully negotiating a HELLO frame.
pub struct HelloOutcome {
    pub reply: Frame,
    pub engine_id: Option<String>,
    pub frame_size: u32,
    pub async_capable: bool,
    pub healthcheck: bool,
}

/// Decode every `(name, value)` pair from a flat KV-encoded buffer.
fn decode_kvs(mut buf: &[u8]) -> Result<HashMap<String, Value>, ProtocolError> {
    let mut out = HashMap::new();
    while !buf.is_empty() {
        let (name, value, n) = decode_kv(buf)?;
        out.insert(name, value);
        buf = &buf[n..];
    }
    Ok(out)
}

/// Parse a dot-separated version string such as `"2.0"` into its numeric
/// components. A malformed entry is a `BadVsn`, matching the upstream
/// behavior of treating any parse failure as an incompatible version.
fn parse_version(v: &str) -> Result<Vec<u32>, ProtocolError> {
    let v = v.trim();
    let mut parts = Vec::new();
    for segment in v.split('.') {
        if segment.is_empty() || !segment.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtocolError::BadVsn);
        }
        parts.push(segment.parse::<u32>().map_err(|_| ProtocolError::BadVsn)?);
    }
    if parts.is_empty() {
        return Err(ProtocolError::BadVsn);
    }
    Ok(parts)
}

fn parse_capabilities(s: &str) -> HashSet<String> {
    s.split(',').map(|s| s.to_string()).collect()
}

/// Negotiate a HAPROXY-HELLO frame, producing the AGENT-HELLO reply.
#[tracing::instrument(skip_all, fields(stream_id = frame.stream_id, frame_id = frame.frame_id))]
pub fn handle_hello(frame: &Frame) -> Result<HelloOutcome, ProtocolError> {
    let data = decode_kvs(&frame.data)?;

    let remote_frame_size = data
        .get(KEY_MAX_FRAME_SIZE)
        .and_then(Value::as_u64)
        .ok_or(ProtocolError::NoFrameSize)?;

    let conn_frame_size = remote_frame_size.min(MAX_FRAME_SIZE as u64) as u32;

    let remote_supported_versions = data
        .get(KEY_SUPPORTED_VERSIONS)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::NoVsn)?;

    let mut version_ok = false;
    for supported in remote_supported_versions.split(',') {
        let parsed = parse_version(supported)?;
        if parsed[0] == 2 {
            version_ok = true;
        }
    }
    if !version_ok {
        return Err(ProtocolError::BadVsn);
    }

    let healthcheck = data.get(KEY_HEALTHCHECK).and_then(Value::as_bool).unwrap_or(false);

    let remote_capabilities_str = data
        .get(KEY_CAPABILITIES)
        .and_then(Value::as_str)
        .ok_or(ProtocolError::NoCap)?;
    let remote_capabilities = parse_capabilities(remote_capabilities_str);

    if !remote_capabilities.contains(CAPABILITY_PIPELINING) && !healthcheck {
        return Err(ProtocolError::Invalid(
            "expected pipelining capability".to_string(),
        ));
    }

    let engine_id = data.get(KEY_ENGINE_ID).and_then(Value::as_str).map(str::to_string);
    if engine_id.as_deref().unwrap_or("").is_empty() && !healthcheck {
        return Err(ProtocolError::Invalid("engine-id not found".to_string()));
    }

    let async_capable = remote_capabilities.contains(CAPABILITY_ASYNC);

    let mut local_capabilities = vec![CAPABILITY_PIPELINING];
    if async_capable {
        local_capabilities.push(CAPABILITY_ASYNC);
    }

    let mut body = BytesMut::new();
    encode_kv(&mut body, KEY_VERSION, &Value::Str(PROTOCOL_VERSION.to_string()));
    encode_kv(&mut body, KEY_MAX_FRAME_SIZE, &Value::U32(conn_frame_size));
    encode_kv(
        &mut body,
        KEY_CAPABILITIES,
        &Value::Str(local_capabilities.join(",")),
    );

    let reply = Frame {
        ftype: FrameType::AgentHello,
        flags: FLAG_FIN,
        stream_id: frame.stream_id,
        frame_id: frame.frame_id,
        data: body.freeze(),
    };

    Ok(HelloOutcome {
        reply,
        engine_id,
        frame_size: conn_frame_size,
        async_capable,
        healthcheck,
    })
}
