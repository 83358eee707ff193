//! Primitive wire codec: varints, length-prefixed bytes/strings, IPv4/IPv6,
//! and the typed key/value encoding used throughout SPOP payloads.
//!
//! Every decode function takes a byte slice and returns `(value,
//! bytes_consumed)`; every encode function appends to a growable
//! `BytesMut`. Higher layers (`frame`, `hello`, `notify`, `actions`) bound
//! the slices they hand here by the negotiated frame size, so there is no
//! separate "too big" error at this layer — only "not enough bytes yet".

use bytes::{BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// Errors raised while decoding or encoding a primitive value.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer too short: need {need} bytes, have {have}")]
    Incomplete { need: usize, have: usize },

    #[error("unterminated varint sequence")]
    UnterminatedVarint,

    #[error("unknown data type tag {0:#x}")]
    UnknownDataType(u8),

    #[error("invalid UTF-8 in string field")]
    InvalidUtf8,
}

/// Maximum number of bytes a varint may occupy before it is considered
/// malformed (enough to cover a full 64-bit value).
const MAX_VARINT_LEN: usize = 10;

/// Decode the protocol's variable-length unsigned integer encoding.
///
/// Values below 240 are a single byte. Otherwise the first byte is
/// `value | 240`, the value is reduced by 240 and shifted right by 4, and
/// subsequent bytes carry 7 bits each with continuation bit `0x80` until a
/// byte with the high bit clear is read.
pub fn decode_varint(buf: &[u8]) -> Result<(u64, usize), CodecError> {
    if buf.is_empty() {
        return Err(CodecError::Incomplete { need: 1, have: 0 });
    }

    let val = buf[0] as u64;
    if val < 240 {
        return Ok((val, 1));
    }

    let mut val = val;
    let mut off = 1usize;
    let mut shift: u32 = 4;
    loop {
        if off >= MAX_VARINT_LEN {
            return Err(CodecError::UnterminatedVarint);
        }
        if off >= buf.len() {
            return Err(CodecError::Incomplete {
                need: off + 1,
                have: buf.len(),
            });
        }

        let b = buf[off] as u64;
        val += b << shift;
        off += 1;
        shift += 7;

        if b < 128 {
            break;
        }
    }

    Ok((val, off))
}

/// Encode `value` using the protocol's varint scheme, appending to `buf`.
pub fn encode_varint(buf: &mut BytesMut, value: u64) {
    if value < 240 {
        buf.put_u8(value as u8);
        return;
    }

    let mut v = value;
    buf.put_u8((v as u8) | 240);
    v = (v - 240) >> 4;

    while v >= 128 {
        buf.put_u8((v as u8) | 128);
        v = (v - 128) >> 7;
    }
    buf.put_u8(v as u8);
}

/// Decode a big-endian u32.
pub fn decode_u32(buf: &[u8]) -> Result<(u32, usize), CodecError> {
    if buf.len() < 4 {
        return Err(CodecError::Incomplete {
            need: 4,
            have: buf.len(),
        });
    }
    Ok((u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]), 4))
}

/// Encode a big-endian u32.
pub fn encode_u32(buf: &mut BytesMut, value: u32) {
    buf.put_u32(value);
}

/// Decode a varint-length-prefixed byte string.
pub fn decode_bytes(buf: &[u8]) -> Result<(Bytes, usize), CodecError> {
    let (len, off) = decode_varint(buf)?;
    let len = len as usize;
    if buf.len() < off + len {
        return Err(CodecError::Incomplete {
            need: off + len,
            have: buf.len(),
        });
    }
    Ok((Bytes::copy_from_slice(&buf[off..off + len]), off + len))
}

/// Encode a byte string as a varint length prefix followed by the raw bytes.
pub fn encode_bytes(buf: &mut BytesMut, value: &[u8]) {
    encode_varint(buf, value.len() as u64);
    buf.put_slice(value);
}

/// Decode a varint-length-prefixed UTF-8 string.
pub fn decode_string(buf: &[u8]) -> Result<(String, usize), CodecError> {
    let (bytes, n) = decode_bytes(buf)?;
    let s = String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)?;
    Ok((s, n))
}

/// Encode a UTF-8 string the same way as a byte string.
pub fn encode_string(buf: &mut BytesMut, value: &str) {
    encode_bytes(buf, value.as_bytes());
}

/// Decode 4 raw bytes as an IPv4 address.
pub fn decode_ipv4(buf: &[u8]) -> Result<(Ipv4Addr, usize), CodecError> {
    if buf.len() < 4 {
        return Err(CodecError::Incomplete {
            need: 4,
            have: buf.len(),
        });
    }
    Ok((Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]), 4))
}

/// Encode an IPv4 address as 4 raw bytes.
pub fn encode_ipv4(buf: &mut BytesMut, addr: Ipv4Addr) {
    buf.put_slice(&addr.octets());
}

/// Decode 16 raw bytes as an IPv6 address.
pub fn decode_ipv6(buf: &[u8]) -> Result<(Ipv6Addr, usize), CodecError> {
    if buf.len() < 16 {
        return Err(CodecError::Incomplete {
            need: 16,
            have: buf.len(),
        });
    }
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&buf[..16]);
    Ok((Ipv6Addr::from(octets), 16))
}

/// Encode an IPv6 address as 16 raw bytes.
pub fn encode_ipv6(buf: &mut BytesMut, addr: Ipv6Addr) {
    buf.put_slice(&addr.octets());
}

const TYPE_NULL: u8 = 0;
const TYPE_BOOL: u8 = 1;
const TYPE_INT32: u8 = 2;
const TYPE_UINT32: u8 = 3;
const TYPE_INT64: u8 = 4;
const TYPE_UINT64: u8 = 5;
const TYPE_IPV4: u8 = 6;
const TYPE_IPV6: u8 = 7;
const TYPE_STRING: u8 = 8;
const TYPE_BINARY: u8 = 9;

const TYPE_MASK: u8 = 0x0F;
const FLAG_TRUE: u8 = 0x10;

/// A dynamically-typed SPOP value.
///
/// `I32`/`I64` both surface as a signed integer on decode and `U32`/`U64`
/// both surface as an unsigned integer; the tag distinction only matters
/// for the caller choosing how to encode a value back onto the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    Str(String),
    Bin(Bytes),
}

impl Value {
    /// Best-effort coercion to `u64`, used when decoding fields whose wire
    /// type is inconsistent across peer revisions (e.g. `status-code`).
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U32(v) => Some(*v as u64),
            Value::U64(v) => Some(*v),
            Value::I32(v) if *v >= 0 => Some(*v as u64),
            Value::I64(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// Decode a single typed value (the part after the name string of a K/V pair).
pub fn decode_value(buf: &[u8]) -> Result<(Value, usize), CodecError> {
    if buf.is_empty() {
        return Err(CodecError::Incomplete { need: 1, have: 0 });
    }

    let tag_byte = buf[0];
    let dtype = tag_byte & TYPE_MASK;
    let mut off = 1;

    let value = match dtype {
        TYPE_NULL => Value::Null,
        TYPE_BOOL => Value::Bool(tag_byte & FLAG_TRUE != 0),
        TYPE_INT32 => {
            let (v, n) = decode_varint(&buf[off..])?;
            off += n;
            Value::I32(v as i32)
        }
        TYPE_UINT32 => {
            let (v, n) = decode_varint(&buf[off..])?;
            off += n;
            Value::U32(v as u32)
        }
        TYPE_INT64 => {
            let (v, n) = decode_varint(&buf[off..])?;
            off += n;
            Value::I64(v as i64)
        }
        TYPE_UINT64 => {
            let (v, n) = decode_varint(&buf[off..])?;
            off += n;
            Value::U64(v)
        }
        TYPE_IPV4 => {
            let (v, n) = decode_ipv4(&buf[off..])?;
            off += n;
            Value::Ipv4(v)
        }
        TYPE_IPV6 => {
            let (v, n) = decode_ipv6(&buf[off..])?;
            off += n;
            Value::Ipv6(v)
        }
        TYPE_STRING => {
            let (v, n) = decode_string(&buf[off..])?;
            off += n;
            Value::Str(v)
        }
        TYPE_BINARY => {
            let (v, n) = decode_bytes(&buf[off..])?;
            off += n;
            Value::Bin(v)
        }
        other => return Err(CodecError::UnknownDataType(other)),
    };

    Ok((value, off))
}

/// Encode a typed value, appending to `buf`.
pub fn encode_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Null => buf.put_u8(TYPE_NULL),
        Value::Bool(b) => {
            let tag = TYPE_BOOL | if *b { FLAG_TRUE } else { 0 };
            buf.put_u8(tag);
        }
        Value::I32(v) => {
            buf.put_u8(TYPE_INT32);
            encode_varint(buf, *v as u64);
        }
        Value::U32(v) => {
            buf.put_u8(TYPE_UINT32);
            encode_varint(buf, *v as u64);
        }
        Value::I64(v) => {
            buf.put_u8(TYPE_INT64);
            encode_varint(buf, *v as u64);
        }
        Value::U64(v) => {
            buf.put_u8(TYPE_UINT64);
            encode_varint(buf, *v);
        }
        Value::Ipv4(addr) => {
            buf.put_u8(TYPE_IPV4);
            encode_ipv4(buf, *addr);
        }
        Value::Ipv6(addr) => {
            buf.put_u8(TYPE_IPV6);
            encode_ipv6(buf, *addr);
        }
        Value::Str(s) => {
            buf.put_u8(TYPE_STRING);
            encode_string(buf, s);
        }
        Value::Bin(b) => {
            buf.put_u8(TYPE_BINARY);
            encode_bytes(buf, b);
        }
    }
}

/// Decode a single `(name, value)` pair.
pub fn decode_kv(buf: &[u8]) -> Result<(String, Value, usize), CodecError> {
    let (name, n1) = decode_string(buf)?;
    let (value, n2) = decode_value(&buf[n1..])?;
    Ok((name, value, n1 + n2))
}

/// Encode a `(name, value)` pair, appending to `buf`.
pub fn encode_kv(buf: &mut BytesMut, name: &str, value: &Value) {
    encode_string(buf, name);
    encode_value(buf, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_single_byte_boundary() {
        for n in [0u64, 1, 100, 239] {
            let mut buf = BytesMut::new();
            encode_varint(&mut buf, n);
            assert_eq!(buf.len(), 1, "value {n} should encode to 1 byte");
            let (decoded, consumed) = decode_varint(&buf).unwrap();
            assert_eq!(decoded, n);
            assert_eq!(consumed, 1);
        }
    }

    #[test]
    fn varint_round_trip_boundaries() {
        for n in [0u64, 239, 240, 241, u32::MAX as u64, u64::MAX >> 1, u64::MAX] {
            let mut buf = BytesMut::new();
            encode_varint(&mut buf, n);
            let (decoded, consumed) = decode_varint(&buf).unwrap();
            assert_eq!(decoded, n, "round-trip failed for {n}");
            assert_eq!(consumed, buf.len(), "varint encoding for {n} not canonical length");
        }
    }

    #[test]
    fn varint_is_canonical_shortest_form() {
        let mut buf = BytesMut::new();
        encode_varint(&mut buf, 240);
        assert_eq!(buf.len(), 2);

        let mut buf = BytesMut::new();
        encode_varint(&mut buf, 239);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn varint_incomplete_buffer() {
        let err = decode_varint(&[]).unwrap_err();
        assert_eq!(err, CodecError::Incomplete { need: 1, have: 0 });

        let err = decode_varint(&[250]).unwrap_err();
        assert!(matches!(err, CodecError::Incomplete { .. }));
    }

    #[test]
    fn string_round_trip() {
        let mut buf = BytesMut::new();
        encode_string(&mut buf, "hello spop");
        let (s, n) = decode_string(&buf).unwrap();
        assert_eq!(s, "hello spop");
        assert_eq!(n, buf.len());
    }

    #[test]
    fn ipv4_round_trip() {
        let addr = Ipv4Addr::new(192, 0, 2, 1);
        let mut buf = BytesMut::new();
        encode_ipv4(&mut buf, addr);
        let (decoded, n) = decode_ipv4(&buf).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(n, 4);
    }

    #[test]
    fn ipv6_round_trip() {
        let addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        let mut buf = BytesMut::new();
        encode_ipv6(&mut buf, addr);
        let (decoded, n) = decode_ipv6(&buf).unwrap();
        assert_eq!(decoded, addr);
        assert_eq!(n, 16);
    }

    #[test]
    fn typed_kv_round_trip_every_type() {
        let cases = vec![
            Value::Null,
            Value::Bool(true),
            Value::Bool(false),
            Value::I32(-42),
            Value::U32(42),
            Value::I64(-1_000_000_000_000),
            Value::U64(1_000_000_000_000),
            Value::Ipv4(Ipv4Addr::new(10, 0, 0, 1)),
            Value::Ipv6(Ipv6Addr::LOCALHOST),
            Value::Str("spoe_ok".to_string()),
            Value::Bin(Bytes::from_static(b"\x01\x02\x03")),
        ];

        for value in cases {
            let mut buf = BytesMut::new();
            encode_kv(&mut buf, "k", &value);
            let (name, decoded, n) = decode_kv(&buf).unwrap();
            assert_eq!(name, "k");
            assert_eq!(decoded, value);
            assert_eq!(n, buf.len());
        }
    }

    #[test]
    fn unknown_data_type_rejected() {
        let mut buf = BytesMut::new();
        encode_string(&mut buf, "k");
        buf.put_u8(0x0F);
        let err = decode_kv(&buf).unwrap_err();
        assert_eq!(err, CodecError::UnknownDataType(0x0F));
    }

    #[test]
    fn as_u64_coerces_signed_and_unsigned() {
        assert_eq!(Value::U32(7).as_u64(), Some(7));
        assert_eq!(Value::U64(7).as_u64(), Some(7));
        assert_eq!(Value::I32(7).as_u64(), Some(7));
        assert_eq!(Value::I64(7).as_u64(), Some(7));
        assert_eq!(Value::I32(-1).as_u64(), None);
        assert_eq!(Value::Str("x".into()).as_u64(), None);
    }
}
