//! Wire-stable status code taxonomy and the top-level protocol error type.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// The status codes exchanged in a DISCONNECT frame's `status-code` field.
///
/// Numeric values are part of the wire contract and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u64)]
pub enum StatusCode {
    None = 0,
    Io = 1,
    Timeout = 2,
    TooBig = 3,
    Invalid = 4,
    NoVsn = 5,
    NoFrameSize = 6,
    NoCap = 7,
    BadVsn = 8,
    BadFrameSize = 9,
    FragNotSupported = 10,
    InterlacedFrames = 11,
    FrameIdNotFound = 12,
    Res = 13,
    Unknown = 99,
}

impl StatusCode {
    /// Human-readable message matching the wire protocol's canonical text.
    pub fn message(&self) -> &'static str {
        match self {
            StatusCode::None => "normal",
            StatusCode::Io => "I/O error",
            StatusCode::Timeout => "a timeout occurred",
            StatusCode::TooBig => "frame is too big",
            StatusCode::Invalid => "invalid frame received",
            StatusCode::NoVsn => "version value not found",
            StatusCode::NoFrameSize => "max-frame-size value not found",
            StatusCode::NoCap => "capabilities value not found",
            StatusCode::BadVsn => "unsupported version",
            StatusCode::BadFrameSize => "max-frame-size too big or too small",
            StatusCode::FragNotSupported => "fragmentation not supported",
            StatusCode::InterlacedFrames => "invalid interlaced frames",
            StatusCode::FrameIdNotFound => "frame-id not found",
            StatusCode::Res => "resource allocation error",
            StatusCode::Unknown => "an unknown error occurred",
        }
    }
}

/// Errors that terminate a connection or a single NOTIFY exchange.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("frame exceeds negotiated max-frame-size")]
    TooBig,

    #[error("invalid frame: {0}")]
    Invalid(String),

    #[error("version value not found")]
    NoVsn,

    #[error("max-frame-size value not found")]
    NoFrameSize,

    #[error("capabilities value not found")]
    NoCap,

    #[error("unsupported version")]
    BadVsn,

    #[error("max-frame-size too big or too small")]
    BadFrameSize,

    #[error("fragmentation not supported")]
    FragNotSupported,

    #[error("invalid interlaced frames")]
    InterlacedFrames,

    #[error("frame-id not found")]
    FrameIdNotFound,

    #[error("resource allocation error")]
    Res,

    #[error("codec error: {0}")]
    Codec(#[from] crate::codec::CodecError),
}

impl ProtocolError {
    /// The wire status code this error maps to, for embedding in a
    /// DISCONNECT frame.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProtocolError::Io(_) => StatusCode::Io,
            ProtocolError::Timeout => StatusCode::Timeout,
            ProtocolError::TooBig => StatusCode::TooBig,
            ProtocolError::Invalid(_) => StatusCode::Invalid,
            ProtocolError::NoVsn => StatusCode::NoVsn,
            ProtocolError::NoFrameSize => StatusCode::NoFrameSize,
            ProtocolError::NoCap => StatusCode::NoCap,
            ProtocolError::BadVsn => StatusCode::BadVsn,
            ProtocolError::BadFrameSize => StatusCode::BadFrameSize,
            ProtocolError::FragNotSupported => StatusCode::FragNotSupported,
            ProtocolError::InterlacedFrames => StatusCode::InterlacedFrames,
            ProtocolError::FrameIdNotFound => StatusCode::FrameIdNotFound,
            ProtocolError::Res => StatusCode::Res,
            ProtocolError::Codec(_) => StatusCode::Invalid,
        }
    }
}

/// Errors a handler may return from processing a NOTIFY; these never tear
/// down the connection, only the single exchange they occurred in.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),
}
