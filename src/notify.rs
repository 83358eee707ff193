//! Lazy iteration over a NOTIFY frame's payload: a sequence of messages,
//! each carrying a name and a sequence of typed arguments.
//!
//! Mirrors the upstream iterator design exactly: advancing a
//! [`MessageIterator`] drains whatever arguments of the *current* message
//! were left unread before moving on, so callers who only care about a
//! message's name never have to manually skip its arguments.

use crate::codec::{decode_kv, decode_string, Value};
use crate::errors::ProtocolError;
use bytes::Bytes;

/// One `(name, value)` argument of a message.
#[derive(Debug, Clone, PartialEq)]
pub struct Arg {
    pub name: String,
    pub value: Value,
}

/// Iterates the arguments of a single message.
pub struct ArgIterator {
    buf: Bytes,
    remaining: usize,
}

impl ArgIterator {
    fn empty() -> Self {
        ArgIterator {
            buf: Bytes::new(),
            remaining: 0,
        }
    }

    /// Number of arguments not yet read.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Advance past every remaining argument, returning the unread tail of
    /// the buffer once exhausted (or the first decode error encountered).
    fn drain(&mut self) -> Result<Bytes, ProtocolError> {
        while self.remaining > 0 {
            self.next_arg()?;
        }
        Ok(self.buf.clone())
    }

    fn next_arg(&mut self) -> Result<Option<Arg>, ProtocolError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let (name, value, n) = decode_kv(&self.buf)?;
        self.buf = self.buf.slice(n..);
        self.remaining -= 1;
        Ok(Some(Arg { name, value }))
    }
}

impl Iterator for ArgIterator {
    type Item = Result<Arg, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_arg() {
            Ok(Some(arg)) => Some(Ok(arg)),
            Ok(None) => None,
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

/// A single decoded message: its name plus an iterator over its arguments.
pub struct Message {
    pub name: String,
    pub args: ArgIterator,
}

/// Iterates the messages of a NOTIFY frame payload.
pub struct MessageIterator {
    buf: Bytes,
    pending_args: Option<ArgIterator>,
}

impl MessageIterator {
    pub fn new(payload: Bytes) -> Self {
        MessageIterator {
            buf: payload,
            pending_args: None,
        }
    }

    fn advance(&mut self) -> Result<Option<Message>, ProtocolError> {
        if let Some(mut args) = self.pending_args.take() {
            self.buf = args.drain()?;
        }

        if self.buf.is_empty() {
            return Ok(None);
        }

        let (name, n) = decode_string(&self.buf)?;
        self.buf = self.buf.slice(n..);

        if self.buf.is_empty() {
            return Err(ProtocolError::Invalid(
                "truncated message: missing argument count".to_string(),
            ));
        }
        let arg_count = self.buf[0] as usize;
        self.buf = self.buf.slice(1..);

        let args = ArgIterator {
            buf: self.buf.clone(),
            remaining: arg_count,
        };
        self.pending_args = Some(ArgIterator {
            buf: args.buf.clone(),
            remaining: args.remaining,
        });

        Ok(Some(Message { name, args }))
    }
}

impl Iterator for MessageIterator {
    type Item = Result<Message, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(msg)) => Some(Ok(msg)),
            Ok(None) => None,
            Err(e) => {
                self.buf = Bytes::new();
                self.pending_args = None;
                Some(Err(e))
            }
        }
    }
}

impl Default for ArgIterator {
    fn default() -> Self {
        ArgIterator::empty()
    }
}
