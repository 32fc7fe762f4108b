//! Call and reply payload layout.
//!
//! A call travels as three frames: the slot index and the sequence number of
//! its [`CallId`] (two little-endian bytes each) and the call payload. A reply
//! echoes the two id frames followed by the reply payload.
//!
//! ```text
//! call payload  = CallHeader, { (index: u8, value: bytes) }   one record per non-null argument
//! reply payload = ReplyHeader, [ value ]                      value only for a non-null Ok reply
//! ```
//!
//! Headers and argument records are postcard-encoded. The values themselves
//! are opaque here; they were produced by the channel's [`Codec`](crate::Codec).

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tether_primitives::CallId;

use crate::error::ErrorCode;

/// Most arguments a method can take; one bit each in [`ArgsPresence`].
pub const MAX_ARGS: usize = 16;

/// Length of each call id frame.
pub const CALL_ID_FRAME_LEN: usize = 2;

/// Postcard `ReplyHeader { is_null: true, error_code: Internal, error_description: None }`,
/// sent when a reply header cannot be encoded.
pub const INTERNAL_ERROR_REPLY: &[u8] = &[1, ErrorCode::Internal as u8, 0];

/// Bit `i` is set iff argument `i` is non-null.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArgsPresence(u16);

impl ArgsPresence {
    pub fn from_bits(bits: u16) -> Self {
        ArgsPresence(bits)
    }

    pub fn bits(self) -> u16 {
        self.0
    }

    /// Presence bitmap of an argument list.
    pub fn of<T>(args: &[Option<T>]) -> Result<Self, WireError> {
        if args.len() > MAX_ARGS {
            return Err(WireError::TooManyArguments(args.len()));
        }
        let bits = args
            .iter()
            .enumerate()
            .filter(|(_, arg)| arg.is_some())
            .fold(0u16, |bits, (i, _)| bits | (1 << i));
        Ok(ArgsPresence(bits))
    }

    pub fn is_present(self, index: usize) -> bool {
        index < MAX_ARGS && self.0 & (1 << index) != 0
    }

    /// Number of non-null arguments.
    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Number of positions up to and including the last non-null argument.
    pub fn span(self) -> usize {
        MAX_ARGS - self.0.leading_zeros() as usize
    }

    /// Indices of the non-null arguments, ascending.
    pub fn present(self) -> impl Iterator<Item = usize> {
        (0..MAX_ARGS).filter(move |&i| self.is_present(i))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHeader {
    pub service: String,
    pub method: String,
    pub args_presence: ArgsPresence,
    pub secret: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyHeader {
    pub is_null: bool,
    pub error_code: ErrorCode,
    pub error_description: Option<String>,
}

impl ReplyHeader {
    pub fn ok(is_null: bool) -> Self {
        ReplyHeader {
            is_null,
            error_code: ErrorCode::Ok,
            error_description: None,
        }
    }

    pub fn error(code: ErrorCode, description: impl Into<String>) -> Self {
        ReplyHeader {
            is_null: true,
            error_code: code,
            error_description: Some(description.into()),
        }
    }

    /// Whether a value follows this header.
    pub fn carries_value(&self) -> bool {
        self.error_code.is_ok() && !self.is_null
    }
}

/// A call payload split into its header and positional arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCall {
    pub header: CallHeader,
    /// One entry per position up to the last non-null argument.
    pub args: Vec<Option<Vec<u8>>>,
}

#[derive(Debug)]
pub enum WireError {
    Encode(postcard::Error),
    Decode(postcard::Error),
    TooManyArguments(usize),
    ArgumentOutOfOrder { expected: usize, found: u8 },
    TrailingBytes(usize),
    BadCallIdFrame(usize),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireError::Encode(err) => write!(f, "failed to encode payload: {err}"),
            WireError::Decode(err) => write!(f, "failed to decode payload: {err}"),
            WireError::TooManyArguments(n) => {
                write!(f, "{n} arguments exceed the maximum of {MAX_ARGS}")
            }
            WireError::ArgumentOutOfOrder { expected, found } => {
                write!(f, "expected argument {expected}, found argument {found}")
            }
            WireError::TrailingBytes(n) => write!(f, "{n} unexpected bytes after payload"),
            WireError::BadCallIdFrame(len) => write!(
                f,
                "call id frame is {len} bytes, expected {CALL_ID_FRAME_LEN}"
            ),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WireError::Encode(err) | WireError::Decode(err) => Some(err),
            _ => None,
        }
    }
}

/// Encode a call payload. `args` holds already-encoded values.
pub fn encode_call(
    service: &str,
    method: &str,
    secret: Option<Vec<u8>>,
    args: &[Option<Vec<u8>>],
) -> Result<Vec<u8>, WireError> {
    let header = CallHeader {
        service: service.to_owned(),
        method: method.to_owned(),
        args_presence: ArgsPresence::of(args)?,
        secret,
    };

    let mut buf = postcard::to_allocvec(&header).map_err(WireError::Encode)?;
    for (index, arg) in args.iter().enumerate() {
        if let Some(value) = arg {
            let record = postcard::to_allocvec(&(index as u8, value.as_slice()))
                .map_err(WireError::Encode)?;
            buf.extend_from_slice(&record);
        }
    }
    Ok(buf)
}

pub fn decode_call(payload: &[u8]) -> Result<DecodedCall, WireError> {
    let (header, mut rest) =
        postcard::take_from_bytes::<CallHeader>(payload).map_err(WireError::Decode)?;

    let mut args = vec![None; header.args_presence.span()];
    for expected in header.args_presence.present() {
        let ((found, value), remaining) =
            postcard::take_from_bytes::<(u8, Vec<u8>)>(rest).map_err(WireError::Decode)?;
        if found as usize != expected {
            return Err(WireError::ArgumentOutOfOrder { expected, found });
        }
        args[expected] = Some(value);
        rest = remaining;
    }

    if !rest.is_empty() {
        return Err(WireError::TrailingBytes(rest.len()));
    }
    Ok(DecodedCall { header, args })
}

/// Encode a reply payload.
///
/// `value` is written only when the header says a value follows.
pub fn encode_reply(header: &ReplyHeader, value: Option<&[u8]>) -> Result<Vec<u8>, WireError> {
    let mut buf = postcard::to_allocvec(header).map_err(WireError::Encode)?;
    if header.carries_value() {
        buf.extend_from_slice(value.unwrap_or_default());
    }
    Ok(buf)
}

/// Decode a reply payload. The value, if any, is a slice of `payload`.
pub fn decode_reply(payload: &Bytes) -> Result<(ReplyHeader, Option<Bytes>), WireError> {
    let (header, rest) =
        postcard::take_from_bytes::<ReplyHeader>(payload).map_err(WireError::Decode)?;
    let offset = payload.len() - rest.len();

    if header.carries_value() {
        return Ok((header, Some(payload.slice(offset..))));
    }
    if !rest.is_empty() {
        return Err(WireError::TrailingBytes(rest.len()));
    }
    Ok((header, None))
}

pub fn encode_call_id(id: CallId) -> [Bytes; 2] {
    [
        Bytes::copy_from_slice(&id.index.to_le_bytes()),
        Bytes::copy_from_slice(&id.sequence.to_le_bytes()),
    ]
}

pub fn decode_call_id(index: &[u8], sequence: &[u8]) -> Result<CallId, WireError> {
    let index: [u8; CALL_ID_FRAME_LEN] = index
        .try_into()
        .map_err(|_| WireError::BadCallIdFrame(index.len()))?;
    let sequence: [u8; CALL_ID_FRAME_LEN] = sequence
        .try_into()
        .map_err(|_| WireError::BadCallIdFrame(sequence.len()))?;
    Ok(CallId::new(
        u16::from_le_bytes(index),
        u16::from_le_bytes(sequence),
    ))
}
