use std::fmt;

use serde::{Deserialize, Serialize};
use tether_primitives::{AccessTimeout, ArenaError, QueueError};

use crate::transport::TransportError;

/// Boxed error returned by service method implementations.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Status code carried by every reply.
///
/// The numeric values are part of the wire format.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum ErrorCode {
    Unknown = 0,
    Ok = 1,
    Cancelled = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    Unauthenticated = 8,
    Aborted = 9,
    OutOfRange = 10,
    Unimplemented = 11,
    Internal = 12,
    Unavailable = 13,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 14] = [
        ErrorCode::Unknown,
        ErrorCode::Ok,
        ErrorCode::Cancelled,
        ErrorCode::InvalidArgument,
        ErrorCode::DeadlineExceeded,
        ErrorCode::NotFound,
        ErrorCode::AlreadyExists,
        ErrorCode::PermissionDenied,
        ErrorCode::Unauthenticated,
        ErrorCode::Aborted,
        ErrorCode::OutOfRange,
        ErrorCode::Unimplemented,
        ErrorCode::Internal,
        ErrorCode::Unavailable,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_ok(self) -> bool {
        self == ErrorCode::Ok
    }

    /// What the code means, used when a reply carries no description.
    pub fn description(self) -> &'static str {
        match self {
            ErrorCode::Unknown => {
                "Unknown error. The remote handler raised an error the framework does not recognize."
            }
            ErrorCode::Ok => "Not an error; returned on success.",
            ErrorCode::Cancelled => "The operation was cancelled, typically by the caller.",
            ErrorCode::InvalidArgument => {
                "The client specified an invalid argument or called a method with the wrong shape."
            }
            ErrorCode::DeadlineExceeded => "The deadline expired before the operation could complete.",
            ErrorCode::NotFound => "Some requested entity (service or method) was not found.",
            ErrorCode::AlreadyExists => "The entity that a client attempted to create already exists.",
            ErrorCode::PermissionDenied => {
                "The caller does not have permission to execute the specified operation."
            }
            ErrorCode::Unauthenticated => {
                "The request does not have valid authentication credentials for the operation."
            }
            ErrorCode::Aborted => "The operation was aborted, typically because an endpoint shut down.",
            ErrorCode::OutOfRange => "The operation was attempted past the valid range.",
            ErrorCode::Unimplemented => {
                "The operation is not implemented or not supported, including values that cannot be serialized."
            }
            ErrorCode::Internal => "Internal error. An invariant of the framework has been broken.",
            ErrorCode::Unavailable => "The endpoint is currently unavailable.",
        }
    }
}

impl TryFrom<u8> for ErrorCode {
    type Error = UnknownErrorCode;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        ErrorCode::ALL
            .get(v as usize)
            .copied()
            .ok_or(UnknownErrorCode(v))
    }
}

impl From<ErrorCode> for u8 {
    fn from(code: ErrorCode) -> u8 {
        code.as_u8()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Unknown => "unknown",
            ErrorCode::Ok => "ok",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::InvalidArgument => "invalid argument",
            ErrorCode::DeadlineExceeded => "deadline exceeded",
            ErrorCode::NotFound => "not found",
            ErrorCode::AlreadyExists => "already exists",
            ErrorCode::PermissionDenied => "permission denied",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::Aborted => "aborted",
            ErrorCode::OutOfRange => "out of range",
            ErrorCode::Unimplemented => "unimplemented",
            ErrorCode::Internal => "internal",
            ErrorCode::Unavailable => "unavailable",
        };
        f.write_str(name)
    }
}

/// Error when converting from an unknown u8 error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownErrorCode(pub u8);

impl fmt::Display for UnknownErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown error code: {}", self.0)
    }
}

impl std::error::Error for UnknownErrorCode {}

/// An RPC failure: a status code and a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        RpcError {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unavailable, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<AccessTimeout> for RpcError {
    fn from(err: AccessTimeout) -> Self {
        RpcError::internal(err.to_string())
    }
}

impl From<ArenaError> for RpcError {
    fn from(err: ArenaError) -> Self {
        let code = match err {
            ArenaError::ResourceExhausted { .. } => ErrorCode::Unavailable,
            ArenaError::InvalidState { .. } | ArenaError::Timeout(_) => ErrorCode::Internal,
        };
        RpcError::new(code, err.to_string())
    }
}

impl From<QueueError> for RpcError {
    fn from(err: QueueError) -> Self {
        let code = match err {
            QueueError::Full { .. } => ErrorCode::Unavailable,
            QueueError::Timeout(_) => ErrorCode::Internal,
        };
        RpcError::new(code, err.to_string())
    }
}

impl From<TransportError> for RpcError {
    fn from(err: TransportError) -> Self {
        RpcError::unavailable(err.to_string())
    }
}
