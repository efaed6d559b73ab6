//! Protocol error types and standard error URIs.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid magic bytes: expected 'WMPX', got {0:?}")]
    InvalidMagic([u8; 4]),

    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u16),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u32, max: u32 },

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid frame flags: {0:#x}")]
    InvalidFlags(u16),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid UTF-8 in payload")]
    InvalidUtf8,

    #[error("message is not a non-empty array")]
    NotAnArray,

    #[error("invalid message type code: {0}")]
    InvalidTypeCode(String),

    #[error("no {kind} variant takes {count} field(s)")]
    FieldCount { kind: &'static str, count: usize },

    #[error("{kind}.{field}: expected {expected}")]
    FieldType {
        kind: &'static str,
        field: &'static str,
        expected: &'static str,
    },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("{0} is not an RPC message")]
    NotRpc(&'static str),
}

/// Standard error and close-reason URIs sent in ERROR, ABORT and GOODBYE.
///
/// The string forms are part of the protocol contract and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorUri {
    #[serde(rename = "wamp.error.invalid_uri")]
    InvalidUri,
    #[serde(rename = "wamp.error.no_such_procedure")]
    NoSuchProcedure,
    #[serde(rename = "wamp.error.procedure_already_exists")]
    ProcedureAlreadyExists,
    #[serde(rename = "wamp.error.no_such_registration")]
    NoSuchRegistration,
    #[serde(rename = "wamp.error.no_such_call")]
    NoSuchCall,
    #[serde(rename = "wamp.error.invalid_argument")]
    InvalidArgument,
    #[serde(rename = "wamp.error.canceled")]
    Canceled,
    #[serde(rename = "wamp.error.timeout")]
    Timeout,
    #[serde(rename = "wamp.error.not_authorized")]
    NotAuthorized,
    #[serde(rename = "wamp.error.no_such_realm")]
    NoSuchRealm,
    #[serde(rename = "wamp.error.protocol_violation")]
    ProtocolViolation,
    #[serde(rename = "wamp.error.system_shutdown")]
    SystemShutdown,
    #[serde(rename = "wamp.close.close_realm")]
    CloseRealm,
    #[serde(rename = "wamp.close.goodbye_and_out")]
    GoodbyeAndOut,
}

impl ErrorUri {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorUri::InvalidUri => "wamp.error.invalid_uri",
            ErrorUri::NoSuchProcedure => "wamp.error.no_such_procedure",
            ErrorUri::ProcedureAlreadyExists => "wamp.error.procedure_already_exists",
            ErrorUri::NoSuchRegistration => "wamp.error.no_such_registration",
            ErrorUri::NoSuchCall => "wamp.error.no_such_call",
            ErrorUri::InvalidArgument => "wamp.error.invalid_argument",
            ErrorUri::Canceled => "wamp.error.canceled",
            ErrorUri::Timeout => "wamp.error.timeout",
            ErrorUri::NotAuthorized => "wamp.error.not_authorized",
            ErrorUri::NoSuchRealm => "wamp.error.no_such_realm",
            ErrorUri::ProtocolViolation => "wamp.error.protocol_violation",
            ErrorUri::SystemShutdown => "wamp.error.system_shutdown",
            ErrorUri::CloseRealm => "wamp.close.close_realm",
            ErrorUri::GoodbyeAndOut => "wamp.close.goodbye_and_out",
        }
    }

    /// Returns whether this URI reports a call that ended without a result
    /// because it was canceled or ran out of time.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ErrorUri::Canceled | ErrorUri::Timeout)
    }
}

impl fmt::Display for ErrorUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
