//! Core error types.

use thiserror::Error;
use wampd_protocol::options::UnknownOption;
use wampd_protocol::{ErrorUri, MessageType, ProtocolError};

/// Errors from the dealer and the registration table.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid procedure URI: {uri}")]
    InvalidUri { uri: String },

    #[error("no such procedure: {uri}")]
    NoSuchProcedure { uri: String },

    #[error("procedure already exists: {uri}")]
    ProcedureAlreadyExists { uri: String },

    #[error("no such registration: {registration}")]
    NoSuchRegistration { registration: u64 },

    #[error("no such call: {request}")]
    NoSuchCall { request: u64 },

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("unexpected {kind} from a client")]
    UnexpectedMessage { kind: MessageType },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<UnknownOption> for CoreError {
    fn from(e: UnknownOption) -> Self {
        CoreError::InvalidArgument {
            reason: e.to_string(),
        }
    }
}

impl CoreError {
    /// Returns the error URI used when this error is reported to a peer.
    pub fn error_uri(&self) -> ErrorUri {
        match self {
            CoreError::InvalidUri { .. } => ErrorUri::InvalidUri,
            CoreError::NoSuchProcedure { .. } => ErrorUri::NoSuchProcedure,
            CoreError::ProcedureAlreadyExists { .. } => ErrorUri::ProcedureAlreadyExists,
            CoreError::NoSuchRegistration { .. } => ErrorUri::NoSuchRegistration,
            CoreError::NoSuchCall { .. } => ErrorUri::NoSuchCall,
            CoreError::InvalidArgument { .. } => ErrorUri::InvalidArgument,
            CoreError::UnexpectedMessage { .. } => ErrorUri::ProtocolViolation,
            CoreError::Protocol(_) => ErrorUri::InvalidArgument,
        }
    }

    /// Returns whether the session that caused this error must be aborted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::UnexpectedMessage { .. })
    }
}
