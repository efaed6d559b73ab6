//! Server error types.

use crate::config::ConfigError;
use thiserror::Error;
use wampd_protocol::ErrorUri;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] wampd_protocol::ProtocolError),

    #[error("core error: {0}")]
    Core(#[from] wampd_core::CoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("session aborted ({reason}): {message}")]
    Aborted { reason: ErrorUri, message: String },

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    pub fn aborted(reason: ErrorUri, message: impl Into<String>) -> Self {
        ServerError::Aborted {
            reason,
            message: message.into(),
        }
    }

    /// Reason URI used when this error ends a session.
    pub fn error_uri(&self) -> ErrorUri {
        match self {
            ServerError::Protocol(_) => ErrorUri::ProtocolViolation,
            ServerError::Core(e) => e.error_uri(),
            ServerError::Aborted { reason, .. } => *reason,
            ServerError::ShuttingDown => ErrorUri::SystemShutdown,
            ServerError::Io(_) | ServerError::Config(_) | ServerError::Metrics(_) => {
                ErrorUri::CloseRealm
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wampd_protocol::ProtocolError;

    #[test]
    fn test_error_uri() {
        let err = ServerError::from(ProtocolError::InvalidMagic(*b"HTTP"));
        assert_eq!(err.error_uri(), ErrorUri::ProtocolViolation);

        let err = ServerError::from(wampd_core::CoreError::NoSuchCall { request: 3 });
        assert_eq!(err.error_uri(), ErrorUri::NoSuchCall);

        let err = ServerError::aborted(ErrorUri::NoSuchRealm, "realm2");
        assert_eq!(err.error_uri(), ErrorUri::NoSuchRealm);
        assert!(err.to_string().contains("realm2"));

        assert_eq!(ServerError::ShuttingDown.error_uri(), ErrorUri::SystemShutdown);
    }
}
