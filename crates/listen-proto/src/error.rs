use std::path::PathBuf;

use thiserror::Error;

/// Failure taxonomy shared by every component of the client.
///
/// Only `Config`, `InstanceLocked` and an exhausted `PlaybackStall` end the
/// process; everything else is reported to the user and the session carries
/// on.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    #[error("network error: {0}")]
    Network(String),

    #[error("authentication required: {0}")]
    Authentication(String),

    #[error("playback stalled and {attempts} restart attempt(s) did not recover it")]
    PlaybackStall { attempts: u32 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("another instance is running (lock file {0:?}); use --bypass to clear it")]
    InstanceLocked(PathBuf),

    #[error("api error: {0}")]
    Api(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("malformed gateway message: {0}")]
    Protocol(String),

    #[error("cancelled")]
    Cancelled,
}

impl ClientError {
    /// Process exit code used when this error terminates the client.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::PlaybackStall { .. } => 2,
            ClientError::InstanceLocked(_) => 3,
            _ => 1,
        }
    }

    /// Transient failures that the feed client retries with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Network(_) | ClientError::Protocol(_))
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_severity() {
        assert_eq!(ClientError::PlaybackStall { attempts: 3 }.exit_code(), 2);
        assert_eq!(
            ClientError::InstanceLocked(PathBuf::from("/tmp/x.lock")).exit_code(),
            3
        );
        assert_eq!(ClientError::Config("bad".into()).exit_code(), 1);
    }

    #[test]
    fn only_transport_errors_are_retried() {
        assert!(ClientError::Network("reset".into()).is_retryable());
        assert!(!ClientError::Authentication("expired".into()).is_retryable());
        assert!(!ClientError::Cancelled.is_retryable());
    }
}
