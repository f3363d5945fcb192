//! Remote-access errors and their translation into local errors.

use replidb_core::CoreError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Error code reported by a remote master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The requested database does not exist on the master.
    DbUnavailable,
    /// The master is too busy to serve the request.
    Busy,
    /// The master failed while serving the request.
    InternalError,
    /// The master does not currently serve requests.
    ServiceUnavailable,
    /// Anything else.
    Unknown,
}

impl ErrorCode {
    /// Numeric code as carried on the wire by older peers.
    #[must_use]
    pub fn as_u32(self) -> u32 {
        match self {
            Self::DbUnavailable => 6,
            Self::Busy => 4,
            Self::InternalError => 5,
            Self::Unknown => 99,
            Self::ServiceUnavailable => 404,
        }
    }

    /// Maps a numeric code back; unrecognized numbers become `Unknown`.
    #[must_use]
    pub fn from_u32(code: u32) -> Self {
        match code {
            6 => Self::DbUnavailable,
            4 => Self::Busy,
            5 => Self::InternalError,
            404 => Self::ServiceUnavailable,
            _ => Self::Unknown,
        }
    }
}

/// Failure of a call forwarded to the master.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// The master answered with an error code.
    #[error("remote error {code:?}: {message}")]
    Code {
        /// Code reported by the master.
        code: ErrorCode,
        /// Message reported by the master.
        message: String,
    },

    /// The master did not answer within the request timeout.
    #[error("request to {address} timed out after {timeout:?}")]
    Timeout {
        /// Address of the master.
        address: SocketAddr,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The request could not be delivered.
    #[error("transport error: {0}")]
    Transport(String),

    /// A message could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// The master answered with a response of the wrong kind.
    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        /// Response kind the request calls for.
        expected: &'static str,
        /// Response kind received.
        actual: &'static str,
    },
}

impl RemoteError {
    /// Creates a coded error.
    pub fn code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Code {
            code,
            message: message.into(),
        }
    }

    /// Returns the remote error code, if the master sent one.
    #[must_use]
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Code { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Translates the failure into a local error.
    ///
    /// `DbUnavailable` becomes `NoSuchDatabase` for `database`, since the
    /// master is authoritative on existence. Everything else becomes
    /// `ReplicationFailure`.
    #[must_use]
    pub fn into_core(self, database: &str) -> CoreError {
        match self {
            Self::Code {
                code: ErrorCode::DbUnavailable,
                ..
            } => CoreError::no_such_database(database),
            other => CoreError::replication_failure(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_unavailable_becomes_no_such_database() {
        let err = RemoteError::code(ErrorCode::DbUnavailable, "x");
        assert!(matches!(
            err.into_core("x"),
            CoreError::NoSuchDatabase { name } if name == "x"
        ));
    }

    #[test]
    fn other_failures_become_replication_failure() {
        let failures = [
            RemoteError::code(ErrorCode::Busy, "busy"),
            RemoteError::code(ErrorCode::InternalError, "boom"),
            RemoteError::Timeout {
                address: "127.0.0.1:7000".parse().unwrap(),
                timeout: Duration::from_millis(10),
            },
            RemoteError::Transport("connection refused".into()),
            RemoteError::Codec("eof".into()),
        ];
        for err in failures {
            assert!(matches!(
                err.into_core("db"),
                CoreError::ReplicationFailure { .. }
            ));
        }
    }

    #[test]
    fn numeric_codes() {
        for code in [
            ErrorCode::DbUnavailable,
            ErrorCode::Busy,
            ErrorCode::InternalError,
            ErrorCode::ServiceUnavailable,
            ErrorCode::Unknown,
        ] {
            assert_eq!(ErrorCode::from_u32(code.as_u32()), code);
        }
        assert_eq!(ErrorCode::from_u32(1), ErrorCode::Unknown);
    }

    #[test]
    fn error_display() {
        let err = RemoteError::Timeout {
            address: "10.0.0.1:9000".parse().unwrap(),
            timeout: Duration::from_secs(2),
        };
        assert!(err.to_string().contains("10.0.0.1:9000"));
        assert_eq!(err.error_code(), None);
    }
}
