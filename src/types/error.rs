//! Unified error type for the service core
//!
//! One serializable error enum covers every public operation, so a UI
//! shell can match on the `type` tag instead of parsing messages.
//! Lower-level errors (io, toml, serde_json) fold into it via `From`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application error type for the service core
///
/// Messages are written for the user, not the log: each variant states
/// what went wrong in terms of the operation that was attempted.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "message")]
pub enum TideError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Operation conflicts with service state: {0}")]
    State(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid password or corrupted data")]
    Crypto,

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Unsupported backup version: {0}")]
    VersionMismatch(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

// Implement From for common error types

impl From<std::io::Error> for TideError {
    fn from(err: std::io::Error) -> Self {
        TideError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for TideError {
    fn from(err: toml::de::Error) -> Self {
        TideError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for TideError {
    fn from(err: toml::ser::Error) -> Self {
        TideError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for TideError {
    fn from(err: serde_json::Error) -> Self {
        TideError::Parse(err.to_string())
    }
}

impl From<String> for TideError {
    fn from(err: String) -> Self {
        TideError::Other(err)
    }
}

impl From<&str> for TideError {
    fn from(err: &str) -> Self {
        TideError::Other(err.to_string())
    }
}

/// Result type alias using TideError
pub type Result<T> = std::result::Result<T, TideError>;
