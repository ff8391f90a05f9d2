//! Shibui Error Types

use thiserror::Error;

/// Result type alias for shibui operations
pub type Result<T> = std::result::Result<T, Error>;

/// Shibui error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Peers file error at line {line}: {reason}")]
    PeersFile { line: usize, reason: String },

    // Membership errors
    #[error("Duplicate cluster member {address}:{port}")]
    DuplicateMember { address: String, port: u16 },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Partition error: {0}")]
    Partition(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    #[error("Handshake with {address} failed: {reason}")]
    Handshake { address: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Formation errors
    #[error("Formation stalled after {passes} probe passes with {unreachable} unreachable nodes")]
    FormationStalled { passes: u32, unreachable: usize },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Check if this error is retryable on the next probe pass
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout(_)
                | Error::Network(_)
                | Error::Io(_)
        )
    }
}
