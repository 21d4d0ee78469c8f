//! Error types for the Edgeguard service.

use thiserror::Error;

/// Main error type for Edgeguard operations.
///
/// Rate limit decisions never produce one of these; they cover startup and
/// serving failures only.
#[derive(Error, Debug)]
pub enum EdgeGuardError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP server errors
    #[error("HTTP server error: {0}")]
    Server(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Edgeguard operations.
pub type Result<T> = std::result::Result<T, EdgeGuardError>;
