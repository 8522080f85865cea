//! Error types for Honeypool

use thiserror::Error;

/// Result type alias using Honeypool's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Honeypool
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Clone, start or unfreeze of a sandbox failed
    #[error("Provisioning of sandbox {name} failed: {reason}")]
    Provision { name: String, reason: String },

    /// Sandbox is running but never obtained a usable address
    #[error("Sandbox {name} did not settle: {reason}")]
    SettleTimeout { name: String, reason: String },

    /// Sandbox address is known but its network stayed unreachable
    #[error("Could not dial sandbox {name} at {addr}: {reason}")]
    Dial {
        name: String,
        addr: String,
        reason: String,
    },

    /// Inbound connection is neither TCP nor UDP
    #[error("Unsupported address family: {0}")]
    UnsupportedAddressFamily(String),

    /// Sandbox runtime primitive failed
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Docker/container error
    #[error("Container error: {0}")]
    Container(String),

    /// Operation aborted by shutdown
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if error is retryable on a later dial for the same peer
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Provision { .. }
                | Error::SettleTimeout { .. }
                | Error::Dial { .. }
                | Error::Runtime(_)
                | Error::Container(_)
        )
    }

    /// Check if error is caused by the inbound connection itself
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::UnsupportedAddressFamily(_))
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Error::Container(err.to_string())
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::Cancelled(msg) => std::io::Error::new(std::io::ErrorKind::Interrupted, msg),
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        }
    }
}
