//! Error types for tunsplit-enforce

use std::io;
use thiserror::Error;

/// Result type alias for enforcement operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while programming enforcement primitives
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Route management error
    #[error("route error: {0}")]
    Route(String),

    /// Firewall (exception set) error
    #[error("firewall error: {0}")]
    Firewall(String),

    /// Per-app redirect error
    #[error("redirect error: {0}")]
    Redirect(String),

    /// An external tool exited unsuccessfully
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    /// Permission denied
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid network prefix
    #[error("invalid network prefix: {0}")]
    InvalidPrefix(String),

    /// Operation not supported on this platform
    #[error("operation not supported: {0}")]
    NotSupported(String),

    /// Failure injected by the recording adapter
    #[error("simulated failure in {0}")]
    Simulated(String),
}

impl Error {
    /// Check if the error is a permission-related error
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Error::PermissionDenied(_))
            || matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::PermissionDenied)
            || matches!(self, Error::Command { stderr, .. } if stderr.contains("Operation not permitted"))
    }

    /// Check if the error means this platform cannot enforce at all
    pub fn is_not_supported(&self) -> bool {
        matches!(self, Error::NotSupported(_))
    }
}
