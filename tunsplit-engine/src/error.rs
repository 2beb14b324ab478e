//! Error types for the split tunnel engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running split tunneling
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hostname resolution error
    #[error("DNS error: {0}")]
    Dns(#[from] tunsplit_dns::Error),

    /// Enforcement backend error
    #[error("enforcement error: {0}")]
    Enforcement(#[from] tunsplit_enforce::Error),

    /// Invalid policy entry
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
}

impl Error {
    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::ConfigParse(_) | Error::InvalidPolicy(_)
        )
    }
}
