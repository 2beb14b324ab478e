//! Error types for hostname resolution

use thiserror::Error;

/// Result type alias for DNS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while resolving split tunnel hostnames
#[derive(Debug, Error)]
pub enum Error {
    /// DNS query/response error
    #[error("DNS error: {0}")]
    Dns(String),

    /// The name does not exist or has no usable records
    #[error("no addresses for {0}")]
    NoAddresses(String),

    /// DNS configuration error
    #[error("DNS configuration error: {0}")]
    Config(String),

    /// A lookup did not finish in time
    #[error("lookup timed out: {0}")]
    Timeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
