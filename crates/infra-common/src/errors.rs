use thiserror::Error;

/// Errors raised by the shared infrastructure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// The global subscriber could not be installed
    #[error("Logging error: {0}")]
    Logging(String),
}

/// Result type for infrastructure operations
pub type Result<T> = std::result::Result<T, Error>;
