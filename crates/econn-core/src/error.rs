use thiserror::Error;

use crate::econn::EconnState;

/// Errors returned by [`Econn`](crate::Econn) operations and [`Props`](crate::Props).
///
/// Failures that belong to an ongoing session (timeouts, cancels, transport
/// failures) are never returned here; they surface as a
/// [`CloseReason`](crate::CloseReason) in the close notification.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EconnError {
    /// Operation not allowed in the current state (EPROTO)
    #[error("cannot {operation} in state {state}")]
    InvalidState {
        operation: &'static str,
        state: EconnState,
    },

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Property key already present
    #[error("property `{0}` already set")]
    DuplicateProperty(String),
}

impl EconnError {
    pub(crate) fn invalid_state(operation: &'static str, state: EconnState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Errno-style name of the error
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidState { .. } => "EPROTO",
            Self::Config(_) => "EINVAL",
            Self::DuplicateProperty(_) => "EADDRINUSE",
        }
    }
}

/// Result type for econn operations
pub type Result<T> = std::result::Result<T, EconnError>;
