use thiserror::Error;

use avs_econn_core::{DecodeError, EconnError, EncodeError};

use crate::events::CallState;
use crate::media::MediaError;
use crate::transport::TransportError;

/// Errors returned synchronously by call operations.
///
/// Failures of an established or ringing session are not returned here; they
/// reach the application through the close notification.
#[derive(Error, Debug)]
pub enum CallError {
    /// The media subsystem could not provide a flow (ENOSYS)
    #[error("Media initialization failed: {0}")]
    MediaInit(String),

    /// A call is already running in this conversation (EALREADY)
    #[error("Call already in progress in conversation {0}")]
    AlreadyInProgress(String),

    /// Operation not allowed in the current call state (EPROTO)
    #[error("cannot {operation} in call state {state}")]
    InvalidState {
        operation: &'static str,
        state: CallState,
    },

    /// No call exists for the conversation (ENOENT)
    #[error("No call in conversation {0}")]
    NotFound(String),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Signaling error: {0}")]
    Econn(#[from] EconnError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The engine task is gone
    #[error("Call engine stopped")]
    EngineStopped,
}

impl CallError {
    pub(crate) fn invalid_state(operation: &'static str, state: CallState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Errno-style name of the error
    pub fn code(&self) -> &'static str {
        match self {
            CallError::MediaInit(_) => "ENOSYS",
            CallError::AlreadyInProgress(_) => "EALREADY",
            CallError::InvalidState { .. } => "EPROTO",
            CallError::NotFound(_) => "ENOENT",
            CallError::Media(_) => "EIO",
            CallError::Transport(_) => "ETRANSPORT",
            CallError::Econn(e) => e.code(),
            CallError::Decode(e) => e.code(),
            CallError::Encode(_) => "EPROTO",
            CallError::Config(_) => "EINVAL",
            CallError::EngineStopped => "ESHUTDOWN",
        }
    }
}

/// Result type for call operations
pub type Result<T> = std::result::Result<T, CallError>;
