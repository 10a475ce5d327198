//! Backend relay seam
//!
//! The call layer hands every backend-routed message to a [`Transport`].
//! Sends are fire-and-forget: an immediate `Err` means the message was not
//! accepted, while failures discovered later are reported back through
//! [`EngineHandle::report_send_failure`](crate::EngineHandle::report_send_failure).

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

use avs_econn_core::{EncodeError, Identity, SignalingMessage, encode};

/// Who receives a backend message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Every device of every member of the conversation, except the sender
    Conversation,
    /// Every device of one user
    User(String),
    /// One device
    Device(Identity),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Conversation => f.write_str("conversation"),
            Destination::User(userid) => write!(f, "user {userid}"),
            Destination::Device(id) => write!(f, "device {}", id.anon()),
        }
    }
}

/// An outbound message with its routing
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub convid: String,
    pub sender: Identity,
    pub destination: Destination,
    pub message: SignalingMessage,
}

impl Envelope {
    /// Wire bytes of the message
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        encode(&self.message)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Outbound side of the backend relay
pub trait Transport: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError>;
}
