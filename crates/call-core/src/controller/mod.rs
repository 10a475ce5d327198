//! Per-conversation call controllers
//!
//! A controller owns everything about the call in one conversation: its
//! Econn sessions (1:1) or roster (group), the single media flow and the
//! timers. Controllers are plain synchronous state machines; the
//! [`CallEngine`](crate::CallEngine) serializes every input onto them and
//! drains their [`CallEvent`]s.

pub mod direct;
pub mod group;
pub mod roster;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::warn;

use avs_econn_core::{Identity, SignalingMessage};

use crate::config::CallConfig;
use crate::error::Result;
use crate::events::{CallEvent, CallState, ConversationKind};
use crate::media::{MediaEvent, MediaNotification, MediaSystem};
use crate::transport::{Destination, Envelope, Transport, TransportError};

pub use direct::DirectCall;
pub use group::GroupCall;
pub use roster::{Membership, Participant, Roster};

/// Collaborators shared by every controller of an engine
#[derive(Clone)]
pub struct CallContext {
    pub config: Arc<CallConfig>,
    pub local: Identity,
    pub transport: Arc<dyn Transport>,
    pub media: Arc<dyn MediaSystem>,
    pub media_events: mpsc::UnboundedSender<MediaNotification>,
}

impl CallContext {
    /// Hand a backend-routed message to the transport
    pub(crate) fn send(
        &self,
        convid: &str,
        destination: Destination,
        message: SignalingMessage,
    ) -> std::result::Result<(), TransportError> {
        let envelope = Envelope {
            convid: convid.to_string(),
            sender: self.local.clone(),
            destination,
            message,
        };
        let brief = envelope.message.brief();
        let destination = envelope.destination.to_string();
        self.transport.send(envelope).inspect_err(|e| {
            warn!("conv {}: send {} to {} failed: {}", convid, brief, destination, e);
        })
    }
}

/// A message delivered by the backend
#[derive(Debug, Clone, Copy)]
pub struct Inbound<'a> {
    /// Server time at delivery, seconds
    pub curr_time: u32,
    /// Server time the message was sent, seconds
    pub msg_time: u32,
    pub sender: &'a Identity,
    pub message: &'a SignalingMessage,
}

/// Operations the engine drives on a conversation's call
pub trait CallController: Send {
    fn convid(&self) -> &str;

    fn kind(&self) -> ConversationKind;

    fn state(&self) -> CallState;

    fn start(&mut self, now: Instant, video: bool) -> Result<()>;

    fn answer(&mut self, now: Instant, video: bool) -> Result<()>;

    /// Hang up or leave; always ends in a close eventually
    fn end(&mut self, now: Instant);

    /// Decline a ringing call on this device. A call that is already
    /// up is ended instead.
    fn reject(&mut self, now: Instant) -> Result<()>;

    fn recv_message(&mut self, now: Instant, inbound: Inbound<'_>);

    fn handle_media_event(&mut self, now: Instant, flow_id: u64, event: MediaEvent);

    /// The transport failed, after the fact, to deliver a message of `session_id`
    fn handle_send_failure(&mut self, now: Instant, session_id: &str, error: &str);

    fn media_start(&mut self, now: Instant) -> Result<()>;

    fn set_video_send(&mut self, now: Instant, active: bool) -> Result<()>;

    /// Renegotiate with a fresh media flow
    fn restart(&mut self, now: Instant) -> Result<()>;

    fn handle_timeout(&mut self, now: Instant);

    fn poll_timeout(&self) -> Option<Instant>;

    fn poll_event(&mut self) -> Option<CallEvent>;

    /// Closed and reported; the engine may drop it
    fn is_finished(&self) -> bool;

    /// Remote session ids whose sessions ended in this call
    fn ended_sessions(&self) -> &[String] {
        &[]
    }
}
