//! Application callbacks
//!
//! The engine reports every [`CallEvent`] through [`CallHandler::on_event`].
//! The default implementation dispatches to one method per event kind, each
//! a no-op unless overridden, so handlers implement only what they need.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use avs_econn_core::Identity;

use crate::events::{CallClosed, CallEvent, LeaveReason, Membership, VideoState};

/// Receiver of call events
#[async_trait]
pub trait CallHandler: Send + Sync {
    /// Entry point for every event
    async fn on_event(&self, event: CallEvent) {
        match event {
            CallEvent::Incoming {
                convid,
                msg_time,
                userid,
                clientid,
                video,
                should_ring,
            } => {
                let caller = Identity::new(userid, clientid);
                self.on_incoming(&convid, &caller, msg_time, video, should_ring)
                    .await
            }
            CallEvent::Answered { convid } => self.on_answered(&convid).await,
            CallEvent::MediaEstablished {
                convid,
                userid,
                clientid,
            } => {
                let peer = Identity::new(userid, clientid);
                self.on_media_established(&convid, &peer).await
            }
            CallEvent::DatachannelEstablished {
                convid,
                userid,
                clientid,
            } => {
                let peer = Identity::new(userid, clientid);
                self.on_datachannel_established(&convid, &peer).await
            }
            CallEvent::Closed(closed) => self.on_closed(&closed).await,
            CallEvent::GroupChanged { convid, membership } => {
                self.on_group_changed(&convid, &membership).await
            }
            CallEvent::Left { convid, reason } => self.on_left(&convid, reason).await,
            CallEvent::VideoState {
                convid,
                userid,
                clientid,
                state,
            } => {
                let peer = Identity::new(userid, clientid);
                self.on_video_state(&convid, &peer, state).await
            }
            CallEvent::AudioCbr { convid, enabled } => self.on_audio_cbr(&convid, enabled).await,
        }
    }

    /// A call is offered. `should_ring` is false for stale offers and for
    /// calls started by one of our own devices.
    async fn on_incoming(
        &self,
        _convid: &str,
        _caller: &Identity,
        _msg_time: u32,
        _video: bool,
        _should_ring: bool,
    ) {
    }

    async fn on_answered(&self, _convid: &str) {}

    /// Both answered and media flowing
    async fn on_media_established(&self, _convid: &str, _peer: &Identity) {}

    async fn on_datachannel_established(&self, _convid: &str, _peer: &Identity) {}

    async fn on_closed(&self, closed: &CallClosed) {
        debug!("call in {} closed: {}", closed.convid, closed.reason);
    }

    async fn on_group_changed(&self, _convid: &str, _membership: &Membership) {}

    /// This device is out of a call that may still go on
    async fn on_left(&self, _convid: &str, _reason: LeaveReason) {}

    async fn on_video_state(&self, _convid: &str, _peer: &Identity, _state: VideoState) {}

    async fn on_audio_cbr(&self, _convid: &str, _enabled: bool) {}
}

/// Forwards every event into a channel
#[derive(Debug, Clone)]
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CallHandler for ChannelHandler {
    async fn on_event(&self, event: CallEvent) {
        if let Err(e) = self.tx.send(event) {
            debug!("event {} dropped: receiver gone", e.0.name());
        }
    }
}
