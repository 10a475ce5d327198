//! Media flow seam
//!
//! A [`MediaSystem`] is the constructed media context (ICE, DTLS, codecs)
//! passed into the engine; it allocates one [`MediaFlow`] per call. Flows run
//! on their own threads and report back through a [`MediaEventSink`], which
//! only queues the event for the signaling task.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::TurnServer;
use crate::events::ConversationKind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Media cannot be used at all
    #[error("media unavailable: {0}")]
    Unavailable(String),

    #[error("media operation failed: {0}")]
    Failed(String),
}

/// Which side of an offer/answer exchange a description is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Result of asking a flow for a local description
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdpOutcome {
    Ready(String),
    /// Candidates still gathering; the description follows as
    /// [`MediaEvent::IceGathered`]
    Gathering,
}

/// Callbacks from a media flow
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    Established { crypto: String, codec: String },
    /// The flow died; `None` for an orderly close
    Closed { error: Option<String> },
    DatachannelEstablished,
    IceGathered { sdp: String },
    /// Bytes received on the data channel
    DataReceived(Bytes),
}

/// A media event tagged with the flow that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct MediaNotification {
    pub convid: String,
    pub flow_id: u64,
    pub event: MediaEvent,
}

/// Handle given to a flow for reporting events.
///
/// Holds no reference to the call: the event is resolved against the owning
/// controller by conversation and flow id when it is dequeued, and events of
/// a replaced flow are dropped there.
#[derive(Debug, Clone)]
pub struct MediaEventSink {
    convid: String,
    flow_id: u64,
    tx: mpsc::UnboundedSender<MediaNotification>,
}

impl MediaEventSink {
    pub fn new(
        convid: impl Into<String>,
        flow_id: u64,
        tx: mpsc::UnboundedSender<MediaNotification>,
    ) -> Self {
        Self {
            convid: convid.into(),
            flow_id,
            tx,
        }
    }

    pub fn convid(&self) -> &str {
        &self.convid
    }

    pub fn flow_id(&self) -> u64 {
        self.flow_id
    }

    pub fn established(&self, crypto: impl Into<String>, codec: impl Into<String>) {
        self.push(MediaEvent::Established {
            crypto: crypto.into(),
            codec: codec.into(),
        });
    }

    pub fn closed(&self, error: Option<String>) {
        self.push(MediaEvent::Closed { error });
    }

    pub fn datachannel_established(&self) {
        self.push(MediaEvent::DatachannelEstablished);
    }

    pub fn ice_gathered(&self, sdp: impl Into<String>) {
        self.push(MediaEvent::IceGathered { sdp: sdp.into() });
    }

    pub fn data_received(&self, data: Bytes) {
        self.push(MediaEvent::DataReceived(data));
    }

    pub fn push(&self, event: MediaEvent) {
        let notification = MediaNotification {
            convid: self.convid.clone(),
            flow_id: self.flow_id,
            event,
        };
        if self.tx.send(notification).is_err() {
            debug!("media event for {} dropped: engine stopped", self.convid);
        }
    }
}

/// One media session (peer connection or conference flow)
pub trait MediaFlow: Send {
    fn add_turn_server(&mut self, server: &TurnServer) -> Result<(), MediaError>;

    fn gather_candidates(&mut self) -> Result<(), MediaError>;

    fn create_offer(&mut self) -> Result<SdpOutcome, MediaError>;

    fn create_answer(&mut self) -> Result<SdpOutcome, MediaError>;

    fn set_remote_description(&mut self, kind: SdpKind, sdp: &str) -> Result<(), MediaError>;

    /// Drop local negotiation state, e.g. our offer after losing glare
    fn reset(&mut self) -> Result<(), MediaError>;

    /// Send on the data channel
    fn send_data(&mut self, data: Bytes) -> Result<(), MediaError>;

    /// Begin sending and rendering media
    fn start_media(&mut self) -> Result<(), MediaError>;

    fn stop_media(&mut self) {}

    fn set_video_send(&mut self, _active: bool) {}

    /// Local synchronization sources, announced to group members
    fn local_ssrcs(&self) -> Option<(u32, u32)> {
        None
    }

    fn add_decoder(
        &mut self,
        _userid: &str,
        _clientid: &str,
        _ssrc_audio: Option<u32>,
        _ssrc_video: Option<u32>,
    ) -> Result<(), MediaError> {
        Ok(())
    }

    fn remove_decoder(&mut self, _userid: &str, _clientid: &str) {}

    fn close(&mut self);
}

/// Factory for media flows
pub trait MediaSystem: Send + Sync {
    fn alloc_flow(
        &self,
        convid: &str,
        kind: ConversationKind,
        events: MediaEventSink,
    ) -> Result<Box<dyn MediaFlow>, MediaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_tags_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = MediaEventSink::new("conv", 3, tx);
        sink.ice_gathered("v=0");
        sink.closed(None);

        let first = rx.try_recv().expect("Should queue first event");
        assert_eq!(first.convid, "conv");
        assert_eq!(first.flow_id, 3);
        assert_eq!(first.event, MediaEvent::IceGathered { sdp: "v=0".into() });
        assert_eq!(
            rx.try_recv().expect("Should queue second event").event,
            MediaEvent::Closed { error: None }
        );
    }

    #[test]
    fn test_sink_survives_engine_shutdown() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = MediaEventSink::new("conv", 1, tx);
        drop(rx);
        sink.datachannel_established();
    }
}
