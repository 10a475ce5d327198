//! Signaling messages
//!
//! [`SignalingMessage`] is the unit exchanged between devices, either through
//! the backend relay or through the peer data channel ([`Route`]). The wire
//! representation lives in [`codec`].

mod codec;
mod props;

use std::fmt;

pub use codec::{DecodeError, EncodeError, PROTOCOL_VERSION, decode, encode};
pub use props::{PROP_AUDIO_CBR, PROP_SCREEN_SEND, PROP_VIDEO_SEND, Props};

/// Message time for events not caused by a received message
pub const MESSAGE_TIME_UNKNOWN: u32 = 0;

/// Kind of a signaling message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Setup,
    Cancel,
    Hangup,
    Reject,
    Update,
    Propsync,
    GroupStart,
    GroupLeave,
    GroupCheck,
    Ping,
}

/// Which transport carries a message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Backend relay (REST/websocket), fanned out to conversation members
    Backend,
    /// Peer-to-peer data channel of the established media flow
    Direct,
}

impl MessageKind {
    pub const ALL: [MessageKind; 10] = [
        MessageKind::Setup,
        MessageKind::Cancel,
        MessageKind::Hangup,
        MessageKind::Reject,
        MessageKind::Update,
        MessageKind::Propsync,
        MessageKind::GroupStart,
        MessageKind::GroupLeave,
        MessageKind::GroupCheck,
        MessageKind::Ping,
    ];

    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Setup => "SETUP",
            MessageKind::Cancel => "CANCEL",
            MessageKind::Hangup => "HANGUP",
            MessageKind::Reject => "REJECT",
            MessageKind::Update => "UPDATE",
            MessageKind::Propsync => "PROPSYNC",
            MessageKind::GroupStart => "GROUPSTART",
            MessageKind::GroupLeave => "GROUPLEAVE",
            MessageKind::GroupCheck => "GROUPCHECK",
            MessageKind::Ping => "PING",
        }
    }

    /// Parse a wire name; case-insensitive
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(name))
    }

    pub fn route(&self) -> Route {
        match self {
            MessageKind::Hangup | MessageKind::Propsync => Route::Direct,
            _ => Route::Backend,
        }
    }

    /// Kinds that cannot be sent without an SDP blob
    pub fn requires_sdp(&self) -> bool {
        matches!(self, MessageKind::Setup | MessageKind::Update)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signaling message.
///
/// `src_*`/`dest_*` are advisory copies of the routing identities; the
/// authoritative sender is the one reported by the transport on delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingMessage {
    pub kind: MessageKind,
    pub session_id: String,
    pub is_response: bool,
    pub sdp: Option<String>,
    pub props: Props,
    pub src_userid: Option<String>,
    pub src_clientid: Option<String>,
    pub dest_userid: Option<String>,
    pub dest_clientid: Option<String>,
}

impl SignalingMessage {
    pub fn new(kind: MessageKind, session_id: impl Into<String>, is_response: bool) -> Self {
        Self {
            kind,
            session_id: session_id.into(),
            is_response,
            sdp: None,
            props: Props::new(),
            src_userid: None,
            src_clientid: None,
            dest_userid: None,
            dest_clientid: None,
        }
    }

    pub fn setup(session_id: impl Into<String>, is_response: bool, sdp: String, props: Props) -> Self {
        Self::new(MessageKind::Setup, session_id, is_response)
            .with_sdp(sdp)
            .with_props(props)
    }

    pub fn update(session_id: impl Into<String>, is_response: bool, sdp: String, props: Props) -> Self {
        Self::new(MessageKind::Update, session_id, is_response)
            .with_sdp(sdp)
            .with_props(props)
    }

    pub fn cancel(session_id: impl Into<String>) -> Self {
        Self::new(MessageKind::Cancel, session_id, false)
    }

    pub fn hangup(session_id: impl Into<String>, is_response: bool) -> Self {
        Self::new(MessageKind::Hangup, session_id, is_response)
    }

    pub fn propsync(session_id: impl Into<String>, is_response: bool, props: Props) -> Self {
        Self::new(MessageKind::Propsync, session_id, is_response).with_props(props)
    }

    pub fn with_sdp(mut self, sdp: String) -> Self {
        self.sdp = Some(sdp);
        self
    }

    pub fn with_props(mut self, props: Props) -> Self {
        self.props = props;
        self
    }

    pub fn is_request(&self) -> bool {
        !self.is_response
    }

    /// Short description for logs: `SETUP(r) sessid=...`
    pub fn brief(&self) -> String {
        format!(
            "{}{} sessid={}",
            self.kind,
            if self.is_response { "(r)" } else { "" },
            self.session_id
        )
    }
}

/// Server-side timing of a received message, in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageTiming {
    /// Time the backend stamped on the message
    pub msg_time: u32,
    /// How long the message was in flight; zero if the clocks disagree
    pub age: u32,
}

impl MessageTiming {
    pub fn new(curr_time: u32, msg_time: u32) -> Self {
        Self {
            msg_time,
            age: curr_time.saturating_sub(msg_time),
        }
    }

    /// Timing for messages that arrive over the data channel
    pub fn unknown() -> Self {
        Self {
            msg_time: MESSAGE_TIME_UNKNOWN,
            age: 0,
        }
    }
}
