//! Call-level states and the notifications delivered to the application

use std::fmt;

use serde::Serialize;

use avs_econn_core::CloseReason;

pub use crate::controller::roster::{Membership, Participant};

/// Aggregate state of a conversation's call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CallState {
    Idle,
    Outgoing,
    Incoming,
    Answered,
    /// Signaling answered and media established
    Active,
    Terminating,
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallState::Idle => "Idle",
            CallState::Outgoing => "Outgoing",
            CallState::Incoming => "Incoming",
            CallState::Answered => "Answered",
            CallState::Active => "Active",
            CallState::Terminating => "Terminating",
        };
        f.write_str(name)
    }
}

/// Kind of conversation a call lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConversationKind {
    /// Two users, possibly several devices each
    OneToOne,
    /// Conference with a shared roster
    Group,
}

/// Why a group call stopped ringing or was left while it keeps going
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LeaveReason {
    /// Still running without us (ring timeout or local leave)
    StillOngoing,
    /// Another of our devices joined
    AnsweredElsewhere,
    /// Another of our devices rejected
    Rejected,
}

/// Remote video as announced through properties
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VideoState {
    Stopped,
    Started,
    ScreenShare,
}

/// Final report of a call
#[derive(Debug, Clone, PartialEq)]
pub struct CallClosed {
    pub reason: CloseReason,
    pub convid: String,
    pub msg_time: u32,
    /// Remote party, when known
    pub userid: Option<String>,
    pub clientid: Option<String>,
    /// JSON diagnostics blob
    pub metrics: String,
}

/// Notification for the application
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Incoming {
        convid: String,
        msg_time: u32,
        userid: String,
        clientid: String,
        video: bool,
        should_ring: bool,
    },
    Answered {
        convid: String,
    },
    MediaEstablished {
        convid: String,
        userid: String,
        clientid: String,
    },
    DatachannelEstablished {
        convid: String,
        userid: String,
        clientid: String,
    },
    Closed(CallClosed),
    GroupChanged {
        convid: String,
        membership: Membership,
    },
    Left {
        convid: String,
        reason: LeaveReason,
    },
    VideoState {
        convid: String,
        userid: String,
        clientid: String,
        state: VideoState,
    },
    AudioCbr {
        convid: String,
        enabled: bool,
    },
}

impl CallEvent {
    pub fn convid(&self) -> &str {
        match self {
            CallEvent::Incoming { convid, .. }
            | CallEvent::Answered { convid }
            | CallEvent::MediaEstablished { convid, .. }
            | CallEvent::DatachannelEstablished { convid, .. }
            | CallEvent::GroupChanged { convid, .. }
            | CallEvent::Left { convid, .. }
            | CallEvent::VideoState { convid, .. }
            | CallEvent::AudioCbr { convid, .. } => convid,
            CallEvent::Closed(closed) => &closed.convid,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::Incoming { .. } => "incoming",
            CallEvent::Answered { .. } => "answered",
            CallEvent::MediaEstablished { .. } => "media_established",
            CallEvent::DatachannelEstablished { .. } => "datachannel_established",
            CallEvent::Closed(_) => "closed",
            CallEvent::GroupChanged { .. } => "group_changed",
            CallEvent::Left { .. } => "left",
            CallEvent::VideoState { .. } => "video_state",
            CallEvent::AudioCbr { .. } => "audio_cbr",
        }
    }
}
