use std::fmt;

use crate::identity::Identity;
use crate::message::{Props, SignalingMessage};

/// Side effect requested by an [`Econn`](super::Econn), executed by its owner
#[derive(Debug, Clone, PartialEq)]
pub enum EconnAction {
    /// Hand a message to the transport selected by `msg.kind.route()`
    Send(SignalingMessage),
    /// Tell the owner something happened
    Notify(EconnEvent),
}

/// Notifications emitted by an Econn
#[derive(Debug, Clone, PartialEq)]
pub enum EconnEvent {
    /// Remote SETUP request accepted; we are ringing
    Incoming {
        remote: Identity,
        msg_time: u32,
        age: u32,
        sdp: String,
        props: Props,
    },
    /// SETUP exchange completed.
    ///
    /// With `reset` set, glare was lost: `sdp` is the remote *offer* and the
    /// owner must produce an answer through [`Econn::answer`](super::Econn::answer).
    /// Otherwise `sdp` is the remote answer to our offer.
    Answered {
        reset: bool,
        sdp: String,
        props: Props,
    },
    /// Remote asked to renegotiate; answer with `update_response`
    UpdateRequest {
        remote: Identity,
        sdp: String,
        props: Props,
        should_reset: bool,
    },
    /// Remote answered our UPDATE
    UpdateResponse { sdp: String, props: Props },
    /// Properties arrived over the data channel
    Propsync { props: Props, is_response: bool },
    DatachanEstablished,
    /// Terminal; emitted exactly once per Econn
    Closed { reason: CloseReason, msg_time: u32 },
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    /// Local or remote cancel (ECANCELED)
    Canceled,
    /// Setup or term timer expired (ETIMEDOUT)
    TimedOut,
    /// Another device of ours answered first (EALREADY)
    AnsweredElsewhere,
    /// Another device of ours rejected the call (EREMOTE)
    RejectedElsewhere,
    /// Unusable signaling (EPROTO)
    Protocol(String),
    /// Media subsystem could not be initialised (ENOSYS)
    MediaUnavailable(String),
    /// Media failed or never started (EIO)
    MediaFailed(String),
    /// Text reported by the transport
    Transport(String),
}

impl CloseReason {
    /// Errno-style name, `"OK"` for a normal close
    pub fn code(&self) -> &'static str {
        match self {
            CloseReason::Normal => "OK",
            CloseReason::Canceled => "ECANCELED",
            CloseReason::TimedOut => "ETIMEDOUT",
            CloseReason::AnsweredElsewhere => "EALREADY",
            CloseReason::RejectedElsewhere => "EREMOTE",
            CloseReason::Protocol(_) => "EPROTO",
            CloseReason::MediaUnavailable(_) => "ENOSYS",
            CloseReason::MediaFailed(_) => "EIO",
            CloseReason::Transport(_) => "ETRANSPORT",
        }
    }

    pub fn is_error(&self) -> bool {
        !matches!(self, CloseReason::Normal)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Normal => f.write_str("normal"),
            CloseReason::Canceled => f.write_str("canceled"),
            CloseReason::TimedOut => f.write_str("timed out"),
            CloseReason::AnsweredElsewhere => f.write_str("answered elsewhere"),
            CloseReason::RejectedElsewhere => f.write_str("rejected elsewhere"),
            CloseReason::Protocol(why) => write!(f, "protocol error: {why}"),
            CloseReason::MediaUnavailable(why) => write!(f, "media unavailable: {why}"),
            CloseReason::MediaFailed(why) => write!(f, "media failed: {why}"),
            CloseReason::Transport(why) => write!(f, "transport error: {why}"),
        }
    }
}
