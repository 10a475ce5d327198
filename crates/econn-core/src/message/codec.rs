//! JSON wire format
//!
//! ```json
//! {"version":"3.0","type":"SETUP","sessid":"c0ffee","resp":false,
//!  "sdp":"v=0...","props":{"videosend":"false"}}
//! ```
//!
//! Unknown top-level fields are ignored on decode.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{MessageKind, Props, SignalingMessage};

/// Protocol version written into, and required on, every message
pub const PROTOCOL_VERSION: &str = "3.0";

/// Decoding failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not JSON, or a required field is missing or mistyped (EBADMSG)
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The `type` field names a kind this codec does not know (EPROTONOSUPPORT).
    /// Callers are expected to ignore these.
    #[error("unknown message kind `{0}`")]
    UnknownKind(String),

    /// Message from a different protocol version (EPROTO)
    #[error("protocol version mismatch: got `{0}`")]
    VersionMismatch(String),
}

impl DecodeError {
    pub fn code(&self) -> &'static str {
        match self {
            DecodeError::Malformed(_) => "EBADMSG",
            DecodeError::UnknownKind(_) => "EPROTONOSUPPORT",
            DecodeError::VersionMismatch(_) => "EPROTO",
        }
    }
}

/// Encoding failures; only reachable for messages built by hand
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{0} message without sdp")]
    MissingSdp(MessageKind),

    #[error("json encoding failed: {0}")]
    Json(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    version: String,
    #[serde(rename = "type")]
    kind: String,
    sessid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    src_userid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    src_clientid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dest_userid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    dest_clientid: Option<String>,
    resp: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    props: Option<Props>,
}

/// Encode a message into its wire representation
pub fn encode(msg: &SignalingMessage) -> Result<Bytes, EncodeError> {
    if msg.kind.requires_sdp() && msg.sdp.is_none() {
        return Err(EncodeError::MissingSdp(msg.kind));
    }

    // PROPSYNC always carries its props, even when empty
    let props = if msg.kind == MessageKind::Propsync || !msg.props.is_empty() {
        Some(msg.props.clone())
    } else {
        None
    };

    let wire = WireMessage {
        version: PROTOCOL_VERSION.to_string(),
        kind: msg.kind.as_str().to_string(),
        sessid: msg.session_id.clone(),
        src_userid: msg.src_userid.clone(),
        src_clientid: msg.src_clientid.clone(),
        dest_userid: msg.dest_userid.clone(),
        dest_clientid: msg.dest_clientid.clone(),
        resp: msg.is_response,
        sdp: msg.sdp.clone(),
        props,
    };

    serde_json::to_vec(&wire)
        .map(Bytes::from)
        .map_err(|e| EncodeError::Json(e.to_string()))
}

/// Decode a message from its wire representation
pub fn decode(input: &[u8]) -> Result<SignalingMessage, DecodeError> {
    let wire: WireMessage =
        serde_json::from_slice(input).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    if wire.version != PROTOCOL_VERSION {
        return Err(DecodeError::VersionMismatch(wire.version));
    }

    let kind = MessageKind::from_wire(&wire.kind).ok_or(DecodeError::UnknownKind(wire.kind))?;

    if kind.requires_sdp() && wire.sdp.is_none() {
        return Err(DecodeError::Malformed(format!("{kind} without sdp")));
    }
    if kind == MessageKind::Propsync && wire.props.is_none() {
        return Err(DecodeError::Malformed("PROPSYNC without props".into()));
    }

    Ok(SignalingMessage {
        kind,
        session_id: wire.sessid,
        is_response: wire.resp,
        sdp: wire.sdp,
        props: wire.props.unwrap_or_default(),
        src_userid: wire.src_userid,
        src_clientid: wire.src_clientid,
        dest_userid: wire.dest_userid,
        dest_clientid: wire.dest_clientid,
    })
}
