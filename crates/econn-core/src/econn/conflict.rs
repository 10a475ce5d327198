use crate::identity::Identity;
use crate::message::{MessageKind, SignalingMessage};

/// Glare rule: does `local` win against `remote`?
///
/// The pair with the greater (userid, clientid) in bytewise order wins. For
/// two distinct pairs exactly one side wins, whichever side evaluates it.
pub fn is_winner(local: &Identity, remote: &Identity) -> bool {
    (local.userid.as_bytes(), local.clientid.as_bytes())
        > (remote.userid.as_bytes(), remote.clientid.as_bytes())
}

/// Whether `msg` from `sender` starts a new session on this device
pub fn is_creator(local: &Identity, sender: &Identity, msg: &SignalingMessage) -> bool {
    msg.kind == MessageKind::Setup && msg.is_request() && !local.matches(sender)
}
