use indexmap::IndexMap;
use serde::Serialize;

use avs_econn_core::{Identity, Props};

/// Property carrying a participant's audio ssrc
pub const PROP_SSRC_AUDIO: &str = "ssrc_audio";
/// Property carrying a participant's video ssrc
pub const PROP_SSRC_VIDEO: &str = "ssrc_video";

/// One device taking part in a group call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub userid: String,
    pub clientid: String,
    pub ssrc_audio: Option<u32>,
    pub ssrc_video: Option<u32>,
}

/// Snapshot of a roster handed to the application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Membership {
    pub epoch: u64,
    pub members: Vec<Participant>,
}

/// Group call participants, in order of appearance.
///
/// `epoch` is bumped on every change so snapshots can be ordered.
#[derive(Debug, Default)]
pub struct Roster {
    members: IndexMap<String, Participant>,
    epoch: u64,
}

fn roster_key(id: &Identity) -> String {
    id.key().to_ascii_lowercase()
}

fn parse_ssrc(props: &Props, key: &str) -> Option<u32> {
    props.get(key).and_then(|v| v.parse().ok())
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or refresh a participant from a message's properties.
    /// Returns true if the roster changed.
    pub fn upsert(&mut self, id: &Identity, props: &Props) -> bool {
        let participant = Participant {
            userid: id.userid.clone(),
            clientid: id.clientid.clone(),
            ssrc_audio: parse_ssrc(props, PROP_SSRC_AUDIO),
            ssrc_video: parse_ssrc(props, PROP_SSRC_VIDEO),
        };

        let key = roster_key(id);
        if self.members.get(&key) == Some(&participant) {
            return false;
        }
        self.members.insert(key, participant);
        self.epoch += 1;
        true
    }

    pub fn remove(&mut self, id: &Identity) -> Option<Participant> {
        let removed = self.members.shift_remove(&roster_key(id));
        if removed.is_some() {
            self.epoch += 1;
        }
        removed
    }

    /// Returns true if anything was removed
    pub fn clear(&mut self) -> bool {
        if self.members.is_empty() {
            return false;
        }
        self.members.clear();
        self.epoch += 1;
        true
    }

    pub fn get(&self, id: &Identity) -> Option<&Participant> {
        self.members.get(&roster_key(id))
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.members.values()
    }

    pub fn snapshot(&self) -> Membership {
        Membership {
            epoch: self.epoch,
            members: self.members.values().cloned().collect(),
        }
    }
}
