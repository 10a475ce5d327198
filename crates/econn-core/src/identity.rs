use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of characters kept by [`Identity::anon`]
const ANON_LEN: usize = 6;

/// A (userid, clientid) pair naming one device of one user.
///
/// Ordering is the bytewise order of `userid` and then `clientid`; it is the
/// total order used for glare resolution. Matching against identifiers taken
/// from the wire ([`Identity::matches`]) ignores ASCII case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    pub userid: String,
    pub clientid: String,
}

impl Identity {
    pub fn new(userid: impl Into<String>, clientid: impl Into<String>) -> Self {
        Self {
            userid: userid.into(),
            clientid: clientid.into(),
        }
    }

    /// Same device, ignoring ASCII case
    pub fn matches(&self, other: &Identity) -> bool {
        self.userid.eq_ignore_ascii_case(&other.userid)
            && self.clientid.eq_ignore_ascii_case(&other.clientid)
    }

    /// Same user, ignoring ASCII case
    pub fn same_user(&self, other: &Identity) -> bool {
        self.userid.eq_ignore_ascii_case(&other.userid)
    }

    /// Roster key, `userid.clientid`
    pub fn key(&self) -> String {
        format!("{}.{}", self.userid, self.clientid)
    }

    /// Shortened form for logs
    pub fn anon(&self) -> String {
        format!("{}.{}", shorten(&self.userid), shorten(&self.clientid))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.userid, self.clientid)
    }
}

fn shorten(id: &str) -> &str {
    match id.char_indices().nth(ANON_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}
