use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{EconnError, Result};

/// Local video is being sent
pub const PROP_VIDEO_SEND: &str = "videosend";
/// Local screen share is being sent
pub const PROP_SCREEN_SEND: &str = "screensend";
/// Constant bitrate audio requested
pub const PROP_AUDIO_CBR: &str = "audiocbr";

/// Ordered string properties exchanged in SETUP, UPDATE, PROPSYNC and GROUPSTART.
///
/// Insertion order is kept so that encoding is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Props(IndexMap<String, String>);

impl Props {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new key, failing if it is already present
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        if self.0.contains_key(&key) {
            return Err(EconnError::DuplicateProperty(key));
        }
        self.0.insert(key, value.into());
        Ok(())
    }

    /// Insert or replace a key, returning the old value
    pub fn update(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// `Some(true)` only for the literal `"true"`, `None` when absent
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).map(|v| v == "true")
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.update(key, if value { "true" } else { "false" });
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Props {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}
