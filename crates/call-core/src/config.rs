//! Call configuration
//!
//! Loaded from TOML, with environment overrides for the timers:
//!
//! ```toml
//! media_start_timeout_ms = 10000
//! auto_media_start = false
//!
//! [econn]
//! timeout_setup_ms = 30000
//!
//! [[turn_servers]]
//! url = "turn:turn.example.com:3478"
//! username = "user"
//! credential = "secret"
//!
//! [group]
//! ring_timeout_ms = 20000
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use avs_econn_core::EconnConfig;

use crate::error::{CallError, Result};

pub const ENV_TIMEOUT_SETUP_MS: &str = "AVS_TIMEOUT_SETUP_MS";
pub const ENV_TIMEOUT_TERM_MS: &str = "AVS_TIMEOUT_TERM_MS";
pub const ENV_MEDIA_START_TIMEOUT_MS: &str = "AVS_MEDIA_START_TIMEOUT_MS";

/// A TURN relay handed to every media flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServer {
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Top-level configuration of the call layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub econn: EconnConfig,
    /// Time the application has to call `media_start` once media is up
    pub media_start_timeout_ms: u64,
    /// SETUPs older than this do not ring
    pub should_ring_timeout_ms: u64,
    /// Start media as soon as it is established
    pub auto_media_start: bool,
    /// Announce constant bitrate audio to the peer
    pub audio_cbr: bool,
    pub turn_servers: Vec<TurnServer>,
    pub group: GroupConfig,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            econn: EconnConfig::default(),
            media_start_timeout_ms: 10_000,
            should_ring_timeout_ms: 30_000,
            auto_media_start: true,
            audio_cbr: false,
            turn_servers: Vec::new(),
            group: GroupConfig::default(),
        }
    }
}

/// Group call timers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Outgoing group call without media
    pub start_timeout_ms: u64,
    /// Ringing for an incoming group call
    pub ring_timeout_ms: u64,
    /// Answered group call without media
    pub answer_timeout_ms: u64,
    /// Base interval between our GROUPCHECKs while active
    pub active_roster_timeout_ms: u64,
    /// Upper bound of the random delay added to the active interval
    pub active_roster_jitter_ms: u64,
    /// Silence after which a call we are not part of is considered over
    pub passive_roster_timeout_ms: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: 30_000,
            ring_timeout_ms: 35_000,
            answer_timeout_ms: 60_000,
            active_roster_timeout_ms: 60_000,
            active_roster_jitter_ms: 30_000,
            passive_roster_timeout_ms: 120_000,
        }
    }
}

impl CallConfig {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: CallConfig =
            toml::from_str(input).map_err(|e| CallError::Config(format!("invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path)
            .map_err(|e| CallError::Config(format!("cannot read {}: {e}", path.display())))?;
        debug!("Loading call configuration from {}", path.display());
        Self::from_toml_str(&input)
    }

    /// Apply `AVS_*` timer variables on top of the current values
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(ms) = env_millis(ENV_TIMEOUT_SETUP_MS) {
            self.econn.timeout_setup_ms = ms;
        }
        if let Some(ms) = env_millis(ENV_TIMEOUT_TERM_MS) {
            self.econn.timeout_term_ms = ms;
        }
        if let Some(ms) = env_millis(ENV_MEDIA_START_TIMEOUT_MS) {
            self.media_start_timeout_ms = ms;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.econn.validate()?;
        if self.media_start_timeout_ms == 0 {
            return Err(CallError::Config("media_start_timeout_ms must be non-zero".into()));
        }
        let group = &self.group;
        for (name, value) in [
            ("group.start_timeout_ms", group.start_timeout_ms),
            ("group.ring_timeout_ms", group.ring_timeout_ms),
            ("group.answer_timeout_ms", group.answer_timeout_ms),
            ("group.active_roster_timeout_ms", group.active_roster_timeout_ms),
            ("group.passive_roster_timeout_ms", group.passive_roster_timeout_ms),
        ] {
            if value == 0 {
                return Err(CallError::Config(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    pub fn media_start_timeout(&self) -> Duration {
        Duration::from_millis(self.media_start_timeout_ms)
    }

    pub fn should_ring_timeout(&self) -> Duration {
        Duration::from_millis(self.should_ring_timeout_ms)
    }
}

fn env_millis(name: &str) -> Option<u64> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse() {
        Ok(ms) => Some(ms),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a number of milliseconds", name, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = CallConfig::default();
        assert_eq!(config.econn.timeout_setup_ms, 60_000);
        assert_eq!(config.econn.timeout_term_ms, 5_000);
        assert_eq!(config.media_start_timeout(), Duration::from_secs(10));
        assert_eq!(config.group.ring_timeout_ms, 35_000);
        assert!(config.auto_media_start);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = CallConfig::from_toml_str(
            r#"
            auto_media_start = false

            [econn]
            timeout_setup_ms = 30000

            [[turn_servers]]
            url = "turn:turn.example.com:3478"
            username = "u"
            credential = "p"

            [group]
            ring_timeout_ms = 20000
            "#,
        )
        .expect("Should parse config");

        assert!(!config.auto_media_start);
        assert_eq!(config.econn.timeout_setup_ms, 30_000);
        // unspecified fields keep their defaults
        assert_eq!(config.econn.timeout_term_ms, 5_000);
        assert_eq!(config.group.ring_timeout_ms, 20_000);
        assert_eq!(config.group.answer_timeout_ms, 60_000);
        assert_eq!(config.turn_servers.len(), 1);
        assert_eq!(config.turn_servers[0].username, "u");
    }

    #[test]
    fn test_zero_setup_timeout_rejected() {
        let err = CallConfig::from_toml_str("[econn]\ntimeout_setup_ms = 0\n").unwrap_err();
        assert_eq!(err.code(), "EINVAL");
    }

    #[test]
    fn test_bad_toml_rejected() {
        assert!(matches!(
            CallConfig::from_toml_str("auto_media_start = 'maybe'"),
            Err(CallError::Config(_))
        ));
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        // SAFETY: serialized with the other env tests
        unsafe {
            std::env::set_var(ENV_TIMEOUT_SETUP_MS, "1500");
            std::env::set_var(ENV_MEDIA_START_TIMEOUT_MS, "not-a-number");
        }
        let config = CallConfig::default().with_env_overrides();
        unsafe {
            std::env::remove_var(ENV_TIMEOUT_SETUP_MS);
            std::env::remove_var(ENV_MEDIA_START_TIMEOUT_MS);
        }

        assert_eq!(config.econn.timeout_setup_ms, 1_500);
        assert_eq!(config.econn.timeout_term_ms, 5_000);
        assert_eq!(config.media_start_timeout_ms, 10_000);
    }
}
