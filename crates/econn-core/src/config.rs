use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EconnError, Result};

/// Default time to wait for a SETUP answer (or UPDATE answer)
pub const DEFAULT_TIMEOUT_SETUP_MS: u64 = 60_000;

/// Default time to wait for the data channel after answering, and for a HANGUP response
pub const DEFAULT_TIMEOUT_TERM_MS: u64 = 5_000;

/// Timer configuration for an [`Econn`](crate::Econn)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EconnConfig {
    /// Setup timeout in milliseconds
    pub timeout_setup_ms: u64,
    /// Term timeout in milliseconds
    pub timeout_term_ms: u64,
}

impl Default for EconnConfig {
    fn default() -> Self {
        Self {
            timeout_setup_ms: DEFAULT_TIMEOUT_SETUP_MS,
            timeout_term_ms: DEFAULT_TIMEOUT_TERM_MS,
        }
    }
}

impl EconnConfig {
    pub fn timeout_setup(&self) -> Duration {
        Duration::from_millis(self.timeout_setup_ms)
    }

    pub fn timeout_term(&self) -> Duration {
        Duration::from_millis(self.timeout_term_ms)
    }

    /// Reject timer values the state machine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.timeout_setup_ms == 0 {
            return Err(EconnError::Config("timeout_setup_ms must be non-zero".into()));
        }
        if self.timeout_term_ms == 0 {
            return Err(EconnError::Config("timeout_term_ms must be non-zero".into()));
        }
        Ok(())
    }
}
