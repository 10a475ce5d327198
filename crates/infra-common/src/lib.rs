//! # AVS Infra Common
//!
//! Shared infrastructure for the AVS call signaling crates.
//!
//! At the moment this is the logging bootstrap used by binaries, examples and
//! integration tests so that every crate in the workspace emits `tracing`
//! output through the same subscriber configuration.

pub mod errors;
pub mod logging;

pub use errors::{Error, Result};
pub use logging::{LoggingConfig, parse_log_level, setup_logging, setup_test_logging};
