//! Logging bootstrap

mod setup;

pub use setup::{LoggingConfig, parse_log_level, setup_logging, setup_test_logging};
