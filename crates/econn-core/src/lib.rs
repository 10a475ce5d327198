//! # AVS Econn Core
//!
//! The per-peer call signaling layer of the AVS stack.
//!
//! ## Overview
//!
//! - [`message`]: the [`SignalingMessage`] model, ordered [`Props`] and the
//!   JSON wire codec used both by the backend relay and by the peer data
//!   channel.
//! - [`econn`]: the [`Econn`] state machine. One instance exists per
//!   (local device, remote device) relationship inside a call attempt.
//!
//! ## Driving an Econn
//!
//! An [`Econn`] performs no I/O. Every operation mutates the machine and
//! queues [`EconnAction`]s (messages to send, notifications for the owner)
//! which the owner drains with [`Econn::poll_action`]. Timers are plain
//! deadlines owned by the machine: the owner asks for the next deadline with
//! [`Econn::poll_timeout`] and reports expiry with [`Econn::handle_timeout`].
//!
//! ```rust
//! use std::time::Instant;
//! use avs_econn_core::{Econn, EconnAction, EconnConfig, EconnState, Identity, Props};
//!
//! let now = Instant::now();
//! let mut econn = Econn::new(EconnConfig::default(), Identity::new("alice", "a1"));
//! econn.start(now, "v=0".to_string(), Props::new()).unwrap();
//! assert_eq!(econn.state(), EconnState::PendingOutgoing);
//!
//! // the SETUP request is waiting for the transport
//! assert!(matches!(econn.poll_action(), Some(EconnAction::Send(_))));
//! ```

pub mod config;
pub mod econn;
pub mod error;
pub mod identity;
pub mod message;

pub use config::EconnConfig;
pub use econn::{
    CloseReason, Conflict, Direction, Econn, EconnAction, EconnEvent, EconnState, Timer, earliest,
    is_creator, is_winner, new_session_id,
};
pub use error::{EconnError, Result};
pub use identity::Identity;
pub use message::{
    DecodeError, EncodeError, MESSAGE_TIME_UNKNOWN, MessageKind, MessageTiming, Props, Route,
    SignalingMessage, decode, encode,
};
