//! # AVS Call Core
//!
//! Call control on top of the [`avs_econn_core`] signaling machine.
//!
//! ## Overview
//!
//! - [`controller`]: one controller per conversation. [`DirectCall`] drives a
//!   1:1 call (forking across the callee's devices, glare, our own devices
//!   answering elsewhere); [`GroupCall`] keeps a roster of a conference.
//! - [`media`] and [`transport`]: the seams to the outside. The engine never
//!   touches a socket or a codec; it calls a [`Transport`] to hand messages
//!   to the backend and allocates [`MediaFlow`]s from a [`MediaSystem`].
//! - [`engine`]: the event loop. A single task owns all controllers and
//!   serializes commands, inbound messages, media events and timers.
//! - [`handler`]: application callbacks for [`CallEvent`]s.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use avs_call_core::{CallConfig, CallEngine, ChannelHandler, ConversationKind};
//! use avs_call_core::{MediaSystem, Transport};
//! use avs_econn_core::Identity;
//!
//! # async fn run(transport: Arc<dyn Transport>, media: Arc<dyn MediaSystem>) -> avs_call_core::Result<()> {
//! let (handler, mut events) = ChannelHandler::new();
//! let (engine, _task) = CallEngine::spawn(
//!     CallConfig::default(),
//!     Identity::new("alice", "a1"),
//!     transport,
//!     media,
//!     Arc::new(handler),
//! )?;
//!
//! engine.start_call("conv-1", ConversationKind::OneToOne, false).await?;
//! while let Some(event) = events.recv().await {
//!     println!("{}: {}", event.convid(), event.name());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod events;
pub mod handler;
pub mod media;
pub mod transport;

pub use config::{CallConfig, GroupConfig, TurnServer};
pub use controller::{
    CallContext, CallController, DirectCall, GroupCall, Inbound, Membership, Participant, Roster,
};
pub use engine::{CallEngine, EngineHandle};
pub use error::{CallError, Result};
pub use events::{CallClosed, CallEvent, CallState, ConversationKind, LeaveReason, VideoState};
pub use handler::{CallHandler, ChannelHandler};
pub use media::{
    MediaError, MediaEvent, MediaEventSink, MediaFlow, MediaNotification, MediaSystem, SdpKind,
    SdpOutcome,
};
pub use transport::{Destination, Envelope, Transport, TransportError};
