//! Signaling event loop
//!
//! One task owns every call controller. Application commands, inbound
//! messages, media events and timer expiries are serialized onto it, so
//! controllers never need locks. Events produced by the controllers are
//! delivered to the [`CallHandler`] after each input.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use avs_econn_core::{Identity, MessageKind, SignalingMessage, decode, is_creator};

use crate::config::CallConfig;
use crate::controller::{CallContext, CallController, DirectCall, GroupCall, Inbound};
use crate::error::{CallError, Result};
use crate::events::{CallEvent, CallState, ConversationKind};
use crate::handler::CallHandler;
use crate::media::{MediaNotification, MediaSystem};
use crate::transport::Transport;

const COMMAND_QUEUE_SIZE: usize = 256;

/// How long an ended session is remembered to drop redelivered offers
const CLOSED_SESSION_TTL: Duration = Duration::from_secs(300);
/// Cap on remembered conversations; the oldest is forgotten first
const CLOSED_SESSION_LIMIT: usize = 256;

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

type Reply<T> = oneshot::Sender<T>;

/// Remote session ids of recently finished calls, per conversation
#[derive(Debug, Default)]
struct ClosedSessions {
    entries: IndexMap<String, (std::time::Instant, Vec<String>)>,
}

impl ClosedSessions {
    fn remember(&mut self, convid: &str, sessions: &[String], now: std::time::Instant) {
        self.expire(now);
        if sessions.is_empty() {
            return;
        }
        let mut ids = self
            .entries
            .shift_remove(convid)
            .map(|(_, ids)| ids)
            .unwrap_or_default();
        ids.extend(sessions.iter().map(|id| id.to_ascii_lowercase()));
        self.entries.insert(convid.to_string(), (now, ids));

        while self.entries.len() > CLOSED_SESSION_LIMIT {
            self.entries.shift_remove_index(0);
        }
    }

    fn contains(&mut self, convid: &str, session_id: &str, now: std::time::Instant) -> bool {
        self.expire(now);
        self.entries
            .get(convid)
            .is_some_and(|(_, ids)| ids.iter().any(|id| id.eq_ignore_ascii_case(session_id)))
    }

    /// Entries are kept in insertion order, so expired ones sit at the front
    fn expire(&mut self, now: std::time::Instant) {
        while let Some((_, (at, _))) = self.entries.first() {
            if now.saturating_duration_since(*at) < CLOSED_SESSION_TTL {
                break;
            }
            self.entries.shift_remove_index(0);
        }
    }
}

enum Command {
    Start {
        convid: String,
        kind: ConversationKind,
        video: bool,
        reply: Reply<Result<()>>,
    },
    Answer {
        convid: String,
        video: bool,
        reply: Reply<Result<()>>,
    },
    End {
        convid: String,
        reply: Reply<Result<()>>,
    },
    Reject {
        convid: String,
        reply: Reply<Result<()>>,
    },
    MediaStart {
        convid: String,
        reply: Reply<Result<()>>,
    },
    SetVideoSend {
        convid: String,
        active: bool,
        reply: Reply<Result<()>>,
    },
    Restart {
        convid: String,
        reply: Reply<Result<()>>,
    },
    Recv {
        convid: String,
        curr_time: u32,
        msg_time: u32,
        sender: Identity,
        message: SignalingMessage,
    },
    SendFailure {
        convid: String,
        session_id: String,
        error: String,
    },
    State {
        convid: String,
        reply: Reply<Option<CallState>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Owner of all calls of one local device
pub struct CallEngine {
    ctx: CallContext,
    handler: Arc<dyn CallHandler>,
    calls: IndexMap<String, Box<dyn CallController>>,
    closed_sessions: ClosedSessions,
    commands: mpsc::Receiver<Command>,
    media_events: mpsc::UnboundedReceiver<MediaNotification>,
}

/// Cloneable handle for driving a [`CallEngine`]
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl CallEngine {
    pub fn new(
        config: CallConfig,
        local: Identity,
        transport: Arc<dyn Transport>,
        media: Arc<dyn MediaSystem>,
        handler: Arc<dyn CallHandler>,
    ) -> Result<(Self, EngineHandle)> {
        config.validate()?;

        let (tx, commands) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let (media_tx, media_events) = mpsc::unbounded_channel();
        let ctx = CallContext {
            config: Arc::new(config),
            local,
            transport,
            media,
            media_events: media_tx,
        };

        let engine = Self {
            ctx,
            handler,
            calls: IndexMap::new(),
            closed_sessions: ClosedSessions::default(),
            commands,
            media_events,
        };
        Ok((engine, EngineHandle { tx }))
    }

    /// Create an engine and run it on a new task
    pub fn spawn(
        config: CallConfig,
        local: Identity,
        transport: Arc<dyn Transport>,
        media: Arc<dyn MediaSystem>,
        handler: Arc<dyn CallHandler>,
    ) -> Result<(EngineHandle, JoinHandle<()>)> {
        let (engine, handle) = Self::new(config, local, transport, media, handler)?;
        Ok((handle, tokio::spawn(engine.run())))
    }

    /// Process inputs until shut down or every handle is dropped
    pub async fn run(mut self) {
        info!("Call engine for {} running", self.ctx.local.anon());

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(notification) = self.media_events.recv() => self.handle_media(notification),
                _ = sleep_until(deadline) => self.handle_timeouts(),
            }
            self.dispatch_events().await;
        }

        info!("Call engine for {} stopped", self.ctx.local.anon());
    }

    fn next_deadline(&self) -> Option<std::time::Instant> {
        self.calls.values().filter_map(|call| call.poll_timeout()).min()
    }

    fn call_mut(&mut self, convid: &str) -> Result<&mut Box<dyn CallController>> {
        self.calls
            .get_mut(convid)
            .ok_or_else(|| CallError::NotFound(convid.to_string()))
    }

    fn create_call(ctx: &CallContext, convid: &str, kind: ConversationKind) -> Box<dyn CallController> {
        debug!("conv {}: new {:?} call", convid, kind);
        match kind {
            ConversationKind::OneToOne => Box::new(DirectCall::new(ctx.clone(), convid)),
            ConversationKind::Group => Box::new(GroupCall::new(ctx.clone(), convid)),
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                convid,
                kind,
                video,
                reply,
            } => {
                let _ = reply.send(self.start_call(&convid, kind, video));
            }
            Command::Answer {
                convid,
                video,
                reply,
            } => {
                let result = self
                    .call_mut(&convid)
                    .and_then(|call| call.answer(now(), video));
                let _ = reply.send(result);
            }
            Command::End { convid, reply } => {
                let result = self.call_mut(&convid).map(|call| call.end(now()));
                let _ = reply.send(result);
            }
            Command::Reject { convid, reply } => {
                let result = self.call_mut(&convid).and_then(|call| call.reject(now()));
                let _ = reply.send(result);
            }
            Command::MediaStart { convid, reply } => {
                let result = self
                    .call_mut(&convid)
                    .and_then(|call| call.media_start(now()));
                let _ = reply.send(result);
            }
            Command::SetVideoSend {
                convid,
                active,
                reply,
            } => {
                let result = self
                    .call_mut(&convid)
                    .and_then(|call| call.set_video_send(now(), active));
                let _ = reply.send(result);
            }
            Command::Restart { convid, reply } => {
                let result = self.call_mut(&convid).and_then(|call| call.restart(now()));
                let _ = reply.send(result);
            }
            Command::Recv {
                convid,
                curr_time,
                msg_time,
                sender,
                message,
            } => self.recv_message(&convid, curr_time, msg_time, &sender, &message),
            Command::SendFailure {
                convid,
                session_id,
                error,
            } => match self.calls.get_mut(&convid) {
                Some(call) => call.handle_send_failure(now(), &session_id, &error),
                None => debug!("conv {}: send failure for unknown call", convid),
            },
            Command::State { convid, reply } => {
                let _ = reply.send(self.calls.get(&convid).map(|call| call.state()));
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn start_call(&mut self, convid: &str, kind: ConversationKind, video: bool) -> Result<()> {
        let created = !self.calls.contains_key(convid);
        let ctx = &self.ctx;
        let call = self
            .calls
            .entry(convid.to_string())
            .or_insert_with(|| Self::create_call(ctx, convid, kind));

        if call.kind() != kind {
            return Err(CallError::invalid_state("start", call.state()));
        }
        let result = call.start(now(), video);
        if result.is_err() && created {
            self.calls.shift_remove(convid);
        }
        result
    }

    fn recv_message(
        &mut self,
        convid: &str,
        curr_time: u32,
        msg_time: u32,
        sender: &Identity,
        message: &SignalingMessage,
    ) {
        if !self.calls.contains_key(convid) {
            if message.kind == MessageKind::Setup
                && self
                    .closed_sessions
                    .contains(convid, &message.session_id, now())
            {
                debug!(
                    "conv {}: {} from {} belongs to an ended call, dropping",
                    convid,
                    message.brief(),
                    sender.anon()
                );
                return;
            }
            let local = &self.ctx.local;
            let kind = match message.kind {
                MessageKind::Setup
                    if is_creator(local, sender, message) && !sender.same_user(local) =>
                {
                    ConversationKind::OneToOne
                }
                MessageKind::GroupStart | MessageKind::GroupCheck if !sender.matches(local) => {
                    ConversationKind::Group
                }
                _ => {
                    debug!(
                        "conv {}: no call for {} from {}",
                        convid,
                        message.brief(),
                        sender.anon()
                    );
                    return;
                }
            };
            let call = Self::create_call(&self.ctx, convid, kind);
            self.calls.insert(convid.to_string(), call);
        }

        if let Some(call) = self.calls.get_mut(convid) {
            let inbound = Inbound {
                curr_time,
                msg_time,
                sender,
                message,
            };
            call.recv_message(now(), inbound);
        }
    }

    fn handle_media(&mut self, notification: MediaNotification) {
        let MediaNotification {
            convid,
            flow_id,
            event,
        } = notification;
        match self.calls.get_mut(&convid) {
            Some(call) => call.handle_media_event(now(), flow_id, event),
            None => debug!("conv {}: media event for unknown call", convid),
        }
    }

    fn handle_timeouts(&mut self) {
        let now = now();
        for call in self.calls.values_mut() {
            if call.poll_timeout().is_some_and(|deadline| deadline <= now) {
                call.handle_timeout(now);
            }
        }
    }

    /// Deliver pending events, then forget finished calls
    async fn dispatch_events(&mut self) {
        let mut events: Vec<CallEvent> = Vec::new();
        for call in self.calls.values_mut() {
            while let Some(event) = call.poll_event() {
                events.push(event);
            }
        }
        let finished: Vec<String> = self
            .calls
            .iter()
            .filter(|(_, call)| call.is_finished())
            .map(|(convid, _)| convid.clone())
            .collect();
        let now = now();
        for convid in finished {
            if let Some(call) = self.calls.shift_remove(&convid) {
                debug!("conv {}: call finished", convid);
                self.closed_sessions
                    .remember(&convid, call.ended_sessions(), now);
            }
        }

        for event in events {
            debug!("conv {}: delivering {}", event.convid(), event.name());
            self.handler.on_event(event).await;
        }
    }

    async fn shutdown(&mut self) {
        if !self.calls.is_empty() {
            info!("Ending {} call(s) on shutdown", self.calls.len());
        }
        let now = now();
        for call in self.calls.values_mut() {
            call.end(now);
        }
        self.dispatch_events().await;
        self.calls.clear();
    }
}

impl EngineHandle {
    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .await
            .map_err(|_| CallError::EngineStopped)?;
        rx.await.map_err(|_| CallError::EngineStopped)
    }

    async fn post(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| CallError::EngineStopped)
    }

    pub async fn start_call(
        &self,
        convid: impl Into<String>,
        kind: ConversationKind,
        video: bool,
    ) -> Result<()> {
        let convid = convid.into();
        self.request(|reply| Command::Start {
            convid,
            kind,
            video,
            reply,
        })
        .await?
    }

    pub async fn answer_call(&self, convid: impl Into<String>, video: bool) -> Result<()> {
        let convid = convid.into();
        self.request(|reply| Command::Answer {
            convid,
            video,
            reply,
        })
        .await?
    }

    pub async fn end_call(&self, convid: impl Into<String>) -> Result<()> {
        let convid = convid.into();
        self.request(|reply| Command::End { convid, reply }).await?
    }

    pub async fn reject_call(&self, convid: impl Into<String>) -> Result<()> {
        let convid = convid.into();
        self.request(|reply| Command::Reject { convid, reply }).await?
    }

    pub async fn media_start(&self, convid: impl Into<String>) -> Result<()> {
        let convid = convid.into();
        self.request(|reply| Command::MediaStart { convid, reply })
            .await?
    }

    pub async fn set_video_send(&self, convid: impl Into<String>, active: bool) -> Result<()> {
        let convid = convid.into();
        self.request(|reply| Command::SetVideoSend {
            convid,
            active,
            reply,
        })
        .await?
    }

    pub async fn restart_call(&self, convid: impl Into<String>) -> Result<()> {
        let convid = convid.into();
        self.request(|reply| Command::Restart { convid, reply }).await?
    }

    /// Current state of the call in `convid`, if there is one
    pub async fn call_state(&self, convid: impl Into<String>) -> Result<Option<CallState>> {
        let convid = convid.into();
        self.request(|reply| Command::State { convid, reply }).await
    }

    /// Feed a message delivered by the backend
    pub async fn recv_message(
        &self,
        convid: impl Into<String>,
        curr_time: u32,
        msg_time: u32,
        sender: Identity,
        message: SignalingMessage,
    ) -> Result<()> {
        self.post(Command::Recv {
            convid: convid.into(),
            curr_time,
            msg_time,
            sender,
            message,
        })
        .await
    }

    /// Feed an encoded message; undecodable input is dropped
    pub async fn recv_encoded(
        &self,
        convid: impl Into<String>,
        curr_time: u32,
        msg_time: u32,
        sender: Identity,
        payload: &[u8],
    ) -> Result<()> {
        let convid = convid.into();
        let message = decode(payload).map_err(|e| {
            warn!("conv {}: dropping message from {}: {}", convid, sender.anon(), e);
            CallError::from(e)
        })?;
        self.recv_message(convid, curr_time, msg_time, sender, message)
            .await
    }

    /// The transport failed to deliver a message of `session_id`
    pub async fn report_send_failure(
        &self,
        convid: impl Into<String>,
        session_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Result<()> {
        self.post(Command::SendFailure {
            convid: convid.into(),
            session_id: session_id.into(),
            error: error.into(),
        })
        .await
    }

    /// End every call and stop the engine
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}
