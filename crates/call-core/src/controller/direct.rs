//! 1:1 call controller
//!
//! Drives one Econn against the media flow of a two-party conversation:
//!
//! - forking: an outgoing SETUP is fanned out to every device of the callee;
//!   the first SETUP response binds the session to that device and any later
//!   answer from a sibling device is cancelled explicitly,
//! - our own user's other devices: their answer or reject stops our ringing,
//! - media: the call counts as established only once the SETUP exchange has
//!   completed *and* the flow reports media,
//! - in-call signaling (HANGUP, PROPSYNC) goes over the flow's data channel.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, info, warn};

use avs_econn_core::message::{PROP_AUDIO_CBR, PROP_SCREEN_SEND, PROP_VIDEO_SEND};
use avs_econn_core::{
    CloseReason, Conflict, Direction, Econn, EconnAction, EconnEvent, EconnState, Identity,
    MESSAGE_TIME_UNKNOWN, MessageKind, MessageTiming, Props, Route, SignalingMessage, Timer,
    decode, earliest, encode, is_creator,
};

use super::{CallContext, CallController, Inbound};
use crate::error::{CallError, Result};
use crate::events::{CallClosed, CallEvent, CallState, ConversationKind, VideoState};
use crate::media::{MediaError, MediaEvent, MediaEventSink, MediaFlow, SdpKind, SdpOutcome};
use crate::transport::Destination;

/// Where an Econn sits in the session map
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SessionKey {
    /// Outgoing, no device has answered yet
    Fanout,
    /// Bound to one remote device, `userid.clientid`
    Peer(String),
}

/// Local description waiting for candidate gathering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingSdp {
    None,
    Offer,
    Answer,
    UpdateOffer,
    UpdateAnswer,
}

#[derive(Debug, Default)]
struct CallTimes {
    started: Option<Instant>,
    answered: Option<Instant>,
    established: Option<Instant>,
}

#[derive(Serialize)]
struct CallMetrics<'a> {
    convid: &'a str,
    direction: String,
    reason: &'static str,
    answered: bool,
    conflict: &'static str,
    setup_ms: Option<u64>,
    establish_ms: Option<u64>,
    ended_at: DateTime<Utc>,
}

/// Call controller of a 1:1 conversation.
///
/// Holds at most one live Econn: a second device calling while a session
/// is running is dropped.
pub struct DirectCall {
    ctx: CallContext,
    convid: String,
    sessions: IndexMap<SessionKey, Econn>,

    flow: Option<Box<dyn MediaFlow>>,
    /// Id of `flow`; events tagged with another id are stale
    flow_id: u64,
    pending_sdp: PendingSdp,

    props_local: Props,
    remote: Option<Identity>,
    direction: Direction,
    conflict: Conflict,

    answered: bool,
    /// A sibling device answered too; its CANCEL means we lost
    answered_elsewhere: bool,
    media_established: bool,
    established_notified: bool,
    media_started: bool,
    datachan_open: bool,
    remote_video: VideoState,
    audio_cbr: bool,
    media_start_timer: Timer,

    times: CallTimes,
    events: VecDeque<CallEvent>,
    closed: bool,
    ended_sessions: Vec<String>,
}

impl DirectCall {
    pub fn new(ctx: CallContext, convid: impl Into<String>) -> Self {
        let mut props_local = Props::new();
        props_local.set_bool(PROP_VIDEO_SEND, false);
        props_local.set_bool(PROP_AUDIO_CBR, ctx.config.audio_cbr);

        Self {
            ctx,
            convid: convid.into(),
            sessions: IndexMap::new(),
            flow: None,
            flow_id: 0,
            pending_sdp: PendingSdp::None,
            props_local,
            remote: None,
            direction: Direction::Unknown,
            conflict: Conflict::None,
            answered: false,
            answered_elsewhere: false,
            media_established: false,
            established_notified: false,
            media_started: false,
            datachan_open: false,
            remote_video: VideoState::Stopped,
            audio_cbr: false,
            media_start_timer: Timer::new("media-start"),
            times: CallTimes::default(),
            events: VecDeque::new(),
            closed: false,
            ended_sessions: Vec::new(),
        }
    }

    /// The live session, if any
    pub fn econn(&self) -> Option<&Econn> {
        self.sessions.values().next()
    }

    pub fn props_local(&self) -> &Props {
        &self.props_local
    }

    fn econn_mut(&mut self) -> Option<&mut Econn> {
        self.sessions.values_mut().next()
    }

    fn key_for(&self, sender: &Identity) -> Option<SessionKey> {
        self.sessions
            .iter()
            .find(|(_, econn)| econn.remote().is_none_or(|r| r.matches(sender)))
            .map(|(key, _)| key.clone())
    }

    fn push_event(&mut self, event: CallEvent) {
        debug!("conv {}: event {}", self.convid, event.name());
        self.events.push_back(event);
    }

    fn flow_op<T>(
        &mut self,
        op: impl FnOnce(&mut dyn MediaFlow) -> std::result::Result<T, MediaError>,
    ) -> std::result::Result<T, MediaError> {
        match self.flow.as_deref_mut() {
            Some(flow) => op(flow),
            None => Err(MediaError::Unavailable("no media flow".into())),
        }
    }

    /// Replace the media flow with a fresh one
    fn alloc_flow(&mut self) -> Result<()> {
        let flow_id = self.flow_id + 1;
        let sink = MediaEventSink::new(self.convid.clone(), flow_id, self.ctx.media_events.clone());
        let mut flow = self
            .ctx
            .media
            .alloc_flow(&self.convid, ConversationKind::OneToOne, sink)
            .map_err(|e| CallError::MediaInit(e.to_string()))?;

        let prepared = self
            .ctx
            .config
            .turn_servers
            .iter()
            .try_for_each(|server| flow.add_turn_server(server))
            .and_then(|()| flow.gather_candidates());
        if let Err(e) = prepared {
            flow.close();
            return Err(CallError::MediaInit(e.to_string()));
        }
        flow.set_video_send(self.props_local.get_bool(PROP_VIDEO_SEND) == Some(true));

        if let Some(mut old) = self.flow.replace(flow) {
            debug!("conv {}: replacing media flow {}", self.convid, self.flow_id);
            old.close();
        }
        self.flow_id = flow_id;
        self.media_established = false;
        self.datachan_open = false;
        Ok(())
    }

    /// Drain every Econn's actions until none are left
    fn pump(&mut self, now: Instant) {
        loop {
            let mut batch = Vec::new();
            for (key, econn) in self.sessions.iter_mut() {
                while let Some(action) = econn.poll_action() {
                    batch.push((key.clone(), action));
                }
            }
            if batch.is_empty() {
                break;
            }

            for (key, action) in batch {
                match action {
                    EconnAction::Send(msg) => self.send_econn_message(&key, msg),
                    EconnAction::Notify(event) => self.handle_econn_event(now, &key, event),
                }
            }
        }

        let ended = &mut self.ended_sessions;
        self.sessions.retain(|_, econn| {
            if !econn.state().is_terminal() {
                return true;
            }
            if let Some(remote_session) = econn.remote_session_id() {
                ended.push(remote_session.to_string());
            }
            false
        });

        // bind the fanned-out session to the device that answered
        let answered_by = self
            .sessions
            .get(&SessionKey::Fanout)
            .and_then(|econn| econn.remote())
            .map(Identity::key);
        if let Some(peer) = answered_by {
            if let Some(econn) = self.sessions.shift_remove(&SessionKey::Fanout) {
                self.sessions.insert(SessionKey::Peer(peer), econn);
            }
        }
    }

    fn send_econn_message(&mut self, key: &SessionKey, msg: SignalingMessage) {
        if msg.kind.route() == Route::Direct {
            self.send_direct(key, msg);
            return;
        }

        // answers and cancels reach the whole conversation so that our
        // siblings and the callee's siblings learn about them
        let destination = match (msg.kind, self.sessions.get(key).and_then(|e| e.remote())) {
            (MessageKind::Update, Some(remote)) => Destination::Device(remote.clone()),
            _ => Destination::Conversation,
        };

        if let Err(e) = self.ctx.send(&self.convid, destination, msg) {
            if let Some(econn) = self.sessions.get_mut(key) {
                econn.transport_failed(e.to_string());
            }
        }
    }

    /// Data channel send; a failed send ends the session
    fn send_direct(&mut self, key: &SessionKey, msg: SignalingMessage) {
        let brief = msg.brief();
        let result = match encode(&msg) {
            Ok(bytes) => self.flow_op(|flow| flow.send_data(bytes)).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = result {
            warn!("conv {}: data channel send of {} failed: {}", self.convid, brief, e);
            if let Some(econn) = self.sessions.get_mut(key) {
                econn.transport_failed(e);
            }
        }
    }

    fn handle_econn_event(&mut self, now: Instant, key: &SessionKey, event: EconnEvent) {
        match event {
            EconnEvent::Incoming {
                remote,
                msg_time,
                age,
                sdp,
                props,
            } => self.on_incoming(now, remote, msg_time, age, sdp, props),
            EconnEvent::Answered { reset, sdp, props } => {
                self.on_answered(now, key, reset, sdp, props)
            }
            EconnEvent::UpdateRequest { sdp, props, .. } => {
                self.on_update_request(now, key, sdp, props)
            }
            EconnEvent::UpdateResponse { sdp, props } => {
                self.on_update_response(now, key, sdp, props)
            }
            EconnEvent::Propsync { props, is_response } => {
                self.on_propsync(key, props, is_response)
            }
            EconnEvent::DatachanEstablished => self.on_datachan_established(key),
            EconnEvent::Closed { reason, msg_time } => {
                self.on_session_closed(key, reason, msg_time)
            }
        }
    }

    fn on_incoming(
        &mut self,
        now: Instant,
        remote: Identity,
        msg_time: u32,
        age: u32,
        sdp: String,
        props: Props,
    ) {
        info!(
            "conv {}: incoming call from {} (age={}s)",
            self.convid,
            remote.anon(),
            age
        );
        self.remote = Some(remote.clone());

        if let Err(e) = self.alloc_flow() {
            warn!("conv {}: cannot ring: {}", self.convid, e);
            self.fail_active(now, CloseReason::MediaUnavailable(e.to_string()));
            return;
        }
        if let Err(e) = self.flow_op(|flow| flow.set_remote_description(SdpKind::Offer, &sdp)) {
            self.fail_active(now, CloseReason::MediaFailed(e.to_string()));
            return;
        }

        let should_ring = Duration::from_secs(age.into()) < self.ctx.config.should_ring_timeout();
        self.push_event(CallEvent::Incoming {
            convid: self.convid.clone(),
            msg_time,
            userid: remote.userid,
            clientid: remote.clientid,
            video: props.get_bool(PROP_VIDEO_SEND) == Some(true),
            should_ring,
        });
    }

    fn on_answered(&mut self, now: Instant, key: &SessionKey, reset: bool, sdp: String, props: Props) {
        if let Some(remote) = self.sessions.get(key).and_then(|e| e.remote()) {
            self.remote = Some(remote.clone());
        }

        if reset {
            info!("conv {}: lost call conflict, answering remote offer", self.convid);
            let outcome = self.flow_op(|flow| {
                flow.reset()?;
                flow.set_remote_description(SdpKind::Offer, &sdp)?;
                flow.create_answer()
            });
            match outcome {
                Ok(SdpOutcome::Ready(answer)) => self.send_answer(now, answer),
                Ok(SdpOutcome::Gathering) => self.pending_sdp = PendingSdp::Answer,
                Err(e) => self.fail_active(now, CloseReason::MediaFailed(e.to_string())),
            }
            return;
        }

        if let Err(e) = self.flow_op(|flow| flow.set_remote_description(SdpKind::Answer, &sdp)) {
            self.fail_active(now, CloseReason::MediaFailed(e.to_string()));
            return;
        }
        self.on_remote_props(&props);
        self.mark_answered(now);
    }

    fn on_update_request(&mut self, now: Instant, key: &SessionKey, sdp: String, props: Props) {
        info!("conv {}: remote restarted media", self.convid);
        if let Err(e) = self.alloc_flow() {
            self.fail_active(now, CloseReason::MediaUnavailable(e.to_string()));
            return;
        }
        let outcome = self.flow_op(|flow| {
            flow.set_remote_description(SdpKind::Offer, &sdp)?;
            flow.create_answer()
        });
        match outcome {
            Ok(SdpOutcome::Ready(answer)) => self.send_update_answer(now, key, answer),
            Ok(SdpOutcome::Gathering) => self.pending_sdp = PendingSdp::UpdateAnswer,
            Err(e) => self.fail_active(now, CloseReason::MediaFailed(e.to_string())),
        }
        self.on_remote_props(&props);
    }

    fn on_update_response(&mut self, now: Instant, key: &SessionKey, sdp: String, props: Props) {
        if let Err(e) = self.flow_op(|flow| flow.set_remote_description(SdpKind::Answer, &sdp)) {
            self.fail_active(now, CloseReason::MediaFailed(e.to_string()));
            return;
        }
        self.on_remote_props(&props);
        self.resume_datachan(key);
    }

    fn on_propsync(&mut self, key: &SessionKey, props: Props, is_response: bool) {
        self.on_remote_props(&props);
        if is_response {
            return;
        }
        let local = self.props_local.clone();
        if let Some(econn) = self.sessions.get_mut(key) {
            if let Err(e) = econn.send_propsync(true, local) {
                debug!("conv {}: propsync reply not sent: {}", self.convid, e);
            }
        }
    }

    fn on_datachan_established(&mut self, key: &SessionKey) {
        let local = self.props_local.clone();
        if let Some(econn) = self.sessions.get_mut(key) {
            if let Err(e) = econn.send_propsync(false, local) {
                debug!("conv {}: propsync not sent: {}", self.convid, e);
            }
        }

        let (userid, clientid) = self.remote_names();
        self.push_event(CallEvent::DatachannelEstablished {
            convid: self.convid.clone(),
            userid: userid.unwrap_or_default(),
            clientid: clientid.unwrap_or_default(),
        });
    }

    fn on_session_closed(&mut self, key: &SessionKey, reason: CloseReason, msg_time: u32) {
        if let Some(econn) = self.sessions.get(key) {
            self.conflict = econn.conflict();
            if let Some(remote) = econn.remote() {
                self.remote = Some(remote.clone());
            }
        }
        let reason = match reason {
            CloseReason::Canceled if self.answered_elsewhere => CloseReason::AnsweredElsewhere,
            reason => reason,
        };
        self.close_call(reason, msg_time);
    }

    fn on_remote_props(&mut self, props: &Props) {
        let video = if props.get_bool(PROP_SCREEN_SEND) == Some(true) {
            VideoState::ScreenShare
        } else if props.get_bool(PROP_VIDEO_SEND) == Some(true) {
            VideoState::Started
        } else {
            VideoState::Stopped
        };
        if video != self.remote_video {
            self.remote_video = video;
            let (userid, clientid) = self.remote_names();
            self.push_event(CallEvent::VideoState {
                convid: self.convid.clone(),
                userid: userid.unwrap_or_default(),
                clientid: clientid.unwrap_or_default(),
                state: video,
            });
        }

        let cbr = self.props_local.get_bool(PROP_AUDIO_CBR) == Some(true)
            && props.get_bool(PROP_AUDIO_CBR) == Some(true);
        if cbr != self.audio_cbr {
            self.audio_cbr = cbr;
            self.push_event(CallEvent::AudioCbr {
                convid: self.convid.clone(),
                enabled: cbr,
            });
        }
    }

    fn remote_names(&self) -> (Option<String>, Option<String>) {
        match &self.remote {
            Some(remote) => (Some(remote.userid.clone()), Some(remote.clientid.clone())),
            None => (None, None),
        }
    }

    fn send_offer(&mut self, now: Instant, sdp: String) {
        let props = self.props_local.clone();
        if let Some(econn) = self.econn_mut() {
            if let Err(e) = econn.start(now, sdp, props) {
                debug!("offer not sent: {}", e);
            }
        }
    }

    fn send_answer(&mut self, now: Instant, sdp: String) {
        let props = self.props_local.clone();
        let result = match self.econn_mut() {
            Some(econn) => econn.answer(now, sdp, props),
            None => return,
        };
        match result {
            Ok(()) => self.mark_answered(now),
            Err(e) => warn!("conv {}: answer not sent: {}", self.convid, e),
        }
    }

    fn send_update_offer(&mut self, now: Instant, sdp: String) {
        let props = self.props_local.clone();
        if let Some(econn) = self.econn_mut() {
            if let Err(e) = econn.update_request(now, sdp, props) {
                warn!("update not sent: {}", e);
            }
        }
    }

    fn send_update_answer(&mut self, now: Instant, key: &SessionKey, sdp: String) {
        let props = self.props_local.clone();
        let Some(econn) = self.sessions.get_mut(key) else {
            return;
        };
        if let Err(e) = econn.update_response(now, sdp, props) {
            warn!("update answer not sent: {}", e);
            return;
        }
        self.resume_datachan(key);
    }

    /// After renegotiation, re-enter established if the channel is already up
    fn resume_datachan(&mut self, key: &SessionKey) {
        if !self.datachan_open {
            return;
        }
        if let Some(econn) = self.sessions.get_mut(key) {
            if econn.state() == EconnState::Answered {
                econn.set_datachan_established();
            }
        }
    }

    fn mark_answered(&mut self, now: Instant) {
        if self.answered {
            return;
        }
        self.answered = true;
        self.times.answered = Some(now);
        if self.direction == Direction::Outgoing {
            self.push_event(CallEvent::Answered {
                convid: self.convid.clone(),
            });
        }
        self.check_established(now);
    }

    fn check_established(&mut self, now: Instant) {
        if !(self.answered && self.media_established) {
            return;
        }
        if self.established_notified {
            // a restarted flow came up
            if self.media_started {
                self.start_media_now(now);
            }
            return;
        }

        self.established_notified = true;
        self.times.established = Some(now);
        let (userid, clientid) = self.remote_names();
        self.push_event(CallEvent::MediaEstablished {
            convid: self.convid.clone(),
            userid: userid.unwrap_or_default(),
            clientid: clientid.unwrap_or_default(),
        });

        if self.ctx.config.auto_media_start {
            self.start_media_now(now);
        } else {
            self.media_start_timer
                .arm(now, self.ctx.config.media_start_timeout());
        }
    }

    fn start_media_now(&mut self, now: Instant) {
        match self.flow_op(|flow| flow.start_media()) {
            Ok(()) => self.media_started = true,
            Err(e) => self.fail_active(now, CloseReason::MediaFailed(e.to_string())),
        }
    }

    /// End the live session with `reason`
    fn fail_active(&mut self, now: Instant, reason: CloseReason) {
        match self.econn_mut() {
            Some(econn) => {
                econn.set_error(reason);
                econn.end(now);
            }
            None => self.close_call(reason, MESSAGE_TIME_UNKNOWN),
        }
    }

    fn recv_from_own_device(&mut self, sender: &Identity, msg: &SignalingMessage, timing: MessageTiming) {
        let Some(state) = self.econn().map(Econn::state) else {
            debug!(
                "conv {}: ignoring {} from own device {}",
                self.convid,
                msg.brief(),
                sender.anon()
            );
            return;
        };

        match (msg.kind, msg.is_response, state) {
            (MessageKind::Setup, true, EconnState::PendingIncoming) => {
                info!("conv {}: answered on device {}", self.convid, sender.anon());
                self.close_session(CloseReason::AnsweredElsewhere, timing.msg_time);
            }
            (MessageKind::Reject, _, EconnState::PendingIncoming) => {
                info!("conv {}: rejected on device {}", self.convid, sender.anon());
                self.close_session(CloseReason::RejectedElsewhere, timing.msg_time);
            }
            (MessageKind::Setup, true, state) if state.is_answered() => {
                info!(
                    "conv {}: device {} answered as well",
                    self.convid,
                    sender.anon()
                );
                self.answered_elsewhere = true;
            }
            _ => debug!(
                "conv {}: ignoring {} from own device in state {}",
                self.convid,
                msg.brief(),
                state
            ),
        }
    }

    fn close_session(&mut self, reason: CloseReason, msg_time: u32) {
        if let Some(econn) = self.econn_mut() {
            econn.close(reason, msg_time);
        }
    }

    /// A sibling of the device we are bound to answered too late
    fn is_losing_fork(&self, sender: &Identity) -> bool {
        self.econn()
            .and_then(|econn| econn.remote())
            .is_some_and(|remote| remote.same_user(sender) && !remote.matches(sender))
    }

    fn cancel_fork(&mut self, sender: &Identity) {
        let Some(session_id) = self.econn().map(|e| e.session_id().to_string()) else {
            return;
        };
        info!(
            "conv {}: device {} lost the fork, canceling",
            self.convid,
            sender.anon()
        );

        let mut msg = SignalingMessage::cancel(session_id);
        msg.src_userid = Some(self.ctx.local.userid.clone());
        msg.src_clientid = Some(self.ctx.local.clientid.clone());
        msg.dest_userid = Some(sender.userid.clone());
        msg.dest_clientid = Some(sender.clientid.clone());
        if let Err(e) = self
            .ctx
            .send(&self.convid, Destination::Device(sender.clone()), msg)
        {
            debug!("conv {}: fork cancel not sent: {}", self.convid, e);
        }
    }

    fn on_ice_gathered(&mut self, now: Instant, sdp: String) {
        let pending = std::mem::replace(&mut self.pending_sdp, PendingSdp::None);
        debug!("conv {}: candidates gathered ({:?} pending)", self.convid, pending);
        match pending {
            PendingSdp::None => {}
            PendingSdp::Offer => self.send_offer(now, sdp),
            PendingSdp::Answer => self.send_answer(now, sdp),
            PendingSdp::UpdateOffer => self.send_update_offer(now, sdp),
            PendingSdp::UpdateAnswer => {
                if let Some(key) = self.sessions.keys().next().cloned() {
                    self.send_update_answer(now, &key, sdp);
                }
            }
        }
    }

    fn on_data_received(&mut self, now: Instant, data: &[u8]) {
        let msg = match decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("conv {}: bad data channel message: {}", self.convid, e);
                return;
            }
        };
        let Some(remote) = self.econn().and_then(|e| e.remote()).cloned() else {
            debug!("conv {}: data channel message without session", self.convid);
            return;
        };
        if let Some(econn) = self.econn_mut() {
            econn.recv_message(now, &remote, &msg, MessageTiming::unknown());
        }
    }

    fn close_call(&mut self, reason: CloseReason, msg_time: u32) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending_sdp = PendingSdp::None;
        self.media_start_timer.cancel();
        if let Some(mut flow) = self.flow.take() {
            flow.stop_media();
            flow.close();
        }

        info!("conv {}: call closed ({})", self.convid, reason);
        let metrics = self.metrics_json(&reason);
        let (userid, clientid) = self.remote_names();
        self.push_event(CallEvent::Closed(CallClosed {
            reason,
            convid: self.convid.clone(),
            msg_time,
            userid,
            clientid,
            metrics,
        }));
    }

    fn metrics_json(&self, reason: &CloseReason) -> String {
        let since_start = |at: Option<Instant>| match (self.times.started, at) {
            (Some(start), Some(at)) => {
                Some(u64::try_from(at.saturating_duration_since(start).as_millis()).unwrap_or(u64::MAX))
            }
            _ => None,
        };
        let metrics = CallMetrics {
            convid: &self.convid,
            direction: self.direction.to_string(),
            reason: reason.code(),
            answered: self.answered,
            conflict: self.conflict.name(),
            setup_ms: since_start(self.times.answered),
            establish_ms: since_start(self.times.established),
            ended_at: Utc::now(),
        };
        serde_json::to_string(&metrics).unwrap_or_else(|e| {
            warn!("conv {}: metrics not serialized: {}", self.convid, e);
            String::new()
        })
    }
}

impl CallController for DirectCall {
    fn convid(&self) -> &str {
        &self.convid
    }

    fn kind(&self) -> ConversationKind {
        ConversationKind::OneToOne
    }

    fn state(&self) -> CallState {
        if self.closed {
            return CallState::Terminating;
        }
        let Some(econn) = self.econn() else {
            return CallState::Idle;
        };
        match econn.state() {
            EconnState::Idle => CallState::Idle,
            EconnState::PendingOutgoing | EconnState::ConflictResolution => CallState::Outgoing,
            EconnState::PendingIncoming => CallState::Incoming,
            EconnState::Answered
            | EconnState::DatachanEstablished
            | EconnState::UpdateSent
            | EconnState::UpdateRecv => {
                if self.established_notified {
                    CallState::Active
                } else {
                    CallState::Answered
                }
            }
            EconnState::HangupSent | EconnState::HangupRecv | EconnState::Terminating => {
                CallState::Terminating
            }
        }
    }

    fn start(&mut self, now: Instant, video: bool) -> Result<()> {
        if self.closed {
            return Err(CallError::invalid_state("start", self.state()));
        }
        if !self.sessions.is_empty() {
            return Err(CallError::AlreadyInProgress(self.convid.clone()));
        }
        self.ctx.config.validate()?;

        info!("conv {}: starting call (video={})", self.convid, video);
        self.props_local.set_bool(PROP_VIDEO_SEND, video);
        self.alloc_flow()?;

        let mut econn = Econn::new(self.ctx.config.econn.clone(), self.ctx.local.clone());
        econn.begin_outgoing(now)?;
        self.sessions.insert(SessionKey::Fanout, econn);
        self.direction = Direction::Outgoing;
        self.times.started = Some(now);

        match self.flow_op(|flow| flow.create_offer()) {
            Ok(SdpOutcome::Ready(sdp)) => self.send_offer(now, sdp),
            Ok(SdpOutcome::Gathering) => self.pending_sdp = PendingSdp::Offer,
            Err(e) => {
                // nothing was sent yet; undo quietly
                self.sessions.clear();
                if let Some(mut flow) = self.flow.take() {
                    flow.close();
                }
                return Err(e.into());
            }
        }

        self.pump(now);
        Ok(())
    }

    fn answer(&mut self, now: Instant, video: bool) -> Result<()> {
        let pending = self.econn().map(Econn::state) == Some(EconnState::PendingIncoming);
        if !pending {
            return Err(CallError::invalid_state("answer", self.state()));
        }

        info!("conv {}: answering (video={})", self.convid, video);
        self.props_local.set_bool(PROP_VIDEO_SEND, video);
        let outcome = self.flow_op(|flow| {
            flow.set_video_send(video);
            flow.create_answer()
        })?;
        match outcome {
            SdpOutcome::Ready(sdp) => self.send_answer(now, sdp),
            SdpOutcome::Gathering => self.pending_sdp = PendingSdp::Answer,
        }

        self.pump(now);
        Ok(())
    }

    fn end(&mut self, now: Instant) {
        if self.closed {
            debug!("conv {}: end: already closed", self.convid);
            return;
        }
        match self.econn_mut() {
            Some(econn) => econn.end(now),
            None => debug!("conv {}: end: no session", self.convid),
        }
        self.pump(now);
    }

    fn reject(&mut self, now: Instant) -> Result<()> {
        let session_id = match self.econn() {
            Some(_) if self.closed => return Err(CallError::invalid_state("reject", self.state())),
            Some(econn) if econn.state() == EconnState::PendingIncoming => {
                econn.remote_session_id().unwrap_or_default().to_string()
            }
            Some(_) => {
                debug!("conv {}: reject: call not ringing, ending it", self.convid);
                self.end(now);
                return Ok(());
            }
            None => return Err(CallError::invalid_state("reject", self.state())),
        };

        info!("conv {}: rejecting call", self.convid);
        // stops the ringing on our other devices; the caller keeps ringing theirs
        let msg = SignalingMessage::new(MessageKind::Reject, session_id, false);
        let own_devices = Destination::User(self.ctx.local.userid.clone());
        if let Err(e) = self.ctx.send(&self.convid, own_devices, msg) {
            debug!("conv {}: reject not sent: {}", self.convid, e);
        }

        self.close_session(CloseReason::Normal, MESSAGE_TIME_UNKNOWN);
        self.pump(now);
        Ok(())
    }

    fn recv_message(&mut self, now: Instant, inbound: Inbound<'_>) {
        let Inbound {
            curr_time,
            msg_time,
            sender,
            message: msg,
        } = inbound;

        if self.closed {
            debug!("conv {}: closed, ignoring {}", self.convid, msg.brief());
            return;
        }
        let local = self.ctx.local.clone();
        if sender.matches(&local) {
            debug!("conv {}: ignoring own {}", self.convid, msg.brief());
            return;
        }
        let timing = MessageTiming::new(curr_time, msg_time);

        if sender.same_user(&local) {
            self.recv_from_own_device(sender, msg, timing);
            self.pump(now);
            return;
        }

        if msg.kind == MessageKind::Setup && msg.is_response && self.is_losing_fork(sender) {
            self.cancel_fork(sender);
            return;
        }

        let key = match self.key_for(sender) {
            Some(key) => key,
            None if self.sessions.is_empty() && is_creator(&local, sender, msg) => {
                let key = SessionKey::Peer(sender.key());
                let econn = Econn::new(self.ctx.config.econn.clone(), local);
                self.sessions.insert(key.clone(), econn);
                self.direction = Direction::Incoming;
                self.times.started = Some(now);
                key
            }
            None => {
                info!(
                    "conv {}: no session for {} from {}, dropping",
                    self.convid,
                    msg.brief(),
                    sender.anon()
                );
                return;
            }
        };

        if let Some(econn) = self.sessions.get_mut(&key) {
            econn.recv_message(now, sender, msg, timing);
        }
        self.pump(now);
    }

    fn handle_media_event(&mut self, now: Instant, flow_id: u64, event: MediaEvent) {
        if self.closed || flow_id != self.flow_id || self.flow.is_none() {
            debug!(
                "conv {}: dropping media event of flow {} (current {})",
                self.convid, flow_id, self.flow_id
            );
            return;
        }

        match event {
            MediaEvent::Established { crypto, codec } => {
                info!(
                    "conv {}: media established (crypto={}, codec={})",
                    self.convid, crypto, codec
                );
                self.media_established = true;
                self.check_established(now);
            }
            MediaEvent::Closed { error } => {
                info!("conv {}: media closed ({:?})", self.convid, error);
                match error {
                    Some(error) => self.fail_active(now, CloseReason::MediaFailed(error)),
                    None => {
                        if let Some(econn) = self.econn_mut() {
                            econn.end(now);
                        }
                    }
                }
            }
            MediaEvent::DatachannelEstablished => {
                self.datachan_open = true;
                if let Some(econn) = self.econn_mut() {
                    if econn.state() == EconnState::Answered {
                        econn.set_datachan_established();
                    }
                }
            }
            MediaEvent::IceGathered { sdp } => self.on_ice_gathered(now, sdp),
            MediaEvent::DataReceived(data) => self.on_data_received(now, &data),
        }

        self.pump(now);
    }

    fn handle_send_failure(&mut self, now: Instant, session_id: &str, error: &str) {
        match self
            .sessions
            .values_mut()
            .find(|econn| econn.session_id().eq_ignore_ascii_case(session_id))
        {
            Some(econn) => econn.transport_failed(error),
            None => debug!(
                "conv {}: send failure for unknown session {}",
                self.convid, session_id
            ),
        }
        self.pump(now);
    }

    fn media_start(&mut self, now: Instant) -> Result<()> {
        if self.closed || !self.established_notified {
            return Err(CallError::invalid_state("start media", self.state()));
        }
        self.media_start_timer.cancel();
        if !self.media_started {
            self.start_media_now(now);
            self.pump(now);
        }
        Ok(())
    }

    fn set_video_send(&mut self, now: Instant, active: bool) -> Result<()> {
        if self.closed {
            return Err(CallError::invalid_state("set video", self.state()));
        }
        self.props_local.set_bool(PROP_VIDEO_SEND, active);
        if let Some(flow) = self.flow.as_deref_mut() {
            flow.set_video_send(active);
        }

        let props = self.props_local.clone();
        if let Some(econn) = self.econn_mut() {
            if econn.can_send_propsync() {
                econn.send_propsync(false, props)?;
            }
        }
        self.pump(now);
        Ok(())
    }

    fn restart(&mut self, now: Instant) -> Result<()> {
        let established = matches!(
            self.econn().map(Econn::state),
            Some(EconnState::Answered | EconnState::DatachanEstablished)
        );
        if self.closed || !established {
            return Err(CallError::invalid_state("restart", self.state()));
        }

        info!("conv {}: restarting media", self.convid);
        self.alloc_flow()?;
        match self.flow_op(|flow| flow.create_offer())? {
            SdpOutcome::Ready(sdp) => self.send_update_offer(now, sdp),
            SdpOutcome::Gathering => self.pending_sdp = PendingSdp::UpdateOffer,
        }
        self.pump(now);
        Ok(())
    }

    fn handle_timeout(&mut self, now: Instant) {
        for econn in self.sessions.values_mut() {
            econn.handle_timeout(now);
        }
        if self.media_start_timer.take_expired(now) {
            warn!("conv {}: media was not started in time", self.convid);
            self.fail_active(now, CloseReason::MediaFailed("media start timeout".into()));
        }
        self.pump(now);
    }

    fn poll_timeout(&self) -> Option<Instant> {
        earliest(
            self.sessions
                .values()
                .map(Econn::poll_timeout)
                .chain(std::iter::once(self.media_start_timer.deadline())),
        )
    }

    fn poll_event(&mut self) -> Option<CallEvent> {
        self.events.pop_front()
    }

    fn is_finished(&self) -> bool {
        self.closed
    }

    fn ended_sessions(&self) -> &[String] {
        &self.ended_sessions
    }
}
