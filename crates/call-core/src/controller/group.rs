//! Group call controller
//!
//! A group call has no per-peer Econn. Presence is announced with
//! GROUPSTART, GROUPCHECK and GROUPLEAVE messages fanned out to the whole
//! conversation, and the controller keeps a [`Roster`] of who is in the call
//! along with their media stream ids. Media runs over one conference flow
//! to which a decoder is added per participant.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, info, warn};

use avs_econn_core::message::PROP_VIDEO_SEND;
use avs_econn_core::{
    CloseReason, Identity, MESSAGE_TIME_UNKNOWN, MessageKind, MessageTiming, Props,
    SignalingMessage, Timer, earliest, new_session_id,
};

use super::roster::{PROP_SSRC_AUDIO, PROP_SSRC_VIDEO, Participant, Roster};
use super::{CallContext, CallController, Inbound};
use crate::error::{CallError, Result};
use crate::events::{CallClosed, CallEvent, CallState, ConversationKind, LeaveReason};
use crate::media::{MediaEvent, MediaEventSink, MediaFlow};
use crate::transport::{Destination, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallTimerKind {
    /// Outgoing, waiting for anyone to join
    Start,
    /// Incoming, ringing
    Ring,
    /// Joined, waiting for media
    Answer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RosterTimerKind {
    /// Time to announce ourselves with a GROUPCHECK
    Active,
    /// Nobody announced the call for too long
    Passive,
}

#[derive(Serialize)]
struct GroupMetrics<'a> {
    convid: &'a str,
    reason: &'static str,
    answered: bool,
    members: usize,
    epoch: u64,
    ended_at: DateTime<Utc>,
}

/// Call controller of a group conversation
pub struct GroupCall {
    ctx: CallContext,
    convid: String,
    state: CallState,
    session_id: String,

    flow: Option<Box<dyn MediaFlow>>,
    flow_id: u64,
    media_started: bool,

    roster: Roster,
    props_local: Props,
    ever_answered: bool,

    call_timer: Timer,
    call_timer_kind: CallTimerKind,
    roster_timer: Timer,
    roster_timer_kind: RosterTimerKind,
    rng: SmallRng,

    events: VecDeque<CallEvent>,
    finished: bool,
}

impl GroupCall {
    pub fn new(ctx: CallContext, convid: impl Into<String>) -> Self {
        let mut props_local = Props::new();
        props_local.set_bool(PROP_VIDEO_SEND, false);

        Self {
            ctx,
            convid: convid.into(),
            state: CallState::Idle,
            session_id: new_session_id(),
            flow: None,
            flow_id: 0,
            media_started: false,
            roster: Roster::new(),
            props_local,
            ever_answered: false,
            call_timer: Timer::new("group-call"),
            call_timer_kind: CallTimerKind::Start,
            roster_timer: Timer::new("group-roster"),
            roster_timer_kind: RosterTimerKind::Passive,
            rng: SmallRng::from_entropy(),
            events: VecDeque::new(),
            finished: false,
        }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn set_state(&mut self, state: CallState) {
        if self.state != state {
            info!(
                "conv {}: group state changed: {} -> {}",
                self.convid, self.state, state
            );
            self.state = state;
        }
    }

    fn in_call(&self) -> bool {
        matches!(
            self.state,
            CallState::Outgoing | CallState::Answered | CallState::Active
        )
    }

    fn push_event(&mut self, event: CallEvent) {
        debug!("conv {}: event {}", self.convid, event.name());
        self.events.push_back(event);
    }

    fn group_config_ms(&self, kind: CallTimerKind) -> u64 {
        let group = &self.ctx.config.group;
        match kind {
            CallTimerKind::Start => group.start_timeout_ms,
            CallTimerKind::Ring => group.ring_timeout_ms,
            CallTimerKind::Answer => group.answer_timeout_ms,
        }
    }

    fn arm_call_timer(&mut self, now: Instant, kind: CallTimerKind) {
        self.call_timer_kind = kind;
        let after = Duration::from_millis(self.group_config_ms(kind));
        self.call_timer.arm(now, after);
    }

    fn arm_active_roster(&mut self, now: Instant) {
        let group = &self.ctx.config.group;
        let jitter = self.rng.gen_range(0..=group.active_roster_jitter_ms);
        let after = Duration::from_millis(group.active_roster_timeout_ms + jitter);
        self.roster_timer_kind = RosterTimerKind::Active;
        self.roster_timer.arm(now, after);
    }

    fn arm_passive_roster(&mut self, now: Instant) {
        let after = Duration::from_millis(self.ctx.config.group.passive_roster_timeout_ms);
        self.roster_timer_kind = RosterTimerKind::Passive;
        self.roster_timer.arm(now, after);
    }

    fn alloc_flow(&mut self) -> Result<()> {
        let flow_id = self.flow_id + 1;
        let sink = MediaEventSink::new(self.convid.clone(), flow_id, self.ctx.media_events.clone());
        let mut flow = self
            .ctx
            .media
            .alloc_flow(&self.convid, ConversationKind::Group, sink)
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
            old.close();
        }
        self.flow_id = flow_id;
        self.media_started = false;
        Ok(())
    }

    fn teardown_media(&mut self) {
        if let Some(mut flow) = self.flow.take() {
            for member in self.roster.iter() {
                flow.remove_decoder(&member.userid, &member.clientid);
            }
            flow.stop_media();
            flow.close();
        }
        self.media_started = false;
    }

    fn add_decoder(&mut self, member: &Participant) {
        if let Some(flow) = self.flow.as_deref_mut() {
            if let Err(e) = flow.add_decoder(
                &member.userid,
                &member.clientid,
                member.ssrc_audio,
                member.ssrc_video,
            ) {
                warn!(
                    "conv {}: decoder for {}.{} not added: {}",
                    self.convid, member.userid, member.clientid, e
                );
            }
        }
    }

    fn add_all_decoders(&mut self) {
        let members: Vec<Participant> = self.roster.iter().cloned().collect();
        for member in &members {
            self.add_decoder(member);
        }
    }

    /// Record `sender` in the roster; returns true if it changed
    fn update_roster(&mut self, sender: &Identity, props: &Props) -> bool {
        if !self.roster.upsert(sender, props) {
            return false;
        }
        debug!(
            "conv {}: roster epoch {} ({} members)",
            self.convid,
            self.roster.epoch(),
            self.roster.len()
        );
        if self.in_call() {
            let member = self.roster.get(sender).cloned();
            if let Some(member) = member {
                self.add_decoder(&member);
            }
        }
        self.push_event(CallEvent::GroupChanged {
            convid: self.convid.clone(),
            membership: self.roster.snapshot(),
        });
        true
    }

    /// Properties we announce: video state and our stream ids
    fn signal_props(&self) -> Props {
        let mut props = self.props_local.clone();
        if let Some((audio, video)) = self.flow.as_deref().and_then(|f| f.local_ssrcs()) {
            props.update(PROP_SSRC_AUDIO, audio.to_string());
            props.update(PROP_SSRC_VIDEO, video.to_string());
        }
        props
    }

    fn send_group(
        &self,
        kind: MessageKind,
        is_response: bool,
        destination: Destination,
    ) -> std::result::Result<(), TransportError> {
        let mut msg = SignalingMessage::new(kind, self.session_id.clone(), is_response)
            .with_props(self.signal_props());
        msg.src_userid = Some(self.ctx.local.userid.clone());
        msg.src_clientid = Some(self.ctx.local.clientid.clone());
        self.ctx.send(&self.convid, destination, msg)
    }

    /// Enter the call, as the first participant or by joining
    fn join(&mut self, now: Instant, video: bool, is_response: bool) -> Result<()> {
        self.ctx.config.validate()?;
        self.props_local.set_bool(PROP_VIDEO_SEND, video);
        self.alloc_flow()?;

        if let Err(e) = self.send_group(MessageKind::GroupStart, is_response, Destination::Conversation) {
            self.teardown_media();
            return Err(e.into());
        }

        self.call_timer.cancel();
        if self.state == CallState::Idle {
            self.set_state(CallState::Outgoing);
            self.arm_call_timer(now, CallTimerKind::Start);
        } else {
            self.set_state(CallState::Answered);
            self.ever_answered = true;
            self.add_all_decoders();
            self.arm_call_timer(now, CallTimerKind::Answer);
            self.push_event(CallEvent::Answered {
                convid: self.convid.clone(),
            });
        }
        Ok(())
    }

    /// Drop out of the call; it may go on without us
    fn leave(&mut self, now: Instant, reason: CloseReason) {
        info!("conv {}: leaving group call ({})", self.convid, reason);
        if let Err(e) = self.send_group(MessageKind::GroupLeave, false, Destination::Conversation) {
            debug!("conv {}: GROUPLEAVE not sent: {}", self.convid, e);
        }
        self.teardown_media();
        self.call_timer.cancel();
        self.roster_timer.cancel();

        if self.roster.is_empty() {
            self.close(reason, MESSAGE_TIME_UNKNOWN);
        } else {
            self.set_state(CallState::Incoming);
            self.arm_passive_roster(now);
            self.push_event(CallEvent::Left {
                convid: self.convid.clone(),
                reason: LeaveReason::StillOngoing,
            });
        }
    }

    fn close(&mut self, reason: CloseReason, msg_time: u32) {
        if self.finished {
            return;
        }
        self.call_timer.cancel();
        self.roster_timer.cancel();
        self.teardown_media();
        self.set_state(CallState::Idle);
        self.finished = true;

        info!("conv {}: group call closed ({})", self.convid, reason);
        let metrics = GroupMetrics {
            convid: &self.convid,
            reason: reason.code(),
            answered: self.ever_answered,
            members: self.roster.len(),
            epoch: self.roster.epoch(),
            ended_at: Utc::now(),
        };
        let metrics = serde_json::to_string(&metrics).unwrap_or_else(|e| {
            warn!("conv {}: metrics not serialized: {}", self.convid, e);
            String::new()
        });
        self.push_event(CallEvent::Closed(CallClosed {
            reason,
            convid: self.convid.clone(),
            msg_time,
            userid: None,
            clientid: None,
            metrics,
        }));
    }

    fn recv_groupstart(&mut self, now: Instant, sender: &Identity, msg: &SignalingMessage, timing: MessageTiming) {
        self.update_roster(sender, &msg.props);

        match self.state {
            CallState::Idle => {
                let should_ring = msg.is_request()
                    && Duration::from_secs(timing.age.into()) < self.ctx.config.should_ring_timeout()
                    && !sender.same_user(&self.ctx.local);
                self.set_state(CallState::Incoming);
                if should_ring {
                    self.arm_call_timer(now, CallTimerKind::Ring);
                }
                self.arm_passive_roster(now);
                self.push_event(CallEvent::Incoming {
                    convid: self.convid.clone(),
                    msg_time: timing.msg_time,
                    userid: sender.userid.clone(),
                    clientid: sender.clientid.clone(),
                    video: msg.props.get_bool(PROP_VIDEO_SEND) == Some(true),
                    should_ring,
                });
            }
            CallState::Incoming => {
                if msg.is_response && sender.same_user(&self.ctx.local) {
                    info!("conv {}: joined on device {}", self.convid, sender.anon());
                    self.call_timer.cancel();
                    self.push_event(CallEvent::Left {
                        convid: self.convid.clone(),
                        reason: LeaveReason::AnsweredElsewhere,
                    });
                } else {
                    self.arm_passive_roster(now);
                }
            }
            CallState::Outgoing => {
                self.set_state(CallState::Answered);
                self.ever_answered = true;
                self.arm_call_timer(now, CallTimerKind::Answer);
                self.push_event(CallEvent::Answered {
                    convid: self.convid.clone(),
                });
                self.announce_to(msg);
            }
            CallState::Answered | CallState::Active => self.announce_to(msg),
            CallState::Terminating => {}
        }
    }

    /// Let a new participant know we are here
    fn announce_to(&mut self, msg: &SignalingMessage) {
        if !msg.is_request() {
            return;
        }
        if let Err(e) = self.send_group(MessageKind::GroupCheck, true, Destination::Conversation) {
            debug!("conv {}: GROUPCHECK not sent: {}", self.convid, e);
        }
    }

    fn recv_groupleave(&mut self, sender: &Identity, timing: MessageTiming) {
        if let Some(member) = self.roster.remove(sender) {
            if let Some(flow) = self.flow.as_deref_mut() {
                flow.remove_decoder(&member.userid, &member.clientid);
            }
            self.push_event(CallEvent::GroupChanged {
                convid: self.convid.clone(),
                membership: self.roster.snapshot(),
            });
        }

        if self.state == CallState::Incoming && self.roster.is_empty() {
            let reason = if self.ever_answered {
                CloseReason::Normal
            } else {
                CloseReason::Canceled
            };
            self.close(reason, timing.msg_time);
        }
    }

    fn recv_groupcheck(&mut self, now: Instant, sender: &Identity, msg: &SignalingMessage, timing: MessageTiming) {
        self.update_roster(sender, &msg.props);

        match self.state {
            CallState::Idle => {
                self.set_state(CallState::Incoming);
                self.arm_passive_roster(now);
                self.push_event(CallEvent::Incoming {
                    convid: self.convid.clone(),
                    msg_time: timing.msg_time,
                    userid: sender.userid.clone(),
                    clientid: sender.clientid.clone(),
                    video: msg.props.get_bool(PROP_VIDEO_SEND) == Some(true),
                    should_ring: false,
                });
            }
            CallState::Active => {
                self.announce_to(msg);
                // someone just checked; postpone ours
                self.arm_active_roster(now);
            }
            CallState::Terminating => {}
            _ => {
                if self.in_call() {
                    self.announce_to(msg);
                }
                self.arm_passive_roster(now);
            }
        }
    }

    fn recv_reject(&mut self, sender: &Identity) {
        if self.state == CallState::Incoming && sender.same_user(&self.ctx.local) {
            info!("conv {}: rejected on device {}", self.convid, sender.anon());
            self.call_timer.cancel();
            self.push_event(CallEvent::Left {
                convid: self.convid.clone(),
                reason: LeaveReason::Rejected,
            });
        }
    }
}

impl CallController for GroupCall {
    fn convid(&self) -> &str {
        &self.convid
    }

    fn kind(&self) -> ConversationKind {
        ConversationKind::Group
    }

    fn state(&self) -> CallState {
        self.state
    }

    fn start(&mut self, now: Instant, video: bool) -> Result<()> {
        if self.finished {
            return Err(CallError::invalid_state("start", self.state));
        }
        match self.state {
            CallState::Idle | CallState::Incoming => {}
            _ => return Err(CallError::AlreadyInProgress(self.convid.clone())),
        }
        info!("conv {}: starting group call (video={})", self.convid, video);
        self.join(now, video, false)
    }

    fn answer(&mut self, now: Instant, video: bool) -> Result<()> {
        if self.state != CallState::Incoming {
            return Err(CallError::invalid_state("answer", self.state));
        }
        info!("conv {}: answering group call (video={})", self.convid, video);
        self.join(now, video, true)
    }

    fn end(&mut self, now: Instant) {
        match self.state {
            CallState::Idle | CallState::Terminating => {
                debug!("conv {}: end: not in a call", self.convid);
            }
            CallState::Incoming => {
                // not joined; only stop ringing
                if self.call_timer.is_armed() {
                    self.call_timer.cancel();
                    self.push_event(CallEvent::Left {
                        convid: self.convid.clone(),
                        reason: LeaveReason::StillOngoing,
                    });
                }
            }
            CallState::Outgoing | CallState::Answered | CallState::Active => {
                self.leave(now, CloseReason::Normal);
            }
        }
    }

    fn reject(&mut self, now: Instant) -> Result<()> {
        if self.in_call() {
            debug!("conv {}: reject: already in the call, leaving", self.convid);
            self.leave(now, CloseReason::Normal);
            return Ok(());
        }
        if self.state != CallState::Incoming {
            return Err(CallError::invalid_state("reject", self.state));
        }
        info!("conv {}: rejecting group call", self.convid);
        let own_devices = Destination::User(self.ctx.local.userid.clone());
        if let Err(e) = self.send_group(MessageKind::Reject, false, own_devices) {
            debug!("conv {}: REJECT not sent: {}", self.convid, e);
        }
        self.call_timer.cancel();
        Ok(())
    }

    fn recv_message(&mut self, now: Instant, inbound: Inbound<'_>) {
        let Inbound {
            curr_time,
            msg_time,
            sender,
            message: msg,
        } = inbound;

        if self.finished {
            debug!("conv {}: closed, ignoring {}", self.convid, msg.brief());
            return;
        }
        if sender.matches(&self.ctx.local) {
            return;
        }
        let timing = MessageTiming::new(curr_time, msg_time);

        match msg.kind {
            MessageKind::GroupStart => self.recv_groupstart(now, sender, msg, timing),
            MessageKind::GroupLeave => self.recv_groupleave(sender, timing),
            MessageKind::GroupCheck => self.recv_groupcheck(now, sender, msg, timing),
            MessageKind::Reject => self.recv_reject(sender),
            _ => debug!(
                "conv {}: {} not used in group calls",
                self.convid,
                msg.brief()
            ),
        }
    }

    fn handle_media_event(&mut self, now: Instant, flow_id: u64, event: MediaEvent) {
        if self.finished || flow_id != self.flow_id || self.flow.is_none() {
            debug!(
                "conv {}: dropping media event of flow {} (current {})",
                self.convid, flow_id, self.flow_id
            );
            return;
        }

        match event {
            MediaEvent::Established { crypto, codec } => {
                if !matches!(self.state, CallState::Outgoing | CallState::Answered) {
                    debug!("conv {}: media established in state {}", self.convid, self.state);
                    return;
                }
                info!(
                    "conv {}: group media established (crypto={}, codec={})",
                    self.convid, crypto, codec
                );
                self.call_timer.cancel();
                self.set_state(CallState::Active);
                self.arm_active_roster(now);
                self.push_event(CallEvent::MediaEstablished {
                    convid: self.convid.clone(),
                    userid: self.ctx.local.userid.clone(),
                    clientid: self.ctx.local.clientid.clone(),
                });
                if self.ctx.config.auto_media_start {
                    if let Err(e) = self.media_start(now) {
                        warn!("conv {}: media not started: {}", self.convid, e);
                    }
                }
            }
            MediaEvent::Closed { error } => {
                let reason = match error {
                    Some(error) => CloseReason::MediaFailed(error),
                    None => CloseReason::Normal,
                };
                self.leave(now, reason);
            }
            MediaEvent::DatachannelEstablished => {
                self.push_event(CallEvent::DatachannelEstablished {
                    convid: self.convid.clone(),
                    userid: self.ctx.local.userid.clone(),
                    clientid: self.ctx.local.clientid.clone(),
                });
            }
            MediaEvent::IceGathered { .. } | MediaEvent::DataReceived(_) => {
                debug!("conv {}: media event not used in group calls", self.convid);
            }
        }
    }

    fn handle_send_failure(&mut self, now: Instant, session_id: &str, error: &str) {
        if !session_id.eq_ignore_ascii_case(&self.session_id) || !self.in_call() {
            debug!(
                "conv {}: send failure for {} ignored in state {}",
                self.convid, session_id, self.state
            );
            return;
        }
        warn!("conv {}: group signaling failed: {}", self.convid, error);
        self.leave(now, CloseReason::Transport(error.to_string()));
    }

    fn media_start(&mut self, _now: Instant) -> Result<()> {
        if self.state != CallState::Active {
            return Err(CallError::invalid_state("start media", self.state));
        }
        if self.media_started {
            return Ok(());
        }
        let flow = self
            .flow
            .as_deref_mut()
            .ok_or_else(|| CallError::invalid_state("start media", self.state))?;
        flow.start_media()?;
        self.media_started = true;
        Ok(())
    }

    fn set_video_send(&mut self, _now: Instant, active: bool) -> Result<()> {
        if self.finished {
            return Err(CallError::invalid_state("set video", self.state));
        }
        self.props_local.set_bool(PROP_VIDEO_SEND, active);
        if let Some(flow) = self.flow.as_deref_mut() {
            flow.set_video_send(active);
        }
        Ok(())
    }

    fn restart(&mut self, now: Instant) -> Result<()> {
        if !matches!(self.state, CallState::Answered | CallState::Active) {
            return Err(CallError::invalid_state("restart", self.state));
        }
        info!("conv {}: restarting group media", self.convid);
        self.alloc_flow()?;
        self.add_all_decoders();
        self.roster_timer.cancel();
        self.set_state(CallState::Answered);
        self.arm_call_timer(now, CallTimerKind::Answer);
        Ok(())
    }

    fn handle_timeout(&mut self, now: Instant) {
        if self.call_timer.take_expired(now) {
            match (self.call_timer_kind, self.state) {
                (CallTimerKind::Start, CallState::Outgoing)
                | (CallTimerKind::Answer, CallState::Answered) => {
                    info!("conv {}: no media in time", self.convid);
                    self.leave(now, CloseReason::TimedOut);
                }
                (CallTimerKind::Ring, CallState::Incoming) => {
                    info!("conv {}: stopped ringing", self.convid);
                    self.push_event(CallEvent::Left {
                        convid: self.convid.clone(),
                        reason: LeaveReason::StillOngoing,
                    });
                }
                (kind, state) => {
                    debug!("conv {}: {:?} timer expired in state {}", self.convid, kind, state);
                }
            }
        }

        if self.roster_timer.take_expired(now) {
            match self.roster_timer_kind {
                RosterTimerKind::Active if self.state == CallState::Active => {
                    if let Err(e) =
                        self.send_group(MessageKind::GroupCheck, false, Destination::Conversation)
                    {
                        debug!("conv {}: GROUPCHECK not sent: {}", self.convid, e);
                    }
                    self.arm_active_roster(now);
                }
                RosterTimerKind::Active => {}
                RosterTimerKind::Passive => {
                    info!("conv {}: call no longer announced", self.convid);
                    if self.roster.clear() {
                        self.push_event(CallEvent::GroupChanged {
                            convid: self.convid.clone(),
                            membership: self.roster.snapshot(),
                        });
                    }
                    self.close(CloseReason::Normal, MESSAGE_TIME_UNKNOWN);
                }
            }
        }
    }

    fn poll_timeout(&self) -> Option<Instant> {
        earliest([self.call_timer.deadline(), self.roster_timer.deadline()])
    }

    fn poll_event(&mut self) -> Option<CallEvent> {
        self.events.pop_front()
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}
