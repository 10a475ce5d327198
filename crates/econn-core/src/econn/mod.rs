//! The Econn signaling state machine
//!
//! One [`Econn`] models one signaling relationship between a local device
//! and a remote device during a call attempt.
//!
//! ```text
//! Idle --start--> PendingOutgoing --SETUP(r)--> Answered --datachan--> DatachanEstablished
//! Idle --SETUP--> PendingIncoming --answer----> Answered
//! PendingOutgoing --SETUP (glare lost)--> ConflictResolution --answer--> Answered
//! DatachanEstablished --end--> HangupSent --HANGUP(r)--> Terminating
//! any --CANCEL / timeout / failure--> Terminating
//! ```
//!
//! The machine performs no I/O. Operations queue [`EconnAction`]s that the
//! owner drains with [`Econn::poll_action`] and executes against its
//! transport. Timers are deadlines owned by the machine ([`Timer`]); the
//! owner reports clock progress through [`Econn::handle_timeout`].

mod action;
mod conflict;
mod state;
mod timer;

use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, info, warn};

pub use action::{CloseReason, EconnAction, EconnEvent};
pub use conflict::{is_creator, is_winner};
pub use state::{Conflict, Direction, EconnState};
pub use timer::{Timer, earliest};

use crate::config::EconnConfig;
use crate::error::{EconnError, Result};
use crate::identity::Identity;
use crate::message::{
    MESSAGE_TIME_UNKNOWN, MessageKind, MessageTiming, Props, SignalingMessage,
};

/// Generate a fresh local session id
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Per-peer signaling state machine
#[derive(Debug)]
pub struct Econn {
    config: EconnConfig,
    local: Identity,
    /// Locked by the first accepted SETUP
    remote: Option<Identity>,
    session_local: String,
    session_remote: Option<String>,

    state: EconnState,
    direction: Direction,
    conflict: Conflict,
    /// Our SETUP request has been handed to the transport
    setup_sent: bool,

    props_local: Props,
    props_remote: Option<Props>,

    setup_timer: Timer,
    term_timer: Timer,

    /// Reason to report on the next close instead of the default one
    pending_error: Option<CloseReason>,
    close_notified: bool,

    outbox: VecDeque<EconnAction>,
}

impl Econn {
    pub fn new(config: EconnConfig, local: Identity) -> Self {
        Self::with_session_id(config, local, new_session_id())
    }

    pub fn with_session_id(config: EconnConfig, local: Identity, session_id: impl Into<String>) -> Self {
        let session_local = session_id.into();
        debug!("econn({}): created for {}", session_local, local.anon());
        Self {
            config,
            local,
            remote: None,
            session_local,
            session_remote: None,
            state: EconnState::Idle,
            direction: Direction::Unknown,
            conflict: Conflict::None,
            setup_sent: false,
            props_local: Props::new(),
            props_remote: None,
            setup_timer: Timer::new("setup"),
            term_timer: Timer::new("term"),
            pending_error: None,
            close_notified: false,
            outbox: VecDeque::new(),
        }
    }

    pub fn state(&self) -> EconnState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn conflict(&self) -> Conflict {
        self.conflict
    }

    pub fn local(&self) -> &Identity {
        &self.local
    }

    pub fn remote(&self) -> Option<&Identity> {
        self.remote.as_ref()
    }

    pub fn session_id(&self) -> &str {
        &self.session_local
    }

    pub fn remote_session_id(&self) -> Option<&str> {
        self.session_remote.as_deref()
    }

    /// Id of the SETUP request that governs this session: ours if we
    /// initiated it and kept it, the remote one otherwise.
    pub fn governing_session_id(&self) -> Option<&str> {
        match (self.direction, self.conflict) {
            (_, Conflict::Lost) | (Direction::Incoming, _) => self.session_remote.as_deref(),
            (Direction::Outgoing, _) => Some(&self.session_local),
            (Direction::Unknown, _) => None,
        }
    }

    pub fn props_local(&self) -> &Props {
        &self.props_local
    }

    pub fn props_remote(&self) -> Option<&Props> {
        self.props_remote.as_ref()
    }

    pub fn can_send_propsync(&self) -> bool {
        self.state == EconnState::DatachanEstablished
    }

    /// Next queued side effect
    pub fn poll_action(&mut self) -> Option<EconnAction> {
        self.outbox.pop_front()
    }

    /// Earliest armed timer
    pub fn poll_timeout(&self) -> Option<Instant> {
        earliest([self.setup_timer.deadline(), self.term_timer.deadline()])
    }

    /// Enter PendingOutgoing before the offer exists (ICE still gathering).
    ///
    /// A glare SETUP arriving in the meantime is resolved normally; the
    /// offer is sent later with [`Econn::start`].
    pub fn begin_outgoing(&mut self, now: Instant) -> Result<()> {
        self.config.validate()?;
        if self.state != EconnState::Idle {
            return Err(EconnError::invalid_state("begin outgoing", self.state));
        }
        self.direction = Direction::Outgoing;
        self.set_state(EconnState::PendingOutgoing);
        self.setup_timer.arm(now, self.config.timeout_setup());
        Ok(())
    }

    /// Send our SETUP offer
    pub fn start(&mut self, now: Instant, sdp: String, props: Props) -> Result<()> {
        self.config.validate()?;
        match self.state {
            EconnState::Idle => {
                self.direction = Direction::Outgoing;
                self.set_state(EconnState::PendingOutgoing);
            }
            EconnState::PendingOutgoing if !self.setup_sent => {}
            state => return Err(EconnError::invalid_state("start", state)),
        }

        self.props_local = props.clone();
        let msg = SignalingMessage::setup(self.session_local.clone(), false, sdp, props);
        self.send(msg);
        self.setup_sent = true;
        self.setup_timer.arm(now, self.config.timeout_setup());
        Ok(())
    }

    /// Answer a pending incoming SETUP, or the remote SETUP after losing glare
    pub fn answer(&mut self, now: Instant, sdp: String, props: Props) -> Result<()> {
        match self.state {
            EconnState::PendingIncoming | EconnState::ConflictResolution => {}
            state => return Err(EconnError::invalid_state("answer", state)),
        }

        self.setup_timer.cancel();
        self.props_local = props.clone();
        let msg = SignalingMessage::setup(self.session_local.clone(), true, sdp, props);
        self.send(msg);
        self.enter_answered(now);
        Ok(())
    }

    /// Offer a renegotiation
    pub fn update_request(&mut self, now: Instant, sdp: String, props: Props) -> Result<()> {
        match self.state {
            EconnState::Answered | EconnState::DatachanEstablished => {}
            state => return Err(EconnError::invalid_state("send UPDATE", state)),
        }

        self.term_timer.cancel();
        self.set_state(EconnState::UpdateSent);
        self.props_local = props.clone();
        let msg = SignalingMessage::update(self.session_local.clone(), false, sdp, props);
        self.send(msg);
        self.setup_timer.arm(now, self.config.timeout_setup());
        Ok(())
    }

    /// Answer a renegotiation
    pub fn update_response(&mut self, now: Instant, sdp: String, props: Props) -> Result<()> {
        if self.state != EconnState::UpdateRecv {
            return Err(EconnError::invalid_state("answer UPDATE", self.state));
        }

        self.setup_timer.cancel();
        self.props_local = props.clone();
        let msg = SignalingMessage::update(self.session_local.clone(), true, sdp, props);
        self.send(msg);
        self.enter_answered(now);
        Ok(())
    }

    pub fn send_propsync(&mut self, is_response: bool, props: Props) -> Result<()> {
        if !self.can_send_propsync() {
            return Err(EconnError::invalid_state("send PROPSYNC", self.state));
        }
        self.props_local = props.clone();
        let msg = SignalingMessage::propsync(self.session_local.clone(), is_response, props);
        self.send(msg);
        Ok(())
    }

    /// The data channel of the bound media flow is usable
    pub fn set_datachan_established(&mut self) {
        if self.state != EconnState::Answered {
            warn!(
                "econn({}): set_datachan_established: illegal state {}",
                self.session_local, self.state
            );
            return;
        }
        self.term_timer.cancel();
        self.set_state(EconnState::DatachanEstablished);
        self.notify(EconnEvent::DatachanEstablished);
    }

    /// Remember a reason to report on the next close
    pub fn set_error(&mut self, reason: CloseReason) {
        self.pending_error = Some(reason);
    }

    /// End the session from any state; always reaches Terminating eventually
    pub fn end(&mut self, now: Instant) {
        info!("econn({}): end (state={})", self.session_local, self.state);

        match self.state {
            EconnState::Idle | EconnState::PendingIncoming | EconnState::UpdateRecv => {
                let reason = self.reason_or(CloseReason::Canceled);
                self.terminate(reason, MESSAGE_TIME_UNKNOWN);
            }

            EconnState::PendingOutgoing
            | EconnState::UpdateSent
            | EconnState::Answered
            | EconnState::ConflictResolution => {
                if self.state != EconnState::PendingOutgoing || self.setup_sent {
                    self.send(SignalingMessage::cancel(self.session_local.clone()));
                }
                let reason = self.reason_or(CloseReason::Canceled);
                self.terminate(reason, MESSAGE_TIME_UNKNOWN);
            }

            EconnState::DatachanEstablished => {
                self.setup_timer.cancel();
                self.send(SignalingMessage::hangup(self.session_local.clone(), false));
                self.set_state(EconnState::HangupSent);
                self.term_timer.arm(now, self.config.timeout_term());
            }

            EconnState::HangupSent | EconnState::HangupRecv | EconnState::Terminating => {
                debug!("econn({}): end: already ending", self.session_local);
            }
        }
    }

    /// Close with `reason`, sending CANCEL if our offer is still unanswered
    pub fn close(&mut self, reason: CloseReason, msg_time: u32) {
        if self.state.is_terminal() {
            debug!("econn({}): close: already terminating", self.session_local);
            return;
        }
        if self.state == EconnState::PendingOutgoing && self.setup_sent {
            self.send(SignalingMessage::cancel(self.session_local.clone()));
        }
        self.terminate(reason, msg_time);
    }

    /// A send for this session failed; the session cannot continue
    pub fn transport_failed(&mut self, error: impl Into<String>) {
        let error = error.into();
        if self.state.is_terminal() {
            debug!(
                "econn({}): transport failure after close ignored: {}",
                self.session_local, error
            );
            return;
        }
        warn!("econn({}): transport failed: {}", self.session_local, error);
        let reason = self.reason_or(CloseReason::Transport(error));
        self.terminate(reason, MESSAGE_TIME_UNKNOWN);
    }

    /// Fire any timer whose deadline is at or before `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.state.is_terminal() {
            self.setup_timer.cancel();
            self.term_timer.cancel();
            return;
        }

        if self.setup_timer.take_expired(now) {
            info!("econn({}): setup timeout (state={})", self.session_local, self.state);
            let reason = self.reason_or(CloseReason::TimedOut);
            self.close(reason, MESSAGE_TIME_UNKNOWN);
            return;
        }

        if self.term_timer.take_expired(now) {
            info!("econn({}): term timeout (state={})", self.session_local, self.state);
            // our hangup went out; only the acknowledgement is missing
            let fallback = if self.state == EconnState::HangupSent {
                CloseReason::Normal
            } else {
                CloseReason::TimedOut
            };
            let reason = self.reason_or(fallback);
            self.terminate(reason, MESSAGE_TIME_UNKNOWN);
        }
    }

    /// Feed a message from `sender`
    pub fn recv_message(
        &mut self,
        now: Instant,
        sender: &Identity,
        msg: &SignalingMessage,
        timing: MessageTiming,
    ) {
        if self.state.is_terminal() {
            debug!(
                "econn({}): ignoring {} in state {}",
                self.session_local,
                msg.brief(),
                self.state
            );
            return;
        }

        match msg.kind {
            MessageKind::Setup => self.recv_setup(now, sender, msg, timing),
            MessageKind::Update => self.recv_update(now, sender, msg),
            MessageKind::Cancel => self.recv_cancel(sender, msg, timing),
            MessageKind::Hangup => self.recv_hangup(msg, timing),
            MessageKind::Propsync => self.recv_propsync(msg),
            MessageKind::Reject
            | MessageKind::Ping
            | MessageKind::GroupStart
            | MessageKind::GroupLeave
            | MessageKind::GroupCheck => {
                debug!("econn({}): recv: {} not handled", self.session_local, msg.kind);
            }
        }
    }

    fn recv_setup(&mut self, now: Instant, sender: &Identity, msg: &SignalingMessage, timing: MessageTiming) {
        if !self.accept_sender(sender, msg) {
            return;
        }

        if msg.is_request() {
            self.handle_setup_request(now, sender, msg, timing);
        } else {
            self.handle_setup_response(now, msg);
        }
    }

    fn handle_setup_request(
        &mut self,
        now: Instant,
        sender: &Identity,
        msg: &SignalingMessage,
        timing: MessageTiming,
    ) {
        let sdp = msg.sdp.clone().unwrap_or_default();

        match self.state {
            EconnState::Idle => {
                self.session_remote = Some(msg.session_id.clone());
                self.props_remote = Some(msg.props.clone());
                self.direction = Direction::Incoming;
                self.set_state(EconnState::PendingIncoming);
                self.setup_timer.arm(now, self.config.timeout_setup());

                self.notify(EconnEvent::Incoming {
                    remote: sender.clone(),
                    msg_time: timing.msg_time,
                    age: timing.age,
                    sdp,
                    props: msg.props.clone(),
                });
            }

            EconnState::PendingOutgoing => {
                self.session_remote = Some(msg.session_id.clone());
                let winner = is_winner(&self.local, sender);
                info!(
                    "econn({}): conflict with {}: is_winner={}",
                    self.session_local,
                    sender.anon(),
                    winner
                );

                if winner {
                    // drop the remote offer, expect an answer to ours
                    self.conflict = Conflict::Won;
                } else {
                    self.conflict = Conflict::Lost;
                    self.props_remote = Some(msg.props.clone());
                    self.set_state(EconnState::ConflictResolution);
                    self.notify(EconnEvent::Answered {
                        reset: true,
                        sdp,
                        props: msg.props.clone(),
                    });
                }
            }

            state => {
                info!(
                    "econn({}): ignoring SETUP request in state {}",
                    self.session_local, state
                );
            }
        }
    }

    fn handle_setup_response(&mut self, now: Instant, msg: &SignalingMessage) {
        match self.state {
            EconnState::PendingOutgoing | EconnState::ConflictResolution => {}
            state => {
                info!(
                    "econn({}): ignoring SETUP response in state {}",
                    self.session_local, state
                );
                return;
            }
        }

        self.setup_timer.cancel();
        self.session_remote = Some(msg.session_id.clone());
        self.props_remote = Some(msg.props.clone());
        self.enter_answered(now);

        self.notify(EconnEvent::Answered {
            reset: false,
            sdp: msg.sdp.clone().unwrap_or_default(),
            props: msg.props.clone(),
        });
    }

    fn recv_update(&mut self, now: Instant, sender: &Identity, msg: &SignalingMessage) {
        if !self.remote_session_matches(msg) {
            warn!(
                "econn({}): recv_update: remote session id does not match ({})",
                self.session_local, msg.session_id
            );
            return;
        }
        if !self.remote.as_ref().is_some_and(|r| r.matches(sender)) {
            warn!(
                "econn({}): ignoring UPDATE from unexpected device {}",
                self.session_local,
                sender.anon()
            );
            return;
        }

        let sdp = msg.sdp.clone().unwrap_or_default();

        if msg.is_response {
            if self.state != EconnState::UpdateSent {
                info!(
                    "econn({}): ignoring UPDATE response in state {}",
                    self.session_local, self.state
                );
                return;
            }
            self.setup_timer.cancel();
            self.props_remote = Some(msg.props.clone());
            self.enter_answered(now);
            self.notify(EconnEvent::UpdateResponse {
                sdp,
                props: msg.props.clone(),
            });
            return;
        }

        let mut should_reset = false;
        match self.state {
            EconnState::Answered | EconnState::DatachanEstablished => {
                self.term_timer.cancel();
                self.set_state(EconnState::UpdateRecv);
            }
            EconnState::UpdateSent => {
                let winner = is_winner(&self.local, sender);
                info!(
                    "econn({}): UPDATE conflict with {}: is_winner={}",
                    self.session_local,
                    sender.anon(),
                    winner
                );
                if winner {
                    return;
                }
                should_reset = true;
                self.set_state(EconnState::UpdateRecv);
            }
            state => {
                warn!(
                    "econn({}): ignoring UPDATE request in state {}",
                    self.session_local, state
                );
                return;
            }
        }

        self.props_remote = Some(msg.props.clone());
        self.setup_timer.arm(now, self.config.timeout_setup());
        self.notify(EconnEvent::UpdateRequest {
            remote: sender.clone(),
            sdp,
            props: msg.props.clone(),
            should_reset,
        });
    }

    fn recv_cancel(&mut self, sender: &Identity, msg: &SignalingMessage, timing: MessageTiming) {
        let from_remote = self
            .remote
            .as_ref()
            .is_some_and(|r| r.clientid.eq_ignore_ascii_case(&sender.clientid));
        if !from_remote {
            info!(
                "econn({}): recv_cancel: client does not match (sender={})",
                self.session_local,
                sender.anon()
            );
            return;
        }

        match self.state {
            EconnState::PendingIncoming
            | EconnState::ConflictResolution
            | EconnState::Answered
            | EconnState::DatachanEstablished
            | EconnState::UpdateSent
            | EconnState::UpdateRecv => {}
            state => {
                info!(
                    "econn({}): ignoring CANCEL in state {}",
                    self.session_local, state
                );
                return;
            }
        }

        if !self.remote_session_matches(msg) {
            warn!(
                "econn({}): recv_cancel: remote session id does not match ({})",
                self.session_local, msg.session_id
            );
            return;
        }

        let reason = self.reason_or(CloseReason::Canceled);
        self.terminate(reason, timing.msg_time);
    }

    fn recv_hangup(&mut self, msg: &SignalingMessage, timing: MessageTiming) {
        if !self.remote_session_matches(msg) {
            warn!(
                "econn({}): recv_hangup: remote session id does not match ({})",
                self.session_local, msg.session_id
            );
            return;
        }

        match self.state {
            EconnState::Answered
            | EconnState::DatachanEstablished
            | EconnState::UpdateSent
            | EconnState::UpdateRecv
            | EconnState::HangupSent => {}
            state => {
                warn!(
                    "econn({}): ignoring HANGUP in state {}",
                    self.session_local, state
                );
                return;
            }
        }

        self.set_state(EconnState::HangupRecv);
        if msg.is_request() {
            self.send(SignalingMessage::hangup(self.session_local.clone(), true));
        }

        let reason = self.reason_or(CloseReason::Normal);
        self.terminate(reason, timing.msg_time);
    }

    fn recv_propsync(&mut self, msg: &SignalingMessage) {
        if self.state != EconnState::DatachanEstablished {
            info!(
                "econn({}): ignoring PROPSYNC in state {}",
                self.session_local, self.state
            );
            return;
        }
        self.props_remote = Some(msg.props.clone());
        self.notify(EconnEvent::Propsync {
            props: msg.props.clone(),
            is_response: msg.is_response,
        });
    }

    /// Lock the remote identity on first contact, drop strangers afterwards
    fn accept_sender(&mut self, sender: &Identity, msg: &SignalingMessage) -> bool {
        match &self.remote {
            None => {
                self.remote = Some(sender.clone());
                true
            }
            Some(remote) if remote.matches(sender) => true,
            Some(remote) => {
                warn!(
                    "econn({}): remote already set to {}, dropping {} from {}",
                    self.session_local,
                    remote.anon(),
                    msg.brief(),
                    sender.anon()
                );
                false
            }
        }
    }

    fn remote_session_matches(&self, msg: &SignalingMessage) -> bool {
        self.session_remote
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case(&msg.session_id))
    }

    fn enter_answered(&mut self, now: Instant) {
        self.set_state(EconnState::Answered);
        self.term_timer.arm(now, self.config.timeout_term());
    }

    fn reason_or(&self, fallback: CloseReason) -> CloseReason {
        self.pending_error.clone().unwrap_or(fallback)
    }

    fn terminate(&mut self, reason: CloseReason, msg_time: u32) {
        self.setup_timer.cancel();
        self.term_timer.cancel();
        if self.state != EconnState::Terminating {
            self.set_state(EconnState::Terminating);
        }

        if self.close_notified {
            return;
        }
        self.close_notified = true;
        if reason.is_error() {
            info!("econn({}): closed ({})", self.session_local, reason);
        } else {
            info!("econn({}): closed (normal)", self.session_local);
        }
        self.notify(EconnEvent::Closed { reason, msg_time });
    }

    fn set_state(&mut self, state: EconnState) {
        info!(
            "econn({}): State changed: {} -> {}",
            self.session_local, self.state, state
        );
        self.state = state;
    }

    fn send(&mut self, mut msg: SignalingMessage) {
        msg.src_userid = Some(self.local.userid.clone());
        msg.src_clientid = Some(self.local.clientid.clone());
        if let Some(remote) = &self.remote {
            msg.dest_userid = Some(remote.userid.clone());
            msg.dest_clientid = Some(remote.clientid.clone());
        }
        debug!("econn({}): send {}", self.session_local, msg.brief());
        self.outbox.push_back(EconnAction::Send(msg));
    }

    fn notify(&mut self, event: EconnEvent) {
        self.outbox.push_back(EconnAction::Notify(event));
    }
}
