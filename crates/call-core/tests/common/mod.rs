//! Shared test fixtures: recording transport, scripted media and a backend
//! that fans messages out between devices through the wire codec.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use avs_call_core::{
    CallClosed, CallConfig, CallContext, CallController, CallEvent, ConversationKind, Destination,
    DirectCall, Envelope, GroupCall, Inbound, MediaError, MediaEventSink, MediaFlow,
    MediaNotification, MediaSystem, SdpKind, SdpOutcome, Transport, TransportError, TurnServer,
};
use avs_econn_core::{CloseReason, Identity, MessageKind, decode};

pub const CONVID: &str = "conv-1";

/// Transport that records what it is given
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<Envelope>>,
    failing: Mutex<bool>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take(&self) -> Vec<Envelope> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn kinds(&self) -> Vec<(MessageKind, bool)> {
        self.sent
            .lock()
            .iter()
            .map(|e| (e.message.kind, e.message.is_response))
            .collect()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }
}

impl Transport for MockTransport {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        if *self.failing.lock() {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().push(envelope);
        Ok(())
    }
}

/// What the engine did to one media flow
#[derive(Debug, Default)]
pub struct FlowLog {
    pub flow_id: u64,
    pub offers: usize,
    pub answers: usize,
    pub resets: usize,
    pub remote: Vec<SdpKind>,
    pub media_started: bool,
    pub video_send: bool,
    pub closed: bool,
    pub outbox: Vec<Bytes>,
    pub decoders: Vec<String>,
}

/// Handle on an allocated flow: its log and its event sink
#[derive(Clone)]
pub struct FlowHandle {
    pub log: Arc<Mutex<FlowLog>>,
    pub sink: MediaEventSink,
}

impl FlowHandle {
    pub fn established(&self) {
        self.sink.established("DTLS", "opus");
    }

    pub fn datachannel(&self) {
        self.sink.datachannel_established();
    }
}

struct MockFlow {
    label: String,
    gathering: bool,
    ssrcs: Option<(u32, u32)>,
    handle: FlowHandle,
}

impl MockFlow {
    fn sdp(&self, what: &str) -> SdpOutcome {
        if self.gathering {
            SdpOutcome::Gathering
        } else {
            SdpOutcome::Ready(format!("v=0 {} {} {}", what, self.label, self.handle.sink.flow_id()))
        }
    }
}

impl MediaFlow for MockFlow {
    fn add_turn_server(&mut self, _server: &TurnServer) -> Result<(), MediaError> {
        Ok(())
    }

    fn gather_candidates(&mut self) -> Result<(), MediaError> {
        Ok(())
    }

    fn create_offer(&mut self) -> Result<SdpOutcome, MediaError> {
        self.handle.log.lock().offers += 1;
        Ok(self.sdp("offer"))
    }

    fn create_answer(&mut self) -> Result<SdpOutcome, MediaError> {
        self.handle.log.lock().answers += 1;
        Ok(self.sdp("answer"))
    }

    fn set_remote_description(&mut self, kind: SdpKind, _sdp: &str) -> Result<(), MediaError> {
        self.handle.log.lock().remote.push(kind);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), MediaError> {
        self.handle.log.lock().resets += 1;
        Ok(())
    }

    fn send_data(&mut self, data: Bytes) -> Result<(), MediaError> {
        let mut log = self.handle.log.lock();
        if log.closed {
            return Err(MediaError::Failed("flow closed".into()));
        }
        log.outbox.push(data);
        Ok(())
    }

    fn start_media(&mut self) -> Result<(), MediaError> {
        self.handle.log.lock().media_started = true;
        Ok(())
    }

    fn stop_media(&mut self) {
        self.handle.log.lock().media_started = false;
    }

    fn set_video_send(&mut self, active: bool) {
        self.handle.log.lock().video_send = active;
    }

    fn local_ssrcs(&self) -> Option<(u32, u32)> {
        self.ssrcs
    }

    fn add_decoder(
        &mut self,
        userid: &str,
        clientid: &str,
        _ssrc_audio: Option<u32>,
        _ssrc_video: Option<u32>,
    ) -> Result<(), MediaError> {
        let key = format!("{userid}.{clientid}");
        let mut log = self.handle.log.lock();
        if !log.decoders.contains(&key) {
            log.decoders.push(key);
        }
        Ok(())
    }

    fn remove_decoder(&mut self, userid: &str, clientid: &str) {
        let key = format!("{userid}.{clientid}");
        self.handle.log.lock().decoders.retain(|d| *d != key);
    }

    fn close(&mut self) {
        self.handle.log.lock().closed = true;
    }
}

/// Media system handing out scripted flows
pub struct MockMedia {
    label: String,
    gathering: Mutex<bool>,
    unavailable: Mutex<bool>,
    ssrcs: Option<(u32, u32)>,
    flows: Mutex<Vec<FlowHandle>>,
}

impl MockMedia {
    pub fn new(label: &str) -> Arc<Self> {
        Self::with_ssrcs(label, None)
    }

    pub fn with_ssrcs(label: &str, ssrcs: Option<(u32, u32)>) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
            gathering: Mutex::new(false),
            unavailable: Mutex::new(false),
            ssrcs,
            flows: Mutex::new(Vec::new()),
        })
    }

    /// Descriptions are only produced once candidates are gathered
    pub fn set_gathering(&self, gathering: bool) {
        *self.gathering.lock() = gathering;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    pub fn current(&self) -> Option<FlowHandle> {
        self.flows.lock().last().cloned()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.lock().len()
    }
}

impl MediaSystem for MockMedia {
    fn alloc_flow(
        &self,
        _convid: &str,
        _kind: ConversationKind,
        events: MediaEventSink,
    ) -> Result<Box<dyn MediaFlow>, MediaError> {
        if *self.unavailable.lock() {
            return Err(MediaError::Unavailable("no audio device".into()));
        }
        let handle = FlowHandle {
            log: Arc::new(Mutex::new(FlowLog {
                flow_id: events.flow_id(),
                ..FlowLog::default()
            })),
            sink: events,
        };
        self.flows.lock().push(handle.clone());
        Ok(Box::new(MockFlow {
            label: self.label.clone(),
            gathering: *self.gathering.lock(),
            ssrcs: self.ssrcs,
            handle,
        }))
    }
}

/// One client device with its controller for [`CONVID`]
pub struct Device {
    pub id: Identity,
    pub call: Box<dyn CallController>,
    pub transport: Arc<MockTransport>,
    pub media: Arc<MockMedia>,
    media_rx: mpsc::UnboundedReceiver<MediaNotification>,
    pub events: Vec<CallEvent>,
    /// Device whose flow our data channel reaches
    pub peer: Option<usize>,
}

impl Device {
    pub fn new(id: Identity, kind: ConversationKind, config: CallConfig) -> Self {
        let transport = MockTransport::new();
        let media = MockMedia::with_ssrcs(&id.key(), Some((1000, 2000)));
        let (tx, media_rx) = mpsc::unbounded_channel();
        let ctx = CallContext {
            config: Arc::new(config),
            local: id.clone(),
            transport: transport.clone(),
            media: media.clone(),
            media_events: tx,
        };
        let call: Box<dyn CallController> = match kind {
            ConversationKind::OneToOne => Box::new(DirectCall::new(ctx, CONVID)),
            ConversationKind::Group => Box::new(GroupCall::new(ctx, CONVID)),
        };

        Self {
            id,
            call,
            transport,
            media,
            media_rx,
            events: Vec::new(),
            peer: None,
        }
    }

    fn collect_events(&mut self) {
        while let Some(event) = self.call.poll_event() {
            self.events.push(event);
        }
    }

    pub fn take_events(&mut self) -> Vec<CallEvent> {
        self.collect_events();
        std::mem::take(&mut self.events)
    }

    pub fn event_names(&mut self) -> Vec<&'static str> {
        self.take_events().iter().map(CallEvent::name).collect()
    }

    pub fn closed(&self) -> Option<CallClosed> {
        self.events.iter().find_map(|e| match e {
            CallEvent::Closed(closed) => Some(closed.clone()),
            _ => None,
        })
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed().map(|c| c.reason)
    }

    pub fn flow(&self) -> FlowHandle {
        self.media.current().expect("Device should have a media flow")
    }
}

/// A message the backend delivered
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub from: usize,
    pub to: usize,
    pub kind: MessageKind,
    pub is_response: bool,
}

/// Backend fan-out between a set of devices in one conversation
pub struct Network {
    pub devices: Vec<Device>,
    pub now: Instant,
    started: Instant,
    base_time: u32,
    pub deliveries: Vec<Delivery>,
}

impl Network {
    pub fn new(kind: ConversationKind, ids: &[(&str, &str)], config: CallConfig) -> Self {
        avs_infra_common::setup_test_logging();
        let devices = ids
            .iter()
            .map(|(userid, clientid)| Device::new(Identity::new(*userid, *clientid), kind, config.clone()))
            .collect();
        let now = Instant::now();
        Self {
            devices,
            now,
            started: now,
            base_time: 1_700_000_000,
            deliveries: Vec::new(),
        }
    }

    pub fn direct(ids: &[(&str, &str)]) -> Self {
        Self::new(ConversationKind::OneToOne, ids, CallConfig::default())
    }

    pub fn group(ids: &[(&str, &str)], config: CallConfig) -> Self {
        Self::new(ConversationKind::Group, ids, config)
    }

    /// Backend clock, seconds
    pub fn curr_time(&self) -> u32 {
        let elapsed = self.now.saturating_duration_since(self.started).as_secs();
        self.base_time + u32::try_from(elapsed).unwrap_or(u32::MAX)
    }

    pub fn device(&mut self, index: usize) -> &mut Device {
        &mut self.devices[index]
    }

    pub fn call(&mut self, index: usize) -> &mut dyn CallController {
        self.devices[index].call.as_mut()
    }

    pub fn state(&self, index: usize) -> avs_call_core::CallState {
        self.devices[index].call.state()
    }

    /// Deliver backend messages, data channel bytes and media events until
    /// nothing moves
    pub fn settle(&mut self) {
        for _ in 0..100 {
            let mut busy = false;

            for from in 0..self.devices.len() {
                for envelope in self.devices[from].transport.take() {
                    busy = true;
                    self.route(from, envelope);
                }
            }

            for from in 0..self.devices.len() {
                let Some(peer) = self.devices[from].peer else {
                    continue;
                };
                let Some(flow) = self.devices[from].media.current() else {
                    continue;
                };
                let data = std::mem::take(&mut flow.log.lock().outbox);
                if let Some(target) = self.devices[peer].media.current() {
                    for bytes in data {
                        busy = true;
                        target.sink.data_received(bytes);
                    }
                }
            }

            let now = self.now;
            for device in &mut self.devices {
                while let Ok(notification) = device.media_rx.try_recv() {
                    busy = true;
                    device
                        .call
                        .handle_media_event(now, notification.flow_id, notification.event);
                }
                device.collect_events();
            }

            if !busy {
                return;
            }
        }
        panic!("network did not settle");
    }

    /// Drop whatever `index` has queued for the backend
    pub fn lose_outgoing(&mut self, index: usize) -> Vec<Envelope> {
        self.devices[index].transport.take()
    }

    fn route(&mut self, from: usize, envelope: Envelope) {
        let bytes = envelope.encode().expect("Should encode envelope");
        let message = decode(&bytes).expect("Should decode envelope");
        let curr_time = self.curr_time();
        let now = self.now;

        let targets: Vec<usize> = (0..self.devices.len())
            .filter(|&to| to != from)
            .filter(|&to| {
                let id = &self.devices[to].id;
                match &envelope.destination {
                    Destination::Conversation => true,
                    Destination::User(userid) => id.userid == *userid,
                    Destination::Device(target) => id.matches(target),
                }
            })
            .collect();

        for to in targets {
            self.deliveries.push(Delivery {
                from,
                to,
                kind: message.kind,
                is_response: message.is_response,
            });
            let inbound = Inbound {
                curr_time,
                msg_time: curr_time,
                sender: &envelope.sender,
                message: &message,
            };
            self.devices[to].call.recv_message(now, inbound);
        }
    }

    /// Open media and the data channel between two devices
    pub fn connect_media(&mut self, a: usize, b: usize) {
        self.devices[a].peer = Some(b);
        self.devices[b].peer = Some(a);
        for index in [a, b] {
            let flow = self.devices[index].flow();
            flow.established();
            flow.datachannel();
        }
        self.settle();
    }

    /// Advance the clock, firing timers in deadline order
    pub fn advance(&mut self, by: Duration) {
        let target = self.now + by;
        loop {
            let next = self
                .devices
                .iter()
                .filter_map(|d| d.call.poll_timeout())
                .min();
            match next {
                Some(deadline) if deadline <= target => {
                    self.now = self.now.max(deadline);
                    let now = self.now;
                    for device in &mut self.devices {
                        if device.call.poll_timeout().is_some_and(|d| d <= now) {
                            device.call.handle_timeout(now);
                        }
                    }
                    self.settle();
                }
                _ => break,
            }
        }
        self.now = target;
        self.settle();
    }

    pub fn delivered(&self, kind: MessageKind) -> Vec<&Delivery> {
        self.deliveries.iter().filter(|d| d.kind == kind).collect()
    }
}
