//! Two engines in one process calling each other.
//!
//! An in-memory relay plays the backend and a loopback media system
//! "connects" as soon as both descriptions are known, delivering data
//! channel bytes straight to the peer's flow.
//!
//! ```sh
//! cargo run -p avs-call-core --example loopback_call [-- <log level>]
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{Level, info};

use avs_call_core::{
    CallConfig, CallEngine, CallEvent, ChannelHandler, ConversationKind, Destination,
    EngineHandle, Envelope, MediaError, MediaEventSink, MediaFlow, MediaSystem, SdpKind,
    SdpOutcome, Transport, TransportError, TurnServer,
};
use avs_econn_core::Identity;
use avs_infra_common::{LoggingConfig, parse_log_level, setup_logging};

const CONVID: &str = "loopback";

/// Backend stand-in: queues envelopes for the router task
struct Relay {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Transport for Relay {
    fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        self.tx
            .send(envelope)
            .map_err(|_| TransportError::NotConnected)
    }
}

/// Event sinks of the live flows, by device
type FlowDirectory = Arc<Mutex<HashMap<String, MediaEventSink>>>;

struct LoopbackMedia {
    owner: Identity,
    peer: Identity,
    flows: FlowDirectory,
}

impl MediaSystem for LoopbackMedia {
    fn alloc_flow(
        &self,
        _convid: &str,
        _kind: ConversationKind,
        events: MediaEventSink,
    ) -> Result<Box<dyn MediaFlow>, MediaError> {
        self.flows.lock().insert(self.owner.key(), events.clone());
        Ok(Box::new(LoopbackFlow {
            name: self.owner.key(),
            peer: self.peer.key(),
            flows: self.flows.clone(),
            events,
        }))
    }
}

struct LoopbackFlow {
    name: String,
    peer: String,
    flows: FlowDirectory,
    events: MediaEventSink,
}

impl LoopbackFlow {
    fn connected(&self) {
        self.events.established("DTLS-SRTP", "opus/48000/2");
        self.events.datachannel_established();
    }
}

impl MediaFlow for LoopbackFlow {
    fn add_turn_server(&mut self, _server: &TurnServer) -> Result<(), MediaError> {
        Ok(())
    }

    fn gather_candidates(&mut self) -> Result<(), MediaError> {
        Ok(())
    }

    fn create_offer(&mut self) -> Result<SdpOutcome, MediaError> {
        Ok(SdpOutcome::Ready(format!("v=0\r\no={} offer\r\n", self.name)))
    }

    fn create_answer(&mut self) -> Result<SdpOutcome, MediaError> {
        self.connected();
        Ok(SdpOutcome::Ready(format!("v=0\r\no={} answer\r\n", self.name)))
    }

    fn set_remote_description(&mut self, kind: SdpKind, _sdp: &str) -> Result<(), MediaError> {
        if kind == SdpKind::Answer {
            self.connected();
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<(), MediaError> {
        Ok(())
    }

    fn send_data(&mut self, data: Bytes) -> Result<(), MediaError> {
        let flows = self.flows.lock();
        let peer = flows
            .get(&self.peer)
            .ok_or_else(|| MediaError::Failed("peer flow gone".into()))?;
        peer.data_received(data);
        Ok(())
    }

    fn start_media(&mut self) -> Result<(), MediaError> {
        info!("{}: media flowing", self.name);
        Ok(())
    }

    fn close(&mut self) {
        self.flows.lock().remove(&self.name);
    }
}

fn spawn_device(
    me: &Identity,
    peer: &Identity,
    relay: &mpsc::UnboundedSender<Envelope>,
    flows: &FlowDirectory,
) -> Result<(EngineHandle, mpsc::UnboundedReceiver<CallEvent>)> {
    let (handler, events) = ChannelHandler::new();
    let transport = Arc::new(Relay { tx: relay.clone() });
    let media = Arc::new(LoopbackMedia {
        owner: me.clone(),
        peer: peer.clone(),
        flows: flows.clone(),
    });
    let (engine, _task) = CallEngine::spawn(
        CallConfig::default(),
        me.clone(),
        transport,
        media,
        Arc::new(handler),
    )
    .with_context(|| format!("starting engine for {}", me.key()))?;
    Ok((engine, events))
}

#[tokio::main]
async fn main() -> Result<()> {
    let level = match std::env::args().nth(1) {
        Some(arg) => parse_log_level(&arg)?,
        None => Level::INFO,
    };
    setup_logging(&LoggingConfig::new(level, "loopback_call"))?;

    let alice = Identity::new("alice", "a1");
    let bob = Identity::new("bob", "b1");
    let flows: FlowDirectory = Arc::default();
    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel::<Envelope>();

    let (alice_engine, mut alice_events) = spawn_device(&alice, &bob, &relay_tx, &flows)?;
    let (bob_engine, mut bob_events) = spawn_device(&bob, &alice, &relay_tx, &flows)?;

    // backend fan-out
    let devices = vec![
        (alice.clone(), alice_engine.clone()),
        (bob.clone(), bob_engine.clone()),
    ];
    tokio::spawn(async move {
        let mut server_time: u32 = 1_700_000_000;
        while let Some(envelope) = relay_rx.recv().await {
            server_time += 1;
            let wire = match envelope.encode() {
                Ok(wire) => wire,
                Err(e) => {
                    tracing::warn!("relay: cannot encode: {}", e);
                    continue;
                }
            };
            for (id, engine) in &devices {
                let wanted = match &envelope.destination {
                    Destination::Conversation => true,
                    Destination::User(userid) => id.userid == *userid,
                    Destination::Device(target) => id.matches(target),
                };
                if !wanted || id.matches(&envelope.sender) {
                    continue;
                }
                let delivered = engine
                    .recv_encoded(
                        envelope.convid.clone(),
                        server_time,
                        server_time,
                        envelope.sender.clone(),
                        &wire,
                    )
                    .await;
                if let Err(e) = delivered {
                    tracing::warn!("relay: delivery to {} failed: {}", id.key(), e);
                }
            }
        }
    });

    // Bob picks up whatever rings
    let bob_answerer = bob_engine.clone();
    let bob_task = tokio::spawn(async move {
        while let Some(event) = bob_events.recv().await {
            info!("bob: {}", event.name());
            match event {
                CallEvent::Incoming { convid, .. } => {
                    if let Err(e) = bob_answerer.answer_call(convid, false).await {
                        tracing::warn!("bob: cannot answer: {}", e);
                    }
                }
                CallEvent::Closed(closed) => {
                    info!("bob: call closed ({})", closed.reason);
                    break;
                }
                _ => {}
            }
        }
    });

    alice_engine
        .start_call(CONVID, ConversationKind::OneToOne, false)
        .await?;

    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), alice_events.recv())
            .await
            .context("waiting for the call to come up")?;
        let Some(event) = event else {
            bail!("alice's engine stopped");
        };
        info!("alice: {}", event.name());
        match event {
            CallEvent::MediaEstablished { .. } => break,
            CallEvent::Closed(closed) => bail!("call failed: {}", closed.reason),
            _ => {}
        }
    }

    tokio::time::sleep(Duration::from_secs(1)).await;
    alice_engine.end_call(CONVID).await?;

    while let Some(event) = alice_events.recv().await {
        if let CallEvent::Closed(closed) = event {
            info!("alice: call closed ({}), metrics {}", closed.reason, closed.metrics);
            break;
        }
    }
    bob_task.await?;

    alice_engine.shutdown().await?;
    bob_engine.shutdown().await?;
    Ok(())
}
