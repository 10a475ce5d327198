//! The async engine: commands, inbound messages, media events and timers
//! serialized on one task

mod common;

use std::sync::Arc;

use avs_call_core::{
    CallConfig, CallEngine, CallError, CallEvent, CallState, ChannelHandler, ConversationKind,
    EngineHandle,
};
use avs_econn_core::{CloseReason, Identity, MessageKind, Props, SignalingMessage, encode};
use pretty_assertions::assert_eq;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use common::{CONVID, MockMedia, MockTransport};

struct Harness {
    engine: EngineHandle,
    task: JoinHandle<()>,
    events: UnboundedReceiver<CallEvent>,
    transport: Arc<MockTransport>,
    media: Arc<MockMedia>,
}

fn spawn_engine() -> Harness {
    avs_infra_common::setup_test_logging();
    let transport = MockTransport::new();
    let media = MockMedia::new("alice");
    let (handler, events) = ChannelHandler::new();
    let (engine, task) = CallEngine::spawn(
        CallConfig::default(),
        Identity::new("alice", "a1"),
        transport.clone(),
        media.clone(),
        Arc::new(handler),
    )
    .expect("Should spawn engine");

    Harness {
        engine,
        task,
        events,
        transport,
        media,
    }
}

fn bob() -> Identity {
    Identity::new("bob", "b1")
}

fn offer_from_bob() -> SignalingMessage {
    let mut offer = SignalingMessage::setup("bob-session", false, "v=0 bob".into(), Props::new());
    offer.src_userid = Some("bob".into());
    offer.src_clientid = Some("b1".into());
    offer
}

async fn next_event(events: &mut UnboundedReceiver<CallEvent>) -> CallEvent {
    events.recv().await.expect("Engine should report an event")
}

#[tokio::test(start_paused = true)]
async fn test_outgoing_call_times_out() {
    let mut h = spawn_engine();

    h.engine
        .start_call(CONVID, ConversationKind::OneToOne, false)
        .await
        .expect("Should start call");
    assert_eq!(h.transport.kinds(), vec![(MessageKind::Setup, false)]);
    assert_eq!(
        h.engine.call_state(CONVID).await.expect("Engine should run"),
        Some(CallState::Outgoing)
    );

    // nobody answers; the paused clock jumps to the setup timeout
    match next_event(&mut h.events).await {
        CallEvent::Closed(closed) => assert_eq!(closed.reason, CloseReason::TimedOut),
        other => panic!("Expected close, got {other:?}"),
    }
    assert_eq!(
        h.transport.kinds().last(),
        Some(&(MessageKind::Cancel, false))
    );
    assert_eq!(
        h.engine.call_state(CONVID).await.expect("Engine should run"),
        None
    );

    h.engine.shutdown().await.expect("Should shut down");
    h.task.await.expect("Engine task should finish");
}

#[tokio::test(start_paused = true)]
async fn test_incoming_call_answered_and_ended() {
    let mut h = spawn_engine();

    let wire = encode(&offer_from_bob()).expect("Should encode offer");
    h.engine
        .recv_encoded(CONVID, 1_000, 1_000, bob(), &wire)
        .await
        .expect("Should accept message");

    match next_event(&mut h.events).await {
        CallEvent::Incoming {
            userid,
            should_ring,
            ..
        } => {
            assert_eq!(userid, "bob");
            assert!(should_ring);
        }
        other => panic!("Expected incoming, got {other:?}"),
    }

    h.engine
        .answer_call(CONVID, false)
        .await
        .expect("Should answer");
    assert_eq!(h.transport.kinds(), vec![(MessageKind::Setup, true)]);

    h.media
        .current()
        .expect("Should have a flow")
        .established();
    match next_event(&mut h.events).await {
        CallEvent::MediaEstablished { userid, .. } => assert_eq!(userid, "bob"),
        other => panic!("Expected media established, got {other:?}"),
    }
    assert_eq!(
        h.engine.call_state(CONVID).await.expect("Engine should run"),
        Some(CallState::Active)
    );

    h.engine.end_call(CONVID).await.expect("Should end");
    match next_event(&mut h.events).await {
        CallEvent::Closed(closed) => {
            assert_eq!(closed.reason, CloseReason::Canceled);
            assert_eq!(closed.userid.as_deref(), Some("bob"));
        }
        other => panic!("Expected close, got {other:?}"),
    }

    h.engine.shutdown().await.expect("Should shut down");
}

#[tokio::test(start_paused = true)]
async fn test_stale_offer_does_not_ring() {
    let mut h = spawn_engine();

    h.engine
        .recv_message(CONVID, 1_100, 1_000, bob(), offer_from_bob())
        .await
        .expect("Should accept message");

    match next_event(&mut h.events).await {
        CallEvent::Incoming { should_ring, .. } => assert!(!should_ring),
        other => panic!("Expected incoming, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_request_errors() {
    let h = spawn_engine();

    let err = h.engine.answer_call("nowhere", false).await.unwrap_err();
    assert!(matches!(err, CallError::NotFound(_)));

    let err = h
        .engine
        .recv_encoded(CONVID, 0, 0, bob(), b"{not json")
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Decode(_)));

    h.engine
        .start_call(CONVID, ConversationKind::OneToOne, false)
        .await
        .expect("Should start call");
    let err = h
        .engine
        .start_call(CONVID, ConversationKind::OneToOne, false)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::AlreadyInProgress(_)));

    // a failed start leaves nothing behind
    h.media.set_unavailable(true);
    let err = h
        .engine
        .start_call("conv-2", ConversationKind::OneToOne, false)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::MediaInit(_)));
    assert_eq!(
        h.engine.call_state("conv-2").await.expect("Engine should run"),
        None
    );
}

#[tokio::test(start_paused = true)]
async fn test_messages_without_call_are_dropped() {
    let mut h = spawn_engine();

    let hangup = SignalingMessage::hangup("bob-session", false);
    h.engine
        .recv_message(CONVID, 0, 0, bob(), hangup)
        .await
        .expect("Should accept message");
    assert_eq!(
        h.engine.call_state(CONVID).await.expect("Engine should run"),
        None
    );
    assert!(h.events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_group_call_through_engine() {
    let mut h = spawn_engine();

    let start = SignalingMessage::new(MessageKind::GroupStart, "bob-group", false);
    h.engine
        .recv_message(CONVID, 500, 500, bob(), start)
        .await
        .expect("Should accept message");

    assert_eq!(next_event(&mut h.events).await.name(), "group_changed");
    assert_eq!(next_event(&mut h.events).await.name(), "incoming");

    h.engine
        .answer_call(CONVID, true)
        .await
        .expect("Should join");
    assert_eq!(next_event(&mut h.events).await.name(), "answered");
    assert_eq!(h.transport.kinds(), vec![(MessageKind::GroupStart, true)]);
    let session_id = h.transport.take()[0].message.session_id.clone();

    // the backend later reports our announcement undeliverable
    h.engine
        .report_send_failure(CONVID, session_id, "backend rejected")
        .await
        .expect("Should accept report");
    assert_eq!(next_event(&mut h.events).await.name(), "left");
    assert_eq!(
        h.engine.call_state(CONVID).await.expect("Engine should run"),
        Some(CallState::Incoming)
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_ends_calls() {
    let mut h = spawn_engine();

    h.engine
        .start_call(CONVID, ConversationKind::OneToOne, false)
        .await
        .expect("Should start call");
    h.engine.shutdown().await.expect("Should shut down");

    match next_event(&mut h.events).await {
        CallEvent::Closed(closed) => assert_eq!(closed.reason, CloseReason::Canceled),
        other => panic!("Expected close, got {other:?}"),
    }
    h.task.await.expect("Engine task should finish");

    let err = h
        .engine
        .start_call("conv-2", ConversationKind::OneToOne, false)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::EngineStopped));
}

async fn ring_from_bob(h: &mut Harness, offer: SignalingMessage) {
    h.engine
        .recv_message(CONVID, 1_000, 1_000, bob(), offer)
        .await
        .expect("Should accept message");
    match next_event(&mut h.events).await {
        CallEvent::Incoming { userid, .. } => assert_eq!(userid, "bob"),
        other => panic!("Expected incoming, got {other:?}"),
    }
}

fn cancel_from_bob() -> SignalingMessage {
    let mut cancel = SignalingMessage::cancel("bob-session");
    cancel.src_userid = Some("bob".into());
    cancel.src_clientid = Some("b1".into());
    cancel
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_offer_after_close_does_not_ring() {
    let mut h = spawn_engine();
    ring_from_bob(&mut h, offer_from_bob()).await;

    h.engine
        .recv_message(CONVID, 1_001, 1_001, bob(), cancel_from_bob())
        .await
        .expect("Should accept message");
    match next_event(&mut h.events).await {
        CallEvent::Closed(closed) => assert_eq!(closed.reason, CloseReason::Canceled),
        other => panic!("Expected close, got {other:?}"),
    }

    // the backend replays the same offer
    h.engine
        .recv_message(CONVID, 1_002, 1_000, bob(), offer_from_bob())
        .await
        .expect("Should accept message");
    assert_eq!(
        h.engine.call_state(CONVID).await.expect("Engine should run"),
        None
    );
    assert!(h.events.try_recv().is_err());
    assert_eq!(h.media.flow_count(), 1);

    // a fresh call from the same caller still rings
    let mut again = offer_from_bob();
    again.session_id = "bob-session-2".into();
    ring_from_bob(&mut h, again).await;
    assert_eq!(
        h.engine.call_state(CONVID).await.expect("Engine should run"),
        Some(CallState::Incoming)
    );
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_offer_to_ringing_call_ignored() {
    let mut h = spawn_engine();
    ring_from_bob(&mut h, offer_from_bob()).await;

    h.engine
        .recv_message(CONVID, 1_001, 1_000, bob(), offer_from_bob())
        .await
        .expect("Should accept message");
    assert_eq!(
        h.engine.call_state(CONVID).await.expect("Engine should run"),
        Some(CallState::Incoming)
    );
    assert!(h.events.try_recv().is_err());
    assert!(h.transport.kinds().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_cancel_after_close_dropped() {
    let mut h = spawn_engine();
    ring_from_bob(&mut h, offer_from_bob()).await;

    for _ in 0..2 {
        h.engine
            .recv_message(CONVID, 1_001, 1_001, bob(), cancel_from_bob())
            .await
            .expect("Should accept message");
    }
    match next_event(&mut h.events).await {
        CallEvent::Closed(closed) => assert_eq!(closed.reason, CloseReason::Canceled),
        other => panic!("Expected close, got {other:?}"),
    }
    assert_eq!(
        h.engine.call_state(CONVID).await.expect("Engine should run"),
        None
    );
    assert!(h.events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_answer_to_outgoing_call_ignored() {
    let mut h = spawn_engine();

    h.engine
        .start_call(CONVID, ConversationKind::OneToOne, false)
        .await
        .expect("Should start call");
    assert_eq!(h.transport.kinds(), vec![(MessageKind::Setup, false)]);

    let mut answer = SignalingMessage::setup("bob-session", true, "v=0 bob".into(), Props::new());
    answer.src_userid = Some("bob".into());
    answer.src_clientid = Some("b1".into());
    for _ in 0..2 {
        h.engine
            .recv_message(CONVID, 1_001, 1_001, bob(), answer.clone())
            .await
            .expect("Should accept message");
    }

    match next_event(&mut h.events).await {
        CallEvent::Answered { .. } => {}
        other => panic!("Expected answered, got {other:?}"),
    }
    assert_eq!(
        h.engine.call_state(CONVID).await.expect("Engine should run"),
        Some(CallState::Answered)
    );
    assert!(h.events.try_recv().is_err());
}
