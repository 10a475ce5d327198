//! 1:1 call lifecycles across two or more devices

mod common;

use std::time::Duration;

use avs_call_core::{CallConfig, CallError, CallEvent, CallState, ConversationKind, SdpKind, VideoState};
use avs_econn_core::{CloseReason, MessageKind};
use pretty_assertions::assert_eq;

use common::Network;

fn alice_and_bob() -> Network {
    Network::direct(&[("alice", "a1"), ("bob", "b1")])
}

/// Alice calls, Bob answers, both sides open media
fn active_call(net: &mut Network) {
    let now = net.now;
    net.call(0).start(now, false).expect("Should start call");
    net.settle();
    net.call(1).answer(now, false).expect("Should answer call");
    net.settle();
    net.connect_media(0, 1);
    net.device(0).take_events();
    net.device(1).take_events();
}

#[test]
fn test_call_answer_and_hangup() {
    let mut net = alice_and_bob();
    let now = net.now;

    net.call(0).start(now, false).expect("Should start call");
    assert_eq!(net.state(0), CallState::Outgoing);
    net.settle();

    let incoming = net.device(1).take_events();
    match incoming.as_slice() {
        [
            CallEvent::Incoming {
                userid,
                clientid,
                video,
                should_ring,
                ..
            },
        ] => {
            assert_eq!(userid, "alice");
            assert_eq!(clientid, "a1");
            assert!(!video);
            assert!(should_ring);
        }
        other => panic!("Expected one incoming event, got {other:?}"),
    }
    assert_eq!(net.state(1), CallState::Incoming);

    net.call(1).answer(now, false).expect("Should answer call");
    net.settle();
    assert_eq!(net.device(0).event_names(), vec!["answered"]);
    assert_eq!(net.state(0), CallState::Answered);
    assert_eq!(net.state(1), CallState::Answered);

    net.connect_media(0, 1);
    assert_eq!(
        net.device(0).event_names(),
        vec!["media_established", "datachannel_established"]
    );
    assert_eq!(
        net.device(1).event_names(),
        vec!["media_established", "datachannel_established"]
    );
    assert_eq!(net.state(0), CallState::Active);
    assert_eq!(net.state(1), CallState::Active);
    assert!(net.device(0).flow().log.lock().media_started);
    assert!(net.device(1).flow().log.lock().media_started);

    net.call(0).end(now);
    net.settle();

    assert_eq!(net.device(0).close_reason(), Some(CloseReason::Normal));
    assert_eq!(net.device(1).close_reason(), Some(CloseReason::Normal));
    let closed = net.device(0).closed().expect("Alice should be closed");
    assert_eq!(closed.userid.as_deref(), Some("bob"));
    assert_eq!(closed.clientid.as_deref(), Some("b1"));
    assert!(closed.metrics.contains("\"answered\":true"));
    assert!(net.device(0).call.is_finished());
    assert!(net.device(1).call.is_finished());
    assert!(net.device(0).flow().log.lock().closed);
    assert!(net.device(1).flow().log.lock().closed);

    // the hangup travelled over the data channel, not the backend
    assert!(net.delivered(MessageKind::Hangup).is_empty());
}

#[test]
fn test_caller_cancels_while_ringing() {
    let mut net = alice_and_bob();
    let now = net.now;

    net.call(0).start(now, false).expect("Should start call");
    net.settle();
    net.call(0).end(now);
    net.settle();

    assert_eq!(net.device(0).close_reason(), Some(CloseReason::Canceled));
    assert_eq!(net.device(1).close_reason(), Some(CloseReason::Canceled));
    assert_eq!(net.delivered(MessageKind::Cancel).len(), 1);
    assert!(net.device(1).flow().log.lock().closed);
}

#[test]
fn test_unanswered_call_times_out() {
    let mut net = alice_and_bob();
    let now = net.now;

    net.call(0).start(now, false).expect("Should start call");
    net.settle();
    net.advance(Duration::from_secs(61));

    assert_eq!(net.device(0).close_reason(), Some(CloseReason::TimedOut));
    assert_eq!(net.device(1).close_reason(), Some(CloseReason::TimedOut));
    assert_eq!(net.state(0), CallState::Terminating);
}

#[test]
fn test_media_needs_answer_too() {
    let mut net = alice_and_bob();
    let now = net.now;

    net.call(0).start(now, false).expect("Should start call");
    net.settle();

    // Alice's flow comes up before Bob has answered
    net.device(0).flow().established();
    net.settle();
    assert!(net.device(0).event_names().is_empty());
    assert_eq!(net.state(0), CallState::Outgoing);

    net.call(1).answer(now, false).expect("Should answer call");
    net.settle();
    assert_eq!(
        net.device(0).event_names(),
        vec!["answered", "media_established"]
    );
    assert_eq!(net.state(0), CallState::Active);
}

#[test]
fn test_media_start_timeout() {
    let config = CallConfig {
        auto_media_start: false,
        media_start_timeout_ms: 10_000,
        ..CallConfig::default()
    };
    let mut net = Network::new(
        ConversationKind::OneToOne,
        &[("alice", "a1"), ("bob", "b1")],
        config,
    );
    active_call(&mut net);
    assert!(!net.device(0).flow().log.lock().media_started);

    net.advance(Duration::from_secs(11));

    for index in [0, 1] {
        match net.device(index).close_reason() {
            Some(CloseReason::MediaFailed(error)) => assert_eq!(error, "media start timeout"),
            other => panic!("Expected media failure, got {other:?}"),
        }
    }
}

#[test]
fn test_explicit_media_start() {
    let config = CallConfig {
        auto_media_start: false,
        ..CallConfig::default()
    };
    let mut net = Network::new(
        ConversationKind::OneToOne,
        &[("alice", "a1"), ("bob", "b1")],
        config,
    );
    active_call(&mut net);

    let now = net.now;
    net.call(0).media_start(now).expect("Should start media");
    net.call(1).media_start(now).expect("Should start media");
    assert!(net.device(0).flow().log.lock().media_started);

    net.advance(Duration::from_secs(30));
    assert_eq!(net.device(0).close_reason(), None);
    assert_eq!(net.state(0), CallState::Active);
}

#[test]
fn test_video_propsync() {
    let mut net = alice_and_bob();
    active_call(&mut net);
    let now = net.now;

    net.call(1).set_video_send(now, true).expect("Should toggle video");
    net.settle();

    let events = net.device(0).take_events();
    assert_eq!(
        events,
        vec![CallEvent::VideoState {
            convid: common::CONVID.to_string(),
            userid: "bob".into(),
            clientid: "b1".into(),
            state: VideoState::Started,
        }]
    );
    assert!(net.device(1).flow().log.lock().video_send);
    assert!(net.delivered(MessageKind::Propsync).is_empty());
}

#[test]
fn test_reject_stops_other_devices() {
    let mut net = Network::direct(&[("alice", "a1"), ("bob", "b1"), ("bob", "b2")]);
    let now = net.now;

    net.call(0).start(now, false).expect("Should start call");
    net.settle();
    assert_eq!(net.state(1), CallState::Incoming);
    assert_eq!(net.state(2), CallState::Incoming);

    net.call(1).reject(now).expect("Should reject");
    net.settle();

    assert_eq!(net.device(1).close_reason(), Some(CloseReason::Normal));
    assert_eq!(net.device(2).close_reason(), Some(CloseReason::RejectedElsewhere));
    let rejects = net.delivered(MessageKind::Reject);
    assert_eq!(rejects.len(), 1);
    assert_eq!(rejects[0].to, 2);

    // the caller keeps ringing
    assert_eq!(net.state(0), CallState::Outgoing);
    assert_eq!(net.device(0).close_reason(), None);
}

#[test]
fn test_reject_needs_ringing_call() {
    let mut net = alice_and_bob();
    let now = net.now;
    let err = net.call(1).reject(now).unwrap_err();
    assert!(matches!(err, CallError::InvalidState { .. }));
}

#[test]
fn test_reject_active_call_ends_it() {
    let mut net = alice_and_bob();
    active_call(&mut net);
    let now = net.now;

    net.call(1).reject(now).expect("Should end the call");
    net.settle();

    assert_eq!(net.device(0).close_reason(), Some(CloseReason::Normal));
    assert_eq!(net.device(1).close_reason(), Some(CloseReason::Normal));
    assert!(net.delivered(MessageKind::Reject).is_empty());
    assert!(net.device(1).call.reject(now).is_err());
}

#[test]
fn test_data_channel_send_failure_closes_call() {
    let mut net = alice_and_bob();
    active_call(&mut net);
    let now = net.now;

    // the channel went away underneath us
    net.device(0).flow().log.lock().closed = true;
    net.call(0).end(now);
    net.settle();

    assert!(matches!(
        net.device(0).close_reason(),
        Some(CloseReason::Transport(_))
    ));
    assert!(net.device(0).call.is_finished());
    assert_eq!(net.state(1), CallState::Active);
}

#[test]
fn test_transport_failure_closes_call() {
    let mut net = alice_and_bob();
    let now = net.now;
    net.device(0).transport.set_failing(true);

    net.call(0).start(now, false).expect("Should start call");
    net.settle();

    assert!(matches!(
        net.device(0).close_reason(),
        Some(CloseReason::Transport(_))
    ));
    assert!(net.device(0).call.is_finished());
    assert!(net.device(1).take_events().is_empty());
}

#[test]
fn test_late_send_failure_closes_call() {
    let mut net = alice_and_bob();
    let now = net.now;

    net.call(0).start(now, false).expect("Should start call");
    let sent = net.lose_outgoing(0);
    let session_id = sent[0].message.session_id.clone();

    net.call(0).handle_send_failure(now, &session_id, "device offline");
    net.settle();
    assert_eq!(
        net.device(0).close_reason(),
        Some(CloseReason::Transport("device offline".into()))
    );
}

#[test]
fn test_media_unavailable() {
    let mut net = alice_and_bob();
    let now = net.now;

    net.device(0).media.set_unavailable(true);
    let err = net.call(0).start(now, false).unwrap_err();
    assert!(matches!(err, CallError::MediaInit(_)));
    assert_eq!(net.state(0), CallState::Idle);

    net.device(0).media.set_unavailable(false);
    net.device(1).media.set_unavailable(true);
    net.call(0).start(now, false).expect("Should start call");
    net.settle();
    assert!(matches!(
        net.device(1).close_reason(),
        Some(CloseReason::MediaUnavailable(_))
    ));
}

#[test]
fn test_offer_waits_for_candidates() {
    let mut net = alice_and_bob();
    let now = net.now;

    net.device(0).media.set_gathering(true);
    net.call(0).start(now, false).expect("Should start call");
    net.settle();
    assert!(net.delivered(MessageKind::Setup).is_empty());
    assert_eq!(net.state(0), CallState::Outgoing);

    net.device(0).flow().sink.ice_gathered("v=0 gathered");
    net.settle();
    assert_eq!(net.delivered(MessageKind::Setup).len(), 1);
    assert_eq!(net.state(1), CallState::Incoming);
}

#[test]
fn test_restart_renegotiates_on_fresh_flows() {
    let mut net = alice_and_bob();
    active_call(&mut net);
    let now = net.now;
    let old_flow = net.device(0).flow();

    net.call(0).restart(now).expect("Should restart");
    net.settle();

    assert_eq!(net.device(0).media.flow_count(), 2);
    assert_eq!(net.device(1).media.flow_count(), 2);
    assert!(old_flow.log.lock().closed);
    let updates = net.delivered(MessageKind::Update);
    assert_eq!(updates.len(), 2);
    assert!(updates.iter().all(|d| d.from + d.to == 1));
    assert_eq!(net.device(0).flow().log.lock().remote, vec![SdpKind::Answer]);

    // the replaced flow's death is not the call's
    old_flow.sink.closed(Some("ice failed".into()));
    net.settle();
    assert_eq!(net.device(0).close_reason(), None);

    net.connect_media(0, 1);
    assert!(net.device(0).flow().log.lock().media_started);
    assert_eq!(net.state(0), CallState::Active);
    assert_eq!(net.device(0).event_names(), vec!["datachannel_established"]);
}

#[test]
fn test_media_failure_ends_call() {
    let mut net = alice_and_bob();
    active_call(&mut net);

    net.device(1).flow().sink.closed(Some("dtls alert".into()));
    net.settle();

    assert_eq!(
        net.device(1).close_reason(),
        Some(CloseReason::MediaFailed("dtls alert".into()))
    );
    assert_eq!(net.device(0).close_reason(), Some(CloseReason::Normal));
}
