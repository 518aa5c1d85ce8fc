//! Mute, DTMF, transfer and media binding on an established call

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::Harness;
use webphone_core::testing::{FakeSession, FakeStream};
use webphone_core::{
    CallSession, CallState, CallStatusCode, MediaStream, SessionSignal, SoftphoneError,
    SoftphoneEvent,
};

async fn established(h: &mut Harness) -> (Arc<CallSession>, Arc<FakeSession>) {
    let call = h.agent.call("1001").await.unwrap();
    let session = h.ua().last_session().unwrap();
    session.signal(SessionSignal::Accepted);
    h.wait_for(|e| matches!(e, SoftphoneEvent::CallStatus { info } if info.code == CallStatusCode::Confirmed))
        .await;
    (call, session)
}

#[tokio::test]
async fn test_mute_toggle_restores_track() {
    let mut h = Harness::registered().await;
    let (call, _session) = established(&mut h).await;
    let peer = h.transport.last_peer().unwrap();
    let track = peer.audio_track().unwrap();
    assert!(track.is_enabled());

    h.agent.toggle_mute(true).unwrap();
    assert!(!track.is_enabled());
    assert!(call.is_muted());

    h.agent.toggle_mute(false).unwrap();
    assert!(track.is_enabled());
    assert!(track.is_live());
    assert!(!call.is_muted());
    // the track never left the transport
    assert_eq!(peer.track_ids().len(), 1);
}

#[tokio::test]
async fn test_mute_before_established_is_rejected() {
    let h = Harness::registered().await;
    h.agent.call("1001").await.unwrap();

    let err = h.agent.toggle_mute(true).unwrap_err();
    assert!(matches!(err, SoftphoneError::InvalidSessionState { .. }));
}

#[tokio::test]
async fn test_dtmf_before_established_is_a_silent_noop() {
    let mut h = Harness::registered().await;
    h.agent.call("1001").await.unwrap();
    let session = h.ua().last_session().unwrap();
    h.drain(Duration::from_millis(20)).await;

    h.agent.send_dtmf('5').unwrap();
    h.agent.send_dtmf('?').unwrap();

    assert!(session.dtmf_sent().is_empty());
    assert!(h.drain(Duration::from_millis(20)).await.is_empty());
}

#[tokio::test]
async fn test_dtmf_on_established_call() {
    let mut h = Harness::registered().await;
    let (_call, session) = established(&mut h).await;

    for tone in "123*#D".chars() {
        h.agent.send_dtmf(tone).unwrap();
    }
    assert_eq!(session.dtmf_sent(), vec!['1', '2', '3', '*', '#', 'D']);

    let err = h.agent.send_dtmf('E').unwrap_err();
    assert_eq!(err, SoftphoneError::InvalidDtmfTone { tone: 'E' });
}

#[tokio::test]
async fn test_transfer_ends_call_exactly_once() {
    let mut h = Harness::registered().await;
    let (call, session) = established(&mut h).await;

    h.agent.transfer("2002").unwrap();
    assert_eq!(call.state(), CallState::Transferring);
    assert_eq!(session.refers(), vec!["sip:2002@pbx.example.com".to_string()]);

    // muting stays possible while the transfer is pending
    h.agent.toggle_mute(true).unwrap();

    session.signal(SessionSignal::ReferAccepted);
    session.signal(SessionSignal::ReferAccepted);

    let seen = h.drain(Duration::from_millis(50)).await;
    let codes: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            SoftphoneEvent::CallStatus { info } => Some(info.code),
            _ => None,
        })
        .collect();
    assert_eq!(codes, vec![CallStatusCode::Refer, CallStatusCode::Ended]);
    assert_eq!(
        seen.iter()
            .filter(|e| matches!(e, SoftphoneEvent::Ended { .. }))
            .count(),
        1
    );
    assert_eq!(call.state(), CallState::Ended);
    assert!(!h.agent.has_active_call());
}

#[tokio::test]
async fn test_rejected_transfer_keeps_call_up() {
    let mut h = Harness::registered().await;
    let (call, session) = established(&mut h).await;

    h.agent.transfer("2002").unwrap();
    session.signal(SessionSignal::ReferFailed {
        cause: Some("603 Decline".into()),
    });
    h.wait_for(|e| matches!(e, SoftphoneEvent::CallStatus { info } if info.code == CallStatusCode::TransferFailed))
        .await;

    assert_eq!(call.state(), CallState::Established);
    assert!(h.agent.has_active_call());
}

#[tokio::test]
async fn test_transfer_requires_established_call() {
    let h = Harness::registered().await;
    h.agent.call("1001").await.unwrap();

    let err = h.agent.transfer("2002").unwrap_err();
    assert!(matches!(err, SoftphoneError::InvalidSessionState { .. }));
    assert!(h.ua().last_session().unwrap().refers().is_empty());
}

#[tokio::test]
async fn test_remote_refer_reports_status_only() {
    let mut h = Harness::registered().await;
    let (call, session) = established(&mut h).await;

    session.signal(SessionSignal::ReferReceived {
        target: Some("sip:3003@pbx.example.com".into()),
    });
    match h
        .wait_for(|e| matches!(e, SoftphoneEvent::CallStatus { .. }))
        .await
    {
        SoftphoneEvent::CallStatus { info } => {
            assert_eq!(info.code, CallStatusCode::Refer);
            assert_eq!(info.description, "Transferring call...");
            assert_eq!(info.state, CallState::Established);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(call.state(), CallState::Established);
}

#[tokio::test]
async fn test_remote_audio_is_bound_to_sink() {
    let mut h = Harness::registered().await;
    let (call, _session) = established(&mut h).await;

    let remote: Arc<dyn MediaStream> = FakeStream::audio("remote-1");
    let peer = h.transport.last_peer().unwrap();
    assert!(peer.gather_candidate("candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host"));
    assert!(peer.deliver_remote_stream(remote));

    match h
        .wait_for(|e| matches!(e, SoftphoneEvent::RemoteStreamAvailable { .. }))
        .await
    {
        SoftphoneEvent::RemoteStreamAvailable { call_id, stream_id } => {
            assert_eq!(call_id, call.id());
            assert_eq!(stream_id, "remote-1");
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(h.sink.src_object().as_deref(), Some("remote-1"));
    assert!(h.sink.autoplay());

    h.agent.hangup().unwrap();
    assert!(h.sink.src_object().is_none());
}
