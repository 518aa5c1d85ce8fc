//! Connection and registration lifecycle of the user agent

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Harness, config};
use tokio_test::assert_ok;
use webphone_core::testing::eventually;
use webphone_core::{
    RegistrationState, SessionSignal, SoftphoneConfig, SoftphoneError, SoftphoneEvent,
};

fn names(events: &[SoftphoneEvent]) -> Vec<&'static str> {
    events.iter().map(|e| e.name()).collect()
}

#[tokio::test]
async fn test_connect_resolves_when_registered() {
    let mut h = Harness::new();
    let config = SoftphoneConfig::from_json(
        r#"{
            "username": "user42",
            "password": "secret",
            "domain": "pbx.example.com",
            "websocket": "wss://pbx.example.com:8088/ws"
        }"#,
    )
    .unwrap();

    let registered = assert_ok!(h.agent.connect(config).await);
    assert!(registered);
    assert_eq!(h.agent.registration_state(), RegistrationState::Registered);
    assert!(h.agent.is_registered());

    let params = h.ua().params();
    assert_eq!(params.uri, "sip:user42@pbx.example.com");
    assert_eq!(params.display_name, "user42");
    assert_eq!(params.signaling_uri, "wss://pbx.example.com:8088/ws");
    assert_eq!(params.register_expires, 300);

    let seen = h.drain(Duration::from_millis(50)).await;
    assert_eq!(names(&seen), vec!["connecting", "connected", "registered"]);
}

#[tokio::test]
async fn test_connect_disconnect_connect() {
    let mut h = Harness::new();

    assert!(h.agent.connect(config()).await.unwrap());
    h.agent.disconnect();
    assert_eq!(h.agent.registration_state(), RegistrationState::Disconnected);
    assert!(!h.agent.is_registered());

    let first = h.ua();
    assert!(first.is_stopped());
    assert_eq!(first.unregister_count(), 1);

    assert!(h.agent.connect(config()).await.unwrap());
    assert_eq!(h.agent.registration_state(), RegistrationState::Registered);
    assert_eq!(h.signaling.agents_created(), 2);

    let seen = h.drain(Duration::from_millis(50)).await;
    assert_eq!(
        names(&seen),
        vec![
            "connecting",
            "connected",
            "registered",
            "disconnected",
            "connecting",
            "connected",
            "registered"
        ]
    );
}

#[tokio::test]
async fn test_connect_replaces_live_connection() {
    let h = Harness::registered().await;
    let first = h.ua();

    assert!(h.agent.connect(config()).await.unwrap());
    assert!(first.is_stopped());
    assert!(!h.ua().is_stopped());
    assert!(h.agent.is_registered());
}

#[tokio::test]
async fn test_registration_failure_reports_detail() {
    let mut h = Harness::new();
    h.signaling.reject_registration("403 Forbidden");

    let err = h.agent.connect(config()).await.unwrap_err();
    assert_eq!(err, SoftphoneError::registration_failed("403 Forbidden"));
    assert_eq!(
        h.agent.registration_state(),
        RegistrationState::RegistrationFailed
    );

    let event = h
        .wait_for(|e| matches!(e, SoftphoneEvent::RegistrationFailed { .. }))
        .await;
    match event {
        SoftphoneEvent::RegistrationFailed { detail } => assert_eq!(detail, "403 Forbidden"),
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn test_transport_drop_rejects_pending_connect() {
    let h = Harness::new();
    h.signaling.hold_registration();

    let pending = {
        let agent = h.agent.clone();
        tokio::spawn(async move { agent.connect(config()).await })
    };
    eventually(|| h.agent.registration_state() == RegistrationState::Connected).await;

    h.ua().emit(webphone_core::SignalingEvent::Disconnected);
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, SoftphoneError::Connection { .. }));
    assert_eq!(h.agent.registration_state(), RegistrationState::Disconnected);
}

#[tokio::test]
async fn test_duplicate_registered_is_harmless() {
    let mut h = Harness::registered().await;

    h.ua().emit(webphone_core::SignalingEvent::Registered);
    h.ua().emit(webphone_core::SignalingEvent::Unregistered);
    h.wait_for(|e| matches!(e, SoftphoneEvent::Unregistered)).await;
    assert_eq!(h.agent.registration_state(), RegistrationState::Connected);
}

#[tokio::test]
async fn test_disconnect_ends_active_call_first() {
    let mut h = Harness::registered().await;
    let call = h.agent.call("1001").await.unwrap();
    let session = h.ua().last_session().unwrap();
    session.signal(SessionSignal::Accepted);
    h.wait_for(|e| matches!(e, SoftphoneEvent::CallStatus { .. })).await;

    // a failing BYE must not block the rest of the teardown
    session.fail_operations(true);
    h.agent.disconnect();

    assert_eq!(session.terminate_count(), 1);
    assert!(call.is_terminal());
    assert!(!h.agent.has_active_call());
    assert_eq!(h.agent.registration_state(), RegistrationState::Disconnected);
    assert!(h.ua().is_stopped());

    let seen = h.drain(Duration::from_millis(50)).await;
    assert_eq!(names(&seen), vec!["call_status", "ended", "disconnected"]);
}

#[tokio::test]
async fn test_disconnect_keeps_state_until_teardown_finishes() {
    let h = Harness::registered().await;
    h.agent.call("1001").await.unwrap();
    let session = h.ua().last_session().unwrap();

    let seen_during_hangup = Arc::new(Mutex::new(None));
    {
        let agent = h.agent.clone();
        let seen = seen_during_hangup.clone();
        session.on_terminate(move || {
            *seen.lock().unwrap() = Some(agent.registration_state());
        });
    }
    h.agent.disconnect();

    assert_eq!(session.terminate_count(), 1);
    assert_eq!(
        *seen_during_hangup.lock().unwrap(),
        Some(RegistrationState::Registered)
    );
    assert_eq!(h.agent.registration_state(), RegistrationState::Disconnected);
}

#[tokio::test]
async fn test_disconnect_when_idle_emits_nothing() {
    let mut h = Harness::new();
    h.agent.disconnect();

    assert_eq!(h.agent.registration_state(), RegistrationState::Disconnected);
    assert!(h.drain(Duration::from_millis(20)).await.is_empty());
}
