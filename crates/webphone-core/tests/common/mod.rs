//! Shared setup for integration tests

#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use webphone_core::testing::{
    FakeAudioSink, FakeMediaDevices, FakeSignalingEngine, FakeTransportEngine, FakeUserAgent,
};
use webphone_core::{EventStream, SoftphoneConfig, SoftphoneEvent, UserAgent};

static TRACING: Once = Once::new();

/// Install a test subscriber honouring `RUST_LOG`
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

pub fn config() -> SoftphoneConfig {
    SoftphoneConfig::new("user42", "pbx.example.com", "wss://pbx.example.com:8088/ws")
        .with_password("secret")
}

pub struct Harness {
    pub agent: UserAgent,
    pub signaling: Arc<FakeSignalingEngine>,
    pub transport: Arc<FakeTransportEngine>,
    pub devices: Arc<FakeMediaDevices>,
    pub sink: Arc<FakeAudioSink>,
    pub events: EventStream,
}

impl Harness {
    pub fn new() -> Self {
        init_tracing();
        Self::without_subscriber()
    }

    /// Harness that leaves the global subscriber alone, for `#[traced_test]`
    pub fn without_subscriber() -> Self {
        let signaling = Arc::new(FakeSignalingEngine::new());
        let transport = Arc::new(FakeTransportEngine::new());
        let devices = Arc::new(FakeMediaDevices::new());
        let sink = FakeAudioSink::direct();

        let agent = UserAgent::builder()
            .signaling_engine(signaling.clone())
            .transport_engine(transport.clone())
            .media_devices(devices.clone())
            .audio_sink(sink.clone())
            .build()
            .unwrap();
        let events = agent.subscribe();

        Self {
            agent,
            signaling,
            transport,
            devices,
            sink,
            events,
        }
    }

    /// Harness already registered with the default config
    pub async fn registered() -> Self {
        Self::new().connected().await
    }

    pub async fn connected(self) -> Self {
        assert!(self.agent.connect(config()).await.unwrap());
        self
    }

    pub fn ua(&self) -> Arc<FakeUserAgent> {
        self.signaling.last_agent().unwrap()
    }

    /// Wait for the first event matching `predicate`, skipping others
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&SoftphoneEvent) -> bool,
    ) -> SoftphoneEvent {
        let wait = async {
            loop {
                match self.events.next_event().await {
                    Some(event) if predicate(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event stream closed"),
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(2), wait)
            .await
            .expect("timed out waiting for event")
    }

    /// Collect every event published within `window`
    pub async fn drain(&mut self, window: Duration) -> Vec<SoftphoneEvent> {
        let mut seen = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(window, self.events.next_event()).await {
            seen.push(event);
        }
        seen
    }
}
