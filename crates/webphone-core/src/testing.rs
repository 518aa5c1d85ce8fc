//! In-memory collaborators for tests
//!
//! Scriptable stand-ins for the signaling engine, transport engine, capture
//! devices and playback sink. Compiled for unit tests and behind the
//! `test-util` feature for integration tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::media::{
    AudioSink, MediaConstraints, MediaDevices, MediaError, MediaStream, MediaTrack, TrackKind,
};
use crate::signaling::{
    CallDirection, CallOptions, SessionSignal, SignalingEngine, SignalingError, SignalingEvent,
    SignalingEventSender, SignalingSession, SignalingSessionId, SignalingUserAgent, UaParams,
};
use crate::transport::{
    IceCandidate, PeerTransport, RtcConfiguration, RtpSender, TransportEngine, TransportError,
    TransportEvent, TransportEventSender,
};

/// Poll `condition` until it holds, panicking after two seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within 2s");
}

// media

/// Track with observable enabled/live flags
#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl FakeTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            kind,
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        })
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Stream holding a fixed set of tracks
pub struct FakeStream {
    id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl FakeStream {
    /// Stream with one audio track named `{id}-audio`
    pub fn audio(id: impl Into<String>) -> Arc<Self> {
        let id = id.into();
        let track: Arc<dyn MediaTrack> = FakeTrack::new(format!("{id}-audio"), TrackKind::Audio);
        Arc::new(Self {
            id,
            tracks: vec![track],
        })
    }

    /// Stream without any track
    pub fn empty(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            tracks: Vec::new(),
        })
    }
}

impl MediaStream for FakeStream {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.tracks.clone()
    }
}

/// Microphone that grants or denies on demand
#[derive(Default)]
pub struct FakeMediaDevices {
    denied: Mutex<Option<String>>,
    acquired: AtomicUsize,
    silent: AtomicBool,
}

impl FakeMediaDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following request fail with `reason`
    pub fn deny(&self, reason: impl Into<String>) {
        *self.denied.lock() = Some(reason.into());
    }

    /// Grant requests again
    pub fn allow(&self) {
        *self.denied.lock() = None;
    }

    /// Hand out streams without audio tracks
    pub fn without_audio(&self) {
        self.silent.store(true, Ordering::SeqCst);
    }

    /// Streams handed out so far
    pub fn acquired_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn get_user_media(
        &self,
        _constraints: MediaConstraints,
    ) -> Result<Arc<dyn MediaStream>, MediaError> {
        if let Some(reason) = self.denied.lock().clone() {
            return Err(MediaError::PermissionDenied(reason));
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        let id = format!("local-{n}");
        if self.silent.load(Ordering::SeqCst) {
            return Ok(FakeStream::empty(id));
        }
        Ok(FakeStream::audio(id))
    }
}

/// Playback element recording what was bound to it
pub struct FakeAudioSink {
    supports_src_object: bool,
    src_object: Mutex<Option<String>>,
    src: Mutex<Option<String>>,
    autoplay: AtomicBool,
    revoked: Mutex<Vec<String>>,
}

impl FakeAudioSink {
    fn with_capability(supports_src_object: bool) -> Arc<Self> {
        Arc::new(Self {
            supports_src_object,
            src_object: Mutex::new(None),
            src: Mutex::new(None),
            autoplay: AtomicBool::new(false),
            revoked: Mutex::new(Vec::new()),
        })
    }

    /// Sink that takes streams directly
    pub fn direct() -> Arc<Self> {
        Self::with_capability(true)
    }

    /// Sink that only plays object URLs
    pub fn object_url() -> Arc<Self> {
        Self::with_capability(false)
    }

    /// Id of the stream assigned directly
    pub fn src_object(&self) -> Option<String> {
        self.src_object.lock().clone()
    }

    /// URL assigned to the sink
    pub fn src(&self) -> Option<String> {
        self.src.lock().clone()
    }

    pub fn autoplay(&self) -> bool {
        self.autoplay.load(Ordering::SeqCst)
    }

    /// Object URLs released so far
    pub fn revoked(&self) -> Vec<String> {
        self.revoked.lock().clone()
    }
}

impl AudioSink for FakeAudioSink {
    fn supports_src_object(&self) -> bool {
        self.supports_src_object
    }

    fn set_src_object(&self, stream: Option<Arc<dyn MediaStream>>) {
        *self.src_object.lock() = stream.map(|s| s.id());
    }

    fn set_src(&self, url: Option<String>) {
        *self.src.lock() = url;
    }

    fn set_autoplay(&self, autoplay: bool) {
        self.autoplay.store(autoplay, Ordering::SeqCst);
    }

    fn create_object_url(&self, stream: Arc<dyn MediaStream>) -> Result<String, MediaError> {
        Ok(format!("blob:{}", stream.id()))
    }

    fn revoke_object_url(&self, url: &str) {
        self.revoked.lock().push(url.to_string());
    }
}

// transport

/// Transport engine handing out [`FakePeer`]s
#[derive(Default)]
pub struct FakeTransportEngine {
    failure: Mutex<Option<String>>,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakeTransportEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every following creation with `reason`
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.lock() = Some(reason.into());
    }

    pub fn created_count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn last_peer(&self) -> Option<Arc<FakePeer>> {
        self.peers.lock().last().cloned()
    }
}

impl TransportEngine for FakeTransportEngine {
    fn create_peer(
        &self,
        config: RtcConfiguration,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError> {
        if let Some(reason) = self.failure.lock().clone() {
            return Err(TransportError::Failed(reason));
        }
        let peer = Arc::new(FakePeer {
            config,
            events,
            tracks: Mutex::new(Vec::new()),
            closed: AtomicUsize::new(0),
        });
        self.peers.lock().push(Arc::clone(&peer));
        Ok(peer)
    }
}

/// Peer transport recording attached tracks
pub struct FakePeer {
    config: RtcConfiguration,
    events: TransportEventSender,
    tracks: Mutex<Vec<Arc<dyn MediaTrack>>>,
    closed: AtomicUsize,
}

impl FakePeer {
    /// Configuration the peer was created with
    pub fn config(&self) -> RtcConfiguration {
        self.config.clone()
    }

    /// Ids of the attached local tracks
    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.lock().iter().map(|t| t.id()).collect()
    }

    /// First attached audio track
    pub fn audio_track(&self) -> Option<Arc<dyn MediaTrack>> {
        self.tracks
            .lock()
            .iter()
            .find(|t| t.kind() == TrackKind::Audio)
            .cloned()
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Report the first track of `stream` as received from the remote side
    pub fn deliver_remote_stream(&self, stream: Arc<dyn MediaStream>) -> bool {
        let Some(track) = stream.tracks().into_iter().next() else {
            return false;
        };
        self.events.send(TransportEvent::TrackReceived {
            track,
            streams: vec![stream],
        })
    }

    /// Report a gathered ICE candidate
    pub fn gather_candidate(&self, candidate: impl Into<String>) -> bool {
        self.events.send(TransportEvent::CandidateGathered(IceCandidate {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
        }))
    }
}

impl PeerTransport for FakePeer {
    fn add_track(
        &self,
        track: Arc<dyn MediaTrack>,
        _stream: &Arc<dyn MediaStream>,
    ) -> Result<(), TransportError> {
        if self.close_count() > 0 {
            return Err(TransportError::Closed);
        }
        self.tracks.lock().push(track);
        Ok(())
    }

    fn remove_track(&self, track_id: &str) -> Result<(), TransportError> {
        let mut tracks = self.tracks.lock();
        let before = tracks.len();
        tracks.retain(|track| track.id() != track_id);
        if tracks.len() == before {
            return Err(TransportError::Failed(format!("no sender for track {track_id}")));
        }
        Ok(())
    }

    fn senders(&self) -> Vec<RtpSender> {
        self.tracks
            .lock()
            .iter()
            .map(|track| RtpSender {
                track: Some(Arc::clone(track)),
            })
            .collect()
    }

    fn close(&self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

// signaling

#[derive(Debug, Clone, PartialEq, Eq)]
enum RegistrationOutcome {
    Succeed,
    Fail(String),
    Hang,
}

struct EngineBehaviour {
    registration: RegistrationOutcome,
    start_error: Option<String>,
    start_held: bool,
    early_signal: Option<SessionSignal>,
}

/// Signaling engine whose user agents follow a scripted behaviour
///
/// By default `start` reports connecting and connected, and `register`
/// succeeds immediately.
pub struct FakeSignalingEngine {
    behaviour: Mutex<EngineBehaviour>,
    agents: Mutex<Vec<Arc<FakeUserAgent>>>,
    session_counter: Arc<AtomicUsize>,
}

impl FakeSignalingEngine {
    pub fn new() -> Self {
        Self {
            behaviour: Mutex::new(EngineBehaviour {
                registration: RegistrationOutcome::Succeed,
                start_error: None,
                start_held: false,
                early_signal: None,
            }),
            agents: Mutex::new(Vec::new()),
            session_counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Registrations are answered with a failure carrying `cause`
    pub fn reject_registration(&self, cause: impl Into<String>) {
        self.behaviour.lock().registration = RegistrationOutcome::Fail(cause.into());
    }

    /// Registrations are never answered
    pub fn hold_registration(&self) {
        self.behaviour.lock().registration = RegistrationOutcome::Hang;
    }

    /// Registrations succeed
    pub fn accept_registration(&self) {
        self.behaviour.lock().registration = RegistrationOutcome::Succeed;
    }

    /// `start` fails with `reason`
    pub fn fail_start(&self, reason: impl Into<String>) {
        self.behaviour.lock().start_error = Some(reason.into());
    }

    /// `start` never completes
    pub fn hold_start(&self) {
        self.behaviour.lock().start_held = true;
    }

    /// Outbound sessions report `signal` before `call` returns
    pub fn signal_calls_early(&self, signal: SessionSignal) {
        self.behaviour.lock().early_signal = Some(signal);
    }

    pub fn agents_created(&self) -> usize {
        self.agents.lock().len()
    }

    pub fn last_agent(&self) -> Option<Arc<FakeUserAgent>> {
        self.agents.lock().last().cloned()
    }
}

impl Default for FakeSignalingEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingEngine for FakeSignalingEngine {
    fn create_user_agent(
        &self,
        params: UaParams,
        events: SignalingEventSender,
    ) -> Result<Arc<dyn SignalingUserAgent>, SignalingError> {
        let behaviour = self.behaviour.lock();
        let agent = Arc::new(FakeUserAgent {
            params,
            events,
            registration: behaviour.registration.clone(),
            start_error: behaviour.start_error.clone(),
            start_held: behaviour.start_held,
            early_signal: behaviour.early_signal.clone(),
            session_counter: Arc::clone(&self.session_counter),
            stopped: AtomicBool::new(false),
            registers: AtomicUsize::new(0),
            unregisters: AtomicUsize::new(0),
            sessions: Mutex::new(Vec::new()),
            dialed: Mutex::new(Vec::new()),
        });
        self.agents.lock().push(Arc::clone(&agent));
        Ok(agent)
    }
}

/// One scripted signaling connection
pub struct FakeUserAgent {
    params: UaParams,
    events: SignalingEventSender,
    registration: RegistrationOutcome,
    start_error: Option<String>,
    start_held: bool,
    early_signal: Option<SessionSignal>,
    session_counter: Arc<AtomicUsize>,
    stopped: AtomicBool,
    registers: AtomicUsize,
    unregisters: AtomicUsize,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    dialed: Mutex<Vec<String>>,
}

impl FakeUserAgent {
    /// Parameters the agent was created with
    pub fn params(&self) -> UaParams {
        self.params.clone()
    }

    /// Report an arbitrary event
    pub fn emit(&self, event: SignalingEvent) -> bool {
        self.events.send(event)
    }

    /// Offer an inbound call from `remote_party`
    pub fn incoming_call(&self, remote_party: impl Into<String>) -> Arc<FakeSession> {
        let session = self.new_session();
        self.emit(SignalingEvent::NewSession {
            session: session.clone(),
            direction: CallDirection::Inbound,
            remote_party: remote_party.into(),
        });
        session
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn register_count(&self) -> usize {
        self.registers.load(Ordering::SeqCst)
    }

    pub fn unregister_count(&self) -> usize {
        self.unregisters.load(Ordering::SeqCst)
    }

    /// Targets passed to `call`
    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().clone()
    }

    /// Every session created so far, inbound and outbound
    pub fn sessions(&self) -> Vec<Arc<FakeSession>> {
        self.sessions.lock().clone()
    }

    pub fn last_session(&self) -> Option<Arc<FakeSession>> {
        self.sessions.lock().last().cloned()
    }

    fn new_session(&self) -> Arc<FakeSession> {
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let session = FakeSession::with_events(format!("session-{n}"), self.events.clone());
        self.sessions.lock().push(Arc::clone(&session));
        session
    }
}

#[async_trait]
impl SignalingUserAgent for FakeUserAgent {
    async fn start(&self) -> Result<(), SignalingError> {
        if self.start_held {
            std::future::pending::<()>().await;
        }
        if let Some(reason) = &self.start_error {
            return Err(SignalingError::TransportUnavailable(reason.clone()));
        }
        self.emit(SignalingEvent::Connecting);
        self.emit(SignalingEvent::Connected);
        Ok(())
    }

    fn stop(&self) -> Result<(), SignalingError> {
        self.stopped.store(true, Ordering::SeqCst);
        self.emit(SignalingEvent::Disconnected);
        Ok(())
    }

    fn register(&self) -> Result<(), SignalingError> {
        self.registers.fetch_add(1, Ordering::SeqCst);
        match &self.registration {
            RegistrationOutcome::Succeed => {
                self.emit(SignalingEvent::Registered);
            }
            RegistrationOutcome::Fail(cause) => {
                self.emit(SignalingEvent::RegistrationFailed {
                    cause: Some(cause.clone()),
                });
            }
            RegistrationOutcome::Hang => {}
        }
        Ok(())
    }

    fn unregister(&self) -> Result<(), SignalingError> {
        self.unregisters.fetch_add(1, Ordering::SeqCst);
        self.emit(SignalingEvent::Unregistered);
        Ok(())
    }

    fn call(
        &self,
        target: &str,
        options: CallOptions,
    ) -> Result<Arc<dyn SignalingSession>, SignalingError> {
        self.dialed.lock().push(target.to_string());
        let session = self.new_session();
        *session.options.lock() = Some(options);
        self.emit(SignalingEvent::NewSession {
            session: session.clone(),
            direction: CallDirection::Outbound,
            remote_party: target.to_string(),
        });
        if let Some(signal) = &self.early_signal {
            session.signal(signal.clone());
            // give the dispatcher time to pick the signal up before we return
            std::thread::sleep(Duration::from_millis(20));
        }
        Ok(session)
    }
}

/// Scripted signaling session
pub struct FakeSession {
    id: SignalingSessionId,
    events: Option<SignalingEventSender>,
    fail: AtomicBool,
    answers: AtomicUsize,
    terminates: AtomicUsize,
    refers: Mutex<Vec<String>>,
    dtmf: Mutex<Vec<char>>,
    options: Mutex<Option<CallOptions>>,
    on_terminate: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl FakeSession {
    /// Detached session that cannot report signals
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Self::build(id.into(), None)
    }

    fn with_events(id: String, events: SignalingEventSender) -> Arc<Self> {
        Self::build(id, Some(events))
    }

    fn build(id: String, events: Option<SignalingEventSender>) -> Arc<Self> {
        Arc::new(Self {
            id: SignalingSessionId(id),
            events,
            fail: AtomicBool::new(false),
            answers: AtomicUsize::new(0),
            terminates: AtomicUsize::new(0),
            refers: Mutex::new(Vec::new()),
            dtmf: Mutex::new(Vec::new()),
            options: Mutex::new(None),
            on_terminate: Mutex::new(None),
        })
    }

    /// Report `signal` for this session
    pub fn signal(&self, signal: SessionSignal) -> bool {
        match &self.events {
            Some(events) => events.send_session(self.id.clone(), signal),
            None => false,
        }
    }

    /// Run `hook` inside the next `terminate`
    pub fn on_terminate(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_terminate.lock() = Some(Box::new(hook));
    }

    /// Make every primitive fail
    pub fn fail_operations(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn answer_count(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    pub fn terminate_count(&self) -> usize {
        self.terminates.load(Ordering::SeqCst)
    }

    /// REFER targets sent so far
    pub fn refers(&self) -> Vec<String> {
        self.refers.lock().clone()
    }

    /// DTMF tones sent so far
    pub fn dtmf_sent(&self) -> Vec<char> {
        self.dtmf.lock().clone()
    }

    /// Media options from the last `call` or `answer`
    pub fn options(&self) -> Option<CallOptions> {
        self.options.lock().clone()
    }

    fn check(&self, operation: &str) -> Result<(), SignalingError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SignalingError::Rejected(format!("{operation} refused")));
        }
        Ok(())
    }
}

impl SignalingSession for FakeSession {
    fn id(&self) -> SignalingSessionId {
        self.id.clone()
    }

    fn answer(&self, options: CallOptions) -> Result<(), SignalingError> {
        self.check("answer")?;
        self.answers.fetch_add(1, Ordering::SeqCst);
        *self.options.lock() = Some(options);
        Ok(())
    }

    fn terminate(&self) -> Result<(), SignalingError> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        let hook = self.on_terminate.lock().take();
        if let Some(hook) = hook {
            hook();
        }
        self.check("terminate")
    }

    fn refer(&self, target: &str) -> Result<(), SignalingError> {
        self.check("refer")?;
        self.refers.lock().push(target.to_string());
        Ok(())
    }

    fn send_dtmf(&self, tone: char) -> Result<(), SignalingError> {
        self.check("dtmf")?;
        self.dtmf.lock().push(tone);
        Ok(())
    }
}
