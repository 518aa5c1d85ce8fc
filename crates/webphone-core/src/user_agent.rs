//! User agent controller
//!
//! [`UserAgent`] is the entry point of the crate. It owns the connection to
//! the signaling server, tracks registration, admits at most one call at a
//! time and turns engine notifications into [`SoftphoneEvent`]s.
//!
//! # Architecture
//!
//! ```text
//!  connect/call/hangup ...        subscribe()
//!          │                          ▲
//!          ▼                          │ SoftphoneEvent
//! ┌──────────────────────────────────────────────┐
//! │ UserAgent                                    │
//! │   ConnectionState ── CallRegistry ── Call    │
//! │          ▲                                   │
//! │          │ dispatch task (one per connect)   │
//! └──────────┼───────────────────────────────────┘
//!            │ EngineEvent (generation stamped)
//!   SignalingEngine / TransportEngine
//! ```
//!
//! Every connection attempt gets a generation number. Engine events are
//! stamped with it; once an attempt is torn down its late events are dropped.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use webphone_core::*;
//! # async fn example(
//! #     signaling: Arc<dyn SignalingEngine>,
//! #     transport: Arc<dyn TransportEngine>,
//! #     devices: Arc<dyn MediaDevices>,
//! #     sink: Arc<dyn AudioSink>,
//! # ) -> SoftphoneResult<()> {
//! let agent = UserAgent::builder()
//!     .signaling_engine(signaling)
//!     .transport_engine(transport)
//!     .media_devices(devices)
//!     .audio_sink(sink)
//!     .build()?;
//!
//! let config = SoftphoneConfig::new("user42", "pbx.example.com", "wss://pbx.example.com:8088/ws")
//!     .with_password("secret");
//! agent.connect(config).await?;
//!
//! let call = agent.call("1001").await?;
//! println!("calling {}", call.remote_party());
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::call::{CallId, CallSession, CallSetup, CallState};
use crate::config::SoftphoneConfig;
use crate::dispatch::{self, EngineEventKind, EngineEventRx, EngineEventTx};
use crate::error::{SoftphoneError, SoftphoneResult};
use crate::events::{
    CallHandle, DEFAULT_EVENT_CAPACITY, EventEmitter, EventStream, IncomingCallInfo,
    SoftphoneEvent,
};
use crate::media::{AudioSink, MediaBinder, MediaConstraints, MediaDevices};
use crate::registry::{AdmitError, CallRegistry};
use crate::signaling::{
    CallDirection, CallOptions, SignalingEngine, SignalingEvent, SignalingEventSender,
    SignalingSession, SignalingUserAgent, UaParams,
};
use crate::transport::{TransportCoordinator, TransportEngine, TransportEvent, TransportEventSender};

/// Connection and registration state of the user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RegistrationState {
    /// No signaling connection
    Disconnected,
    /// Signaling transport is being opened
    Connecting,
    /// Signaling transport is up, not registered
    Connected,
    /// Registration accepted
    Registered,
    /// Registration rejected
    RegistrationFailed,
}

impl RegistrationState {
    /// State name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::Registered => "Registered",
            Self::RegistrationFailed => "RegistrationFailed",
        }
    }
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Builder for [`UserAgent`]
pub struct UserAgentBuilder {
    signaling: Option<Arc<dyn SignalingEngine>>,
    transport: Option<Arc<dyn TransportEngine>>,
    devices: Option<Arc<dyn MediaDevices>>,
    sink: Option<Arc<dyn AudioSink>>,
    event_capacity: usize,
}

impl UserAgentBuilder {
    /// Start with no collaborators and the default event capacity
    pub fn new() -> Self {
        Self {
            signaling: None,
            transport: None,
            devices: None,
            sink: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Signaling engine used to create a user agent per connection
    pub fn signaling_engine(mut self, engine: Arc<dyn SignalingEngine>) -> Self {
        self.signaling = Some(engine);
        self
    }

    /// Transport engine used to create a peer transport per call
    pub fn transport_engine(mut self, engine: Arc<dyn TransportEngine>) -> Self {
        self.transport = Some(engine);
        self
    }

    /// Microphone capture
    pub fn media_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Playback element for remote audio
    pub fn audio_sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Per-subscriber event buffer
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Build the user agent
    ///
    /// Every collaborator is required.
    pub fn build(self) -> SoftphoneResult<UserAgent> {
        let signaling = self
            .signaling
            .ok_or_else(|| SoftphoneError::config("signaling engine is required"))?;
        let transport = self
            .transport
            .ok_or_else(|| SoftphoneError::config("transport engine is required"))?;
        let devices = self
            .devices
            .ok_or_else(|| SoftphoneError::config("media devices are required"))?;
        let sink = self
            .sink
            .ok_or_else(|| SoftphoneError::config("audio sink is required"))?;

        Ok(UserAgent {
            inner: Arc::new(UserAgentInner {
                signaling,
                transport,
                media: Arc::new(MediaBinder::new(devices, sink)),
                events: EventEmitter::new(self.event_capacity),
                registry: CallRegistry::new(),
                generation: AtomicU64::new(0),
                connection: Mutex::new(ConnectionState::default()),
            }),
        })
    }
}

impl Default for UserAgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ConnectionState {
    registration: RegistrationState,
    config: Option<Arc<SoftphoneConfig>>,
    ua: Option<Arc<dyn SignalingUserAgent>>,
    pending_connect: Option<oneshot::Sender<SoftphoneResult<bool>>>,
    dispatcher: Option<JoinHandle<()>>,
    engine_tx: Option<EngineEventTx>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            registration: RegistrationState::Disconnected,
            config: None,
            ua: None,
            pending_connect: None,
            dispatcher: None,
            engine_tx: None,
        }
    }
}

struct UserAgentInner {
    signaling: Arc<dyn SignalingEngine>,
    transport: Arc<dyn TransportEngine>,
    media: Arc<MediaBinder>,
    events: EventEmitter,
    registry: CallRegistry,
    generation: AtomicU64,
    connection: Mutex<ConnectionState>,
}

impl Drop for UserAgentInner {
    fn drop(&mut self) {
        if let Some(dispatcher) = self.connection.get_mut().dispatcher.take() {
            dispatcher.abort();
        }
    }
}

/// Everything `call` needs from a registered connection
struct LiveConnection {
    generation: u64,
    config: Arc<SoftphoneConfig>,
    ua: Arc<dyn SignalingUserAgent>,
    engine_tx: EngineEventTx,
}

/// SIP softphone user agent
///
/// Cheap to clone; clones share the same connection and call.
#[derive(Clone)]
pub struct UserAgent {
    inner: Arc<UserAgentInner>,
}

impl UserAgent {
    /// Start building a user agent
    pub fn builder() -> UserAgentBuilder {
        UserAgentBuilder::new()
    }

    /// Connect to the signaling server and register
    ///
    /// Any existing connection is torn down first. Resolves with `true` once
    /// the registrar accepts the binding, or fails with the registrar's detail.
    pub async fn connect(&self, config: SoftphoneConfig) -> SoftphoneResult<bool> {
        config.validate()?;
        let config = Arc::new(config);

        let has_connection = self.inner.connection.lock().ua.is_some();
        if has_connection {
            info!("replacing existing connection");
            self.disconnect();
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (engine_tx, engine_rx) = dispatch::channel();
        let (done_tx, mut done_rx) = oneshot::channel();

        let ua = self
            .inner
            .signaling
            .create_user_agent(
                UaParams::from_config(&config),
                SignalingEventSender::new(generation, engine_tx.clone()),
            )
            .map_err(|e| SoftphoneError::connection(e.to_string()))?;

        {
            let mut conn = self.inner.connection.lock();
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                drop(conn);
                if let Err(e) = ua.stop() {
                    debug!(error = %e, "stopping superseded user agent failed");
                }
                return Err(superseded());
            }
            conn.ua = Some(Arc::clone(&ua));
            conn.config = Some(Arc::clone(&config));
            conn.pending_connect = Some(done_tx);
            conn.engine_tx = Some(engine_tx);
            conn.dispatcher = Some(tokio::spawn(dispatch_loop(
                Arc::downgrade(&self.inner),
                engine_rx,
            )));
        }

        info!(
            identity = %config.identity_uri(),
            server = %config.signaling_uri,
            generation,
            "connecting"
        );

        tokio::select! {
            biased;
            started = ua.start() => {
                if let Err(e) = started {
                    warn!(error = %e, "signaling transport failed to start");
                    if self.inner.generation.load(Ordering::SeqCst) == generation {
                        self.disconnect();
                    }
                    return Err(SoftphoneError::connection(e.to_string()));
                }
            }
            // a disconnect drops the sender while the engine is still starting
            outcome = &mut done_rx => {
                return outcome.unwrap_or_else(|_| Err(superseded()));
            }
        }

        done_rx.await.unwrap_or_else(|_| Err(superseded()))
    }

    /// Tear down the connection
    ///
    /// The active call is hung up and the registration removed on a best-effort
    /// basis. Whatever fails along the way, the state ends up `Disconnected`
    /// once the engine has been stopped.
    pub fn disconnect(&self) {
        let (generation, ua, was_registered, dispatcher) = {
            let mut conn = self.inner.connection.lock();
            let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
            // dropping the sender fails a pending connect as superseded
            conn.pending_connect.take();
            conn.engine_tx.take();
            let was_registered = conn.registration == RegistrationState::Registered;
            (generation, conn.ua.take(), was_registered, conn.dispatcher.take())
        };

        if let Some(call) = self.inner.registry.clear() {
            if !call.is_terminal() {
                if let Err(e) = call.hangup() {
                    warn!(call_id = %call.id(), error = %e, "hangup during disconnect failed");
                }
            }
        }

        if let Some(ua) = ua {
            if was_registered {
                if let Err(e) = ua.unregister() {
                    warn!(error = %e, "unregister during disconnect failed");
                }
            }
            if let Err(e) = ua.stop() {
                warn!(error = %e, "stopping user agent failed");
            }
        }
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }

        let changed = {
            let mut conn = self.inner.connection.lock();
            // a newer connect owns the state now
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            let changed = conn.registration != RegistrationState::Disconnected;
            conn.registration = RegistrationState::Disconnected;
            changed
        };
        if changed {
            info!("disconnected");
            self.inner.events.emit(SoftphoneEvent::Disconnected);
        }
    }

    /// Place a call to `number`
    ///
    /// Requires a registered connection and no active call. The microphone is
    /// captured and the transport built before the engine sends the offer.
    pub async fn call(&self, number: &str) -> SoftphoneResult<Arc<CallSession>> {
        let connection = self.live_connection("call")?;
        if let Some(active) = self.inner.registry.active() {
            return Err(SoftphoneError::invalid_state("call", active.state().name()));
        }
        let number = number.trim();
        if number.is_empty() {
            return Err(SoftphoneError::signaling("call", "empty call target"));
        }

        let local = self.inner.media.acquire_local_audio().await?;

        let LiveConnection {
            generation,
            config,
            ua,
            engine_tx,
        } = connection;
        let id = Uuid::new_v4();
        let mut transport = TransportCoordinator::new(
            id,
            Arc::clone(&self.inner.transport),
            TransportEventSender::new(generation, id, engine_tx),
        );
        let ice_servers = config.effective_ice_servers();
        let prepared = match transport.add_local_stream(local) {
            Ok(()) => transport.create_transport(&ice_servers),
            Err(e) => Err(e),
        };
        let peer = match prepared {
            Ok(peer) => peer,
            Err(e) => {
                transport.close(&self.inner.media);
                return Err(e);
            }
        };

        let target = config.resolve_target(number);
        let mut transport = Some(transport);
        let admitted = self.inner.registry.admit_with(|| {
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                return Err(SoftphoneError::connection(
                    "connection changed while placing the call",
                ));
            }
            let options = CallOptions {
                transport: peer,
                constraints: MediaConstraints::audio_only(),
                ice_servers,
            };
            let session = ua
                .call(&target, options)
                .map_err(|e| SoftphoneError::signaling("call", e.to_string()))?;
            let transport = transport
                .take()
                .ok_or_else(|| SoftphoneError::transport("transport already consumed"))?;

            let call = Arc::new(CallSession::new(CallSetup {
                id,
                direction: CallDirection::Outbound,
                remote_party: number.to_string(),
                initial_state: CallState::Idle,
                signaling: session,
                transport,
                config: Arc::clone(&config),
                media: Arc::clone(&self.inner.media),
                events: self.inner.events.clone(),
            }));
            // routed signals wait for the admission, so their events follow this one
            self.inner.events.emit(SoftphoneEvent::OutgoingCall {
                call_id: call.id(),
                remote_party: call.remote_party().to_string(),
            });
            Ok(call)
        });

        if let Some(mut unused) = transport.take() {
            unused.close(&self.inner.media);
        }

        match admitted {
            Ok(call) => {
                info!(call_id = %call.id(), %target, "outgoing call");
                Ok(call)
            }
            Err(AdmitError::Busy(active)) => {
                Err(SoftphoneError::invalid_state("call", active.state().name()))
            }
            Err(AdmitError::Failed(e)) => {
                warn!(%target, error = %e, "could not place call");
                Err(e)
            }
        }
    }

    /// Answer the ringing inbound call
    pub async fn answer(&self) -> SoftphoneResult<()> {
        self.require_active("answer")?.answer().await
    }

    /// Hang up the active call
    pub fn hangup(&self) -> SoftphoneResult<()> {
        let call = self.require_active("hangup")?;
        call.hangup()?;
        self.inner.registry.release(call.id());
        Ok(())
    }

    /// Mute or unmute the active call
    pub fn toggle_mute(&self, muted: bool) -> SoftphoneResult<()> {
        self.require_active("toggle_mute")?.toggle_mute(muted)
    }

    /// Send a DTMF tone on the active call; without one this does nothing
    pub fn send_dtmf(&self, tone: char) -> SoftphoneResult<()> {
        match self.inner.registry.active() {
            Some(call) => call.send_dtmf(tone),
            None => {
                debug!(%tone, "no active call, DTMF ignored");
                Ok(())
            }
        }
    }

    /// Transfer the active call
    pub fn transfer(&self, target: &str) -> SoftphoneResult<()> {
        self.require_active("transfer")?.transfer(target)
    }

    /// Whether the registrar has accepted the binding
    pub fn is_registered(&self) -> bool {
        self.registration_state() == RegistrationState::Registered
    }

    /// Whether a call is in progress
    pub fn has_active_call(&self) -> bool {
        self.inner.registry.active().is_some()
    }

    /// Current connection state
    pub fn registration_state(&self) -> RegistrationState {
        self.inner.connection.lock().registration
    }

    /// The call in progress, if any
    pub fn active_call(&self) -> Option<Arc<CallSession>> {
        self.inner.registry.active()
    }

    /// Configuration of the last connection attempt
    pub fn config(&self) -> Option<Arc<SoftphoneConfig>> {
        self.inner.connection.lock().config.clone()
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> EventStream {
        self.inner.events.subscribe()
    }

    fn require_active(&self, operation: &str) -> SoftphoneResult<Arc<CallSession>> {
        self.inner
            .registry
            .active()
            .ok_or_else(|| SoftphoneError::invalid_state(operation, "NoActiveCall"))
    }

    fn live_connection(&self, operation: &str) -> SoftphoneResult<LiveConnection> {
        let conn = self.inner.connection.lock();
        if conn.registration != RegistrationState::Registered {
            return Err(SoftphoneError::invalid_state(
                operation,
                conn.registration.name(),
            ));
        }
        match (&conn.config, &conn.ua, &conn.engine_tx) {
            (Some(config), Some(ua), Some(engine_tx)) => Ok(LiveConnection {
                generation: self.inner.generation.load(Ordering::SeqCst),
                config: Arc::clone(config),
                ua: Arc::clone(ua),
                engine_tx: engine_tx.clone(),
            }),
            _ => Err(SoftphoneError::invalid_state(operation, "Disconnected")),
        }
    }
}

impl fmt::Debug for UserAgent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserAgent")
            .field("registration", &self.registration_state())
            .field("generation", &self.inner.generation.load(Ordering::SeqCst))
            .field("active_call", &self.inner.registry.active().map(|c| c.id()))
            .finish()
    }
}

async fn dispatch_loop(inner: Weak<UserAgentInner>, mut rx: EngineEventRx) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let current = inner.generation.load(Ordering::SeqCst);
        if event.generation != current {
            trace!(generation = event.generation, current, "dropping stale engine event");
            continue;
        }

        match event.kind {
            EngineEventKind::Signaling(signal) => inner.on_signaling(event.generation, signal),
            EngineEventKind::Transport { call_id, event } => inner.on_transport(call_id, event),
        }
    }
    trace!("dispatch loop finished");
}

impl UserAgentInner {
    fn on_signaling(&self, generation: u64, event: SignalingEvent) {
        match event {
            SignalingEvent::Connecting => {
                self.update(generation, |conn, events| {
                    conn.registration = RegistrationState::Connecting;
                    events.emit(SoftphoneEvent::Connecting);
                });
            }
            SignalingEvent::Connected => {
                let ua = self.update(generation, |conn, events| {
                    info!("signaling connected");
                    conn.registration = RegistrationState::Connected;
                    events.emit(SoftphoneEvent::Connected);
                    conn.ua.clone()
                });
                if let Some(Some(ua)) = ua {
                    if let Err(e) = ua.register() {
                        warn!(error = %e, "register request failed");
                        self.registration_failed(generation, Some(e.to_string()));
                    }
                }
            }
            SignalingEvent::Disconnected => {
                self.update(generation, |conn, events| {
                    info!("signaling disconnected");
                    conn.registration = RegistrationState::Disconnected;
                    events.emit(SoftphoneEvent::Disconnected);
                    if let Some(pending) = conn.pending_connect.take() {
                        let _ = pending.send(Err(SoftphoneError::connection(
                            "signaling transport disconnected",
                        )));
                    }
                });
            }
            SignalingEvent::Registered => {
                self.update(generation, |conn, events| {
                    info!("registered");
                    conn.registration = RegistrationState::Registered;
                    events.emit(SoftphoneEvent::Registered);
                    // a repeated registered notification must not resolve twice
                    if let Some(pending) = conn.pending_connect.take() {
                        let _ = pending.send(Ok(true));
                    }
                });
            }
            SignalingEvent::Unregistered => {
                self.update(generation, |conn, events| {
                    info!("unregistered");
                    if conn.registration == RegistrationState::Registered {
                        conn.registration = RegistrationState::Connected;
                    }
                    events.emit(SoftphoneEvent::Unregistered);
                });
            }
            SignalingEvent::RegistrationFailed { cause } => {
                self.registration_failed(generation, cause);
            }
            SignalingEvent::NewSession {
                session,
                direction,
                remote_party,
            } => self.on_new_session(generation, session, direction, remote_party),
            SignalingEvent::Session { session_id, signal } => {
                let Some(call) = self.registry.session_for_signaling(&session_id) else {
                    debug!(%session_id, ?signal, "signal for unknown session");
                    return;
                };
                if call.handle_signal(&signal) {
                    self.registry.release(call.id());
                }
            }
        }
    }

    fn registration_failed(&self, generation: u64, cause: Option<String>) {
        let detail = cause
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| "unknown".to_string());
        self.update(generation, |conn, events| {
            warn!(%detail, "registration failed");
            conn.registration = RegistrationState::RegistrationFailed;
            events.emit(SoftphoneEvent::RegistrationFailed {
                detail: detail.clone(),
            });
            if let Some(pending) = conn.pending_connect.take() {
                let _ = pending.send(Err(SoftphoneError::registration_failed(detail)));
            }
        });
    }

    fn on_new_session(
        &self,
        generation: u64,
        session: Arc<dyn SignalingSession>,
        direction: CallDirection,
        remote_party: String,
    ) {
        if direction == CallDirection::Outbound {
            trace!(session_id = %session.id(), "outbound session announced");
            return;
        }

        let context = self.update(generation, |conn, _| {
            conn.config.clone().zip(conn.engine_tx.clone())
        });
        let Some(Some((config, engine_tx))) = context else {
            debug!(session_id = %session.id(), "inbound session without a connection, terminating");
            terminate_quietly(session.as_ref());
            return;
        };

        let admitted = self.registry.admit_with(|| {
            let id = Uuid::new_v4();
            Ok(Arc::new(CallSession::new(CallSetup {
                id,
                direction: CallDirection::Inbound,
                remote_party: remote_party.clone(),
                initial_state: CallState::Progressing,
                signaling: Arc::clone(&session),
                transport: TransportCoordinator::new(
                    id,
                    Arc::clone(&self.transport),
                    TransportEventSender::new(generation, id, engine_tx),
                ),
                config,
                media: Arc::clone(&self.media),
                events: self.events.clone(),
            })))
        });

        match admitted {
            Ok(call) => {
                info!(call_id = %call.id(), %remote_party, "incoming call");
                self.events.emit(SoftphoneEvent::IncomingCall {
                    info: IncomingCallInfo {
                        call_id: call.id(),
                        remote_party,
                        session: CallHandle(call),
                        received_at: Utc::now(),
                    },
                });
            }
            Err(AdmitError::Busy(active)) => {
                info!(
                    active_call = %active.id(),
                    %remote_party,
                    "busy, rejecting inbound call"
                );
                terminate_quietly(session.as_ref());
            }
            Err(AdmitError::Failed(e)) => {
                warn!(%remote_party, error = %e, "could not admit inbound call");
                terminate_quietly(session.as_ref());
            }
        }
    }

    fn on_transport(&self, call_id: CallId, event: TransportEvent) {
        match self.registry.session_for_call(call_id) {
            Some(call) => call.handle_transport_event(event),
            None => trace!(%call_id, ?event, "transport event for finished call"),
        }
    }

    /// Run `apply` against the connection state if `generation` is current
    fn update<R>(
        &self,
        generation: u64,
        apply: impl FnOnce(&mut ConnectionState, &EventEmitter) -> R,
    ) -> Option<R> {
        let mut conn = self.connection.lock();
        if self.generation.load(Ordering::SeqCst) != generation {
            trace!(generation, "connection superseded, ignoring event");
            return None;
        }
        Some(apply(&mut conn, &self.events))
    }
}

fn superseded() -> SoftphoneError {
    SoftphoneError::connection("connection attempt superseded")
}

fn terminate_quietly(session: &dyn SignalingSession) {
    if let Err(e) = session.terminate() {
        warn!(session_id = %session.id(), error = %e, "terminating session failed");
    }
}
