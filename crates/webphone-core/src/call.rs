//! Call session state machine
//!
//! A [`CallSession`] tracks one call from offer to teardown. Its state only
//! changes in response to signaling events or to its own operations:
//!
//! ```text
//!  Idle ──► Progressing ──► Established ──► Transferring ──► Ended
//!   │            │              │  ▲              │
//!   │            │              │  └──────────────┘ (refer failed)
//!   │            │              ▼
//!   └────────────┴─────► Ended | Failed(cause)
//! ```
//!
//! Every transition publishes a [`SoftphoneEvent::CallStatus`]; reaching a
//! terminal state additionally publishes [`SoftphoneEvent::Ended`] and releases
//! the call's transport and local media.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SoftphoneConfig;
use crate::error::{SoftphoneError, SoftphoneResult};
use crate::events::{CallStatusCode, CallStatusInfo, EventEmitter, SoftphoneEvent};
use crate::media::{MediaBinder, MediaConstraints};
use crate::signaling::{
    CallDirection, CallOptions, SessionSignal, SignalingSession, SignalingSessionId,
};
use crate::transport::{TransportCoordinator, TransportEvent};

/// Unique identifier of a call session
pub type CallId = Uuid;

/// Call lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallState {
    /// Created, not yet acknowledged by signaling
    Idle,
    /// Ringing or offer in flight
    Progressing,
    /// Media is (or should be) flowing
    Established,
    /// A transfer was requested and is pending
    Transferring,
    /// Call ended normally
    Ended,
    /// Call failed with a cause
    Failed(String),
}

impl CallState {
    /// Whether the call is over
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Failed(_))
    }

    /// State name without payload
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Progressing => "Progressing",
            Self::Established => "Established",
            Self::Transferring => "Transferring",
            Self::Ended => "Ended",
            Self::Failed(_) => "Failed",
        }
    }

    /// Where a signaling notification takes the call from this state
    ///
    /// `None` means the signal does not change anything observable.
    pub fn on_signal(&self, signal: &SessionSignal) -> Option<Transition> {
        if self.is_terminal() {
            return None;
        }

        match signal {
            SessionSignal::Progress => match self {
                Self::Idle => Some(Transition::new(Self::Progressing, CallStatusCode::Progress)),
                _ => None,
            },
            SessionSignal::Accepted | SessionSignal::Confirmed => match self {
                Self::Idle | Self::Progressing => {
                    Some(Transition::new(Self::Established, CallStatusCode::Confirmed))
                }
                _ => None,
            },
            SessionSignal::Ended { cause } => {
                Some(Transition::new(Self::Ended, CallStatusCode::Ended).with_cause(cause.clone()))
            }
            SessionSignal::Failed { cause } => {
                let cause = cause
                    .clone()
                    .filter(|c| !c.is_empty())
                    .unwrap_or_else(|| "unknown".to_string());
                Some(
                    Transition::new(Self::Failed(cause.clone()), CallStatusCode::Failed)
                        .with_cause(Some(cause)),
                )
            }
            SessionSignal::ReferReceived { .. } => {
                Some(Transition::new(self.clone(), CallStatusCode::Refer))
            }
            SessionSignal::ReferAccepted => match self {
                Self::Transferring => Some(Transition::new(Self::Ended, CallStatusCode::Ended)),
                _ => None,
            },
            SessionSignal::ReferFailed { cause } => match self {
                Self::Transferring => Some(
                    Transition::new(Self::Established, CallStatusCode::TransferFailed)
                        .with_cause(cause.clone()),
                ),
                _ => None,
            },
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(cause) => write!(f, "Failed({cause})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Outcome of applying a signal to a [`CallState`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State after the signal
    pub next: CallState,
    /// Status published for it
    pub code: CallStatusCode,
    /// Cause reported by signaling, if any
    pub cause: Option<String>,
}

impl Transition {
    fn new(next: CallState, code: CallStatusCode) -> Self {
        Self {
            next,
            code,
            cause: None,
        }
    }

    fn with_cause(mut self, cause: Option<String>) -> Self {
        self.cause = cause;
        self
    }
}

/// Whether `tone` is a valid DTMF digit
pub fn is_valid_dtmf(tone: char) -> bool {
    matches!(tone, '0'..='9' | '*' | '#' | 'A'..='D')
}

pub(crate) struct CallSetup {
    pub id: CallId,
    pub direction: CallDirection,
    pub remote_party: String,
    pub initial_state: CallState,
    pub signaling: Arc<dyn SignalingSession>,
    pub transport: TransportCoordinator,
    pub config: Arc<SoftphoneConfig>,
    pub media: Arc<MediaBinder>,
    pub events: EventEmitter,
}

struct CallInner {
    state: CallState,
    transport: TransportCoordinator,
    muted: bool,
}

/// A single call and the transport it owns
pub struct CallSession {
    id: CallId,
    direction: CallDirection,
    remote_party: String,
    created_at: DateTime<Utc>,
    signaling: Arc<dyn SignalingSession>,
    config: Arc<SoftphoneConfig>,
    media: Arc<MediaBinder>,
    events: EventEmitter,
    inner: Mutex<CallInner>,
}

impl CallSession {
    pub(crate) fn new(setup: CallSetup) -> Self {
        debug!(
            call_id = %setup.id,
            direction = ?setup.direction,
            remote_party = %setup.remote_party,
            "call session created"
        );
        Self {
            id: setup.id,
            direction: setup.direction,
            remote_party: setup.remote_party,
            created_at: Utc::now(),
            signaling: setup.signaling,
            config: setup.config,
            media: setup.media,
            events: setup.events,
            inner: Mutex::new(CallInner {
                state: setup.initial_state,
                transport: setup.transport,
                muted: false,
            }),
        }
    }

    /// Call identifier
    pub fn id(&self) -> CallId {
        self.id
    }

    /// Who originated the call
    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    /// Remote user part
    pub fn remote_party(&self) -> &str {
        &self.remote_party
    }

    /// When the session was created
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current state
    pub fn state(&self) -> CallState {
        self.inner.lock().state.clone()
    }

    /// Whether the call is over
    pub fn is_terminal(&self) -> bool {
        self.inner.lock().state.is_terminal()
    }

    /// Whether the outbound audio is muted
    pub fn is_muted(&self) -> bool {
        self.inner.lock().muted
    }

    /// Engine session id
    pub fn signaling_id(&self) -> SignalingSessionId {
        self.signaling.id()
    }

    /// Stream currently bound for playback
    pub fn remote_stream_id(&self) -> Option<String> {
        self.inner.lock().transport.remote_stream().map(|s| s.id())
    }

    /// Accept an inbound call
    ///
    /// Captures the microphone, builds the transport and hands both to the
    /// signaling engine. The call becomes Established once signaling confirms.
    pub async fn answer(&self) -> SoftphoneResult<()> {
        self.ensure_answerable()?;

        let local = self.media.acquire_local_audio().await?;

        let mut inner = self.inner.lock();
        if let Err(e) = self.ensure_answerable_in(&inner) {
            // hung up while the capture prompt was open
            self.media.release(&local);
            return Err(e);
        }

        let ice_servers = self.config.effective_ice_servers();
        let prepared = match inner.transport.add_local_stream(local.clone()) {
            Ok(()) => inner.transport.create_transport(&ice_servers),
            Err(e) => Err(e),
        };
        let transport = match prepared {
            Ok(transport) => transport,
            Err(e) => {
                self.media.release(&local);
                return Err(e);
            }
        };

        let options = CallOptions {
            transport,
            constraints: MediaConstraints::audio_only(),
            ice_servers,
        };
        self.signaling.answer(options).map_err(|e| {
            warn!(call_id = %self.id, error = %e, "answer rejected by signaling");
            SoftphoneError::signaling("answer", e.to_string())
        })?;

        info!(call_id = %self.id, "answered call");
        Ok(())
    }

    fn ensure_answerable(&self) -> SoftphoneResult<()> {
        let inner = self.inner.lock();
        self.ensure_answerable_in(&inner)
    }

    fn ensure_answerable_in(&self, inner: &CallInner) -> SoftphoneResult<()> {
        if self.direction != CallDirection::Inbound || inner.state != CallState::Progressing {
            return Err(SoftphoneError::invalid_state("answer", inner.state.name()));
        }
        Ok(())
    }

    /// End the call
    ///
    /// Signaling termination is best-effort; the call always ends locally.
    pub fn hangup(&self) -> SoftphoneResult<()> {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return Err(SoftphoneError::invalid_state("hangup", inner.state.name()));
        }

        if let Err(e) = self.signaling.terminate() {
            warn!(call_id = %self.id, error = %e, "terminate failed, ending call locally");
        }
        info!(call_id = %self.id, "hung up");
        self.transition(
            &mut inner,
            Transition::new(CallState::Ended, CallStatusCode::Ended),
        );
        Ok(())
    }

    /// Mute or unmute the outbound audio track
    ///
    /// The track stays attached, so unmuting needs no renegotiation. Without an
    /// outbound audio track this does nothing.
    pub fn toggle_mute(&self, muted: bool) -> SoftphoneResult<()> {
        let mut inner = self.inner.lock();
        if !matches!(
            inner.state,
            CallState::Established | CallState::Transferring
        ) {
            return Err(SoftphoneError::invalid_state("toggle_mute", inner.state.name()));
        }

        let Some(track) = inner.transport.outbound_audio_track() else {
            debug!(call_id = %self.id, "no outbound audio track to mute");
            return Ok(());
        };
        track.set_enabled(!muted);
        inner.muted = muted;
        debug!(call_id = %self.id, muted, "outbound audio toggled");
        Ok(())
    }

    /// Send one DTMF tone
    ///
    /// Before the call is established this silently does nothing.
    pub fn send_dtmf(&self, tone: char) -> SoftphoneResult<()> {
        let inner = self.inner.lock();
        if inner.state != CallState::Established {
            debug!(call_id = %self.id, state = inner.state.name(), "ignoring DTMF outside an established call");
            return Ok(());
        }

        let tone = tone.to_ascii_uppercase();
        if !is_valid_dtmf(tone) {
            return Err(SoftphoneError::InvalidDtmfTone { tone });
        }

        self.signaling
            .send_dtmf(tone)
            .map_err(|e| SoftphoneError::signaling("dtmf", e.to_string()))?;
        debug!(call_id = %self.id, %tone, "sent DTMF");
        Ok(())
    }

    /// Transfer the call to `target`
    ///
    /// Bare numbers and users are resolved in the configured domain.
    pub fn transfer(&self, target: &str) -> SoftphoneResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != CallState::Established {
            return Err(SoftphoneError::invalid_state("transfer", inner.state.name()));
        }

        let target = self.config.resolve_target(target);
        self.signaling
            .refer(&target)
            .map_err(|e| SoftphoneError::signaling("refer", e.to_string()))?;

        info!(call_id = %self.id, %target, "transfer requested");
        self.transition(
            &mut inner,
            Transition::new(CallState::Transferring, CallStatusCode::Refer),
        );
        Ok(())
    }

    /// Apply a signaling notification; returns `true` once the call is over
    pub(crate) fn handle_signal(&self, signal: &SessionSignal) -> bool {
        let mut inner = self.inner.lock();
        let Some(transition) = inner.state.on_signal(signal) else {
            debug!(call_id = %self.id, ?signal, state = inner.state.name(), "signal ignored");
            return inner.state.is_terminal();
        };

        if matches!(signal, SessionSignal::ReferAccepted) {
            // the far end now owns the call
            if let Err(e) = self.signaling.terminate() {
                debug!(call_id = %self.id, error = %e, "terminate after transfer failed");
            }
        }

        let established = transition.next == CallState::Established;
        self.transition(&mut inner, transition);
        if established {
            inner.transport.rebind_remote(&self.media);
        }
        inner.state.is_terminal()
    }

    pub(crate) fn handle_transport_event(&self, event: TransportEvent) {
        let mut inner = self.inner.lock();
        if let Some(stream) = inner.transport.handle_event(event, &self.media) {
            self.events.emit(SoftphoneEvent::RemoteStreamAvailable {
                call_id: self.id,
                stream_id: stream.id(),
            });
        }
    }

    fn transition(&self, inner: &mut CallInner, transition: Transition) {
        let Transition { next, code, cause } = transition;
        if next != inner.state {
            info!(
                call_id = %self.id,
                from = inner.state.name(),
                to = next.name(),
                "call state changed"
            );
        }
        inner.state = next.clone();

        self.events.emit(SoftphoneEvent::CallStatus {
            info: CallStatusInfo::new(self.id, code, cause.as_deref(), next.clone()),
        });

        if next.is_terminal() {
            inner.transport.close(&self.media);
            self.events.emit(SoftphoneEvent::Ended { call_id: self.id });
        }
    }
}

impl fmt::Debug for CallSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CallSession")
            .field("id", &self.id)
            .field("direction", &self.direction)
            .field("remote_party", &self.remote_party)
            .field("state", &inner.state)
            .field("muted", &inner.muted)
            .field("transport", &inner.transport)
            .finish()
    }
}
