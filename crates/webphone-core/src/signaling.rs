//! Signaling engine boundary
//!
//! The SIP-over-WebSocket engine is an external collaborator. The core only
//! drives it through the traits below and consumes the [`SignalingEvent`]s it
//! reports:
//!
//! ```text
//! ┌──────────────────────┐  create_user_agent   ┌────────────────────────┐
//! │      UserAgent       │ ───────────────────► │   SignalingEngine      │
//! │  (controller core)   │                      │ ┌────────────────────┐ │
//! │                      │ ◄─────────────────── │ │ SignalingUserAgent │ │
//! └──────────────────────┘  SignalingEvent      │ │ SignalingSession   │ │
//!                           (via sender handle) │ └────────────────────┘ │
//!                                               └────────────────────────┘
//! ```
//!
//! Each connection attempt gets a fresh [`SignalingUserAgent`], so a superseded
//! attempt can be stopped without touching its replacement.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::config::{IceServer, SoftphoneConfig};
use crate::dispatch::{EngineEvent, EngineEventKind, EngineEventTx};
use crate::media::MediaConstraints;
use crate::transport::PeerTransport;

/// Direction of a call relative to this user agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    /// Call offered by a remote party
    Inbound,
    /// Call placed by this user agent
    Outbound,
}

/// Identifier the signaling engine assigns to a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalingSessionId(pub String);

impl fmt::Display for SignalingSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors reported by the signaling engine
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    /// The signaling transport could not be opened or is gone
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
    /// The primitive is not allowed in the session's current signaling state
    #[error("invalid signaling state: {0}")]
    InvalidState(String),
    /// The remote side or the engine rejected the request
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Parameters for a user agent instance
#[derive(Debug, Clone)]
pub struct UaParams {
    /// Signaling identity, `sip:{username}@{domain}`
    pub uri: String,
    /// Display name presented to remote parties
    pub display_name: String,
    /// Authentication username
    pub authorization_user: String,
    /// Authentication password
    pub password: String,
    /// WebSocket endpoint of the signaling server
    pub signaling_uri: String,
    /// Registration expiry in seconds
    pub register_expires: u32,
    /// Session timers are disabled for browser endpoints
    pub session_timers: bool,
}

impl UaParams {
    /// Derive user agent parameters from a softphone configuration
    pub fn from_config(config: &SoftphoneConfig) -> Self {
        Self {
            uri: config.identity_uri(),
            display_name: config.display_name().to_string(),
            authorization_user: config.username.clone(),
            password: config.password.clone(),
            signaling_uri: config.signaling_uri.clone(),
            register_expires: config.registration_expiry_seconds,
            session_timers: false,
        }
    }
}

/// Media options handed to the engine when placing or answering a call
///
/// The engine negotiates SDP over the supplied peer transport.
#[derive(Clone)]
pub struct CallOptions {
    /// Peer transport owned by the call session
    pub transport: Arc<dyn PeerTransport>,
    /// Capture constraints
    pub constraints: MediaConstraints,
    /// ICE servers the transport was configured with
    pub ice_servers: Vec<IceServer>,
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("constraints", &self.constraints)
            .field("ice_servers", &self.ice_servers)
            .finish_non_exhaustive()
    }
}

/// Factory for per-connection user agents
pub trait SignalingEngine: Send + Sync {
    /// Build a user agent that reports through `events`
    fn create_user_agent(
        &self,
        params: UaParams,
        events: SignalingEventSender,
    ) -> Result<Arc<dyn SignalingUserAgent>, SignalingError>;
}

/// One signaling connection and registration binding
#[async_trait]
pub trait SignalingUserAgent: Send + Sync {
    /// Open the signaling transport
    async fn start(&self) -> Result<(), SignalingError>;
    /// Close the signaling transport
    fn stop(&self) -> Result<(), SignalingError>;
    /// Send a REGISTER with the configured expiry; the outcome arrives as an event
    fn register(&self) -> Result<(), SignalingError>;
    /// Remove the registration binding
    fn unregister(&self) -> Result<(), SignalingError>;
    /// Place a call to `target`
    fn call(
        &self,
        target: &str,
        options: CallOptions,
    ) -> Result<Arc<dyn SignalingSession>, SignalingError>;
}

/// One INVITE session inside the engine
pub trait SignalingSession: Send + Sync {
    /// Engine-assigned session id
    fn id(&self) -> SignalingSessionId;
    /// Accept an inbound offer
    fn answer(&self, options: CallOptions) -> Result<(), SignalingError>;
    /// Terminate the session (CANCEL, reject or BYE depending on its state)
    fn terminate(&self) -> Result<(), SignalingError>;
    /// Send a REFER toward `target`
    fn refer(&self, target: &str) -> Result<(), SignalingError>;
    /// Send one DTMF tone
    fn send_dtmf(&self, tone: char) -> Result<(), SignalingError>;
}

/// Per-session notifications from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    /// Provisional response (ringing, session progress)
    Progress,
    /// Final 2xx accepted the session
    Accepted,
    /// ACK exchanged, dialog confirmed
    Confirmed,
    /// Session ended normally
    Ended {
        /// Why the session ended, if reported
        cause: Option<String>,
    },
    /// Session failed before or after establishment
    Failed {
        /// Failure cause, if reported
        cause: Option<String>,
    },
    /// The remote side asked us to transfer
    ReferReceived {
        /// Requested transfer target
        target: Option<String>,
    },
    /// Our REFER was accepted and the transfer target answered
    ReferAccepted,
    /// Our REFER was rejected or the transfer target failed
    ReferFailed {
        /// Failure cause, if reported
        cause: Option<String>,
    },
}

/// Notifications from a [`SignalingUserAgent`]
#[derive(Clone)]
pub enum SignalingEvent {
    /// Signaling transport is connecting
    Connecting,
    /// Signaling transport is up
    Connected,
    /// Signaling transport dropped
    Disconnected,
    /// Registration binding accepted
    Registered,
    /// Registration binding removed
    Unregistered,
    /// Registration rejected
    RegistrationFailed {
        /// Failure detail
        cause: Option<String>,
    },
    /// A new session exists in the engine
    NewSession {
        /// The engine's session handle
        session: Arc<dyn SignalingSession>,
        /// Who originated it
        direction: CallDirection,
        /// Remote user part
        remote_party: String,
    },
    /// A session reported progress
    Session {
        /// The session the signal concerns
        session_id: SignalingSessionId,
        /// What happened
        signal: SessionSignal,
    },
}

impl fmt::Debug for SignalingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("Connecting"),
            Self::Connected => f.write_str("Connected"),
            Self::Disconnected => f.write_str("Disconnected"),
            Self::Registered => f.write_str("Registered"),
            Self::Unregistered => f.write_str("Unregistered"),
            Self::RegistrationFailed { cause } => f
                .debug_struct("RegistrationFailed")
                .field("cause", cause)
                .finish(),
            Self::NewSession {
                session,
                direction,
                remote_party,
            } => f
                .debug_struct("NewSession")
                .field("session_id", &session.id())
                .field("direction", direction)
                .field("remote_party", remote_party)
                .finish(),
            Self::Session { session_id, signal } => f
                .debug_struct("Session")
                .field("session_id", session_id)
                .field("signal", signal)
                .finish(),
        }
    }
}

/// Handle a signaling engine reports through
///
/// Cheap to clone. Sends after the owning connection attempt has been torn
/// down are dropped.
#[derive(Clone)]
pub struct SignalingEventSender {
    generation: u64,
    tx: EngineEventTx,
}

impl SignalingEventSender {
    pub(crate) fn new(generation: u64, tx: EngineEventTx) -> Self {
        Self { generation, tx }
    }

    /// Deliver an event; returns `false` if the user agent no longer listens
    pub fn send(&self, event: SignalingEvent) -> bool {
        trace!(generation = self.generation, ?event, "signaling event");
        self.tx
            .send(EngineEvent {
                generation: self.generation,
                kind: EngineEventKind::Signaling(event),
            })
            .is_ok()
    }

    /// Shorthand for a [`SignalingEvent::Session`] event
    pub fn send_session(&self, session_id: SignalingSessionId, signal: SessionSignal) -> bool {
        self.send(SignalingEvent::Session { session_id, signal })
    }
}

impl fmt::Debug for SignalingEventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalingEventSender")
            .field("generation", &self.generation)
            .finish()
    }
}
