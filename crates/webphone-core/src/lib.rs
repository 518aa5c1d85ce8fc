//! # Webphone Core - Softphone Call-Session Layer
//!
//! This crate is the coordination core of a SIP softphone that runs against a
//! WebSocket signaling server and a WebRTC-style media transport. It:
//!
//! - tracks connection and registration state of the user agent
//! - enforces a single active call, silently rejecting further inbound offers
//! - drives each call through its lifecycle from signaling notifications
//! - binds local microphone audio and remote playback to the call's transport
//! - publishes everything that happens as a typed event stream
//!
//! The signaling engine, transport engine, capture devices and playback sink
//! are collaborators supplied through traits ([`SignalingEngine`],
//! [`TransportEngine`], [`MediaDevices`], [`AudioSink`]).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! use webphone_core::{SoftphoneConfig, SoftphoneEvent, UserAgent};
//! # async fn run(agent: UserAgent) -> webphone_core::SoftphoneResult<()> {
//! let config = SoftphoneConfig::from_json(r#"{
//!     "username": "user42",
//!     "password": "secret",
//!     "domain": "pbx.example.com",
//!     "websocket": "wss://pbx.example.com:8088/ws"
//! }"#)?;
//!
//! let mut events = agent.subscribe();
//! agent.connect(config).await?;
//!
//! while let Some(event) = events.next_event().await {
//!     if let SoftphoneEvent::IncomingCall { info } = event {
//!         info.session.answer().await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`user_agent`] - connection, registration and call admission
//! - [`call`] - per-call state machine and in-call operations
//! - [`transport`] / [`media`] - peer transport and audio binding
//! - [`signaling`] - the signaling engine boundary
//! - [`events`] - event stream
//! - [`reporting`] - call records for the control plane

pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod reporting;
pub mod signaling;
pub mod transport;
pub mod user_agent;

mod dispatch;
mod registry;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use call::{CallId, CallSession, CallState, Transition, is_valid_dtmf};
pub use config::{DEFAULT_REGISTRATION_EXPIRY, DEFAULT_STUN_SERVER, IceServer, SoftphoneConfig};
pub use error::{SoftphoneError, SoftphoneResult};
pub use events::{
    CallHandle, CallStatusCode, CallStatusInfo, EventEmitter, EventStream, IncomingCallInfo,
    SoftphoneEvent,
};
pub use media::{
    AudioSink, MediaBinder, MediaConstraints, MediaDevices, MediaError, MediaStream, MediaTrack,
    SinkCapability, TrackKind,
};
pub use reporting::{CallRecord, CallRecordSink, CallRecordStatus, CallReporter, TracingRecordSink};
pub use signaling::{
    CallDirection, CallOptions, SessionSignal, SignalingEngine, SignalingError, SignalingEvent,
    SignalingEventSender, SignalingSession, SignalingSessionId, SignalingUserAgent, UaParams,
};
pub use transport::{
    PeerTransport, RtcConfiguration, TransportCoordinator, TransportEngine, TransportError,
    TransportEvent, TransportEventSender,
};
pub use user_agent::{RegistrationState, UserAgent, UserAgentBuilder};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
