//! Softphone event stream
//!
//! Everything that happens asynchronously (connection changes, registration
//! outcome, incoming calls, call progress) is published as a [`SoftphoneEvent`]
//! on a broadcast channel. Any number of observers can subscribe; each gets
//! its own [`EventStream`].
//!
//! # Ordering
//!
//! Events for one call are emitted in the order its state changed. The terminal
//! [`SoftphoneEvent::CallStatus`] of a call always precedes its
//! [`SoftphoneEvent::Ended`].
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn observe(agent: webphone_core::UserAgent) {
//! use webphone_core::SoftphoneEvent;
//!
//! let mut events = agent.subscribe();
//! while let Some(event) = events.next_event().await {
//!     match event {
//!         SoftphoneEvent::IncomingCall { info } => println!("call from {}", info.remote_party),
//!         SoftphoneEvent::CallStatus { info } => println!("{}: {}", info.code, info.description),
//!         _ => {}
//!     }
//! }
//! # }
//! ```

use std::fmt;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use crate::call::{CallId, CallSession, CallState};

/// Default broadcast capacity
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Status codes carried by [`SoftphoneEvent::CallStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatusCode {
    /// Remote side is being alerted
    Progress,
    /// Call is established
    Confirmed,
    /// Transfer in progress
    Refer,
    /// Transfer was rejected; the call continues
    TransferFailed,
    /// Call ended normally
    Ended,
    /// Call failed
    Failed,
}

impl CallStatusCode {
    /// Wire name of the code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Confirmed => "confirmed",
            Self::Refer => "refer",
            Self::TransferFailed => "transfer_failed",
            Self::Ended => "ended",
            Self::Failed => "failed",
        }
    }

    /// Human-readable description shown to the user
    pub fn describe(&self, cause: Option<&str>) -> String {
        match self {
            Self::Progress => "Calling...".to_string(),
            Self::Confirmed => "Call in progress".to_string(),
            Self::Refer => "Transferring call...".to_string(),
            Self::TransferFailed => "Transfer failed".to_string(),
            Self::Ended => "Call ended".to_string(),
            Self::Failed => format!("Call failed: {}", cause.unwrap_or("unknown")),
        }
    }
}

impl fmt::Display for CallStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared handle to a call session, carried by incoming-call events
#[derive(Clone)]
pub struct CallHandle(pub Arc<CallSession>);

impl Deref for CallHandle {
    type Target = CallSession;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CallHandle").field(&self.0.id()).finish()
    }
}

/// Details of an offered call
#[derive(Debug, Clone)]
pub struct IncomingCallInfo {
    /// Call identifier
    pub call_id: CallId,
    /// Remote user part
    pub remote_party: String,
    /// Session handle
    pub session: CallHandle,
    /// When the offer arrived
    pub received_at: DateTime<Utc>,
}

/// A call status update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallStatusInfo {
    /// Call identifier
    pub call_id: CallId,
    /// Status code
    pub code: CallStatusCode,
    /// User-facing description
    pub description: String,
    /// Call state after the update
    pub state: CallState,
    /// When the update happened
    pub timestamp: DateTime<Utc>,
}

impl CallStatusInfo {
    /// Build a status update stamped now
    pub fn new(call_id: CallId, code: CallStatusCode, cause: Option<&str>, state: CallState) -> Self {
        Self {
            call_id,
            code,
            description: code.describe(cause),
            state,
            timestamp: Utc::now(),
        }
    }
}

/// Events published by the softphone
#[derive(Debug, Clone)]
pub enum SoftphoneEvent {
    /// Signaling transport is connecting
    Connecting,
    /// Signaling transport is up
    Connected,
    /// Signaling transport is down
    Disconnected,
    /// Registration accepted
    Registered,
    /// Registration removed
    Unregistered,
    /// Registration rejected
    RegistrationFailed {
        /// Failure detail
        detail: String,
    },
    /// A remote party is calling
    IncomingCall {
        /// Offer details
        info: IncomingCallInfo,
    },
    /// An outbound call was placed
    OutgoingCall {
        /// Call identifier
        call_id: CallId,
        /// Dialed party
        remote_party: String,
    },
    /// A call changed status
    CallStatus {
        /// Status details
        info: CallStatusInfo,
    },
    /// A call is over; follows its terminal status
    Ended {
        /// Call identifier
        call_id: CallId,
    },
    /// Remote audio is bound for playback
    RemoteStreamAvailable {
        /// Call identifier
        call_id: CallId,
        /// Bound stream
        stream_id: String,
    },
}

impl SoftphoneEvent {
    /// Call the event concerns, if any
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Self::IncomingCall { info } => Some(info.call_id),
            Self::OutgoingCall { call_id, .. } => Some(*call_id),
            Self::CallStatus { info } => Some(info.call_id),
            Self::Ended { call_id } => Some(*call_id),
            Self::RemoteStreamAvailable { call_id, .. } => Some(*call_id),
            _ => None,
        }
    }

    /// Whether this is a terminal call status
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::CallStatus { info } => {
                matches!(info.code, CallStatusCode::Ended | CallStatusCode::Failed)
            }
            Self::Ended { .. } => true,
            _ => false,
        }
    }

    /// Event name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Registered => "registered",
            Self::Unregistered => "unregistered",
            Self::RegistrationFailed { .. } => "registration_failed",
            Self::IncomingCall { .. } => "incoming_call",
            Self::OutgoingCall { .. } => "outgoing_call",
            Self::CallStatus { .. } => "call_status",
            Self::Ended { .. } => "ended",
            Self::RemoteStreamAvailable { .. } => "remote_stream",
        }
    }
}

/// Publishes [`SoftphoneEvent`]s to all subscribers
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<SoftphoneEvent>,
}

impl EventEmitter {
    /// Create an emitter buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event
    pub fn emit(&self, event: SoftphoneEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events published from now on
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            inner: BroadcastStream::new(self.sender.subscribe()),
        }
    }

    /// Number of live subscribers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

/// One subscriber's view of the event stream
///
/// A subscriber that falls behind by more than the channel capacity loses the
/// oldest events; the gap is logged and the stream continues.
pub struct EventStream {
    inner: BroadcastStream<SoftphoneEvent>,
}

impl EventStream {
    /// Next event, or `None` once the softphone is dropped
    pub async fn next_event(&mut self) -> Option<SoftphoneEvent> {
        self.next().await
    }
}

impl Stream for EventStream {
    type Item = SoftphoneEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => return Poll::Ready(Some(event)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(skipped, "event subscriber lagged, events dropped");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream").finish_non_exhaustive()
    }
}
