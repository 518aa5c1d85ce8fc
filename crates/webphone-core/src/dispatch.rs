//! Engine event multiplexing
//!
//! Signaling and transport engines report through handles that all feed one
//! unbounded channel per connection attempt. The user agent drains that
//! channel on a single task, so every transition is applied in arrival order.

use tokio::sync::mpsc;

use crate::call::CallId;
use crate::signaling::SignalingEvent;
use crate::transport::TransportEvent;

/// Event delivered to the user agent's dispatch task
pub(crate) struct EngineEvent {
    /// Connection attempt the event belongs to
    pub generation: u64,
    pub kind: EngineEventKind,
}

pub(crate) enum EngineEventKind {
    Signaling(SignalingEvent),
    Transport { call_id: CallId, event: TransportEvent },
}

pub(crate) type EngineEventTx = mpsc::UnboundedSender<EngineEvent>;
pub(crate) type EngineEventRx = mpsc::UnboundedReceiver<EngineEvent>;

pub(crate) fn channel() -> (EngineEventTx, EngineEventRx) {
    mpsc::unbounded_channel()
}
