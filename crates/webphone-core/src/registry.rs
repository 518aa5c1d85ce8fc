//! Active call bookkeeping
//!
//! The softphone supports a single call at a time. [`CallRegistry`] holds that
//! call and maps engine session ids to it, so per-session signals can be routed
//! without asking the engine.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::call::{CallId, CallSession};
use crate::error::SoftphoneError;
use crate::signaling::SignalingSessionId;

/// Why a session could not be admitted
#[derive(Debug)]
pub(crate) enum AdmitError {
    /// Another call is still in progress
    Busy(Arc<CallSession>),
    /// Building the session failed
    Failed(SoftphoneError),
}

#[derive(Debug, Default)]
pub(crate) struct CallRegistry {
    active: Mutex<Option<Arc<CallSession>>>,
    by_signaling: DashMap<SignalingSessionId, CallId>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The active call; a call that has reached a terminal state is dropped here
    pub fn active(&self) -> Option<Arc<CallSession>> {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|call| call.is_terminal()) {
            if let Some(call) = active.take() {
                self.forget(call.id());
            }
        }
        active.clone()
    }

    /// Admit the session produced by `build`, unless a call is already active
    ///
    /// `build` runs under the registry lock and is skipped entirely when busy,
    /// so two concurrent admissions cannot both succeed.
    pub fn admit_with<F>(&self, build: F) -> Result<Arc<CallSession>, AdmitError>
    where
        F: FnOnce() -> Result<Arc<CallSession>, SoftphoneError>,
    {
        let mut active = self.active.lock();
        if let Some(current) = active.as_ref() {
            if !current.is_terminal() {
                return Err(AdmitError::Busy(Arc::clone(current)));
            }
            let stale = current.id();
            self.forget(stale);
        }

        let session = build().map_err(AdmitError::Failed)?;
        self.by_signaling
            .insert(session.signaling_id(), session.id());
        debug!(call_id = %session.id(), "call admitted");
        *active = Some(Arc::clone(&session));
        Ok(session)
    }

    /// Drop `call_id` if it is the active call
    pub fn release(&self, call_id: CallId) -> Option<Arc<CallSession>> {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and(|call| call.id() == call_id) {
            self.forget(call_id);
            debug!(%call_id, "call released");
            return active.take();
        }
        None
    }

    /// The call bound to an engine session
    ///
    /// Waits for an admission in progress, so a signal the engine raises while
    /// the session is still being built is routed once the mapping exists.
    pub fn session_for_signaling(&self, id: &SignalingSessionId) -> Option<Arc<CallSession>> {
        let active = self.active.lock();
        let call_id = *self.by_signaling.get(id)?;
        active.as_ref().filter(|call| call.id() == call_id).cloned()
    }

    /// The call with `call_id`, if it is the one being tracked
    pub fn session_for_call(&self, call_id: CallId) -> Option<Arc<CallSession>> {
        self.active
            .lock()
            .as_ref()
            .filter(|call| call.id() == call_id)
            .cloned()
    }

    /// Forget every call, returning the one that was tracked
    pub fn clear(&self) -> Option<Arc<CallSession>> {
        let taken = self.active.lock().take();
        self.by_signaling.clear();
        taken
    }

    fn forget(&self, call_id: CallId) {
        self.by_signaling.retain(|_, id| *id != call_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallSetup, CallState};
    use crate::config::SoftphoneConfig;
    use crate::dispatch;
    use crate::events::EventEmitter;
    use crate::media::MediaBinder;
    use crate::signaling::{CallDirection, SessionSignal};
    use crate::testing::{FakeAudioSink, FakeMediaDevices, FakeSession, FakeTransportEngine};
    use crate::transport::{TransportCoordinator, TransportEventSender};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    fn session(sid: &str) -> Arc<CallSession> {
        let (tx, _rx) = dispatch::channel();
        let id = Uuid::new_v4();
        Arc::new(CallSession::new(CallSetup {
            id,
            direction: CallDirection::Inbound,
            remote_party: "1001".into(),
            initial_state: CallState::Progressing,
            signaling: FakeSession::new(sid),
            transport: TransportCoordinator::new(
                id,
                Arc::new(FakeTransportEngine::new()),
                TransportEventSender::new(1, id, tx),
            ),
            config: Arc::new(SoftphoneConfig::new("u", "example.com", "wss://example.com/ws")),
            media: Arc::new(MediaBinder::new(
                Arc::new(FakeMediaDevices::new()),
                FakeAudioSink::direct(),
            )),
            events: EventEmitter::new(8),
        }))
    }

    #[test]
    fn second_admission_is_busy_and_skips_build() {
        let registry = CallRegistry::new();
        let first = registry.admit_with(|| Ok(session("a"))).unwrap();

        let built = AtomicUsize::new(0);
        let result = registry.admit_with(|| {
            built.fetch_add(1, Ordering::SeqCst);
            Ok(session("b"))
        });

        match result {
            Err(AdmitError::Busy(current)) => assert_eq!(current.id(), first.id()),
            other => panic!("expected busy, got {other:?}"),
        }
        assert_eq!(built.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn routes_by_signaling_id() {
        let registry = CallRegistry::new();
        let call = registry.admit_with(|| Ok(session("sess-9"))).unwrap();

        let found = registry
            .session_for_signaling(&SignalingSessionId("sess-9".into()))
            .unwrap();
        assert_eq!(found.id(), call.id());
        assert!(registry
            .session_for_signaling(&SignalingSessionId("other".into()))
            .is_none());
    }

    #[test]
    fn routing_waits_for_admission_in_progress() {
        let registry = CallRegistry::new();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        std::thread::scope(|scope| {
            let registry = &registry;
            let lookup = scope.spawn(move || {
                ready_rx.recv().unwrap();
                registry.session_for_signaling(&SignalingSessionId("early".into()))
            });

            let call = registry
                .admit_with(|| {
                    let call = session("early");
                    // the engine has already reported on this session
                    ready_tx.send(()).unwrap();
                    std::thread::sleep(Duration::from_millis(20));
                    Ok(call)
                })
                .unwrap();

            let routed = lookup.join().unwrap();
            assert_eq!(routed.map(|c| c.id()), Some(call.id()));
        });
    }

    #[test]
    fn terminal_call_frees_the_slot() {
        let registry = CallRegistry::new();
        let call = registry.admit_with(|| Ok(session("a"))).unwrap();

        call.handle_signal(&SessionSignal::Ended { cause: None });
        assert!(registry.active().is_none());
        assert!(registry
            .session_for_signaling(&SignalingSessionId("a".into()))
            .is_none());

        assert!(registry.admit_with(|| Ok(session("b"))).is_ok());
    }

    #[test]
    fn failed_build_leaves_slot_empty() {
        let registry = CallRegistry::new();
        let result = registry.admit_with(|| Err(SoftphoneError::transport("no peer")));
        assert!(matches!(result, Err(AdmitError::Failed(_))));
        assert!(registry.active().is_none());
    }

    #[test]
    fn release_only_matches_active_id() {
        let registry = CallRegistry::new();
        let call = registry.admit_with(|| Ok(session("a"))).unwrap();

        assert!(registry.release(Uuid::new_v4()).is_none());
        assert!(registry.release(call.id()).is_some());
        assert!(registry.active().is_none());
        assert!(registry.clear().is_none());
    }
}
