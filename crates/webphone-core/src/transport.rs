//! Peer transport coordination
//!
//! Each call owns exactly one peer transport. The [`TransportCoordinator`]
//! creates it lazily with the configured ICE servers, attaches local media
//! tracks (buffering them if they arrive first) and routes remote tracks to
//! the [`MediaBinder`].
//!
//! SDP offer/answer itself is performed by the signaling engine against the
//! transport handle it receives in [`CallOptions`](crate::signaling::CallOptions).

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::call::CallId;
use crate::config::IceServer;
use crate::dispatch::{EngineEvent, EngineEventKind, EngineEventTx};
use crate::error::{SoftphoneError, SoftphoneResult};
use crate::media::{MediaBinder, MediaStream, MediaTrack, TrackKind};

/// Configuration handed to the transport engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RtcConfiguration {
    /// ICE servers used for candidate gathering
    pub ice_servers: Vec<IceServer>,
}

/// Errors reported by the transport engine
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The transport has been closed
    #[error("transport closed")]
    Closed,
    /// The configuration was rejected
    #[error("invalid transport configuration: {0}")]
    InvalidConfiguration(String),
    /// Any other engine failure
    #[error("{0}")]
    Failed(String),
}

/// ICE candidate produced during gathering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// Media section the candidate belongs to
    pub sdp_mid: Option<String>,
}

/// A sender slot on the peer transport
#[derive(Clone)]
pub struct RtpSender {
    /// The track currently fed into the sender, if any
    pub track: Option<Arc<dyn MediaTrack>>,
}

impl fmt::Debug for RtpSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpSender")
            .field("track", &self.track.as_ref().map(|t| t.id()))
            .finish()
    }
}

/// Notifications from a peer transport
#[derive(Clone)]
pub enum TransportEvent {
    /// A local ICE candidate was gathered
    CandidateGathered(IceCandidate),
    /// A remote track arrived
    TrackReceived {
        /// The remote track
        track: Arc<dyn MediaTrack>,
        /// Streams the track belongs to
        streams: Vec<Arc<dyn MediaStream>>,
    },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CandidateGathered(candidate) => {
                f.debug_tuple("CandidateGathered").field(candidate).finish()
            }
            Self::TrackReceived { track, streams } => f
                .debug_struct("TrackReceived")
                .field("track", &track.id())
                .field("streams", &streams.iter().map(|s| s.id()).collect::<Vec<_>>())
                .finish(),
        }
    }
}

/// Factory for peer transports
pub trait TransportEngine: Send + Sync {
    /// Create a transport that reports through `events`
    fn create_peer(
        &self,
        config: RtcConfiguration,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>, TransportError>;
}

/// A single peer transport
pub trait PeerTransport: Send + Sync {
    /// Attach a local track belonging to `stream`
    fn add_track(
        &self,
        track: Arc<dyn MediaTrack>,
        stream: &Arc<dyn MediaStream>,
    ) -> Result<(), TransportError>;
    /// Stop sending `track_id` and free its sender slot
    fn remove_track(&self, track_id: &str) -> Result<(), TransportError>;
    /// Current sender slots
    fn senders(&self) -> Vec<RtpSender>;
    /// Tear the transport down
    fn close(&self);
}

/// Handle a transport engine reports through
#[derive(Clone)]
pub struct TransportEventSender {
    generation: u64,
    call_id: CallId,
    tx: EngineEventTx,
}

impl TransportEventSender {
    pub(crate) fn new(generation: u64, call_id: CallId, tx: EngineEventTx) -> Self {
        Self {
            generation,
            call_id,
            tx,
        }
    }

    /// The call the transport belongs to
    pub fn call_id(&self) -> CallId {
        self.call_id
    }

    /// Deliver an event; returns `false` if nobody listens anymore
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx
            .send(EngineEvent {
                generation: self.generation,
                kind: EngineEventKind::Transport {
                    call_id: self.call_id,
                    event,
                },
            })
            .is_ok()
    }
}

impl fmt::Debug for TransportEventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportEventSender")
            .field("generation", &self.generation)
            .field("call_id", &self.call_id)
            .finish()
    }
}

/// Owns the peer transport of one call
pub struct TransportCoordinator {
    call_id: CallId,
    engine: Arc<dyn TransportEngine>,
    events: TransportEventSender,
    peer: Option<Arc<dyn PeerTransport>>,
    pending_streams: Vec<Arc<dyn MediaStream>>,
    local_streams: Vec<Arc<dyn MediaStream>>,
    attached_tracks: HashSet<String>,
    remote_stream: Option<Arc<dyn MediaStream>>,
    closed: bool,
}

impl TransportCoordinator {
    pub(crate) fn new(
        call_id: CallId,
        engine: Arc<dyn TransportEngine>,
        events: TransportEventSender,
    ) -> Self {
        Self {
            call_id,
            engine,
            events,
            peer: None,
            pending_streams: Vec::new(),
            local_streams: Vec::new(),
            attached_tracks: HashSet::new(),
            remote_stream: None,
            closed: false,
        }
    }

    /// Create the peer transport, or return the existing one
    ///
    /// Streams added before creation are attached once the transport exists.
    pub fn create_transport(
        &mut self,
        ice_servers: &[IceServer],
    ) -> SoftphoneResult<Arc<dyn PeerTransport>> {
        if self.closed {
            return Err(TransportError::Closed.into());
        }
        if let Some(peer) = &self.peer {
            return Ok(Arc::clone(peer));
        }

        let config = RtcConfiguration {
            ice_servers: ice_servers.to_vec(),
        };
        let peer = self
            .engine
            .create_peer(config, self.events.clone())
            .map_err(|e| {
                warn!(call_id = %self.call_id, error = %e, "failed to create peer transport");
                SoftphoneError::from(e)
            })?;
        info!(
            call_id = %self.call_id,
            ice_servers = ice_servers.len(),
            "created peer transport"
        );
        self.peer = Some(Arc::clone(&peer));

        for stream in std::mem::take(&mut self.pending_streams) {
            self.attach(&peer, &stream)?;
        }
        Ok(peer)
    }

    /// Add a local capture stream to the transport
    ///
    /// Adding the same stream twice attaches its tracks once.
    pub fn add_local_stream(&mut self, stream: Arc<dyn MediaStream>) -> SoftphoneResult<()> {
        if self.closed {
            return Err(TransportError::Closed.into());
        }
        let stream_id = stream.id();
        if !self.local_streams.iter().any(|s| s.id() == stream_id) {
            self.local_streams.push(Arc::clone(&stream));
        }

        match self.peer.clone() {
            Some(peer) => self.attach(&peer, &stream),
            None => {
                debug!(call_id = %self.call_id, %stream_id, "buffering local stream until transport exists");
                if !self.pending_streams.iter().any(|s| s.id() == stream_id) {
                    self.pending_streams.push(stream);
                }
                Ok(())
            }
        }
    }

    /// Detach a local stream from the transport
    ///
    /// The stream's tracks are left running; adding it again re-attaches them.
    /// Unknown streams are ignored.
    pub fn remove_local_stream(&mut self, stream_id: &str) -> SoftphoneResult<()> {
        if self.closed {
            return Err(TransportError::Closed.into());
        }
        self.pending_streams.retain(|s| s.id() != stream_id);
        let Some(index) = self.local_streams.iter().position(|s| s.id() == stream_id) else {
            return Ok(());
        };
        let stream = self.local_streams.remove(index);

        if let Some(peer) = &self.peer {
            for track in stream.tracks() {
                let track_id = track.id();
                if !self.attached_tracks.remove(&track_id) {
                    continue;
                }
                peer.remove_track(&track_id)?;
                debug!(call_id = %self.call_id, %track_id, "detached local track");
            }
        }
        Ok(())
    }

    fn attach(
        &mut self,
        peer: &Arc<dyn PeerTransport>,
        stream: &Arc<dyn MediaStream>,
    ) -> SoftphoneResult<()> {
        for track in stream.tracks() {
            let track_id = track.id();
            if self.attached_tracks.contains(&track_id) {
                continue;
            }
            peer.add_track(track, stream)?;
            debug!(call_id = %self.call_id, %track_id, "attached local track");
            self.attached_tracks.insert(track_id);
        }
        Ok(())
    }

    /// Apply a transport event
    ///
    /// Returns the remote stream when it was newly bound to the playback sink.
    pub fn handle_event(
        &mut self,
        event: TransportEvent,
        media: &MediaBinder,
    ) -> Option<Arc<dyn MediaStream>> {
        match event {
            TransportEvent::CandidateGathered(candidate) => {
                debug!(
                    call_id = %self.call_id,
                    candidate = %candidate.candidate,
                    sdp_mid = ?candidate.sdp_mid,
                    "gathered ICE candidate"
                );
                None
            }
            TransportEvent::TrackReceived { track, streams } => {
                if self.closed {
                    return None;
                }
                let Some(stream) = streams.into_iter().next() else {
                    debug!(call_id = %self.call_id, track_id = %track.id(), "remote track without stream");
                    return None;
                };
                if self
                    .remote_stream
                    .as_ref()
                    .is_some_and(|current| current.id() == stream.id())
                {
                    return None;
                }

                match media.bind_remote(&stream) {
                    Ok(()) => {
                        info!(call_id = %self.call_id, stream_id = %stream.id(), "remote audio bound");
                        self.remote_stream = Some(Arc::clone(&stream));
                        Some(stream)
                    }
                    Err(e) => {
                        warn!(call_id = %self.call_id, error = %e, "could not bind remote audio");
                        None
                    }
                }
            }
        }
    }

    /// Bind the already received remote stream again, if there is one
    pub fn rebind_remote(&self, media: &MediaBinder) {
        let Some(stream) = &self.remote_stream else {
            return;
        };
        if let Err(e) = media.bind_remote(stream) {
            warn!(call_id = %self.call_id, error = %e, "could not rebind remote audio");
        }
    }

    /// The audio track currently feeding the transport
    pub fn outbound_audio_track(&self) -> Option<Arc<dyn MediaTrack>> {
        self.peer.as_ref().and_then(|peer| {
            peer.senders()
                .into_iter()
                .filter_map(|sender| sender.track)
                .find(|track| track.kind() == TrackKind::Audio)
        })
    }

    /// The peer transport, once created
    pub fn peer(&self) -> Option<Arc<dyn PeerTransport>> {
        self.peer.clone()
    }

    /// The remote stream bound for playback, if any
    pub fn remote_stream(&self) -> Option<Arc<dyn MediaStream>> {
        self.remote_stream.clone()
    }

    /// Whether [`close`](Self::close) has run
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release local media, detach remote audio and close the transport
    pub fn close(&mut self, media: &MediaBinder) {
        if self.closed {
            return;
        }
        self.closed = true;

        for stream in self
            .local_streams
            .drain(..)
            .chain(self.pending_streams.drain(..))
        {
            media.release(&stream);
        }
        if let Some(remote) = self.remote_stream.take() {
            media.unbind(&remote.id());
        }
        if let Some(peer) = self.peer.take() {
            peer.close();
        }
        self.attached_tracks.clear();
        debug!(call_id = %self.call_id, "transport closed");
    }
}

impl fmt::Debug for TransportCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportCoordinator")
            .field("call_id", &self.call_id)
            .field("has_peer", &self.peer.is_some())
            .field("local_streams", &self.local_streams.len())
            .field("pending_streams", &self.pending_streams.len())
            .field("remote_stream", &self.remote_stream.as_ref().map(|s| s.id()))
            .field("closed", &self.closed)
            .finish()
    }
}
