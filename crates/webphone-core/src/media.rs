//! Media binding
//!
//! The [`MediaBinder`] sits between the softphone and the platform's media
//! APIs. It acquires the microphone, attaches remote audio to the playback
//! sink and stops tracks when a call is over.
//!
//! The platform side is expressed as three small traits:
//!
//! - [`MediaDevices`] - microphone capture (`getUserMedia`)
//! - [`MediaStream`] / [`MediaTrack`] - stream and track handles
//! - [`AudioSink`] - the playback element remote audio is bound to
//!
//! Whether the sink accepts a stream directly or needs an object URL is probed
//! once, when the binder is built, and cached for its lifetime.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::{SoftphoneError, SoftphoneResult};

/// Kind of media carried by a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

/// Handle to a single media track
pub trait MediaTrack: Send + Sync {
    /// Track identifier, unique within the platform
    fn id(&self) -> String;
    /// Media kind
    fn kind(&self) -> TrackKind;
    /// Whether the track currently produces media
    fn is_enabled(&self) -> bool;
    /// Enable or disable the track without removing it
    fn set_enabled(&self, enabled: bool);
    /// Permanently stop the track
    fn stop(&self);
    /// Whether the track has not been stopped yet
    fn is_live(&self) -> bool;
}

/// Handle to a stream of tracks
pub trait MediaStream: Send + Sync {
    /// Stream identifier
    fn id(&self) -> String;
    /// All tracks in the stream
    fn tracks(&self) -> Vec<Arc<dyn MediaTrack>>;

    /// Audio tracks only
    fn audio_tracks(&self) -> Vec<Arc<dyn MediaTrack>> {
        self.tracks()
            .into_iter()
            .filter(|track| track.kind() == TrackKind::Audio)
            .collect()
    }
}

/// Constraints passed to capture requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    /// Capture audio
    pub audio: bool,
    /// Capture video
    pub video: bool,
}

impl MediaConstraints {
    /// Microphone only
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

/// Errors reported by media collaborators
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    /// The user declined the capture prompt
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// No capture device matched the constraints
    #[error("no capture device: {0}")]
    DeviceNotFound(String),
    /// The sink could not produce a playable object URL
    #[error("object URL unavailable: {0}")]
    ObjectUrl(String),
    /// Any other platform failure
    #[error("{0}")]
    Other(String),
}

/// Microphone capture
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Request a capture stream matching `constraints`
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Arc<dyn MediaStream>, MediaError>;
}

/// Playback element remote audio is bound to
#[cfg_attr(test, mockall::automock)]
pub trait AudioSink: Send + Sync {
    /// Whether the sink can take a stream directly
    fn supports_src_object(&self) -> bool;
    /// Assign (or clear) the stream played by the sink
    fn set_src_object(&self, stream: Option<Arc<dyn MediaStream>>);
    /// Assign (or clear) a playable URL
    fn set_src(&self, url: Option<String>);
    /// Toggle autoplay
    fn set_autoplay(&self, autoplay: bool);
    /// Produce a playable object URL for a stream
    fn create_object_url(&self, stream: Arc<dyn MediaStream>) -> Result<String, MediaError>;
    /// Release an object URL produced by [`AudioSink::create_object_url`]
    fn revoke_object_url(&self, url: &str);
}

/// How remote streams reach the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkCapability {
    /// Direct stream assignment
    SrcObject,
    /// Generated object URL
    ObjectUrl,
}

#[derive(Debug, Clone)]
struct BoundOutput {
    stream_id: String,
    object_url: Option<String>,
}

/// Acquires local audio and binds remote audio to the playback sink
pub struct MediaBinder {
    devices: Arc<dyn MediaDevices>,
    sink: Arc<dyn AudioSink>,
    capability: SinkCapability,
    bound: Mutex<Option<BoundOutput>>,
}

impl MediaBinder {
    /// Build a binder, probing the sink's capabilities once
    pub fn new(devices: Arc<dyn MediaDevices>, sink: Arc<dyn AudioSink>) -> Self {
        let capability = if sink.supports_src_object() {
            SinkCapability::SrcObject
        } else {
            SinkCapability::ObjectUrl
        };
        sink.set_autoplay(true);
        debug!(?capability, "media binder initialised");

        Self {
            devices,
            sink,
            capability,
            bound: Mutex::new(None),
        }
    }

    /// Sink capability detected at construction
    pub fn capability(&self) -> SinkCapability {
        self.capability
    }

    /// Identifier of the stream currently bound to the sink
    pub fn bound_stream_id(&self) -> Option<String> {
        self.bound.lock().as_ref().map(|bound| bound.stream_id.clone())
    }

    /// Capture the microphone
    ///
    /// Fails with [`SoftphoneError::MediaAccessDenied`] when the user declines
    /// or the returned stream carries no audio.
    pub async fn acquire_local_audio(&self) -> SoftphoneResult<Arc<dyn MediaStream>> {
        let stream = self
            .devices
            .get_user_media(MediaConstraints::audio_only())
            .await
            .map_err(|e| {
                warn!(error = %e, "microphone capture failed");
                SoftphoneError::from(e)
            })?;

        if stream.audio_tracks().is_empty() {
            self.release(&stream);
            return Err(SoftphoneError::media_denied("no audio input device available"));
        }

        info!(stream_id = %stream.id(), "acquired local audio");
        Ok(stream)
    }

    /// Play a remote stream through the sink
    ///
    /// Binding the stream that is already bound is a no-op.
    pub fn bind_remote(&self, stream: &Arc<dyn MediaStream>) -> SoftphoneResult<()> {
        let stream_id = stream.id();
        let mut bound = self.bound.lock();

        if bound.as_ref().is_some_and(|b| b.stream_id == stream_id) {
            return Ok(());
        }
        if let Some(previous) = bound.take() {
            self.detach(previous);
        }

        self.sink.set_autoplay(true);
        let object_url = match self.capability {
            SinkCapability::SrcObject => {
                self.sink.set_src_object(Some(Arc::clone(stream)));
                None
            }
            SinkCapability::ObjectUrl => {
                let url = self.sink.create_object_url(Arc::clone(stream))?;
                self.sink.set_src(Some(url.clone()));
                Some(url)
            }
        };

        debug!(%stream_id, capability = ?self.capability, "bound remote stream");
        *bound = Some(BoundOutput {
            stream_id,
            object_url,
        });
        Ok(())
    }

    /// Detach `stream_id` from the sink if it is the one playing
    pub fn unbind(&self, stream_id: &str) {
        let mut bound = self.bound.lock();
        if bound.as_ref().is_some_and(|b| b.stream_id == stream_id) {
            if let Some(previous) = bound.take() {
                self.detach(previous);
            }
        }
    }

    /// Stop every live track in `stream`; safe to call repeatedly
    pub fn release(&self, stream: &Arc<dyn MediaStream>) {
        let mut stopped = 0usize;
        for track in stream.tracks() {
            if track.is_live() {
                track.stop();
                stopped += 1;
            }
        }
        if stopped > 0 {
            debug!(stream_id = %stream.id(), stopped, "released stream");
        }
    }

    fn detach(&self, output: BoundOutput) {
        match output.object_url {
            Some(url) => {
                self.sink.set_src(None);
                self.sink.revoke_object_url(&url);
            }
            None => self.sink.set_src_object(None),
        }
        debug!(stream_id = %output.stream_id, "unbound remote stream");
    }
}

impl fmt::Debug for MediaBinder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaBinder")
            .field("capability", &self.capability)
            .field("bound", &*self.bound.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeMediaDevices, FakeStream};
    use mockall::predicate::eq;

    fn stream(id: &str) -> Arc<dyn MediaStream> {
        FakeStream::audio(id)
    }

    #[test]
    fn probes_sink_once_and_binds_directly() {
        let mut sink = MockAudioSink::new();
        sink.expect_supports_src_object().times(1).return_const(true);
        sink.expect_set_autoplay().with(eq(true)).return_const(());
        sink.expect_set_src_object()
            .withf(|stream| stream.as_ref().map(|s| s.id()) == Some("remote-1".to_string()))
            .times(1)
            .return_const(());
        sink.expect_create_object_url().never();

        let binder = MediaBinder::new(Arc::new(FakeMediaDevices::new()), Arc::new(sink));
        assert_eq!(binder.capability(), SinkCapability::SrcObject);

        let remote = stream("remote-1");
        binder.bind_remote(&remote).unwrap();
        // same stream again does not touch the sink
        binder.bind_remote(&remote).unwrap();
        assert_eq!(binder.bound_stream_id().as_deref(), Some("remote-1"));
    }

    #[test]
    fn falls_back_to_object_url() {
        let mut sink = MockAudioSink::new();
        sink.expect_supports_src_object().times(1).return_const(false);
        sink.expect_set_autoplay().return_const(());
        sink.expect_create_object_url()
            .times(1)
            .returning(|stream| Ok(format!("blob:{}", stream.id())));
        sink.expect_set_src()
            .withf(|url| url.as_deref() == Some("blob:remote-1"))
            .times(1)
            .return_const(());
        sink.expect_set_src()
            .withf(|url| url.is_none())
            .times(1)
            .return_const(());
        sink.expect_revoke_object_url()
            .withf(|url| url == "blob:remote-1")
            .times(1)
            .return_const(());
        sink.expect_set_src_object().never();

        let binder = MediaBinder::new(Arc::new(FakeMediaDevices::new()), Arc::new(sink));
        assert_eq!(binder.capability(), SinkCapability::ObjectUrl);

        binder.bind_remote(&stream("remote-1")).unwrap();
        binder.unbind("remote-1");
        assert!(binder.bound_stream_id().is_none());
    }

    #[test]
    fn object_url_failure_is_reported() {
        let mut sink = MockAudioSink::new();
        sink.expect_supports_src_object().return_const(false);
        sink.expect_set_autoplay().return_const(());
        sink.expect_create_object_url()
            .returning(|_| Err(MediaError::ObjectUrl("unsupported".into())));

        let binder = MediaBinder::new(Arc::new(FakeMediaDevices::new()), Arc::new(sink));
        let err = binder.bind_remote(&stream("remote-1")).unwrap_err();
        assert!(matches!(err, SoftphoneError::MediaAccessDenied { .. }));
        assert!(binder.bound_stream_id().is_none());
    }

    #[tokio::test]
    async fn acquire_maps_denial() {
        let devices = Arc::new(FakeMediaDevices::new());
        devices.deny("user declined");
        let binder = MediaBinder::new(devices, crate::testing::FakeAudioSink::direct());

        let err = binder.acquire_local_audio().await.err().expect("expected error");
        assert!(matches!(err, SoftphoneError::MediaAccessDenied { .. }));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let devices = Arc::new(FakeMediaDevices::new());
        let binder = MediaBinder::new(devices.clone(), crate::testing::FakeAudioSink::direct());

        let local = binder.acquire_local_audio().await.unwrap();
        assert!(local.tracks().iter().all(|t| t.is_live()));

        binder.release(&local);
        binder.release(&local);
        assert!(local.tracks().iter().all(|t| !t.is_live()));
        assert_eq!(devices.acquired_count(), 1);
    }
}
