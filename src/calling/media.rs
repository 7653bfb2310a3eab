//! Media streams and tracks.
//!
//! A `LocalMediaStream` owns the camera/microphone tracks handed out by the
//! device layer. Tracks are shared (`Arc`) with the transport so the remote
//! side observes `enabled` changes, but only the owning stream stops them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A single audio or video track.
#[derive(Debug)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            label: label.into(),
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// A live track still holds the device.
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Stop the track and release its device.
    ///
    /// Returns `true` only for the call that actually stopped it.
    pub(crate) fn stop(&self) -> bool {
        self.live.swap(false, Ordering::AcqRel)
    }
}

/// Tracks captured from the local camera and microphone.
#[derive(Debug)]
pub struct LocalMediaStream {
    id: String,
    tracks: Vec<Arc<MediaTrack>>,
    released: bool,
}

impl LocalMediaStream {
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn live_track_count(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Stop every track. Only the first call does anything.
    ///
    /// Returns the number of tracks this call stopped.
    pub fn release(&mut self) -> usize {
        if self.released {
            return 0;
        }
        self.released = true;
        let stopped = self.tracks.iter().filter(|t| t.stop()).count();
        tracing::debug!("Released local stream {} ({} tracks stopped)", self.id, stopped);
        stopped
    }

    /// Read-only reference for binding a video surface.
    pub fn view(&self) -> StreamView {
        StreamView::new(&self.id, &self.tracks)
    }
}

impl Drop for LocalMediaStream {
    fn drop(&mut self) {
        self.release();
    }
}

/// Media received from the other party.
#[derive(Debug, Clone)]
pub struct RemoteMediaStream {
    id: String,
    tracks: Vec<Arc<MediaTrack>>,
}

impl RemoteMediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn view(&self) -> StreamView {
        StreamView::new(&self.id, &self.tracks)
    }
}

/// What a video surface needs to display a stream. Holds the tracks but
/// cannot stop them.
#[derive(Debug, Clone)]
pub struct StreamView {
    stream_id: String,
    tracks: Vec<Arc<MediaTrack>>,
}

impl StreamView {
    fn new(stream_id: &str, tracks: &[Arc<MediaTrack>]) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            tracks: tracks.to_vec(),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Video)
    }

    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind() == TrackKind::Audio)
    }

    /// True if any video track is live and enabled.
    pub fn video_enabled(&self) -> bool {
        self.tracks
            .iter()
            .any(|t| t.kind() == TrackKind::Video && t.is_live() && t.is_enabled())
    }

    /// True if any audio track is live and enabled.
    pub fn audio_enabled(&self) -> bool {
        self.tracks
            .iter()
            .any(|t| t.kind() == TrackKind::Audio && t.is_live() && t.is_enabled())
    }
}
