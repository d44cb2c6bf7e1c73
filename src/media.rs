//! Media tracks and streams.
//!
//! A `MediaTrack` is a shared handle to one capture resource: an audio feed
//! backed by a ring buffer, or a display surface the recorder grabs from.
//! Clones share the resource; `stop()` ends it for every holder.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::audio::ring_buffer::AudioConsumer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Microphone constraint set used when acquiring an input device.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AudioConstraint {
    /// Whatever the platform considers the default input.
    #[default]
    Any,
    /// Exactly this device id; acquisition fails if it is gone.
    Exact(String),
}

/// Readable side of an audio track.
#[derive(Clone)]
pub struct AudioFeed {
    consumer: Arc<Mutex<AudioConsumer>>,
    sample_rate: u32,
}

impl AudioFeed {
    pub fn new(consumer: AudioConsumer, sample_rate: u32) -> Self {
        Self {
            consumer: Arc::new(Mutex::new(consumer)),
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Append every buffered sample to `out`.
    pub fn read_into(&self, out: &mut Vec<f32>) -> usize {
        match self.consumer.lock() {
            Ok(mut cons) => cons.drain_into(out),
            Err(e) => {
                tracing::error!("Audio feed lock poisoned: {}", e);
                0
            }
        }
    }

    /// Drop stale samples, e.g. right before a recorder starts reading.
    pub fn clear(&self) {
        if let Ok(mut cons) = self.consumer.lock() {
            cons.clear();
        }
    }
}

/// What the recorder needs to grab the display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplaySurface {
    /// ffmpeg input format (x11grab, avfoundation, gdigrab, ...).
    pub input_format: String,
    /// ffmpeg input name for that format.
    pub input: String,
    pub framerate: u32,
}

#[derive(Clone)]
pub enum TrackSource {
    Audio(AudioFeed),
    Video(DisplaySurface),
}

struct TrackInner {
    id: Uuid,
    kind: TrackKind,
    label: String,
    source: TrackSource,
    ended: AtomicBool,
    keepalive: Mutex<Option<Box<dyn Send>>>,
}

#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn audio(label: impl Into<String>, feed: AudioFeed) -> Self {
        Self::new(TrackKind::Audio, label.into(), TrackSource::Audio(feed))
    }

    pub fn video(label: impl Into<String>, surface: DisplaySurface) -> Self {
        Self::new(TrackKind::Video, label.into(), TrackSource::Video(surface))
    }

    fn new(kind: TrackKind, label: String, source: TrackSource) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4(),
                kind,
                label,
                source,
                ended: AtomicBool::new(false),
                keepalive: Mutex::new(None),
            }),
        }
    }

    /// Attach a resource that must live exactly as long as the track
    /// (e.g. the platform input stream feeding it).
    pub fn with_keepalive(self, resource: Box<dyn Send>) -> Self {
        if let Ok(mut slot) = self.inner.keepalive.lock() {
            *slot = Some(resource);
        }
        self
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn audio_feed(&self) -> Option<&AudioFeed> {
        match &self.inner.source {
            TrackSource::Audio(feed) => Some(feed),
            TrackSource::Video(_) => None,
        }
    }

    pub fn display_surface(&self) -> Option<&DisplaySurface> {
        match &self.inner.source {
            TrackSource::Video(surface) => Some(surface),
            TrackSource::Audio(_) => None,
        }
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    /// End the track and release its underlying resource.
    pub fn stop(&self) {
        if self.inner.ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let resource = self.inner.keepalive.lock().ok().and_then(|mut r| r.take());
        drop(resource);
        tracing::debug!(track = %self.inner.id, kind = %self.inner.kind, label = %self.inner.label, "Track stopped");
    }

    /// Whether two handles refer to the same underlying track.
    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("label", &self.inner.label)
            .field("ended", &self.is_ended())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct MediaStream {
    id: Uuid,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tracks,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn add_track(&mut self, track: MediaTrack) {
        self.tracks.push(track);
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}
