//! Display capture.
//!
//! A granted display capture is a `DisplayHandle`: one video track that
//! describes what the recorder should grab, plus an optional system-audio
//! track. `ScreenGrab` is the ffmpeg-based platform implementation.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::devices::MediaDevices;
use crate::error::CaptureError;
use crate::media::{AudioConstraint, DisplaySurface, MediaStream, MediaTrack};

/// A granted display capture.
#[derive(Debug, Clone)]
pub struct DisplayHandle {
    stream: MediaStream,
}

impl DisplayHandle {
    pub fn new(video: MediaTrack, system_audio: Option<MediaTrack>) -> Self {
        let mut tracks = vec![video];
        tracks.extend(system_audio);
        Self {
            stream: MediaStream::new(tracks),
        }
    }

    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    pub fn video_track(&self) -> Option<&MediaTrack> {
        self.stream.video_tracks().next()
    }

    pub fn audio_track(&self) -> Option<&MediaTrack> {
        self.stream.audio_tracks().next()
    }

    /// End every track of the capture.
    pub fn stop(&self) {
        self.stream.stop_all();
    }
}

/// Platform display capture (the permission prompt lives behind this).
#[async_trait]
pub trait DisplayCapture: Send + Sync {
    async fn get_display_media(&self) -> Result<DisplayHandle, CaptureError>;
}

#[derive(Debug, Clone, Default)]
pub struct DisplayMediaOptions {
    /// Explicit ffmpeg binary; looked up on `PATH` when unset.
    pub ffmpeg_path: Option<PathBuf>,
    /// Overrides the platform grab device.
    pub input_format: Option<String>,
    pub input: Option<String>,
    pub framerate: u32,
    /// Loopback/monitor input carrying system audio, if any.
    pub system_audio_device: Option<String>,
}

/// Default grab device for the current platform.
pub fn platform_surface(framerate: u32) -> DisplaySurface {
    let (input_format, input) = if cfg!(target_os = "macos") {
        ("avfoundation", "Capture screen 0".to_string())
    } else if cfg!(target_os = "windows") {
        ("gdigrab", "desktop".to_string())
    } else {
        let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0".into());
        ("x11grab", display)
    };
    DisplaySurface {
        input_format: input_format.to_string(),
        input,
        framerate,
    }
}

/// Resolve the ffmpeg binary: explicit path first, then `PATH`.
pub fn locate_ffmpeg(explicit: Option<&PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.clone());
    }
    which::which("ffmpeg").ok()
}

/// ffmpeg-backed display capture.
pub struct ScreenGrab {
    options: DisplayMediaOptions,
    devices: Arc<dyn MediaDevices>,
}

impl ScreenGrab {
    pub fn new(options: DisplayMediaOptions, devices: Arc<dyn MediaDevices>) -> Self {
        Self { options, devices }
    }

    fn surface(&self) -> DisplaySurface {
        let mut surface = platform_surface(self.options.framerate.max(1));
        if let Some(format) = &self.options.input_format {
            surface.input_format = format.clone();
        }
        if let Some(input) = &self.options.input {
            surface.input = input.clone();
        }
        surface
    }
}

#[async_trait]
impl DisplayCapture for ScreenGrab {
    async fn get_display_media(&self) -> Result<DisplayHandle, CaptureError> {
        let ffmpeg = locate_ffmpeg(self.options.ffmpeg_path.as_ref()).ok_or_else(|| {
            CaptureError::PermissionDenied("ffmpeg not found; screen capture unavailable".into())
        })?;
        let surface = self.surface();
        info!(
            ffmpeg = %ffmpeg.display(),
            format = %surface.input_format,
            input = %surface.input,
            framerate = surface.framerate,
            "Display capture granted"
        );
        let video = MediaTrack::video(format!("screen:{}", surface.input), surface);

        let system_audio = match &self.options.system_audio_device {
            Some(id) => {
                match self
                    .devices
                    .get_user_media(&AudioConstraint::Exact(id.clone()))
                    .await
                {
                    Ok(track) => Some(track),
                    Err(e) => {
                        warn!(device = %id, "System audio unavailable, continuing without it: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        Ok(DisplayHandle::new(video, system_audio))
    }
}
