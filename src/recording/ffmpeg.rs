//! ffmpeg-backed recorder.
//!
//! ffmpeg grabs the display itself and reads the mixed audio as raw f32le on
//! stdin. The encoded container (webm or fragmented mp4) streams back on
//! stdout and is cut into pieces every timeslice. Stopping closes stdin;
//! `-shortest` then ends the encode and whatever is left on stdout becomes
//! the last piece.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::recorder::{
    AtomicRecorderState, MediaRecorder, RecordedData, RecorderFactory, RecorderState,
};
use crate::audio::capture::GRAPH_SAMPLE_RATE;
use crate::display::locate_ffmpeg;
use crate::error::CaptureError;
use crate::media::{AudioFeed, DisplaySurface, MediaStream};

/// How often mixed audio is forwarded to ffmpeg.
const AUDIO_FEED_INTERVAL: Duration = Duration::from_millis(20);

/// Container and codecs for one recorder configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputProfile {
    WebmVp9,
    WebmVp8,
    FragmentedMp4,
}

impl OutputProfile {
    /// Map a mime type (with optional `codecs=` parameter) to a profile.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let mut parts = mime.split(';').map(str::trim);
        let container = parts.next()?.to_ascii_lowercase();
        let codecs: Vec<String> = parts
            .filter_map(|p| p.strip_prefix("codecs="))
            .flat_map(|c| c.trim_matches('"').split(','))
            .map(|c| c.trim().to_ascii_lowercase())
            .collect();

        match container.as_str() {
            "video/webm" => {
                if !codecs.iter().all(|c| c.starts_with("vp") || c == "opus") {
                    return None;
                }
                match codecs.iter().find(|c| c.starts_with("vp")).map(String::as_str) {
                    Some(c) if c == "vp9" || c.starts_with("vp09") => Some(Self::WebmVp9),
                    Some("vp8") | None => Some(Self::WebmVp8),
                    _ => None,
                }
            }
            "video/mp4" => {
                let ok = codecs
                    .iter()
                    .all(|c| c.starts_with("avc1") || c == "h264" || c.starts_with("mp4a") || c == "aac");
                ok.then_some(Self::FragmentedMp4)
            }
            _ => None,
        }
    }

    fn codec_args(self) -> &'static [&'static str] {
        match self {
            Self::WebmVp9 => &[
                "-c:v", "libvpx-vp9", "-deadline", "realtime", "-cpu-used", "8", "-row-mt", "1",
                "-b:v", "2M", "-c:a", "libopus", "-b:a", "128k", "-f", "webm",
            ],
            Self::WebmVp8 => &[
                "-c:v", "libvpx", "-deadline", "realtime", "-cpu-used", "8", "-b:v", "2M",
                "-c:a", "libopus", "-b:a", "128k", "-f", "webm",
            ],
            Self::FragmentedMp4 => &[
                "-c:v", "libx264", "-preset", "veryfast", "-tune", "zerolatency",
                "-pix_fmt", "yuv420p", "-c:a", "aac", "-b:a", "128k",
                "-movflags", "frag_keyframe+empty_moov+default_base_moof", "-f", "mp4",
            ],
        }
    }
}

/// Full ffmpeg argument list for one recording.
pub fn build_args(surface: &DisplaySurface, profile: OutputProfile) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    args.extend([
        "-f".into(),
        surface.input_format.clone(),
        "-framerate".into(),
        surface.framerate.to_string(),
        "-i".into(),
        surface.input.clone(),
    ]);
    args.extend([
        "-f".into(),
        "f32le".into(),
        "-ar".into(),
        GRAPH_SAMPLE_RATE.to_string(),
        "-ac".into(),
        "1".into(),
        "-i".into(),
        "pipe:0".into(),
    ]);
    args.extend(["-map", "0:v:0", "-map", "1:a:0"].map(String::from));
    args.extend(profile.codec_args().iter().map(|s| s.to_string()));
    args.extend(["-shortest".into(), "pipe:1".into()]);
    args
}

pub struct FfmpegRecorderFactory {
    ffmpeg: Option<PathBuf>,
}

impl FfmpegRecorderFactory {
    pub fn new(explicit: Option<PathBuf>) -> Self {
        let ffmpeg = locate_ffmpeg(explicit.as_ref());
        if ffmpeg.is_none() {
            warn!("ffmpeg not found; recording is unavailable");
        }
        Self { ffmpeg }
    }
}

impl RecorderFactory for FfmpegRecorderFactory {
    fn is_type_supported(&self, mime: &str) -> bool {
        self.ffmpeg.is_some() && OutputProfile::from_mime(mime).is_some()
    }

    fn create(&self, stream: &MediaStream, mime: &str) -> Result<Box<dyn MediaRecorder>, CaptureError> {
        let ffmpeg = self
            .ffmpeg
            .clone()
            .ok_or_else(|| CaptureError::Recorder("ffmpeg not found".into()))?;
        let profile = OutputProfile::from_mime(mime)
            .ok_or_else(|| CaptureError::Recorder(format!("unsupported recorder type: {mime}")))?;
        let surface = stream
            .video_tracks()
            .find_map(|t| t.display_surface().cloned())
            .ok_or_else(|| CaptureError::Recorder("stream has no display video".into()))?;
        // The first audio track is the mix bus; raw display audio is already
        // mixed into it.
        let audio = stream
            .audio_tracks()
            .find_map(|t| t.audio_feed().cloned())
            .ok_or_else(|| CaptureError::Recorder("stream has no audio".into()))?;

        Ok(Box::new(FfmpegRecorder {
            ffmpeg,
            mime: mime.to_string(),
            args: build_args(&surface, profile),
            audio,
            state: Arc::new(AtomicRecorderState::new(RecorderState::Inactive)),
            stop_tx: None,
            tasks: Vec::new(),
        }))
    }
}

pub struct FfmpegRecorder {
    ffmpeg: PathBuf,
    mime: String,
    args: Vec<String>,
    audio: AudioFeed,
    state: Arc<AtomicRecorderState>,
    stop_tx: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

#[async_trait]
impl MediaRecorder for FfmpegRecorder {
    fn state(&self) -> RecorderState {
        self.state.get()
    }

    fn mime_type(&self) -> &str {
        &self.mime
    }

    async fn start(
        &mut self,
        timeslice: Duration,
        sink: mpsc::Sender<RecordedData>,
    ) -> Result<(), CaptureError> {
        if self.state.get() != RecorderState::Inactive {
            return Err(CaptureError::Recorder("recorder already started".into()));
        }

        let mut cmd = tokio::process::Command::new(&self.ffmpeg);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(target_os = "windows")]
        cmd.creation_flags(0x08000000); // CREATE_NO_WINDOW

        let mut child = cmd
            .spawn()
            .map_err(|e| CaptureError::Recorder(format!("failed to spawn ffmpeg: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| CaptureError::Recorder("ffmpeg stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Recorder("ffmpeg stdout unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            self.tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        warn!("ffmpeg: {}", trimmed);
                    }
                }
            }));
        }

        // Samples that piled up on the mix bus before the recorder existed
        // would desync audio from video.
        self.audio.clear();

        let (stop_tx, stop_rx) = watch::channel(false);
        self.state.set(RecorderState::Recording);
        self.tasks
            .push(tokio::spawn(feed_audio(self.audio.clone(), stdin, stop_rx)));
        self.tasks.push(tokio::spawn(read_output(
            child,
            stdout,
            timeslice,
            Arc::clone(&self.state),
            sink,
        )));
        self.stop_tx = Some(stop_tx);

        info!(mime = %self.mime, timeslice_ms = timeslice.as_millis() as u64, "ffmpeg recorder started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        if !self.state.begin_stop() {
            debug!("Stop requested on a recorder that is not recording");
            return Ok(());
        }
        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(true);
        }
        info!("ffmpeg recorder stopping");
        Ok(())
    }
}

impl Drop for FfmpegRecorder {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn feed_audio(audio: AudioFeed, mut stdin: ChildStdin, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(AUDIO_FEED_INTERVAL);
    let mut samples: Vec<f32> = Vec::with_capacity(GRAPH_SAMPLE_RATE as usize / 10);
    let mut raw: Vec<u8> = Vec::with_capacity(GRAPH_SAMPLE_RATE as usize / 10 * 4);

    loop {
        let stopping = tokio::select! {
            _ = ticker.tick() => false,
            _ = stop.changed() => true,
        };

        samples.clear();
        audio.read_into(&mut samples);
        if !samples.is_empty() {
            raw.clear();
            for s in &samples {
                raw.extend_from_slice(&s.to_le_bytes());
            }
            if let Err(e) = stdin.write_all(&raw).await {
                warn!("ffmpeg stdin closed: {}", e);
                break;
            }
        }
        if stopping {
            break;
        }
    }
    let _ = stdin.shutdown().await;
    debug!("ffmpeg audio input closed");
}

async fn read_output(
    mut child: Child,
    mut stdout: ChildStdout,
    timeslice: Duration,
    state: Arc<AtomicRecorderState>,
    sink: mpsc::Sender<RecordedData>,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + timeslice, timeslice);
    let mut pending = BytesMut::with_capacity(256 * 1024);
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => pending.extend_from_slice(&buf[..n]),
                Err(e) => {
                    error!("ffmpeg stdout read failed: {}", e);
                    break;
                }
            },
            _ = ticker.tick() => {
                // Only cut while recording; after a stop everything left
                // goes out as the last piece.
                if state.get() == RecorderState::Recording && !pending.is_empty() {
                    let bytes: Bytes = pending.split().freeze();
                    let piece = RecordedData { bytes, state: RecorderState::Recording };
                    if sink.send(piece).await.is_err() {
                        debug!("Recorder sink dropped");
                    }
                }
            }
        }
    }

    state.set(RecorderState::Inactive);
    let last = RecordedData {
        bytes: pending.split().freeze(),
        state: RecorderState::Inactive,
    };
    let _ = sink.send(last).await;
    drop(sink);

    match child.wait().await {
        Ok(status) if status.success() => info!("ffmpeg exited"),
        Ok(status) => warn!("ffmpeg exited with {}", status),
        Err(e) => warn!("Failed to wait for ffmpeg: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface() -> DisplaySurface {
        DisplaySurface {
            input_format: "x11grab".into(),
            input: ":0".into(),
            framerate: 30,
        }
    }

    #[test]
    fn test_profiles_from_mime() {
        assert_eq!(OutputProfile::from_mime("video/webm;codecs=vp9"), Some(OutputProfile::WebmVp9));
        assert_eq!(OutputProfile::from_mime("video/webm; codecs=\"vp9,opus\""), Some(OutputProfile::WebmVp9));
        assert_eq!(OutputProfile::from_mime("video/webm;codecs=vp8"), Some(OutputProfile::WebmVp8));
        assert_eq!(OutputProfile::from_mime("video/webm"), Some(OutputProfile::WebmVp8));
        assert_eq!(OutputProfile::from_mime("video/mp4"), Some(OutputProfile::FragmentedMp4));
        assert_eq!(OutputProfile::from_mime("video/webm;codecs=av1"), None);
        assert_eq!(OutputProfile::from_mime("video/x-matroska"), None);
    }

    #[test]
    fn test_args_grab_display_and_read_audio_from_stdin() {
        let args = build_args(&surface(), OutputProfile::WebmVp9);
        let joined = args.join(" ");
        assert!(joined.contains("-f x11grab -framerate 30 -i :0"));
        assert!(joined.contains("-f f32le -ar 48000 -ac 1 -i pipe:0"));
        assert!(joined.contains("-c:v libvpx-vp9"));
        assert!(joined.ends_with("-shortest pipe:1"));
    }

    #[test]
    fn test_mp4_is_fragmented() {
        let args = build_args(&surface(), OutputProfile::FragmentedMp4);
        let pos = args.iter().position(|a| a == "-movflags").unwrap();
        assert_eq!(args[pos + 1], "frag_keyframe+empty_moov+default_base_moof");
    }

    #[test]
    fn test_missing_ffmpeg_supports_nothing() {
        let factory = FfmpegRecorderFactory::new(Some(PathBuf::from("/nonexistent/ffmpeg")));
        assert!(!factory.is_type_supported("video/webm"));
        let err = factory
            .create(&MediaStream::new(vec![]), "video/webm")
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::Recorder(_)));
    }
}
