//! In-memory fakes for the platform seams, shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::capture::GRAPH_SAMPLE_RATE;
use crate::audio::level::rms_dbfs;
use crate::audio::{audio_ring_buffer, AudioProducer, RmsRoutine};
use crate::compose::compose;
use crate::devices::{DeviceDescriptor, MediaDevices};
use crate::display::{DisplayCapture, DisplayHandle};
use crate::error::CaptureError;
use crate::media::{AudioConstraint, AudioFeed, DisplaySurface, MediaStream, MediaTrack};
use crate::recording::recorder::{
    AtomicRecorderState, MediaRecorder, RecordedData, RecorderFactory, RecorderState,
    DEFAULT_MIME_CANDIDATES,
};
use crate::upload::{UploadBackend, UploadBackendFactory};

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

pub struct FakeDevices {
    devices: Mutex<Vec<DeviceDescriptor>>,
    enumeration_fails: AtomicBool,
    mic_error: Mutex<Option<String>>,
    opened: Mutex<Vec<(MediaTrack, AudioProducer)>>,
    last_opened: Mutex<Option<String>>,
    changes: broadcast::Sender<()>,
}

impl FakeDevices {
    pub fn with_inputs(ids: &[&str]) -> Self {
        let (changes, _) = broadcast::channel(8);
        Self {
            devices: Mutex::new(
                ids.iter()
                    .map(|id| DeviceDescriptor::audio_input(*id, format!("{id} (fake)")))
                    .collect(),
            ),
            enumeration_fails: AtomicBool::new(false),
            mic_error: Mutex::new(None),
            opened: Mutex::new(Vec::new()),
            last_opened: Mutex::new(None),
            changes,
        }
    }

    pub fn fail_enumeration(&self, fail: bool) {
        self.enumeration_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_microphone(&self, message: &str) {
        *self.mic_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn add_device(&self, device: DeviceDescriptor) {
        self.devices.lock().unwrap().push(device);
        let _ = self.changes.send(());
    }

    pub fn unplug(&self, id: &str) {
        self.devices.lock().unwrap().retain(|d| d.id != id);
        let _ = self.changes.send(());
    }

    /// Feed samples into every microphone that is still open.
    pub fn push_mic_samples(&self, samples: &[f32]) {
        for (track, producer) in self.opened.lock().unwrap().iter_mut() {
            if !track.is_ended() {
                producer.push_slice(samples);
            }
        }
    }

    pub fn open_microphones(&self) -> usize {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .filter(|(track, _)| !track.is_ended())
            .count()
    }

    pub fn last_opened(&self) -> Option<String> {
        self.last_opened.lock().unwrap().clone()
    }
    /// Every microphone ever opened, released or not.
    pub fn acquisitions(&self) -> usize {
        self.opened.lock().unwrap().len()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        if self.enumeration_fails.load(Ordering::SeqCst) {
            return Err(CaptureError::DeviceEnumeration("fake enumeration failure".into()));
        }
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn get_user_media(&self, constraint: &AudioConstraint) -> Result<MediaTrack, CaptureError> {
        if let Some(message) = self.mic_error.lock().unwrap().clone() {
            return Err(CaptureError::GraphConstruction(message));
        }
        let id = {
            let devices = self.devices.lock().unwrap();
            match constraint {
                AudioConstraint::Any => devices
                    .first()
                    .map(|d| d.id.clone())
                    .unwrap_or_else(|| "default".to_string()),
                AudioConstraint::Exact(id) => {
                    if !devices.iter().any(|d| &d.id == id) {
                        return Err(CaptureError::GraphConstruction(format!(
                            "no such device: {id}"
                        )));
                    }
                    id.clone()
                }
            }
        };
        let (producer, consumer) = audio_ring_buffer(None);
        let track = MediaTrack::audio(id.clone(), AudioFeed::new(consumer, GRAPH_SAMPLE_RATE));
        self.opened.lock().unwrap().push((track.clone(), producer));
        *self.last_opened.lock().unwrap() = Some(id);
        Ok(track)
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

fn display_feeds() -> &'static Mutex<HashMap<Uuid, AudioProducer>> {
    static FEEDS: OnceLock<Mutex<HashMap<Uuid, AudioProducer>>> = OnceLock::new();
    FEEDS.get_or_init(|| Mutex::new(HashMap::new()))
}

pub struct FakeDisplay {
    with_audio: bool,
    deny: Mutex<Option<String>>,
    calls: AtomicUsize,
    last: Mutex<Option<DisplayHandle>>,
}

impl FakeDisplay {
    pub fn granting(with_audio: bool) -> Self {
        Self {
            with_audio,
            deny: Mutex::new(None),
            calls: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }

    pub fn denying(message: &str) -> Self {
        let display = Self::granting(false);
        display.set_deny(Some(message));
        display
    }

    pub fn set_deny(&self, message: Option<&str>) {
        *self.deny.lock().unwrap() = message.map(str::to_string);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_handle(&self) -> Option<DisplayHandle> {
        self.last.lock().unwrap().clone()
    }

    /// A granted capture, optionally with a system-audio track.
    pub fn handle(with_audio: bool) -> DisplayHandle {
        let video = MediaTrack::video(
            "screen",
            DisplaySurface {
                input_format: "lavfi".into(),
                input: "testsrc".into(),
                framerate: 30,
            },
        );
        let audio = with_audio.then(|| {
            let (producer, consumer) = audio_ring_buffer(None);
            let track = MediaTrack::audio("system-audio", AudioFeed::new(consumer, GRAPH_SAMPLE_RATE));
            display_feeds().lock().unwrap().insert(track.id(), producer);
            track
        });
        DisplayHandle::new(video, audio)
    }

    /// Feed samples into the handle's system-audio track.
    pub fn push_audio(handle: &DisplayHandle, samples: &[f32]) {
        let track = handle.audio_track().expect("handle has no system audio");
        let mut feeds = display_feeds().lock().unwrap();
        feeds
            .get_mut(&track.id())
            .expect("system audio not created by FakeDisplay")
            .push_slice(samples);
    }
}

#[async_trait]
impl DisplayCapture for FakeDisplay {
    async fn get_display_media(&self) -> Result<DisplayHandle, CaptureError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = self.deny.lock().unwrap().clone() {
            return Err(CaptureError::PermissionDenied(message));
        }
        let handle = Self::handle(self.with_audio);
        *self.last.lock().unwrap() = Some(handle.clone());
        Ok(handle)
    }
}

/// Mixed audio plus a fake display: what the recorder gets once ready.
pub fn composed_stream() -> MediaStream {
    let (_producer, consumer) = audio_ring_buffer(Some(64));
    let mix = MediaStream::new(vec![MediaTrack::audio(
        "mix-bus",
        AudioFeed::new(consumer, GRAPH_SAMPLE_RATE),
    )]);
    compose(Some(&mix), Some(&FakeDisplay::handle(false))).unwrap()
}

// ---------------------------------------------------------------------------
// Meter
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct CountingRms {
    calls: AtomicUsize,
}

impl CountingRms {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RmsRoutine for CountingRms {
    async fn compute_rms(&self, samples: &[f32]) -> anyhow::Result<f32> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(rms_dbfs(samples))
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct RecorderScript {
    /// Pieces emitted after the final one.
    pub trailing_after_final: usize,
    /// Close without emitting the final piece.
    pub omit_final: bool,
}

pub struct FakeRecorderFactory {
    script: RecorderScript,
    supported: Mutex<Option<Vec<String>>>,
    created: AtomicUsize,
    chosen: Mutex<Option<String>>,
}

impl FakeRecorderFactory {
    pub fn new(script: RecorderScript) -> Self {
        Self {
            script,
            supported: Mutex::new(None),
            created: AtomicUsize::new(0),
            chosen: Mutex::new(None),
        }
    }

    pub fn set_supported(&self, mimes: &[&str]) {
        *self.supported.lock().unwrap() = Some(mimes.iter().map(|m| m.to_string()).collect());
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn chosen_mime(&self) -> Option<String> {
        self.chosen.lock().unwrap().clone()
    }
}

impl RecorderFactory for FakeRecorderFactory {
    fn is_type_supported(&self, mime: &str) -> bool {
        match &*self.supported.lock().unwrap() {
            Some(list) => list.iter().any(|m| m == mime),
            None => DEFAULT_MIME_CANDIDATES.iter().any(|m| *m == mime),
        }
    }

    fn create(&self, _stream: &MediaStream, mime: &str) -> Result<Box<dyn MediaRecorder>, CaptureError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        *self.chosen.lock().unwrap() = Some(mime.to_string());
        Ok(Box::new(FakeRecorder {
            mime: mime.to_string(),
            script: self.script,
            state: Arc::new(AtomicRecorderState::new(RecorderState::Inactive)),
            stop: None,
            task: None,
        }))
    }
}

/// Emits one piece per timeslice while recording, then the final piece.
struct FakeRecorder {
    mime: String,
    script: RecorderScript,
    state: Arc<AtomicRecorderState>,
    stop: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl MediaRecorder for FakeRecorder {
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
        let (stop_tx, mut stop_rx) = watch::channel(false);
        self.state.set(RecorderState::Recording);
        let state = Arc::clone(&self.state);
        let script = self.script;

        self.task = Some(tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + timeslice, timeslice);
            let mut n = 0u32;
            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        if state.get() != RecorderState::Recording {
                            break;
                        }
                        let piece = RecordedData {
                            bytes: Bytes::from(format!("chunk-{n}")),
                            state: RecorderState::Recording,
                        };
                        n += 1;
                        if sink.send(piece).await.is_err() {
                            break;
                        }
                    }
                }
            }

            if !script.omit_final {
                let _ = sink
                    .send(RecordedData {
                        bytes: Bytes::from_static(b"final"),
                        state: RecorderState::Stopping,
                    })
                    .await;
            }
            for _ in 0..script.trailing_after_final {
                let _ = sink
                    .send(RecordedData {
                        bytes: Bytes::from_static(b"late"),
                        state: RecorderState::Inactive,
                    })
                    .await;
            }
            state.set(RecorderState::Inactive);
        }));
        self.stop = Some(stop_tx);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), CaptureError> {
        if self.state.begin_stop() {
            if let Some(stop) = &self.stop {
                let _ = stop.send(true);
            }
        }
        Ok(())
    }
}

impl Drop for FakeRecorder {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Begin,
    Part {
        len: usize,
        first_byte: u8,
        is_final: bool,
    },
}

#[derive(Default)]
struct BackendInner {
    calls: Mutex<Vec<BackendCall>>,
    fail_begin: AtomicBool,
    failing_parts: AtomicU32,
    stall_final: AtomicBool,
    reject_final: AtomicBool,
}

/// Records every call; also hands out itself as the per-session backend.
#[derive(Clone, Default)]
pub struct FakeBackend {
    inner: Arc<BackendInner>,
}

impl FakeBackend {
    pub fn calls(&self) -> Vec<BackendCall> {
        self.inner.calls.lock().unwrap().clone()
    }

    pub fn fail_begin(&self) {
        self.inner.fail_begin.store(true, Ordering::SeqCst);
    }

    /// The next `n` part calls fail.
    pub fn fail_parts(&self, n: u32) {
        self.inner.failing_parts.store(n, Ordering::SeqCst);
    }

    pub fn stall_final(&self) {
        self.inner.stall_final.store(true, Ordering::SeqCst);
    }

    pub fn reject_final(&self) {
        self.inner.reject_final.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl UploadBackend for FakeBackend {
    async fn begin(&self) -> anyhow::Result<()> {
        self.inner.calls.lock().unwrap().push(BackendCall::Begin);
        if self.inner.fail_begin.load(Ordering::SeqCst) {
            anyhow::bail!("begin refused");
        }
        Ok(())
    }

    async fn part(&self, data: Bytes, is_final: bool) -> anyhow::Result<bool> {
        self.inner.calls.lock().unwrap().push(BackendCall::Part {
            len: data.len(),
            first_byte: data.first().copied().unwrap_or(0),
            is_final,
        });
        let failing = self.inner.failing_parts.load(Ordering::SeqCst);
        if failing > 0 {
            self.inner.failing_parts.store(failing - 1, Ordering::SeqCst);
            anyhow::bail!("part refused");
        }
        if !is_final {
            return Ok(false);
        }
        if self.inner.stall_final.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(!self.inner.reject_final.load(Ordering::SeqCst))
    }

    async fn location(&self) -> Option<String> {
        Some("memory://upload".to_string())
    }
}

impl UploadBackendFactory for FakeBackend {
    fn create(&self, _mime: &str) -> anyhow::Result<Arc<dyn UploadBackend>> {
        Ok(Arc::new(self.clone()))
    }
}
