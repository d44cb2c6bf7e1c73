//! Capture coordinator.
//!
//! Wires the leaf components into one capture session:
//!
//! ```text
//! PermissionGate ──┐
//!                  ├──► AudioGraphBuilder ──► compose ──► RecordingController ──► UploadPipeline
//! DeviceRegistry ──┘            │
//!                               └──► MeterLoop
//! ```
//!
//! Permission grants, device selection and explicit reloads mark the graph
//! dirty; `rebuild()` tears the old graph down before building the next one
//! and pushes the recomposed stream into the controller.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::level::METER_FLOOR_DB;
use crate::audio::{AudioGraph, AudioGraphBuilder, RmsRoutine};
use crate::compose::compose;
use crate::devices::{DeviceDescriptor, DeviceRegistry, DeviceWatch, MediaDevices};
use crate::display::DisplayCapture;
use crate::error::{CaptureError, UploadError};
use crate::media::MediaTrack;
use crate::permission::{PermissionGate, ResourceState};
use crate::recording::recorder::RecorderFactory;
use crate::recording::{RecordingController, RecordingState, DRAIN_TIMEOUT};
use crate::upload::{UploadBackendFactory, UploadEvent, UploadPipeline, UploadPolicy, UploadSummary};

/// Platform and backend collaborators.
pub struct CaptureDeps {
    pub devices: Arc<dyn MediaDevices>,
    pub display: Arc<dyn DisplayCapture>,
    pub recorders: Arc<dyn RecorderFactory>,
    pub rms: Arc<dyn RmsRoutine>,
    pub uploads: Arc<dyn UploadBackendFactory>,
}

#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub initial_device: Option<String>,
    pub fft_size: usize,
    pub meter_frame: Duration,
    pub timeslice: Duration,
    pub mime_candidates: Vec<String>,
    pub upload_policy: UploadPolicy,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            initial_device: None,
            fft_size: crate::audio::graph::DEFAULT_FFT_SIZE,
            meter_frame: crate::audio::meter::DEFAULT_FRAME,
            timeslice: crate::recording::DEFAULT_TIMESLICE,
            mime_candidates: crate::recording::recorder::DEFAULT_MIME_CANDIDATES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            upload_policy: UploadPolicy::default(),
        }
    }
}

/// Notifications for the shell.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    Permission { state: &'static str, error: Option<String> },
    Devices { devices: Vec<DeviceDescriptor>, selected: Option<String> },
    StreamReady(bool),
    State(RecordingState),
    Level(f32),
    Upload(UploadEvent),
    Error(String),
}

/// One end-to-end recording attempt.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub state: RecordingState,
    pub video_track: MediaTrack,
    pub graph_id: Uuid,
}

pub struct CaptureCoordinator {
    gate: Arc<PermissionGate>,
    registry: Arc<DeviceRegistry>,
    controller: Arc<RecordingController>,
    builder: AudioGraphBuilder,
    rms: Arc<dyn RmsRoutine>,
    uploads: Arc<dyn UploadBackendFactory>,
    policy: UploadPolicy,
    meter_frame: Duration,
    /// Holding this lock is what serializes rebuilds.
    graph: tokio::sync::Mutex<Option<AudioGraph>>,
    level: watch::Sender<f32>,
    device_watch: Mutex<Option<DeviceWatch>>,
    session: Mutex<Option<CaptureSession>>,
    upload: Mutex<Option<JoinHandle<()>>>,
    last_error: Mutex<Option<String>>,
    events: mpsc::UnboundedSender<CoreEvent>,
    watchers: Mutex<Vec<JoinHandle<()>>>,
}

impl CaptureCoordinator {
    pub fn new(
        deps: CaptureDeps,
        options: CaptureOptions,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CoreEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (level, _) = watch::channel(METER_FLOOR_DB);
        let coordinator = Arc::new(Self {
            gate: PermissionGate::new(deps.display),
            registry: Arc::new(DeviceRegistry::new(deps.devices, options.initial_device)),
            controller: RecordingController::new(
                deps.recorders,
                options.mime_candidates,
                options.timeslice,
            ),
            builder: AudioGraphBuilder::new(options.fft_size),
            rms: deps.rms,
            uploads: deps.uploads,
            policy: options.upload_policy,
            meter_frame: options.meter_frame,
            graph: tokio::sync::Mutex::new(None),
            level,
            device_watch: Mutex::new(None),
            session: Mutex::new(None),
            upload: Mutex::new(None),
            last_error: Mutex::new(None),
            events,
            watchers: Mutex::new(Vec::new()),
        });
        (coordinator, events_rx)
    }

    fn emit(&self, event: CoreEvent) {
        let _ = self.events.send(event);
    }

    /// Start the reactive edges: permission outcomes trigger rebuilds,
    /// device-list changes are reported (and rebuild when the microphone in
    /// use disappears), state and level changes are forwarded.
    pub async fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handles = vec![
            tokio::spawn(watch_permission(weak.clone(), self.gate.subscribe())),
            tokio::spawn(watch_devices(weak.clone(), self.registry.subscribe())),
            tokio::spawn(watch_state(weak.clone(), self.controller.subscribe())),
            tokio::spawn(watch_level(weak, self.level.subscribe())),
        ];
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.extend(handles);
        }
        self.registry.refresh().await;
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &Arc<PermissionGate> {
        &self.gate
    }

    pub fn controller(&self) -> &Arc<RecordingController> {
        &self.controller
    }

    pub fn level(&self) -> watch::Receiver<f32> {
        self.level.subscribe()
    }

    pub fn session(&self) -> Option<CaptureSession> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    fn set_last_error(&self, error: Option<String>) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = error;
        }
    }

    pub async fn has_graph(&self) -> bool {
        self.graph.lock().await.is_some()
    }

    /// The capture action: ask for display capture (idempotent) and move the
    /// controller towards `Ready`.
    pub fn request_permission(&self) -> bool {
        self.controller.request_capture();
        let issued = self.gate.request_permission();
        self.emit_permission();
        issued
    }

    fn emit_permission(&self) {
        let state = self.gate.state();
        let error = match &state {
            ResourceState::Failed(message) => Some(message.clone()),
            _ => None,
        };
        self.emit(CoreEvent::Permission {
            state: state.label(),
            error,
        });
    }

    pub async fn list_devices(&self) -> Vec<DeviceDescriptor> {
        self.registry.refresh().await
    }

    pub async fn select_device(&self, id: Option<String>) -> Result<(), CaptureError> {
        self.registry.set_selected(id);
        self.rebuild().await
    }

    pub async fn reload_audio(&self) -> Result<(), CaptureError> {
        self.rebuild().await
    }

    /// Live gain of the microphone path. Returns the applied value.
    pub async fn set_gain(&self, value: f32) -> Option<f32> {
        let graph = self.graph.lock().await;
        graph.as_ref().map(|g| {
            g.gain().set_value(value);
            g.gain().value()
        })
    }

    fn ensure_device_watch(&self) {
        if let Ok(mut slot) = self.device_watch.lock() {
            if slot.is_none() {
                *slot = Some(self.registry.watch());
            }
        }
    }

    /// Rebuild the audio graph and recompose the stream.
    pub async fn rebuild(&self) -> Result<(), CaptureError> {
        let mut slot = self.graph.lock().await;
        if self.controller.state() == RecordingState::Recording {
            debug!("Rebuild deferred: recording in progress");
            return Ok(());
        }

        if let Some(old) = slot.take() {
            info!(graph = %old.id(), "Tearing down previous audio graph");
            drop(old);
        }
        self.level.send_replace(METER_FLOOR_DB);

        let Some(display) = self.gate.state().ready().cloned() else {
            debug!("Rebuild skipped: display capture not granted");
            self.controller.set_stream(None);
            self.emit(CoreEvent::StreamReady(false));
            return Ok(());
        };

        self.ensure_device_watch();
        self.registry.refresh().await;
        let constraint = self.registry.audio_constraint();

        let graph = match self
            .builder
            .build(self.registry.backend().as_ref(), &constraint, Some(&display))
            .await
        {
            Ok(graph) => graph,
            Err(e) => {
                warn!("Audio graph build failed: {}", e);
                self.set_last_error(Some(e.to_string()));
                self.controller.set_stream(None);
                self.emit(CoreEvent::Error(e.to_string()));
                self.emit(CoreEvent::StreamReady(false));
                return Err(e);
            }
        };

        graph.start_meter(Arc::clone(&self.rms), self.level.clone(), self.meter_frame);
        let composed = compose(Some(graph.stream()), Some(&display));
        let ready = composed.is_some();
        self.controller.set_stream(composed);
        self.set_last_error(None);
        *slot = Some(graph);
        drop(slot);

        self.emit(CoreEvent::StreamReady(ready));
        Ok(())
    }

    /// Start recording and stream the chunks to a fresh upload session.
    ///
    /// Returns `Ok(None)` when there was nothing to start (no composed stream,
    /// not ready, or the previous session is still uploading).
    pub async fn start_recording(self: &Arc<Self>) -> Result<Option<Uuid>, CaptureError> {
        if self.session().is_some() {
            info!("start_recording ignored: previous session still finishing");
            return Ok(None);
        }
        if !self.controller.has_stream() {
            info!("start_recording ignored: no composed stream");
            return Ok(None);
        }

        let mime = self
            .controller
            .preferred_mime()
            .ok_or_else(|| CaptureError::Recorder("no supported recorder configuration".into()))?;
        let backend = self
            .uploads
            .create(&mime)
            .map_err(|e| CaptureError::Upload(UploadError::Begin(e.to_string())))?;

        let Some(active) = self.controller.start_recording().await? else {
            return Ok(None);
        };

        let (video_track, graph_id) = {
            let graph = self.graph.lock().await;
            let video = self.gate.state().ready().and_then(|d| d.video_track().cloned());
            match (video, graph.as_ref()) {
                (Some(video), Some(graph)) => (video, graph.id()),
                _ => {
                    error!("Recording started without a graph or display track");
                    let _ = self.controller.stop_recording().await;
                    return Err(CaptureError::Recorder("capture resources vanished".into()));
                }
            }
        };

        let session = CaptureSession {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            state: self.controller.state(),
            video_track,
            graph_id,
        };
        let session_id = session.id;
        if let Ok(mut slot) = self.session.lock() {
            *slot = Some(session);
        }
        info!(session = %session_id, mime = %active.mime, "Capture session started");

        let (upload_tx, upload_rx) = mpsc::unbounded_channel();
        let pipeline = UploadPipeline::new(backend, self.policy).with_events(upload_tx);
        tokio::spawn(forward_upload_events(self.events.clone(), upload_rx));

        let coordinator = Arc::clone(self);
        let upload = tokio::spawn(async move {
            let outcome = pipeline.run(active.chunks).await;
            coordinator.finish_session(session_id, outcome).await;
        });
        if let Ok(mut slot) = self.upload.lock() {
            *slot = Some(upload);
        }

        Ok(Some(session_id))
    }

    pub async fn stop_recording(&self) -> Result<(), CaptureError> {
        self.controller.stop_recording().await
    }

    async fn finish_session(&self, session_id: Uuid, outcome: Result<UploadSummary, UploadError>) {
        match &outcome {
            Ok(summary) => info!(
                session = %session_id,
                parts = summary.session.parts.len(),
                location = ?summary.location,
                "Capture session uploaded"
            ),
            Err(e) => {
                warn!(session = %session_id, "Capture session upload failed: {}", e);
                // Make sure the recorder does not keep running into a dead
                // upload.
                let _ = self.controller.stop_recording().await;
            }
        }
        self.controller.wait_idle().await;
        self.release_session(session_id).await;
    }

    /// Tear down everything the session holds: graph (and meter), device
    /// listener, display tracks. The controller ends in `Idle`.
    pub async fn release_session(&self, session_id: Uuid) {
        let current = self.session().map(|s| s.id);
        if current != Some(session_id) {
            debug!(session = %session_id, "Release ignored: not the current session");
            return;
        }
        self.teardown().await;
        info!(session = %session_id, "Capture session released");
    }

    /// Stop a live recording, wait for its upload to settle, then release
    /// everything.
    ///
    /// The wait is bounded by the recorder drain plus the upload's
    /// finalize timeout; an upload still running after that is abandoned.
    pub async fn shutdown(&self) {
        if let Some(session) = self.session() {
            info!(session = %session.id, "Finishing capture session before shutdown");
            if let Err(e) = self.stop_recording().await {
                warn!("Failed to stop recording: {}", e);
            }
            let upload = self.upload.lock().ok().and_then(|mut slot| slot.take());
            if let Some(mut upload) = upload {
                let bound = DRAIN_TIMEOUT + self.policy.finalize_timeout;
                if tokio::time::timeout(bound, &mut upload).await.is_err() {
                    warn!(session = %session.id, "Upload did not settle before shutdown, abandoning it");
                    upload.abort();
                }
            }
        }
        self.teardown().await;
    }

    /// Release every capture resource regardless of session state.
    ///
    /// A running recorder is drained first so its final chunk still reaches
    /// the upload.
    pub async fn teardown(&self) {
        self.controller.reset().await;
        {
            let mut graph = self.graph.lock().await;
            graph.take();
        }
        if let Ok(mut watch) = self.device_watch.lock() {
            watch.take();
        }
        self.gate.release();
        if let Ok(mut slot) = self.session.lock() {
            slot.take();
        }
        self.level.send_replace(METER_FLOOR_DB);
        self.emit(CoreEvent::StreamReady(false));
    }

    pub fn device_watch_active(&self) -> bool {
        self.device_watch
            .lock()
            .map(|w| w.as_ref().is_some_and(DeviceWatch::is_active))
            .unwrap_or(false)
    }

    fn update_session_state(&self, state: RecordingState) {
        if let Ok(mut slot) = self.session.lock() {
            if let Some(session) = slot.as_mut() {
                session.state = state;
            }
        }
    }
}

impl Drop for CaptureCoordinator {
    fn drop(&mut self) {
        if let Ok(watchers) = self.watchers.lock() {
            for handle in watchers.iter() {
                handle.abort();
            }
        }
    }
}

async fn watch_permission(
    coordinator: Weak<CaptureCoordinator>,
    mut rx: watch::Receiver<ResourceState<crate::display::DisplayHandle>>,
) {
    while rx.changed().await.is_ok() {
        let Some(c) = coordinator.upgrade() else { break };
        c.emit_permission();
        let granted = rx.borrow_and_update().ready().is_some();
        if granted {
            if let Err(e) = c.rebuild().await {
                debug!("Rebuild after grant failed: {}", e);
            }
        } else if c.controller.has_stream() {
            c.controller.set_stream(None);
            c.emit(CoreEvent::StreamReady(false));
        }
    }
}

async fn watch_devices(coordinator: Weak<CaptureCoordinator>, mut rx: watch::Receiver<Vec<DeviceDescriptor>>) {
    let mut previous = rx.borrow().clone();
    while rx.changed().await.is_ok() {
        let devices = rx.borrow_and_update().clone();
        let Some(c) = coordinator.upgrade() else { break };
        let selected = c.registry.selected_device().map(|d| d.id);
        c.emit(CoreEvent::Devices {
            devices: devices.clone(),
            selected,
        });

        // Rebuild when the microphone feeding the graph went away. An empty
        // list is a failed or transient enumeration, not an unplug.
        let changed = devices != previous;
        previous = devices.clone();
        let lost = changed
            && !devices.is_empty()
            && c.graph
                .lock()
                .await
                .as_ref()
                .and_then(AudioGraph::device_id)
                .is_some_and(|id| !devices.iter().any(|d| d.id == id));
        if lost && c.controller.state() != RecordingState::Recording {
            info!("Microphone in use disappeared, rebuilding audio graph");
            let rebuild_target = Arc::clone(&c);
            tokio::spawn(async move {
                let _ = rebuild_target.rebuild().await;
            });
        }
    }
}

async fn watch_state(coordinator: Weak<CaptureCoordinator>, mut rx: watch::Receiver<RecordingState>) {
    while rx.changed().await.is_ok() {
        let state = *rx.borrow_and_update();
        let Some(c) = coordinator.upgrade() else { break };
        c.update_session_state(state);
        c.emit(CoreEvent::State(state));
    }
}

async fn watch_level(coordinator: Weak<CaptureCoordinator>, mut rx: watch::Receiver<f32>) {
    while rx.changed().await.is_ok() {
        let rms = *rx.borrow_and_update();
        let Some(c) = coordinator.upgrade() else { break };
        c.emit(CoreEvent::Level(rms));
    }
}

async fn forward_upload_events(events: mpsc::UnboundedSender<CoreEvent>, mut rx: mpsc::UnboundedReceiver<UploadEvent>) {
    while let Some(event) = rx.recv().await {
        if events.send(CoreEvent::Upload(event)).is_err() {
            break;
        }
    }
}
