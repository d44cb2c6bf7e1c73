//! Recording controller.
//!
//! Owns the capture-session state machine and the recorder. Recorder output
//! is renumbered into `Chunk`s and handed to the upload side over a bounded
//! channel, which is the backpressure point between encoding and network.

pub mod ffmpeg;
pub mod recorder;
pub mod state;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::CaptureError;
use crate::media::MediaStream;
use recorder::{select_mime_type, MediaRecorder, RecordedData, RecorderFactory, RecorderState};
pub use state::{RecordingState, RecordingStateMachine};

/// Chunk cadence of the recorder.
pub const DEFAULT_TIMESLICE: Duration = Duration::from_millis(1000);

/// Chunks buffered between the recorder and the uploader.
pub const CHUNK_CHANNEL_DEPTH: usize = 8;

/// How long `reset` waits for a stopped recorder to flush its tail.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A started recording: the chosen configuration and its chunk stream.
#[derive(Debug)]
pub struct ActiveRecording {
    pub mime: String,
    pub chunks: mpsc::Receiver<Chunk>,
}

/// One piece of recorder output, numbered in emission order.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub seq: u64,
    pub data: Bytes,
    pub is_final: bool,
}

pub struct RecordingController {
    state: RecordingStateMachine,
    published: watch::Sender<RecordingState>,
    stream: Mutex<Option<MediaStream>>,
    factory: Arc<dyn RecorderFactory>,
    mime_candidates: Vec<String>,
    timeslice: Duration,
    recorder: tokio::sync::Mutex<Option<Box<dyn MediaRecorder>>>,
}

impl RecordingController {
    pub fn new(
        factory: Arc<dyn RecorderFactory>,
        mime_candidates: Vec<String>,
        timeslice: Duration,
    ) -> Arc<Self> {
        let (published, _) = watch::channel(RecordingState::Idle);
        Arc::new(Self {
            state: RecordingStateMachine::new(),
            published,
            stream: Mutex::new(None),
            factory,
            mime_candidates,
            timeslice,
            recorder: tokio::sync::Mutex::new(None),
        })
    }

    pub fn state(&self) -> RecordingState {
        self.state.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<RecordingState> {
        self.published.subscribe()
    }

    fn publish(&self) {
        let current = self.state.current();
        self.published.send_if_modified(|s| {
            if *s == current {
                false
            } else {
                *s = current;
                true
            }
        });
    }

    pub fn has_stream(&self) -> bool {
        self.stream.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    /// A capture action was invoked. Idle moves to Requesting until a
    /// composed stream arrives, or straight to Ready if one is already here.
    pub fn request_capture(&self) -> RecordingState {
        if self.has_stream() {
            self.state.stream_ready();
        } else {
            self.state.request();
        }
        self.publish();
        self.state.current()
    }

    /// The recorder configuration `start_recording` would use.
    pub fn preferred_mime(&self) -> Option<String> {
        select_mime_type(self.factory.as_ref(), &self.mime_candidates)
    }

    /// Replace the composed stream (`None` while it is not ready).
    pub fn set_stream(&self, stream: Option<MediaStream>) {
        let ready = stream.is_some();
        if let Ok(mut slot) = self.stream.lock() {
            *slot = stream;
        }
        if ready {
            self.state.stream_ready();
        } else {
            self.state.stream_lost();
        }
        self.publish();
    }

    /// Start the recorder against the composed stream.
    ///
    /// Without a composed stream (or outside `Ready`) this is a no-op that
    /// returns `Ok(None)`. On success the chunk receiver yields the
    /// session's chunks, ending with exactly one final chunk.
    pub async fn start_recording(self: &Arc<Self>) -> Result<Option<ActiveRecording>, CaptureError> {
        let stream = self.stream.lock().ok().and_then(|s| s.clone());
        let Some(stream) = stream else {
            info!("start_recording ignored: no composed stream");
            return Ok(None);
        };
        if self.state.current() != RecordingState::Ready {
            info!(state = %self.state.current(), "start_recording ignored: not ready");
            return Ok(None);
        }

        let mut slot = self.recorder.lock().await;
        if slot.is_some() {
            warn!("start_recording ignored: recorder already active");
            return Ok(None);
        }

        let mime = self
            .preferred_mime()
            .ok_or_else(|| CaptureError::Recorder("no supported recorder configuration".into()))?;
        let mut recorder = self.factory.create(&stream, &mime)?;

        let (data_tx, data_rx) = mpsc::channel(CHUNK_CHANNEL_DEPTH);
        recorder.start(self.timeslice, data_tx).await?;
        if !self.state.start_recording() {
            warn!("State changed while starting the recorder, stopping it");
            let _ = recorder.stop().await;
            return Ok(None);
        }
        *slot = Some(recorder);
        drop(slot);
        self.publish();

        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_CHANNEL_DEPTH);
        tokio::spawn(Arc::clone(self).pump(data_rx, chunk_tx));
        info!(mime = %mime, "Recording started");
        Ok(Some(ActiveRecording {
            mime,
            chunks: chunk_rx,
        }))
    }

    /// Ask the recorder to stop. No-op without an active recorder.
    pub async fn stop_recording(&self) -> Result<(), CaptureError> {
        let mut slot = self.recorder.lock().await;
        let Some(recorder) = slot.as_mut() else {
            debug!("stop_recording ignored: no active recorder");
            return Ok(());
        };
        if recorder.state() != RecorderState::Recording {
            debug!("stop_recording ignored: recorder already stopping");
            return Ok(());
        }
        recorder.stop().await
    }

    /// Resolves once the controller is back to `Idle`.
    pub async fn wait_idle(&self) {
        let mut rx = self.published.subscribe();
        let _ = rx.wait_for(|s| *s == RecordingState::Idle).await;
    }

    /// Drop the stream and any recorder and force `Idle`.
    ///
    /// A live recorder is stopped and given up to [`DRAIN_TIMEOUT`] to hand
    /// its remaining output, final chunk included, to the upload side. Only
    /// then is it dropped.
    pub async fn reset(&self) {
        if let Ok(mut slot) = self.stream.lock() {
            *slot = None;
        }

        let draining = {
            let mut slot = self.recorder.lock().await;
            match slot.as_mut() {
                Some(recorder) => {
                    if recorder.state() == RecorderState::Recording {
                        if let Err(e) = recorder.stop().await {
                            warn!("Failed to stop recorder: {}", e);
                        }
                    }
                    true
                }
                None => false,
            }
        };
        // The pump needs the recorder lock to finish, so it is not held here.
        if draining && tokio::time::timeout(DRAIN_TIMEOUT, self.wait_idle()).await.is_err() {
            warn!("Recorder did not drain in time, dropping it");
        }
        self.recorder.lock().await.take();

        self.state.reset();
        self.publish();
    }

    /// Turn recorder output into numbered chunks with exactly one final.
    async fn pump(self: Arc<Self>, mut data: mpsc::Receiver<RecordedData>, chunks: mpsc::Sender<Chunk>) {
        let mut seq: u64 = 0;
        let mut final_sent = false;
        let mut upload_gone = false;

        while let Some(piece) = data.recv().await {
            if final_sent {
                warn!(bytes = piece.bytes.len(), "Dropping recorder data after the final chunk");
                continue;
            }
            let is_final = piece.state != RecorderState::Recording;
            if piece.bytes.is_empty() && !is_final {
                continue;
            }
            let chunk = Chunk {
                seq,
                data: piece.bytes,
                is_final,
            };
            seq += 1;
            final_sent = is_final;

            if upload_gone {
                continue;
            }
            debug!(seq = chunk.seq, bytes = chunk.data.len(), is_final, "Chunk emitted");
            if chunks.send(chunk).await.is_err() {
                warn!("Upload ended early, stopping the recorder");
                upload_gone = true;
                if let Err(e) = self.stop_recording().await {
                    warn!("Failed to stop recorder: {}", e);
                }
            }
        }

        if !final_sent && !upload_gone {
            warn!("Recorder closed without a final chunk, sending an empty one");
            let _ = chunks
                .send(Chunk {
                    seq,
                    data: Bytes::new(),
                    is_final: true,
                })
                .await;
        }
        drop(chunks);

        self.recorder.lock().await.take();
        self.state.finish_recording();
        self.publish();
        info!(chunks = seq, "Recording finished");
    }
}
