//! Recorder abstraction.
//!
//! A recorder consumes a composed stream and hands encoded data to a sink
//! every timeslice. Each piece carries a snapshot of the recorder state at
//! emission time; the controller marks the first piece emitted outside
//! `Recording` as the session's final chunk.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::CaptureError;
use crate::media::MediaStream;

/// Recorder configurations tried in order, most specific first.
pub const DEFAULT_MIME_CANDIDATES: [&str; 3] = ["video/webm;codecs=vp9", "video/webm", "video/mp4"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecorderState {
    Inactive = 0,
    Recording = 1,
    /// Stop requested; the last data has not been emitted yet.
    Stopping = 2,
}

impl RecorderState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Recording,
            2 => Self::Stopping,
            _ => Self::Inactive,
        }
    }
}

/// Shareable recorder state cell, read by the emitting task at each cut.
#[derive(Debug)]
pub struct AtomicRecorderState(AtomicU8);

impl AtomicRecorderState {
    pub fn new(state: RecorderState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn get(&self) -> RecorderState {
        RecorderState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: RecorderState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Recording → Stopping. False if the recorder was not recording.
    pub fn begin_stop(&self) -> bool {
        self.0
            .compare_exchange(
                RecorderState::Recording as u8,
                RecorderState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// One piece of encoded output.
#[derive(Debug, Clone)]
pub struct RecordedData {
    pub bytes: Bytes,
    /// Recorder state when this piece was cut.
    pub state: RecorderState,
}

#[async_trait]
pub trait MediaRecorder: Send + Sync {
    fn state(&self) -> RecorderState;

    fn mime_type(&self) -> &str;

    /// Start encoding; data goes to `sink` every `timeslice`.
    async fn start(
        &mut self,
        timeslice: Duration,
        sink: mpsc::Sender<RecordedData>,
    ) -> Result<(), CaptureError>;

    /// Request a stop. The recorder emits exactly one more piece (with a
    /// non-`Recording` state) and then closes the sink.
    async fn stop(&mut self) -> Result<(), CaptureError>;
}

pub trait RecorderFactory: Send + Sync {
    fn is_type_supported(&self, mime: &str) -> bool;

    fn create(&self, stream: &MediaStream, mime: &str) -> Result<Box<dyn MediaRecorder>, CaptureError>;
}

/// First candidate the factory supports.
pub fn select_mime_type<S: AsRef<str>>(factory: &dyn RecorderFactory, candidates: &[S]) -> Option<String> {
    let chosen = candidates
        .iter()
        .map(AsRef::as_ref)
        .find(|mime| factory.is_type_supported(mime))
        .map(str::to_string);
    debug!(?chosen, "Recorder configuration selected");
    chosen
}
