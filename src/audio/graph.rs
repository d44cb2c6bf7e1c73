//! Audio mixing graph.
//!
//! Fixed topology:
//!
//! ```text
//! microphone ──► gain ──┬──► analyser (meter tap)
//!                       └──► mix bus ──► output stream
//! display audio ───────────► mix bus   (unity gain, optional)
//! ```
//!
//! A render task pulls one quantum at a time from the input feeds, applies
//! the gain, feeds the analyser window, and pushes the mixed samples into
//! the mix-bus ring buffer that backs the output track.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_atomic::AtomicF32;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::capture::GRAPH_SAMPLE_RATE;
use super::meter::{MeterLoop, RmsRoutine};
use super::ring_buffer::{audio_ring_buffer, AudioProducer};
use crate::devices::MediaDevices;
use crate::display::DisplayHandle;
use crate::error::CaptureError;
use crate::media::{AudioConstraint, AudioFeed, MediaStream, MediaTrack};

/// Render period of the graph.
pub const RENDER_QUANTUM: Duration = Duration::from_millis(10);

/// Default analyser window (samples).
pub const DEFAULT_FFT_SIZE: usize = 2048;

/// Upper bound of the user gain control.
pub const MAX_GAIN: f32 = 100.0;

/// Mix-bus capacity: two seconds of output.
const MIX_BUS_CAPACITY: usize = GRAPH_SAMPLE_RATE as usize * 2;

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// Live gain control for the microphone path.
#[derive(Debug, Clone)]
pub struct GainNode {
    gain: Arc<AtomicF32>,
}

impl GainNode {
    fn new() -> Self {
        Self {
            gain: Arc::new(AtomicF32::new(1.0)),
        }
    }

    pub fn value(&self) -> f32 {
        self.gain.load(Ordering::Relaxed)
    }

    /// Set the linear gain, clamped to `0.0..=MAX_GAIN`. NaN is ignored.
    pub fn set_value(&self, value: f32) {
        if value.is_nan() {
            return;
        }
        self.gain.store(value.clamp(0.0, MAX_GAIN), Ordering::Relaxed);
    }
}

struct AnalyserWindow {
    data: Vec<f32>,
    write_pos: usize,
    released: bool,
}

/// Read-only tap exposing the most recent post-gain microphone samples.
///
/// Only the graph writes to it; consumers copy out with
/// [`AnalyserNode::get_float_time_domain_data`].
#[derive(Clone)]
pub struct AnalyserNode {
    window: Arc<Mutex<AnalyserWindow>>,
    fft_size: usize,
}

impl AnalyserNode {
    fn new(fft_size: usize) -> Self {
        Self {
            window: Arc::new(Mutex::new(AnalyserWindow {
                data: vec![0.0; fft_size],
                write_pos: 0,
                released: false,
            })),
            fft_size,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    fn write(&self, samples: &[f32]) {
        let Ok(mut w) = self.window.lock() else {
            return;
        };
        if w.released {
            return;
        }
        for &s in samples {
            let pos = w.write_pos;
            w.data[pos] = s;
            w.write_pos = (pos + 1) % self.fft_size;
        }
    }

    /// Copy the most recent `out.len()` samples (oldest first) into `out`.
    ///
    /// Returns `false` once the owning graph has been torn down.
    pub fn get_float_time_domain_data(&self, out: &mut [f32]) -> bool {
        let Ok(w) = self.window.lock() else {
            return false;
        };
        if w.released {
            return false;
        }
        let n = out.len().min(self.fft_size);
        let start = (w.write_pos + self.fft_size - n) % self.fft_size;
        for (i, slot) in out.iter_mut().take(n).enumerate() {
            *slot = w.data[(start + i) % self.fft_size];
        }
        true
    }

    fn release(&self) {
        if let Ok(mut w) = self.window.lock() {
            w.released = true;
            w.data.clear();
            w.data.shrink_to_fit();
        }
    }

    pub fn is_released(&self) -> bool {
        self.window.lock().map(|w| w.released).unwrap_or(true)
    }
}

/// Render one quantum: `mix = mic * gain + display`, and the post-gain
/// microphone samples are written to the analyser.
///
/// Inputs of different lengths are zero-padded to the longer one.
pub fn render_quantum(
    mic: &[f32],
    display: &[f32],
    gain: f32,
    analyser: &AnalyserNode,
    mix: &mut Vec<f32>,
) {
    mix.clear();
    mix.resize(mic.len().max(display.len()), 0.0);
    for (out, s) in mix.iter_mut().zip(mic) {
        *out = s * gain;
    }
    analyser.write(&mix[..mic.len()]);
    for (out, s) in mix.iter_mut().zip(display) {
        *out += s;
    }
}

async fn render_loop(
    mic: AudioFeed,
    display: Option<AudioFeed>,
    gain: GainNode,
    analyser: AnalyserNode,
    mut out: AudioProducer,
) {
    let mut ticker = tokio::time::interval(RENDER_QUANTUM);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut mic_buf = Vec::with_capacity(GRAPH_SAMPLE_RATE as usize / 10);
    let mut display_buf = Vec::with_capacity(GRAPH_SAMPLE_RATE as usize / 10);
    let mut mix = Vec::with_capacity(GRAPH_SAMPLE_RATE as usize / 10);

    loop {
        ticker.tick().await;

        mic_buf.clear();
        mic.read_into(&mut mic_buf);
        display_buf.clear();
        if let Some(feed) = &display {
            feed.read_into(&mut display_buf);
        }
        if mic_buf.is_empty() && display_buf.is_empty() {
            continue;
        }

        render_quantum(&mic_buf, &display_buf, gain.value(), &analyser, &mut mix);
        // Nobody is draining the mix bus (no recorder yet): newest samples
        // are dropped until the recorder clears and reads it.
        out.push_slice(&mix);
    }
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// A built, running audio graph.
///
/// Dropping it tears everything down: meter first, then the render task,
/// the microphone, the analyser, and the output track.
pub struct AudioGraph {
    id: Uuid,
    device_id: Option<String>,
    microphone: MediaTrack,
    display_source: Option<MediaTrack>,
    gain: GainNode,
    analyser: AnalyserNode,
    output: MediaStream,
    sample_buffer: Arc<Mutex<Vec<f32>>>,
    render: JoinHandle<()>,
    meter: Mutex<Option<MeterLoop>>,
}

impl AudioGraph {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Mixed output stream (one audio track).
    pub fn stream(&self) -> &MediaStream {
        &self.output
    }

    pub fn gain(&self) -> &GainNode {
        &self.gain
    }

    pub fn analyser(&self) -> &AnalyserNode {
        &self.analyser
    }

    pub fn microphone(&self) -> &MediaTrack {
        &self.microphone
    }

    /// Device id the microphone was opened with. `None` when the graph was
    /// built against whatever default the platform picked.
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn has_display_audio(&self) -> bool {
        self.display_source.is_some()
    }

    /// Start (or restart) the meter loop on this graph's analyser.
    pub fn start_meter(
        &self,
        routine: Arc<dyn RmsRoutine>,
        level: watch::Sender<f32>,
        frame: Duration,
    ) {
        let meter = MeterLoop::spawn(
            self.analyser.clone(),
            Arc::clone(&self.sample_buffer),
            routine,
            level,
            frame,
        );
        let previous = match self.meter.lock() {
            Ok(mut slot) => slot.replace(meter),
            Err(e) => {
                warn!("Meter slot lock poisoned: {}", e);
                return;
            }
        };
        if let Some(old) = previous {
            old.cancel();
        }
    }

    pub fn stop_meter(&self) {
        if let Some(meter) = self.meter.lock().ok().and_then(|mut m| m.take()) {
            meter.cancel();
        }
    }

    pub fn meter_running(&self) -> bool {
        self.meter
            .lock()
            .map(|m| m.as_ref().is_some_and(|m| !m.is_cancelled()))
            .unwrap_or(false)
    }
}

impl Drop for AudioGraph {
    fn drop(&mut self) {
        self.stop_meter();
        self.render.abort();
        self.microphone.stop();
        self.analyser.release();
        self.output.stop_all();
        info!(graph = %self.id, "Audio graph torn down");
    }
}

/// Stops the track on drop unless disarmed. Keeps a failed build from
/// leaving the microphone open.
struct ReleaseOnError {
    track: MediaTrack,
    armed: bool,
}

impl ReleaseOnError {
    fn new(track: MediaTrack) -> Self {
        Self { track, armed: true }
    }

    fn disarm(mut self) -> MediaTrack {
        self.armed = false;
        self.track.clone()
    }
}

impl Drop for ReleaseOnError {
    fn drop(&mut self) {
        if self.armed {
            self.track.stop();
        }
    }
}

/// Builds `AudioGraph`s with a fixed analyser size.
#[derive(Debug, Clone)]
pub struct AudioGraphBuilder {
    fft_size: usize,
}

impl Default for AudioGraphBuilder {
    fn default() -> Self {
        Self::new(DEFAULT_FFT_SIZE)
    }
}

impl AudioGraphBuilder {
    pub fn new(fft_size: usize) -> Self {
        Self {
            fft_size: fft_size.max(32),
        }
    }

    /// Acquire the microphone and wire the graph.
    ///
    /// On failure nothing stays connected: the microphone (if acquired) is
    /// released before the error is returned.
    pub async fn build(
        &self,
        devices: &dyn MediaDevices,
        constraint: &AudioConstraint,
        display: Option<&DisplayHandle>,
    ) -> Result<AudioGraph, CaptureError> {
        let started = std::time::Instant::now();
        let microphone = ReleaseOnError::new(devices.get_user_media(constraint).await?);
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "Microphone acquired");

        let mic_feed = microphone
            .track
            .audio_feed()
            .cloned()
            .ok_or_else(|| {
                CaptureError::GraphConstruction("microphone track carries no audio".into())
            })?;

        let display_source = display.and_then(|d| d.audio_track()).cloned();
        let display_feed = match &display_source {
            Some(track) => Some(track.audio_feed().cloned().ok_or_else(|| {
                CaptureError::GraphConstruction("display audio track carries no audio".into())
            })?),
            None => None,
        };

        // Whatever the feeds buffered before this graph existed belongs to
        // the previous one.
        mic_feed.clear();
        if let Some(feed) = &display_feed {
            feed.clear();
        }

        let gain = GainNode::new();
        let analyser = AnalyserNode::new(self.fft_size);
        let (mix_prod, mix_cons) = audio_ring_buffer(Some(MIX_BUS_CAPACITY));
        let output_track = MediaTrack::audio("mix-bus", AudioFeed::new(mix_cons, GRAPH_SAMPLE_RATE));

        let render = tokio::spawn(render_loop(
            mic_feed,
            display_feed,
            gain.clone(),
            analyser.clone(),
            mix_prod,
        ));

        let microphone = microphone.disarm();
        let device_id = match constraint {
            AudioConstraint::Exact(id) => Some(id.clone()),
            AudioConstraint::Any => None,
        };
        let graph = AudioGraph {
            id: Uuid::new_v4(),
            device_id,
            microphone,
            display_source,
            gain,
            analyser,
            output: MediaStream::new(vec![output_track]),
            sample_buffer: Arc::new(Mutex::new(vec![0.0; self.fft_size])),
            render,
            meter: Mutex::new(None),
        };

        info!(
            graph = %graph.id,
            microphone = %graph.microphone.label(),
            display_audio = graph.has_display_audio(),
            fft_size = self.fft_size,
            "Audio graph built"
        );

        Ok(graph)
    }
}
