//! Microphone capture via cpal.
//!
//! Opens the default (or named) input device, captures audio at its native
//! sample rate, down-mixes to mono, resamples to the graph rate, and pushes
//! the samples into a ring buffer read by the audio graph.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use tracing::{error, info};

use super::ring_buffer::AudioProducer;
use crate::media::AudioConstraint;

/// Sample rate of every audio feed inside the graph.
pub const GRAPH_SAMPLE_RATE: u32 = 48_000;

/// Input device names with their default-ness, as reported by the host.
pub fn list_input_devices() -> Result<Vec<(String, bool)>, String> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    let devices = host
        .input_devices()
        .map_err(|e| format!("Failed to enumerate input devices: {e}"))?;
    let mut out = Vec::new();
    for dev in devices {
        if let Ok(name) = dev.name() {
            let is_default = default_name.as_deref() == Some(name.as_str());
            out.push((name, is_default));
        }
    }
    Ok(out)
}

/// `cpal::Stream` is `!Send` on some platforms because of internal raw
/// pointers. We only keep it alive and eventually drop it; the audio
/// callback runs on cpal's own thread.
pub struct SendStream(#[allow(dead_code)] Stream);

// SAFETY: the stream is never accessed after construction, only dropped.
unsafe impl Send for SendStream {}

/// Resolved info about the audio input we will use.
struct InputConfig {
    device: cpal::Device,
    name: String,
    stream_config: StreamConfig,
    native_rate: u32,
}

fn resolve_device(constraint: &AudioConstraint) -> Result<InputConfig, String> {
    let host = cpal::default_host();

    let device = match constraint {
        AudioConstraint::Exact(name) => host
            .input_devices()
            .map_err(|e| format!("Failed to enumerate input devices: {e}"))?
            .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
            .ok_or_else(|| format!("Input device not found: {name}"))?,
        AudioConstraint::Any => host
            .default_input_device()
            .ok_or_else(|| "No default input device available".to_string())?,
    };

    let name = device.name().unwrap_or_else(|_| "unknown".into());

    let default_config = device
        .default_input_config()
        .map_err(|e| format!("Failed to get default input config: {e}"))?;

    let native_rate = default_config.sample_rate().0;
    let channels = default_config.channels();

    let stream_config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(native_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    info!(
        device = %name,
        native_rate,
        channels,
        "Input device config (will resample to {}Hz mono if needed)",
        GRAPH_SAMPLE_RATE,
    );

    Ok(InputConfig {
        device,
        name,
        stream_config,
        native_rate,
    })
}

/// Simple linear resampler from `from_rate` to `to_rate`.
/// Operates on mono f32 samples.
pub fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_idx = i as f64 * ratio;
        let idx0 = src_idx.floor() as usize;
        let frac = (src_idx - idx0 as f64) as f32;
        let s0 = input.get(idx0).copied().unwrap_or(0.0);
        let s1 = input.get(idx0 + 1).copied().unwrap_or(s0);
        output.push(s0 + frac * (s1 - s0));
    }
    output
}

/// Down-mix multi-channel audio to mono by averaging channels.
pub fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Start capturing the constrained input device into `producer`.
///
/// Returns the device name and the stream, which must be kept alive for
/// capture to continue.
pub fn start_capture(
    mut producer: AudioProducer,
    constraint: &AudioConstraint,
) -> Result<(String, SendStream), String> {
    let cfg = resolve_device(constraint)?;
    let native_rate = cfg.native_rate;
    let channels = cfg.stream_config.channels;
    let needs_resample = native_rate != GRAPH_SAMPLE_RATE;
    let needs_downmix = channels > 1;

    let stream = cfg
        .device
        .build_input_stream(
            &cfg.stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = if needs_downmix {
                    to_mono(data, channels)
                } else {
                    data.to_vec()
                };

                let resampled = if needs_resample {
                    resample_linear(&mono, native_rate, GRAPH_SAMPLE_RATE)
                } else {
                    mono
                };

                // Ring buffer full: the render task fell behind, newest
                // samples are dropped.
                producer.push_slice(&resampled);
            },
            move |err| {
                error!("Audio input stream error: {}", err);
            },
            None,
        )
        .map_err(|e| format!("Failed to build input stream: {e}"))?;

    stream
        .play()
        .map_err(|e| format!("Failed to start input stream: {e}"))?;

    info!(device = %cfg.name, "Microphone capture started");

    Ok((cfg.name, SendStream(stream)))
}
