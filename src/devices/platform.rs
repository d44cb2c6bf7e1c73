//! cpal-backed media devices.
//!
//! cpal exposes no stable device ids, so the device name doubles as the id.
//! cpal has no hot-plug callback either; a poll task compares the input list
//! every couple of seconds and broadcasts when it changes.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{DeviceDescriptor, MediaDevices};
use crate::audio::capture::{list_input_devices, start_capture, GRAPH_SAMPLE_RATE};
use crate::audio::ring_buffer::audio_ring_buffer;
use crate::error::CaptureError;
use crate::media::{AudioConstraint, AudioFeed, MediaTrack};

/// How often the input list is polled for changes.
pub const HOTPLUG_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct CpalDevices {
    changes: broadcast::Sender<()>,
}

impl CpalDevices {
    /// Create the backend and start the hot-plug poller. The poller stops
    /// once the backend is dropped.
    pub fn start() -> Arc<Self> {
        let (changes, _) = broadcast::channel(16);
        let devices = Arc::new(Self { changes });
        tokio::spawn(poll_topology(Arc::downgrade(&devices)));
        devices
    }
}

async fn enumerate_names() -> Result<Vec<(String, bool)>, CaptureError> {
    tokio::task::spawn_blocking(list_input_devices)
        .await
        .map_err(|e| CaptureError::DeviceEnumeration(format!("enumeration task failed: {e}")))?
        .map_err(CaptureError::DeviceEnumeration)
}

async fn poll_topology(devices: Weak<CpalDevices>) {
    let mut ticker = tokio::time::interval(HOTPLUG_POLL_INTERVAL);
    let mut last: Option<Vec<String>> = None;
    loop {
        ticker.tick().await;
        let Some(devices) = devices.upgrade() else {
            debug!("Device backend dropped, hot-plug poller exiting");
            break;
        };
        let names: Vec<String> = match enumerate_names().await {
            Ok(list) => list.into_iter().map(|(name, _)| name).collect(),
            Err(e) => {
                debug!("Hot-plug poll failed: {}", e);
                continue;
            }
        };
        if let Some(previous) = &last {
            if *previous != names {
                info!(count = names.len(), "Audio input topology changed");
                let _ = devices.changes.send(());
            }
        }
        last = Some(names);
    }
}

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, CaptureError> {
        let list = enumerate_names().await?;
        Ok(list
            .into_iter()
            .map(|(name, is_default)| {
                let label = if is_default {
                    format!("{name} (default)")
                } else {
                    name.clone()
                };
                DeviceDescriptor::audio_input(name, label)
            })
            .collect())
    }

    async fn get_user_media(&self, constraint: &AudioConstraint) -> Result<MediaTrack, CaptureError> {
        let (producer, consumer) = audio_ring_buffer(None);
        let constraint = constraint.clone();
        let (name, stream) = tokio::task::spawn_blocking(move || start_capture(producer, &constraint))
            .await
            .map_err(|e| CaptureError::GraphConstruction(format!("capture task failed: {e}")))?
            .map_err(|e| {
                warn!("Microphone acquisition failed: {}", e);
                CaptureError::GraphConstruction(e)
            })?;
        Ok(MediaTrack::audio(name, AudioFeed::new(consumer, GRAPH_SAMPLE_RATE))
            .with_keepalive(Box::new(stream)))
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }
}
