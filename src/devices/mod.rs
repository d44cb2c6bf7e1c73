//! Audio input devices and the user's selection.
//!
//! The registry keeps the last enumerated list and a stored candidate id.
//! Selection is resolved on every read, so a stale id falls back to the
//! first device in the current list.

pub mod platform;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CaptureError;
use crate::media::{AudioConstraint, MediaTrack};

pub use platform::CpalDevices;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    AudioInput,
    AudioOutput,
    VideoInput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub id: String,
    pub label: String,
    pub kind: DeviceKind,
}

impl DeviceDescriptor {
    pub fn audio_input(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            kind: DeviceKind::AudioInput,
        }
    }
}

/// Platform media devices.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Every device the platform currently exposes.
    async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, CaptureError>;

    /// Open a microphone matching `constraint` as a live audio track.
    async fn get_user_media(&self, constraint: &AudioConstraint) -> Result<MediaTrack, CaptureError>;

    /// Device-topology change notifications.
    fn subscribe(&self) -> broadcast::Receiver<()>;
}

pub struct DeviceRegistry {
    backend: Arc<dyn MediaDevices>,
    devices: watch::Sender<Vec<DeviceDescriptor>>,
    selected: Mutex<Option<String>>,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn MediaDevices>, initial_selection: Option<String>) -> Self {
        let (devices, _) = watch::channel(Vec::new());
        Self {
            backend,
            devices,
            selected: Mutex::new(initial_selection),
        }
    }

    pub fn backend(&self) -> &Arc<dyn MediaDevices> {
        &self.backend
    }

    /// Re-enumerate and replace the list wholesale. A failed enumeration is
    /// logged and leaves an empty list. Subscribers are only notified when
    /// the list actually changed.
    pub async fn refresh(&self) -> Vec<DeviceDescriptor> {
        let list: Vec<DeviceDescriptor> = match self.backend.enumerate_devices().await {
            Ok(all) => all
                .into_iter()
                .filter(|d| d.kind == DeviceKind::AudioInput)
                .collect(),
            Err(e) => {
                warn!("Device enumeration failed, using empty list: {}", e);
                Vec::new()
            }
        };
        let changed = self.devices.send_if_modified(|current| {
            if *current == list {
                false
            } else {
                *current = list.clone();
                true
            }
        });
        debug!(count = list.len(), changed, "Audio input devices refreshed");
        list
    }

    /// The current list (as of the last refresh).
    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.borrow().clone()
    }

    /// Notified with the new list after every refresh.
    pub fn subscribe(&self) -> watch::Receiver<Vec<DeviceDescriptor>> {
        self.devices.subscribe()
    }

    /// Store a candidate id. Not validated against the list.
    pub fn set_selected(&self, id: Option<String>) {
        if let Ok(mut selected) = self.selected.lock() {
            *selected = id;
        }
    }

    pub fn selected_id(&self) -> Option<String> {
        self.selected.lock().ok().and_then(|s| s.clone())
    }

    /// The stored id's descriptor, else the first device, else `None`.
    pub fn selected_device(&self) -> Option<DeviceDescriptor> {
        let list = self.devices.borrow();
        let stored = self.selected_id();
        stored
            .and_then(|id| list.iter().find(|d| d.id == id).cloned())
            .or_else(|| list.first().cloned())
    }

    /// Constraint used to open the microphone for the next graph build:
    /// the resolved selection, or the stored id before any enumeration.
    pub fn audio_constraint(&self) -> AudioConstraint {
        match self.selected_device().map(|d| d.id).or_else(|| self.selected_id()) {
            Some(id) => AudioConstraint::Exact(id),
            None => AudioConstraint::Any,
        }
    }

    /// Listen for topology changes and re-enumerate on each one until the
    /// returned guard is dropped.
    pub fn watch(self: &Arc<Self>) -> DeviceWatch {
        let mut rx = self.backend.subscribe();
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        info!("Device topology changed, re-enumerating");
                        registry.refresh().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        DeviceWatch { handle }
    }
}

/// Scoped device-change listener. Dropping it cancels the listener.
pub struct DeviceWatch {
    handle: JoinHandle<()>,
}

impl DeviceWatch {
    pub fn is_active(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for DeviceWatch {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
