//! Display-capture permission gate.
//!
//! `request_permission()` may be called any number of times; only a call
//! made while nothing is outstanding (never requested, or the last request
//! failed) issues a new display-capture request. The outcome is published
//! as a `ResourceState` so the UI can show progress and retry inline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::display::{DisplayCapture, DisplayHandle};
use crate::error::CaptureError;

/// Lifecycle of an asynchronously acquired resource.
#[derive(Debug, Clone)]
pub enum ResourceState<T> {
    Unrequested,
    Pending,
    Ready(T),
    Failed(String),
}

impl<T> ResourceState<T> {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unrequested => "unrequested",
            Self::Pending => "pending",
            Self::Ready(_) => "granted",
            Self::Failed(_) => "failed",
        }
    }

    pub fn ready(&self) -> Option<&T> {
        match self {
            Self::Ready(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

pub struct PermissionGate {
    capture: Arc<dyn DisplayCapture>,
    state: watch::Sender<ResourceState<DisplayHandle>>,
    requests: AtomicU64,
    generation: AtomicU64,
}

impl PermissionGate {
    pub fn new(capture: Arc<dyn DisplayCapture>) -> Arc<Self> {
        let (state, _) = watch::channel(ResourceState::Unrequested);
        Arc::new(Self {
            capture,
            state,
            requests: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        })
    }

    /// Bump the request counter and, if nothing is outstanding, issue a
    /// display-capture request. Returns whether a request was issued.
    pub fn request_permission(self: &Arc<Self>) -> bool {
        let count = self.requests.fetch_add(1, Ordering::AcqRel) + 1;
        let issued = self.state.send_if_modified(|state| {
            if matches!(state, ResourceState::Unrequested | ResourceState::Failed(_)) {
                *state = ResourceState::Pending;
                true
            } else {
                false
            }
        });
        if !issued {
            debug!(count, state = self.state.borrow().label(), "Permission request coalesced");
            return false;
        }

        let generation = self.generation.load(Ordering::Acquire);
        info!(count, generation, "Requesting display capture");
        let gate = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = gate.capture.get_display_media().await;
            if gate.generation.load(Ordering::Acquire) != generation {
                debug!(generation, "Discarding superseded display capture result");
                if let Ok(handle) = outcome {
                    handle.stop();
                }
                return;
            }
            match outcome {
                Ok(handle) => {
                    info!("Display capture granted");
                    gate.state.send_replace(ResourceState::Ready(handle));
                }
                Err(e) => {
                    warn!("Display capture failed: {}", e);
                    gate.state.send_replace(ResourceState::Failed(e.to_string()));
                }
            }
        });
        true
    }

    pub fn state(&self) -> ResourceState<DisplayHandle> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceState<DisplayHandle>> {
        self.state.subscribe()
    }

    /// Total number of `request_permission()` calls.
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Acquire)
    }

    /// Wait for the outstanding request to settle.
    pub async fn granted(&self) -> Result<DisplayHandle, CaptureError> {
        let mut rx = self.state.subscribe();
        let settled = rx
            .wait_for(|s| !s.is_pending())
            .await
            .map_err(|_| CaptureError::PermissionDenied("permission gate closed".into()))?;
        match &*settled {
            ResourceState::Ready(handle) => Ok(handle.clone()),
            ResourceState::Failed(message) => Err(CaptureError::PermissionDenied(message.clone())),
            _ => Err(CaptureError::PermissionDenied("display capture not requested".into())),
        }
    }

    /// Stop the display tracks and forget the grant. A request still in
    /// flight is discarded when it completes.
    pub fn release(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let previous = self.state.send_replace(ResourceState::Unrequested);
        if let ResourceState::Ready(handle) = previous {
            handle.stop();
            info!("Display capture released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDisplay;

    #[tokio::test]
    async fn test_many_requests_issue_one() {
        let display = Arc::new(FakeDisplay::granting(true));
        let gate = PermissionGate::new(display.clone());

        assert!(gate.request_permission());
        assert!(!gate.request_permission());
        assert!(!gate.request_permission());
        assert_eq!(gate.request_count(), 3);

        let handle = gate.granted().await.unwrap();
        assert!(handle.video_track().is_some());
        assert!(handle.audio_track().is_some());
        assert!(!gate.request_permission());
        assert_eq!(display.calls(), 1);
    }

    #[tokio::test]
    async fn test_denial_then_retry_issues_fresh_request() {
        let display = Arc::new(FakeDisplay::denying("user cancelled"));
        let gate = PermissionGate::new(display.clone());

        gate.request_permission();
        let err = gate.granted().await.unwrap_err();
        assert!(matches!(err, CaptureError::PermissionDenied(_)));
        assert!(err.is_user_retriable());
        assert_eq!(gate.state().label(), "failed");

        display.set_deny(None);
        assert!(gate.request_permission());
        assert!(gate.granted().await.is_ok());
        assert_eq!(display.calls(), 2);
    }

    #[tokio::test]
    async fn test_release_stops_tracks() {
        let display = Arc::new(FakeDisplay::granting(false));
        let gate = PermissionGate::new(display);
        gate.request_permission();
        let handle = gate.granted().await.unwrap();

        gate.release();
        assert!(handle.video_track().unwrap().is_ended());
        assert_eq!(gate.state().label(), "unrequested");
    }

    #[tokio::test]
    async fn test_release_discards_inflight_result() {
        let display = Arc::new(FakeDisplay::granting(false));
        let gate = PermissionGate::new(display.clone());
        gate.request_permission();
        gate.release();

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(gate.state().label(), "unrequested");
        assert!(display.last_handle().unwrap().video_track().unwrap().is_ended());
    }

    #[tokio::test]
    async fn test_granted_without_request_fails() {
        let gate = PermissionGate::new(Arc::new(FakeDisplay::granting(false)));
        assert!(gate.granted().await.is_err());
    }
}
