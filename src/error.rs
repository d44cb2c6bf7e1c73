//! Error taxonomy for the capture core.
//!
//! Permission and graph failures are shown inline where the control lives,
//! enumeration failures are swallowed into an empty device list, and upload
//! failures end the upload session.

use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by capture, graph, and recording operations.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    /// The user or the platform refused display capture.
    #[error("display capture permission denied: {0}")]
    PermissionDenied(String),

    /// Device enumeration failed. Callers normally degrade this to an
    /// empty device list instead of propagating it.
    #[error("device enumeration failed: {0}")]
    DeviceEnumeration(String),

    /// Microphone acquisition or node wiring failed.
    #[error("audio graph construction failed: {0}")]
    GraphConstruction(String),

    /// The recorder could not be created, started, or stopped.
    #[error("recorder error: {0}")]
    Recorder(String),

    #[error(transparent)]
    Upload(#[from] UploadError),
}

impl CaptureError {
    /// Whether the user can retry the failed action from the UI.
    pub fn is_user_retriable(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied(_) | Self::GraphConstruction(_) | Self::Recorder(_)
        )
    }
}

/// Failures of one upload session.
#[derive(Debug, Clone, Error)]
pub enum UploadError {
    /// `begin` failed; no part was sent.
    #[error("failed to begin upload session: {0}")]
    Begin(String),

    /// A part kept failing after all retries; the session was aborted.
    #[error("upload of part {seq} failed after {attempts} attempts: {message}")]
    Part {
        seq: u64,
        attempts: u32,
        message: String,
    },

    /// The backend answered the final part with a falsy acknowledgement.
    #[error("backend did not acknowledge the final part")]
    FinalizeRejected,

    /// The final part was not acknowledged in time.
    #[error("final part not acknowledged within {0:?}")]
    FinalizeTimeout(Duration),

    /// The chunk stream ended before a final chunk arrived.
    #[error("chunk stream ended without a final chunk")]
    Incomplete,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(CaptureError::PermissionDenied("no".into()).is_user_retriable());
        assert!(CaptureError::GraphConstruction("mic".into()).is_user_retriable());
        assert!(!CaptureError::DeviceEnumeration("x".into()).is_user_retriable());
        assert!(!CaptureError::Upload(UploadError::Incomplete).is_user_retriable());
    }

    #[test]
    fn test_part_error_message() {
        let err = UploadError::Part {
            seq: 4,
            attempts: 3,
            message: "503".into(),
        };
        assert_eq!(
            err.to_string(),
            "upload of part 4 failed after 3 attempts: 503"
        );
    }
}
