//! IPC protocol types for communication with the desktop shell.
//!
//! Events use `{"event": "<name>", "data": {...}}` format (core -> shell).
//! Commands use `{"command": "<name>", ...}` format (shell -> core).

pub mod bridge;

use serde::{Deserialize, Serialize};

use crate::devices::DeviceDescriptor;
use crate::recording::RecordingState;
use crate::session::CoreEvent;
use crate::upload::UploadEvent;

// ---------------------------------------------------------------------------
// Events: core -> shell (stdout)
// ---------------------------------------------------------------------------

/// All events emitted to the shell via stdout as JSON lines.
///
/// Serialized as `{"event": "<variant>", "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum CaptureEvent {
    Starting {},
    Ready {},
    Pong {},
    Permission {
        state: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    AudioDevices {
        devices: Vec<DeviceDescriptor>,
        selected: Option<String>,
    },
    StreamReady { ready: bool },
    StateChange { state: RecordingState },
    Level { rms: f32 },
    RecordingStarted {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    UploadStarted {
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    UploadProgress { parts: usize, bytes: u64 },
    UploadComplete {
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    UploadFailed { message: String },
    Gain { value: f32 },
    Error { message: String },
    Stopping {},
}

impl From<CoreEvent> for CaptureEvent {
    fn from(event: CoreEvent) -> Self {
        match event {
            CoreEvent::Permission { state, error } => Self::Permission { state, error },
            CoreEvent::Devices { devices, selected } => Self::AudioDevices { devices, selected },
            CoreEvent::StreamReady(ready) => Self::StreamReady { ready },
            CoreEvent::State(state) => Self::StateChange { state },
            CoreEvent::Level(rms) => Self::Level { rms },
            CoreEvent::Upload(UploadEvent::Started { session }) => Self::UploadStarted {
                session_id: session.to_string(),
            },
            CoreEvent::Upload(UploadEvent::Progress { parts, bytes }) => {
                Self::UploadProgress { parts, bytes }
            }
            CoreEvent::Upload(UploadEvent::Done { location }) => {
                Self::UploadComplete { url: location }
            }
            CoreEvent::Upload(UploadEvent::Failed { message }) => Self::UploadFailed { message },
            CoreEvent::Error(message) => Self::Error { message },
        }
    }
}

// ---------------------------------------------------------------------------
// Commands: shell -> core (stdin)
// ---------------------------------------------------------------------------

/// All commands received from the shell via stdin as JSON lines.
///
/// Deserialized from `{"command": "<variant>", ...}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command")]
#[serde(rename_all = "snake_case")]
pub enum CaptureCommand {
    Ping {},
    RequestPermission {},
    ListAudioDevices {},
    SelectAudioDevice {
        #[serde(default)]
        id: Option<String>,
    },
    ReloadAudio {},
    SetGain { value: f32 },
    StartRecording {},
    StopRecording {},
    Stop {},
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_tags() {
        let cmd: CaptureCommand =
            serde_json::from_str(r#"{"command":"select_audio_device","id":"USB Mic"}"#).unwrap();
        assert!(matches!(cmd, CaptureCommand::SelectAudioDevice { id: Some(ref id) } if id == "USB Mic"));

        let cmd: CaptureCommand = serde_json::from_str(r#"{"command":"set_gain","value":2.5}"#).unwrap();
        assert!(matches!(cmd, CaptureCommand::SetGain { value } if value == 2.5));

        let cmd: CaptureCommand = serde_json::from_str(r#"{"command":"request_permission"}"#).unwrap();
        assert!(matches!(cmd, CaptureCommand::RequestPermission {}));

        assert!(serde_json::from_str::<CaptureCommand>(r#"{"command":"explode"}"#).is_err());
    }

    #[test]
    fn test_event_shape() {
        let event = CaptureEvent::from(CoreEvent::State(RecordingState::Recording));
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "state_change", "data": {"state": "recording"}})
        );

        let event = CaptureEvent::from(CoreEvent::Upload(UploadEvent::Done {
            location: Some("https://cdn.example.com/a.webm".into()),
        }));
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "upload_complete", "data": {"url": "https://cdn.example.com/a.webm"}})
        );

        let event = CaptureEvent::Pong {};
        assert_eq!(serde_json::to_value(&event).unwrap(), json!({"event": "pong", "data": {}}));
    }

    #[test]
    fn test_permission_event_omits_missing_error() {
        let event = CaptureEvent::from(CoreEvent::Permission {
            state: "pending",
            error: None,
        });
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "permission", "data": {"state": "pending"}})
        );
    }
}
