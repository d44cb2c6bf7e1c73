//! Atomic recording state machine.
//!
//! `Idle → Requesting → Ready → Recording → Idle`. Every transition is a
//! compare-and-swap; an invalid transition returns `false` and leaves the
//! state untouched.

use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

/// Capture-session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RecordingState {
    /// Nothing requested, no recorder.
    Idle = 0,
    /// A capture action was invoked but the composed stream is not there yet.
    Requesting = 1,
    /// A composed stream is available; recording may start.
    Ready = 2,
    /// The recorder is running.
    Recording = 3,
}

impl RecordingState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Requesting,
            2 => Self::Ready,
            3 => Self::Recording,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for RecordingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Requesting => write!(f, "requesting"),
            Self::Ready => write!(f, "ready"),
            Self::Recording => write!(f, "recording"),
        }
    }
}

#[derive(Debug)]
pub struct RecordingStateMachine {
    state: AtomicU8,
}

impl RecordingStateMachine {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(RecordingState::Idle as u8),
        }
    }

    pub fn current(&self) -> RecordingState {
        RecordingState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: RecordingState, to: RecordingState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Idle → Requesting.
    pub fn request(&self) -> bool {
        self.transition(RecordingState::Idle, RecordingState::Requesting)
    }

    /// Idle | Requesting → Ready.
    pub fn stream_ready(&self) -> bool {
        self.transition(RecordingState::Requesting, RecordingState::Ready)
            || self.transition(RecordingState::Idle, RecordingState::Ready)
    }

    /// Ready → Requesting, when the composed stream goes away.
    pub fn stream_lost(&self) -> bool {
        self.transition(RecordingState::Ready, RecordingState::Requesting)
    }

    /// Ready → Recording.
    pub fn start_recording(&self) -> bool {
        self.transition(RecordingState::Ready, RecordingState::Recording)
    }

    /// Recording → Idle, once the recorder has emitted its final chunk.
    pub fn finish_recording(&self) -> bool {
        self.transition(RecordingState::Recording, RecordingState::Idle)
    }

    /// Force back to Idle (session release, shutdown).
    pub fn reset(&self) {
        self.state.store(RecordingState::Idle as u8, Ordering::Release);
    }
}

impl Default for RecordingStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let sm = RecordingStateMachine::new();
        assert_eq!(sm.current(), RecordingState::Idle);
        assert!(sm.request());
        assert_eq!(sm.current(), RecordingState::Requesting);
        assert!(sm.stream_ready());
        assert!(sm.start_recording());
        assert_eq!(sm.current(), RecordingState::Recording);
        assert!(sm.finish_recording());
        assert_eq!(sm.current(), RecordingState::Idle);
    }

    #[test]
    fn test_start_only_from_ready() {
        let sm = RecordingStateMachine::new();
        assert!(!sm.start_recording());
        sm.request();
        assert!(!sm.start_recording());
        assert_eq!(sm.current(), RecordingState::Requesting);
    }

    #[test]
    fn test_invalid_transitions_leave_state() {
        let sm = RecordingStateMachine::new();
        assert!(!sm.finish_recording());
        assert!(!sm.stream_lost());
        assert_eq!(sm.current(), RecordingState::Idle);

        sm.stream_ready();
        sm.start_recording();
        assert!(!sm.request());
        assert!(!sm.stream_ready());
        assert_eq!(sm.current(), RecordingState::Recording);
    }

    #[test]
    fn test_stream_lost_goes_back_to_requesting() {
        let sm = RecordingStateMachine::new();
        sm.stream_ready();
        assert!(sm.stream_lost());
        assert_eq!(sm.current(), RecordingState::Requesting);
    }

    #[test]
    fn test_reset() {
        let sm = RecordingStateMachine::new();
        sm.stream_ready();
        sm.start_recording();
        sm.reset();
        assert_eq!(sm.current(), RecordingState::Idle);
    }

    #[test]
    fn test_display() {
        assert_eq!(RecordingState::Requesting.to_string(), "requesting");
        assert_eq!(RecordingState::Recording.to_string(), "recording");
    }
}
