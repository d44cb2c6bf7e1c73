//! Screen + microphone capture core.
//!
//! Display capture and a selected microphone are combined into one
//! recordable stream through a small audio graph (gain, analyser, mix bus),
//! recorded in timesliced chunks, and streamed to an upload backend while
//! recording is still in progress.

pub mod audio;
pub mod compose;
pub mod config;
pub mod devices;
pub mod display;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod media;
pub mod permission;
pub mod recording;
pub mod session;
pub mod upload;

#[cfg(test)]
mod testing;

pub use error::{CaptureError, UploadError};
pub use session::{CaptureCoordinator, CaptureDeps, CaptureOptions, CoreEvent};
