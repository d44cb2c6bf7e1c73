//! Configuration reading and data directory paths.
//!
//! Everything the core persists lives under one per-user directory,
//! `<platform config dir>/capture-core/data`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::display::DisplayMediaOptions;
use crate::recording::recorder::DEFAULT_MIME_CANDIDATES;
use crate::session::CaptureOptions;
use crate::upload::{S3Config, Unconfigured, UploadBackendFactory, UploadPolicy};

const APP_DIR: &str = "capture-core";

/// capture_config.json shape (written by the shell's settings panel).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfig {
    /// Microphone to use before the user picks one.
    #[serde(default)]
    pub audio_device: Option<String>,
    #[serde(default = "default_timeslice_ms")]
    pub timeslice_ms: u64,
    #[serde(default = "default_meter_fps")]
    pub meter_fps: u32,
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
    #[serde(default)]
    pub recorder: RecorderConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            audio_device: None,
            timeslice_ms: default_timeslice_ms(),
            meter_fps: default_meter_fps(),
            fft_size: default_fft_size(),
            recorder: RecorderConfig::default(),
            display: DisplayConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderConfig {
    /// Most specific first.
    #[serde(default = "default_mime_candidates")]
    pub mime_candidates: Vec<String>,
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            mime_candidates: default_mime_candidates(),
            ffmpeg_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayConfig {
    #[serde(default)]
    pub input_format: Option<String>,
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    #[serde(default)]
    pub system_audio_device: Option<String>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            input_format: None,
            input: None,
            framerate: default_framerate(),
            system_audio_device: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_finalize_timeout_ms")]
    pub finalize_timeout_ms: u64,
    #[serde(default)]
    pub s3: Option<S3Profile>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            finalize_timeout_ms: default_finalize_timeout_ms(),
            s3: None,
        }
    }
}

/// Upload destination.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Profile {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default)]
    pub host_rewrite: Option<String>,
}

impl std::fmt::Debug for S3Profile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Profile")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .field("bucket", &self.bucket)
            .field("host_rewrite", &self.host_rewrite)
            .finish_non_exhaustive()
    }
}

fn default_timeslice_ms() -> u64 {
    1000
}

fn default_meter_fps() -> u32 {
    60
}

fn default_fft_size() -> usize {
    crate::audio::graph::DEFAULT_FFT_SIZE
}

fn default_mime_candidates() -> Vec<String> {
    DEFAULT_MIME_CANDIDATES.iter().map(|s| s.to_string()).collect()
}

fn default_framerate() -> u32 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    500
}

fn default_finalize_timeout_ms() -> u64 {
    60_000
}

impl CaptureConfig {
    pub fn timeslice(&self) -> Duration {
        Duration::from_millis(self.timeslice_ms.max(1))
    }

    pub fn meter_frame(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.meter_fps.max(1)))
    }

    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            max_retries: self.upload.max_retries,
            backoff_base: Duration::from_millis(self.upload.backoff_ms),
            finalize_timeout: Duration::from_millis(self.upload.finalize_timeout_ms),
        }
    }

    pub fn display_options(&self) -> DisplayMediaOptions {
        DisplayMediaOptions {
            ffmpeg_path: self.recorder.ffmpeg_path.clone(),
            input_format: self.display.input_format.clone(),
            input: self.display.input.clone(),
            framerate: self.display.framerate,
            system_audio_device: self.display.system_audio_device.clone(),
        }
    }

    pub fn capture_options(&self) -> CaptureOptions {
        let mime_candidates = if self.recorder.mime_candidates.is_empty() {
            default_mime_candidates()
        } else {
            self.recorder.mime_candidates.clone()
        };
        CaptureOptions {
            initial_device: self.audio_device.clone(),
            fft_size: self.fft_size,
            meter_frame: self.meter_frame(),
            timeslice: self.timeslice(),
            mime_candidates,
            upload_policy: self.upload_policy(),
        }
    }

    /// The configured upload destination; without one every recording
    /// fails to start its upload.
    pub fn upload_factory(&self) -> Arc<dyn UploadBackendFactory> {
        let Some(profile) = &self.upload.s3 else {
            warn!("No upload destination configured");
            return Arc::new(Unconfigured);
        };
        match S3Config::new(
            &profile.endpoint,
            profile.region.clone(),
            profile.bucket.clone(),
            profile.access_key.clone(),
            profile.secret_key.clone(),
            profile.host_rewrite.clone(),
        ) {
            Ok(config) => {
                info!(bucket = %profile.bucket, region = %profile.region, "S3 upload configured");
                Arc::new(config)
            }
            Err(e) => {
                warn!("Invalid S3 profile, uploads disabled: {}", e);
                Arc::new(Unconfigured)
            }
        }
    }
}

/// Read capture_config.json from the data directory.
pub fn read_capture_config() -> CaptureConfig {
    let path = get_config_path();
    read_json_file(&path).unwrap_or_default()
}

/// Path to capture_config.json.
pub fn get_config_path() -> PathBuf {
    data_dir().join("capture_config.json")
}

/// Per-user data directory. Falls back to the working directory when the
/// platform reports no home.
pub fn data_dir() -> PathBuf {
    dirs::config_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("data")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Generic helper: read a JSON file and deserialize it.
fn read_json_file<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str(&contents) {
            Ok(val) => Some(val),
            Err(e) => {
                warn!("Failed to parse {}, using defaults: {}", path.display(), e);
                None
            }
        },
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to read {}: {}", path.display(), e);
            }
            None
        }
    }
}
