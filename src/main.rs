//! capture-core: headless screen + microphone capture sidecar.
//!
//! Communicates with the desktop shell via JSON-line IPC on stdin/stdout.
//! This is the entry point that wires the platform backends into the
//! capture coordinator and runs the main event loop.

use std::sync::Arc;

use tracing::{info, warn};

use capture_core::audio::DbfsRms;
use capture_core::config::read_capture_config;
use capture_core::devices::CpalDevices;
use capture_core::display::ScreenGrab;
use capture_core::ipc::bridge::{emit_error, emit_event, spawn_stdin_reader};
use capture_core::ipc::{CaptureCommand, CaptureEvent};
use capture_core::logging;
use capture_core::recording::ffmpeg::FfmpegRecorderFactory;
use capture_core::session::{CaptureCoordinator, CaptureDeps};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = logging::try_init() {
        logging::init_stderr();
        warn!("File logging unavailable, logging to stderr only: {}", e);
    }

    // Emit starting event immediately so the shell knows we're alive.
    emit_event(&CaptureEvent::Starting {});

    let config = read_capture_config();
    info!(?config, "Configuration loaded");

    let devices = CpalDevices::start();
    let deps = CaptureDeps {
        devices: devices.clone(),
        display: Arc::new(ScreenGrab::new(config.display_options(), devices)),
        recorders: Arc::new(FfmpegRecorderFactory::new(config.recorder.ffmpeg_path.clone())),
        rms: Arc::new(DbfsRms),
        uploads: config.upload_factory(),
    };
    let (coordinator, mut core_events) = CaptureCoordinator::new(deps, config.capture_options());
    coordinator.start().await;

    let mut cmd_rx = spawn_stdin_reader();

    emit_event(&CaptureEvent::Ready {});
    info!("Capture core ready");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(command) => {
                        if !handle_command(&coordinator, command).await {
                            break;
                        }
                    }
                    None => {
                        // stdin closed: parent process gone
                        info!("stdin closed, shutting down");
                        break;
                    }
                }
            }
            Some(event) = core_events.recv() => {
                emit_event(&CaptureEvent::from(event));
            }
        }
    }

    // Let a live session finish uploading; its events still reach the shell.
    let shutdown = coordinator.shutdown();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(event) = core_events.recv() => {
                emit_event(&CaptureEvent::from(event));
            }
        }
    }
    while let Ok(event) = core_events.try_recv() {
        emit_event(&CaptureEvent::from(event));
    }
    info!("Capture core shutting down");
}

/// Handle a single command from the shell.
/// Returns `false` if the main loop should exit.
async fn handle_command(coordinator: &Arc<CaptureCoordinator>, cmd: CaptureCommand) -> bool {
    match cmd {
        CaptureCommand::Ping {} => {
            emit_event(&CaptureEvent::Pong {});
        }

        CaptureCommand::Stop {} => {
            emit_event(&CaptureEvent::Stopping {});
            return false;
        }

        CaptureCommand::RequestPermission {} => {
            let issued = coordinator.request_permission();
            info!(issued, "Capture requested");
        }

        CaptureCommand::ListAudioDevices {} => {
            let devices = coordinator.list_devices().await;
            let selected = coordinator.registry().selected_device().map(|d| d.id);
            emit_event(&CaptureEvent::AudioDevices { devices, selected });
        }

        CaptureCommand::SelectAudioDevice { id } => {
            info!(device = ?id, "Audio device selected");
            // Failures are reported through the coordinator's error event.
            let _ = coordinator.select_device(id).await;
        }

        CaptureCommand::ReloadAudio {} => {
            let _ = coordinator.reload_audio().await;
        }

        CaptureCommand::SetGain { value } => match coordinator.set_gain(value).await {
            Some(value) => emit_event(&CaptureEvent::Gain { value }),
            None => emit_error("No audio graph to apply gain to"),
        },

        CaptureCommand::StartRecording {} => match coordinator.start_recording().await {
            Ok(Some(session)) => emit_event(&CaptureEvent::RecordingStarted {
                session_id: session.to_string(),
            }),
            Ok(None) => info!("Start recording ignored"),
            Err(e) => emit_error(&e.to_string()),
        },

        CaptureCommand::StopRecording {} => {
            if let Err(e) = coordinator.stop_recording().await {
                emit_error(&e.to_string());
            }
        }
    }

    true
}
