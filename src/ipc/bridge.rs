//! IPC bridge: stdin reader and stdout event emitter.
//!
//! A blocking stdin reader thread sends deserialized commands through an
//! mpsc channel; events go out as JSON lines on stdout.

use std::io::{self, BufRead, Write};

use tokio::sync::mpsc;
use tracing::{debug, error};

use super::{CaptureCommand, CaptureEvent};

/// Emit a `CaptureEvent` as a JSON line on stdout and flush.
pub fn emit_event(event: &CaptureEvent) {
    let json = match serde_json::to_string(event) {
        Ok(j) => j,
        Err(e) => {
            error!("Failed to serialize event: {}", e);
            return;
        }
    };
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    // Pipe may be closed.
    let _ = writeln!(handle, "{}", json);
    let _ = handle.flush();
}

/// Convenience helper for emitting error events.
pub fn emit_error(message: &str) {
    emit_event(&CaptureEvent::Error {
        message: message.to_string(),
    });
}

/// Parse one stdin line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Option<Result<CaptureCommand, serde_json::Error>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(serde_json::from_str::<CaptureCommand>(trimmed))
}

/// Spawn a blocking thread that reads JSON lines from stdin, deserializes
/// them into `CaptureCommand`, and forwards them through the returned
/// channel.
///
/// The thread exits when stdin is closed (parent process gone) or on
/// unrecoverable read error.
pub fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<CaptureCommand> {
    let (tx, rx) = mpsc::unbounded_channel();

    std::thread::spawn(move || {
        let stdin = io::stdin();
        let reader = stdin.lock();
        for line in reader.lines() {
            match line {
                Ok(text) => match parse_command(&text) {
                    None => continue,
                    Some(Ok(cmd)) => {
                        debug!(?cmd, "Received command");
                        if tx.send(cmd).is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        error!("Invalid JSON command: {} (input: {})", e, text.trim());
                        emit_error(&format!("Invalid JSON command: {}", e));
                    }
                },
                Err(e) => {
                    error!("stdin read error: {}", e);
                    break;
                }
            }
        }
        debug!("stdin reader thread exiting");
    });

    rx
}
