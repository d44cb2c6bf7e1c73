use std::fs;

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config;

/// Initialize the structured logging system.
///
/// Sets up:
/// - File output: rolling log files in `{data_dir}/logs/capture.log`
///   with daily rotation, keeping the latest 5 files.
/// - Console output (stderr): human-readable format. Stdout carries the
///   JSON-line protocol and never receives log output.
/// - Environment filter: defaults to `info`, configurable via `RUST_LOG`.
///
/// Fails if the log directory cannot be used or a global subscriber is
/// already installed.
pub fn try_init() -> anyhow::Result<()> {
    let log_dir = config::log_dir();
    fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("capture")
        .filename_suffix("log")
        .max_log_files(5)
        .build(&log_dir)?;

    let file_layer = fmt::layer()
        .with_writer(file_appender)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true)
        .compact();

    // cpal and the HTTP stack are chatty at info.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,cpal=warn,reqwest=warn,hyper=warn,hyper_util=warn,mio=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()?;

    tracing::info!(
        log_dir = %log_dir.display(),
        "Logger initialized"
    );
    Ok(())
}

/// Stderr-only fallback used when the file logger cannot be set up.
pub fn init_stderr() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}
