//! Logging configuration using tracing

use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

const LOG_FILE_NAME: &str = "devherd.log";

/// Initialize the logging subsystem
///
/// Logs are written to `~/.local/share/devherd/logs/`, never to stdout,
/// which belongs to the headless event stream.
/// Log level is controlled by the `DEVHERD_LOG` environment variable.
///
/// # Examples
/// ```bash
/// DEVHERD_LOG=debug devherd up
/// DEVHERD_LOG=devherd_daemon=trace devherd up
/// ```
pub fn init() -> Result<()> {
    let log_dir = get_log_directory();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE_NAME);

    // Default to info for our crates, allow override via DEVHERD_LOG
    let env_filter = EnvFilter::try_from_env("DEVHERD_LOG")
        .unwrap_or_else(|_| EnvFilter::new("devherd=info,warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(
                    "%Y-%m-%d %H:%M:%S%.3f".to_string(),
                )),
        )
        .init();

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("devherd starting");
    tracing::info!("Log directory: {}", log_dir.display());
    tracing::info!("═══════════════════════════════════════════════════════");

    Ok(())
}

/// Get the log directory path
fn get_log_directory() -> PathBuf {
    let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
    base.join("devherd").join("logs")
}

/// Get the log file path for the current day
///
/// The daily appender suffixes the file name with the UTC date.
pub fn get_current_log_file() -> PathBuf {
    let date = chrono::Utc::now().format("%Y-%m-%d");
    get_log_directory().join(format!("{}.{}", LOG_FILE_NAME, date))
}
