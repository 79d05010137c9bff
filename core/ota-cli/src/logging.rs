//! Tracing setup for the CLI.
//!
//! Console output is always on. `--log-dir` adds a daily rolling file written
//! through a non-blocking worker; the returned guard must live until exit so
//! buffered lines are flushed.

use std::env;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Forces debug logging regardless of `RUST_LOG`.
pub const DEBUG_LOG_ENV: &str = "TRACKER_OTA_DEBUG_LOG";

const LOG_FILE_PREFIX: &str = "tracker-ota.log";

pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let console = fmt::layer().with_target(false);

    let Some(dir) = log_dir else {
        let _ = tracing_subscriber::registry()
            .with(env_filter())
            .with(console)
            .try_init();
        return None;
    };

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .build(dir);
    match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = fmt::layer().with_ansi(false).with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(console)
                .with(file)
                .try_init();
            Some(guard)
        }
        Err(err) => {
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(console)
                .try_init();
            tracing::warn!(
                error = %err,
                dir = %dir.display(),
                "File logging unavailable, logging to console only"
            );
            None
        }
    }
}

fn env_filter() -> EnvFilter {
    let forced = env::var(DEBUG_LOG_ENV)
        .map(|value| debug_forced(&value))
        .unwrap_or(false);
    if forced {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn debug_forced(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "yes" | "YES")
}
