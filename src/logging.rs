use std::fs;
use std::io;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const APP_LOG_FILE: &str = "app.log";

/// Daily rolling `app.log` under `log_dir` plus stderr. `RUST_LOG` wins over
/// `verbose`. Keep the guard alive until exit or buffered lines are lost.
pub fn init(log_dir: &Path, verbose: bool) -> io::Result<WorkerGuard> {
    fs::create_dir_all(log_dir)?;
    let default_level = if verbose { "debug" } else { "info" };
    let filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
    };

    let file_appender = rolling::daily(log_dir, APP_LOG_FILE);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(filter());
    let stderr_layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_writer(io::stderr)
        .with_filter(filter());

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    Ok(guard)
}
