//! Log setup for the plugin binary. Stdout carries the CNI reply, so logs go
//! to a file (or stderr when the file cannot be opened).

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the configured log level.
pub const LOG_ENV: &str = "PODNET_LOG";

const DEFAULT_LEVEL: &str = "info";

/// `PODNET_LOG`, else the configured level, else `info`.
pub fn filter(level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_new(level.unwrap_or(DEFAULT_LEVEL)))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
}

fn open_log_file(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Install the global subscriber writing to `log_file`.
pub fn init(log_file: &Path, level: Option<&str>) {
    let filter = filter(level);
    match open_log_file(log_file) {
        Ok(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init();
        }
        Err(e) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .try_init();
            tracing::warn!(
                path = %log_file.display(),
                error = %e,
                "Cannot open log file, logging to stderr"
            );
        }
    }
}

/// Stderr-only logging, used before the configuration is known.
pub fn init_stderr() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter(None))
        .with_writer(io::stderr)
        .try_init();
}
