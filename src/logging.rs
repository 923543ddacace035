use anyhow::{Context, Result};
use chrono::Local;
use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info,sqlx=warn";

pub fn log_filename(command: &str, batch: Option<usize>) -> String {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    match batch {
        Some(batch) => format!("{}_batch_{:02}_{}.log", command, batch, timestamp),
        None => format!("{}_{}.log", command, timestamp),
    }
}

/// Logs to stderr and to `<logs_dir>/<command>[_batch_NN]_<timestamp>.log`.
pub fn init_logging(logs_dir: &Path, command: &str, batch: Option<usize>) -> Result<PathBuf> {
    create_dir_all(logs_dir)
        .with_context(|| format!("Failed to create log directory {}", logs_dir.display()))?;
    let log_path = logs_dir.join(log_filename(command, batch));
    let file = File::create(&log_path)
        .with_context(|| format!("Failed to create log file {}", log_path.display()))?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(log_path)
}

// ====== MEMORY MONITORING ======
pub fn memory_usage() -> String {
    if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
        for line in status.lines() {
            if line.starts_with("VmRSS:") {
                return line.split_whitespace().skip(1).collect::<Vec<_>>().join(" ");
            }
        }
    }
    "unavailable".to_string()
}
