//! Tracing setup for hosts that want the engine's log output on disk.
//!
//! The default location is the XDG state directory
//! (`~/.local/state/rangeload/rangeload.log`); embedders and tests can
//! point the log anywhere with [`init_logging_at`]. The engine itself only
//! emits `tracing` events and never installs a subscriber on its own.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "rangeload.log";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,rangeload=debug"))
}

/// Append tracing output to `rangeload.log` inside `dir`, creating the
/// directory if needed. Fails if the directory is unwritable or a global
/// subscriber is already installed; callers may then fall back to
/// [`init_logging_stderr`].
pub fn init_logging_at(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create log dir {}", dir.display()))?;
    let path = dir.join(LOG_FILE_NAME);
    let file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open log file {}", path.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(Arc::new(file))
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("install tracing subscriber: {e}"))?;

    tracing::info!("logging to {}", path.display());
    Ok(())
}

/// Log to the default XDG state directory.
pub fn init_logging() -> Result<()> {
    let xdg_dirs = xdg::BaseDirectories::with_prefix("rangeload")?;
    init_logging_at(&xdg_dirs.get_state_home())
}

/// Stderr-only setup, for hosts without a writable state directory.
pub fn init_logging_stderr() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();
}
