use crate::clienv;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "info";

/// `RUST_LOG`, then `$PROCFAM_LOG`, then `info`.
fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| clienv::log_filter().and_then(|f| EnvFilter::try_new(f).ok()))
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber, writing to stderr or appending to `file`.
pub fn init(file: Option<&Path>) -> Result<()> {
    let registry = tracing_subscriber::registry().with(filter());

    match file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create log directory {}", parent.display())
                })?;
            }
            let log = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let layer = fmt::layer()
                .with_target(true)
                .with_ansi(false)
                .with_writer(Mutex::new(log));
            registry
                .with(layer)
                .try_init()
                .context("Failed to set tracing subscriber")?;
        }
        None => {
            let layer = fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr);
            registry
                .with(layer)
                .try_init()
                .context("Failed to set tracing subscriber")?;
        }
    }
    Ok(())
}
