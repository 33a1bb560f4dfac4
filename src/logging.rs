//! Tracing setup: structured stdout output plus a plain-text log file that
//! `GET /log` serves back.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use eyre::{Result, WrapErr};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// The rolled log file next to the binary.
pub const LOG_FILE: &str = "portal.log";

pub fn init(log_path: &Path) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .wrap_err_with(|| format!("Failed to open log file {}", log_path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,swap_portal=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        .with(filter)
        .init();

    Ok(())
}
