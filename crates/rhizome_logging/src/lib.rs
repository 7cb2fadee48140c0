//! Shared logging utilities for Rhizome binaries.

use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "rhizome=info,rhizome_scheduler=info,rhizome_worker=info,rhizome_store=info,rhizome_graph=info";

/// Logging configuration shared by Rhizome binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
}

/// Initialize tracing with a log file under the Rhizome home plus stderr
/// output. `RUST_LOG` overrides the default filter for both sinks.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let log_path = log_dir.join(format!("{}.log", sanitize_name(config.app_name)));
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file: {}", log_path.display()))?;

    let base_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };
    // Console stays quiet unless asked; the file gets everything.
    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(if config.verbose {
            base_filter()
        } else {
            EnvFilter::new("warn")
        });
    let file = tracing_subscriber::fmt::layer()
        .with_writer(file)
        .with_ansi(false)
        .with_filter(base_filter());

    tracing_subscriber::registry().with(file).with(console).init();
    Ok(())
}

/// Rhizome home directory: `$RHIZOME_HOME` or `~/.rhizome`.
pub fn rhizome_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("RHIZOME_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rhizome")
}

/// Logs directory: `<home>/logs`.
pub fn logs_dir() -> PathBuf {
    rhizome_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

fn sanitize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => out.push(ch),
            _ => out.push('_'),
        }
    }
    out
}
