//! Logging initialization for the two transport modes.
//!
//! In stdio mode the MCP handshake owns stdout, and clients treat stderr
//! output during the handshake as a broken connection, so logs go to a file
//! or nowhere. Stream mode is free to log to stderr.

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Stdio,
    Stream,
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` filter.
pub fn init_logging(mode: TransportMode, log_file: Option<String>) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match (mode, log_file) {
        (_, Some(file)) => {
            let writer = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&file)
                .with_context(|| format!("Failed to open log file {file}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(writer))
                .init();
        }
        (TransportMode::Stream, None) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
        // stdio without a log file: stay silent
        (TransportMode::Stdio, None) => {}
    }
    Ok(())
}
