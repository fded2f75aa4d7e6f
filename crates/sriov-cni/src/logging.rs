//! Tracing subscriber setup.
//!
//! Stdout carries the CNI reply, so logs go to `logFile` or stderr.

use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::defaults;

/// Maps a configured `logLevel` to a tracing filter directive.
pub fn filter_directive(level: Option<&str>) -> &'static str {
    match level.unwrap_or(defaults::LOG_LEVEL) {
        "panic" | "error" => "error",
        "warning" => "warn",
        "debug" => "debug",
        _ => "info",
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides `level`.
pub fn init_logging(level: Option<&str>, file: Option<&str>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(level)));

    let writer = match file {
        Some(path) if !path.is_empty() => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path))?;
            BoxMakeWriter::new(Arc::new(file))
        }
        _ => BoxMakeWriter::new(std::io::stderr),
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;
    Ok(())
}
