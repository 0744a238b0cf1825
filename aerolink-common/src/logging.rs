//! Logging initialization for the aerolink daemons.
//!
//! Both initializers build the same `EnvFilter` so `RUST_LOG` always wins
//! over the configured level; they differ only in the output layer.

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Human-readable log lines with source locations, for interactive use and
/// the systemd journal.
pub fn init_logging(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .init();
    Ok(())
}

/// JSON log lines, one object per event, for shipping to a collector.
pub fn init_logging_json(level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt::layer().json().with_target(true))
        .init();
    Ok(())
}
