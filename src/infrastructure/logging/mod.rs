//! Logging initialization via tracing.
//!
//! Env filter over the configured default level, json or pretty output,
//! and an optional daily-rolling file appender. The returned guard keeps
//! the non-blocking writer alive for the life of the process.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::domain::models::config::LoggingConfig;

/// Initialize the global subscriber. Call once at process start.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(
            config
                .level
                .parse()
                .with_context(|| format!("invalid log level: {}", config.level))?,
        )
        .from_env_lossy();

    let (file_layer, guard) = match &config.log_dir {
        Some(log_dir) => {
            let appender = rolling::daily(log_dir, "drover.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let stdout_layer = match config.format.as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stdout)
            .with_target(true)
            .boxed(),
        _ => tracing_subscriber::fmt::layer()
            .pretty()
            .with_writer(std::io::stdout)
            .with_target(false)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}
