use std::path::Path;

use anyhow::Context;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Installs console and daily-rolling file logging for one process role.
///
/// Every role (`supervisor`, `camera-01`, `transfer-4242`, ...) writes to its own
/// `{log_dir}/{role}.log.YYYY-MM-DD` so concurrent processes never share a file.
/// `RUST_LOG` overrides the console level. The returned guard flushes the file writer
/// when dropped and must be held for the life of the process.
#[inline]
pub fn init_logging(
    console_level: LevelFilter,
    log_dir: &Path,
    role: &str,
    file_level: LevelFilter,
) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let file_appender = tracing_appender::rolling::daily(log_dir, format!("{role}.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let console_filter = EnvFilter::builder()
        .with_default_directive(console_level.into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_filter(console_filter),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_thread_names(true)
                .with_filter(file_level),
        )
        .try_init()
        .context("Failed to install the global log subscriber")?;

    Ok(guard)
}
