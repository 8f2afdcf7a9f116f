use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Directory used when no log directory is configured: `~/.shardmem/logs`
pub fn default_log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".shardmem")
        .join("logs")
}

/// Initialize logging for a rank process with file rotation
///
/// Output goes to a daily rotating `shardmem.log` under `log_dir` (default
/// `~/.shardmem/logs`) and to stdout. `RUST_LOG` overrides `level`.
pub fn init_production_logging(level: &str, log_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let log_dir = log_dir.unwrap_or_else(default_log_dir);

    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "shardmem.log");

    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_line_number(true),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stdout)
                .with_target(false)
                .with_line_number(false),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    tracing::info!(
        log_dir = %log_dir.display(),
        level = %level,
        "Rank logging initialized"
    );

    Ok(())
}

/// Initialize stderr-only logging for short CLI commands, keeping stdout for
/// command output. Lines are compact and untimestamped.
pub fn init_simple_logging(level: &str) -> anyhow::Result<()> {
    fmt()
        .with_env_filter(env_filter(level))
        .with_writer(std::io::stderr)
        .compact()
        .without_time()
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

/// `RUST_LOG` wins over the configured level
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}
