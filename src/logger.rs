use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::SubscriberBuilder;

use crate::parse::LoggingConfig;



/*
    @@@
    @logs_tracing();
    . With `logging.dir` set, creates a daily-rotating `supervisor.log` there; otherwise logs go to stderr, keeping stdout for reports.
    . Either way the writer is non-blocking, and the level comes from `logging.level`.
    . Returns the guard that keeps the background writer alive.
*/
pub fn logs_tracing(cfg: &LoggingConfig) -> Result<WorkerGuard> {
    let level: tracing::Level = cfg
        .level
        .parse()
        .with_context(|| format!("invalid log level `{}`", cfg.level))?;

    let (non_blocking, guard) = match &cfg.dir {
        Some(dir) => {
            let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "supervisor.log");
            tracing_appender::non_blocking(file_appender)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    let subscriber = SubscriberBuilder::default()
        .with_ansi(cfg.dir.is_none())
        .with_target(true)
        .with_level(true)
        .with_writer(non_blocking)
        .with_max_level(level)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global subscriber")?;
    Ok(guard)
}
