use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use log::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};

const MAX_LOG_FILES: usize = 10;

/// Wires the `log` facade for one CLI run: everything at `level` goes to a
/// daily-rolling file under `dir`, while stderr gets warnings only, or the
/// full debug stream when `--debug` is set.
///
/// The returned guard flushes the non-blocking file writer on drop; keep it
/// alive until exit.
pub fn init_logging(dir: &Path, level: &str, debug: bool) -> Result<WorkerGuard> {
    let level = LevelFilter::from_str(level)
        .with_context(|| format!("unrecognized log level '{}'", level))?;

    let rolling = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("beadscli")
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(dir)
        .with_context(|| format!("cannot open log directory {}", dir.display()))?;
    let (file_writer, guard) = tracing_appender::non_blocking(rolling);

    let to_file = fern::Dispatch::new()
        .level(level)
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {:<5} {}: {}",
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                record.level(),
                record.target(),
                message
            ))
        })
        .chain(Box::new(file_writer) as Box<dyn Write + Send>);

    let colors = fern::colors::ColoredLevelConfig::new()
        .error(fern::colors::Color::Red)
        .warn(fern::colors::Color::Yellow)
        .debug(fern::colors::Color::BrightBlack);
    let to_stderr = fern::Dispatch::new()
        .level(if debug { LevelFilter::Debug } else { LevelFilter::Warn })
        .format(move |out, message, record| {
            out.finish(format_args!("{}: {}", colors.color(record.level()), message))
        })
        .chain(std::io::stderr());

    fern::Dispatch::new()
        .chain(to_file)
        .chain(to_stderr)
        .apply()
        .context("logger already initialized")?;

    Ok(guard)
}
