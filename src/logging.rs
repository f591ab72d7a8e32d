//! Daemon logging setup.
//!
//! # Example
//!
//! ```rust,no_run
//! use prontrd::config::LogConfig;
//! use prontrd::logging::init_logging;
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::default())?;
//!
//!     tracing::info!("Daemon started");
//!     Ok(())
//! }
//! ```

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::IsTerminal;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

use crate::config::{expand_path, LogConfig, LogFormat};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Without a configured
/// file, logs go to stderr.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)
            .with_context(|| format!("Invalid log level '{}'", config.level))?,
    };

    let ansi = config.file.is_none() && std::io::stderr().is_terminal();
    let writer = match &config.file {
        Some(path) => file_writer(&expand_path(path), config.rotate)?,
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let base = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Text => base.boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(layer).with(filter);
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")?;

    Ok(())
}

fn file_writer(path: &Path, rotate: bool) -> Result<BoxMakeWriter> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    if rotate {
        return rolling_writer(path);
    }

    let file = File::options()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;
    Ok(BoxMakeWriter::new(Mutex::new(file)))
}

/// Daily rotation. Older logs are kept as `<name>.YYYY-MM-DD`.
#[cfg(feature = "log-rotation")]
fn rolling_writer(path: &Path) -> Result<BoxMakeWriter> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};

    let dir = path.parent().unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .context("Log file path has no file name")?;
    Ok(BoxMakeWriter::new(RollingFileAppender::new(
        Rotation::DAILY,
        dir,
        name,
    )))
}

#[cfg(not(feature = "log-rotation"))]
fn rolling_writer(_path: &Path) -> Result<BoxMakeWriter> {
    anyhow::bail!("log rotation requires the `log-rotation` feature")
}
