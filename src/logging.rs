//! Tracing subscriber setup.
//!
//! `RUST_LOG` filters as usual (default `info`). Output goes to stderr, or
//! is appended to `common.log_filename` when set; `common.log_format =
//! "json"` switches to one JSON object per line.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

use crate::config::{CommonParams, LogFormat};

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("cannot open log file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tracing subscriber already installed: {0}")]
    Init(String),
}

/// Install the global subscriber described by `common`.
pub fn init(common: &CommonParams) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let writer = match &common.log_filename {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LoggingError::Io {
                    path: path.clone(),
                    source,
                })?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(common.log_filename.is_none())
        .with_writer(writer);

    let result = match common.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    result.map_err(|e| LoggingError::Init(e.to_string()))
}
