//! Structured logging surface. Re-exports the slog vocabulary used across
//! the crate and provides ready-made logger constructors so embedders do not
//! have to touch sloggers directly.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use crate::error::{Error, Result};
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::path::Path;

/// Terminal logger writing to stderr at debug level.
pub fn terminal() -> Logger {
    TerminalLoggerBuilder::new()
        .level(Severity::Debug)
        .destination(Destination::Stderr)
        .build()
        .expect("Terminal logger construction cannot fail")
}

/// Logger that drops everything. The default when an embedder supplies none.
pub fn noop() -> Logger {
    Logger::root(Discard, o!())
}

/// Build a logger from a sloggers TOML configuration file.
pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Logger> {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig =
        serdeconv::from_toml_file(path).map_err(|e| Error::Config(format!("logger config: {}", e)))?;

    config
        .build_logger()
        .map_err(|e| Error::Config(format!("logger construction: {}", e)))
}
