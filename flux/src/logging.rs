//! Structured logging bootstrap, shared by every binary in the workspace.
//!
//! Mirrors the logging setup used throughout the rest of the codebase: a terminal-destination
//! `slog` logger assembled once at startup and threaded explicitly through to whatever owns it.
//! There is no global logger; callers keep the `Logger` value returned by [`init`] and pass it
//! (or a child of it via `slog::o!`) to anything that needs to log.

pub use slog::{debug, error, info, o, trace, warn, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;

/// Builds the terminal logger used by every relay binary.
///
/// `level` accepts the usual severity names (`trace`, `debug`, `info`, `warn`, `error`);
/// anything unrecognized falls back to `info`.
pub fn init(level: &str) -> Logger {
    let severity = match level {
        "trace" => Severity::Trace,
        "debug" => Severity::Debug,
        "info" => Severity::Info,
        "warn" | "warning" => Severity::Warning,
        "error" => Severity::Error,
        _ => Severity::Info,
    };

    let mut builder = TerminalLoggerBuilder::new();
    builder.level(severity);
    builder.destination(Destination::Stdout);

    builder.build().expect("failed to build terminal logger")
}
