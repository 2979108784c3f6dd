//! Operator-facing log sink.
//!
//! The coordinator writes exactly one line when it starts, one per handoff
//! and one when it exits. Those lines go through [`Logger`] so embedding
//! applications can route them anywhere; internal detail goes to `tracing`.

use std::fmt;
use std::io::Write;

/// Minimal formatted-output sink.
pub trait Logger: Send + Sync + 'static {
    fn log(&self, args: fmt::Arguments<'_>);
}

/// Writes `YYYY/MM/DD HH:MM:SS message` lines to stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrLogger;

impl Logger for StderrLogger {
    fn log(&self, args: fmt::Arguments<'_>) {
        let now = chrono::Local::now().format("%Y/%m/%d %H:%M:%S");
        let mut stderr = std::io::stderr().lock();
        // Nothing sensible to do if stderr is gone.
        let _ = writeln!(stderr, "{now} {args}");
    }
}

/// Forwards lines to `tracing` at `info` level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, args: fmt::Arguments<'_>) {
        tracing::info!(target: "handoff", "{}", args);
    }
}
