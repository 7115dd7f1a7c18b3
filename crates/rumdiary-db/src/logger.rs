//! Logger capability injected into every model.
//!
//! Models report operation starts, durations and warnings through a
//! [`Logger`] rather than calling `tracing` directly, so the host decides
//! where those lines go. [`TracingLogger`] is what the datastore installs
//! by default; [`NullLogger`] drops everything; [`RecordingLogger`] keeps
//! lines in memory for assertions.

use std::sync::{Mutex, PoisonError};

/// Severity of a logged line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    /// Low-level trace output (query durations).
    Log,
    /// Normal operational messages.
    Info,
    /// Something the caller should look at.
    Warn,
    /// A failure.
    Error,
}

/// Sink for the messages models and the connection manager produce.
pub trait Logger: Send + Sync {
    /// Record a low-level message.
    fn log(&self, message: &str);

    /// Record an informational message.
    fn info(&self, message: &str);

    /// Record a warning.
    fn warn(&self, message: &str);

    /// Record an error.
    fn error(&self, message: &str);
}

/// Drops every message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn log(&self, _message: &str) {}
    fn info(&self, _message: &str) {}
    fn warn(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// Forwards messages to `tracing` under the `rumdiary_db` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, message: &str) {
        tracing::debug!(target: "rumdiary_db", "{message}");
    }

    fn info(&self, message: &str) {
        tracing::info!(target: "rumdiary_db", "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "rumdiary_db", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "rumdiary_db", "{message}");
    }
}

/// One captured line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Severity.
    pub level: LogLevel,
    /// Formatted message.
    pub message: String,
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct RecordingLogger {
    lines: Mutex<Vec<LogLine>>,
}

impl RecordingLogger {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all captured lines, oldest first.
    pub fn lines(&self) -> Vec<LogLine> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of lines at `level` whose message contains `needle`.
    pub fn count(&self, level: LogLevel, needle: &str) -> usize {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|line| line.level == level && line.message.contains(needle))
            .count()
    }

    /// Forget everything captured so far.
    pub fn reset(&self) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn push(&self, level: LogLevel, message: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LogLine {
                level,
                message: message.to_owned(),
            });
    }
}

impl Logger for RecordingLogger {
    fn log(&self, message: &str) {
        self.push(LogLevel::Log, message);
    }

    fn info(&self, message: &str) {
        self.push(LogLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.push(LogLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.push(LogLevel::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_logger_counts_by_level_and_text() {
        let logger = RecordingLogger::new();
        logger.info("pageView->get: {}");
        logger.warn("clearing table: pageView");
        logger.warn("clearing table: site");
        logger.error("boom");

        assert_eq!(logger.lines().len(), 4);
        assert_eq!(logger.count(LogLevel::Warn, "clearing table"), 2);
        assert_eq!(logger.count(LogLevel::Warn, "pageView"), 1);
        assert_eq!(logger.count(LogLevel::Info, "clearing"), 0);

        logger.reset();
        assert!(logger.lines().is_empty());
    }

    #[test]
    fn null_logger_is_usable_as_a_trait_object() {
        let logger: &dyn Logger = &NullLogger;
        logger.log("dropped");
        logger.info("dropped");
        logger.warn("dropped");
        logger.error("dropped");
    }
}
