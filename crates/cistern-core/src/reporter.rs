//! Operator facing progress messages.

use crate::error::ArchiveError;

/// Sink for the messages a build or deploy emits along the way.
///
/// `critical` reports a fatal condition and hands the error back so the
/// caller can return it; it never continues the operation.
pub trait Reporter {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn warning(&self, message: &str);
    fn error(&self, message: &str);

    #[must_use]
    fn critical(&self, err: ArchiveError) -> ArchiveError {
        self.error(&err.to_string());
        err
    }
}

/// Forwards every message to `tracing` under the `cistern` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn debug(&self, message: &str) {
        tracing::debug!(target: "cistern", "{message}");
    }

    fn info(&self, message: &str) {
        tracing::info!(target: "cistern", "{message}");
    }

    fn warning(&self, message: &str) {
        tracing::warn!(target: "cistern", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "cistern", "{message}");
    }
}

pub(crate) static TRACING_REPORTER: TracingReporter = TracingReporter;
