//! Host-facing log line capability.
//!
//! The broker session and persistence sink report notable events as plain
//! text lines through an injected `LogSink`; hosts embedding the consumer can
//! supply their own sink, and the default forwards to `tracing`. Every record
//! call goes through `BestEffortLog`, the single point where logging faults
//! are absorbed: logging must never alter the outcome of message processing.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use tracing::info;

/// One-operation logging capability.
pub trait LogSink: Send + Sync {
    fn record(&self, line: &str);
}

/// Default sink: forwards lines to `tracing` at info level.
#[derive(Debug, Default)]
pub struct TracingLog;

impl LogSink for TracingLog {
    fn record(&self, line: &str) {
        info!("{}", line);
    }
}

/// Fault-swallowing wrapper around an injected sink.
#[derive(Clone)]
pub struct BestEffortLog {
    inner: Arc<dyn LogSink>,
}

impl BestEffortLog {
    pub fn new(inner: Arc<dyn LogSink>) -> Self {
        Self { inner }
    }

    /// Record a line, swallowing any fault the sink raises.
    pub fn record(&self, line: &str) {
        let _ = catch_unwind(AssertUnwindSafe(|| self.inner.record(line)));
    }
}

impl Default for BestEffortLog {
    fn default() -> Self {
        Self::new(Arc::new(TracingLog))
    }
}
