//! Operator-facing diagnostics
//!
//! Nothing in the Kafka subsystem logs errors directly; they are reported
//! through a [`Diagnostic`] so the embedding application decides where they go.

use parking_lot::Mutex;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use tracing::{error, warn};

/// Context attached to every diagnostic of a handler
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

/// Sink for errors and warnings
pub trait Diagnostic: Send + Sync {
    /// Derive a sink that tags everything with `ctx` in addition to the
    /// current context
    fn with_context(&self, ctx: &[KeyValue]) -> Arc<dyn Diagnostic>;

    /// Warn that TLS certificate verification is disabled
    fn insecure_skip_verify(&self);

    /// Report a non-fatal error
    fn error(&self, msg: &str, err: &(dyn StdError + 'static));
}

/// [`Diagnostic`] backed by `tracing`
#[derive(Debug, Clone, Default)]
pub struct TracingDiagnostic {
    context: Vec<KeyValue>,
}

impl TracingDiagnostic {
    pub fn new() -> Self {
        Self::default()
    }

    fn context(&self) -> String {
        self.context
            .iter()
            .map(|kv| kv.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Diagnostic for TracingDiagnostic {
    fn with_context(&self, ctx: &[KeyValue]) -> Arc<dyn Diagnostic> {
        let mut context = self.context.clone();
        context.extend_from_slice(ctx);
        Arc::new(TracingDiagnostic { context })
    }

    fn insecure_skip_verify(&self) {
        warn!(
            service = "kafka",
            context = %self.context(),
            "Service is configured to skip SSL verification"
        );
    }

    fn error(&self, msg: &str, err: &(dyn StdError + 'static)) {
        error!(
            service = "kafka",
            context = %self.context(),
            error = %err,
            "{}",
            msg
        );
    }
}

/// One entry captured by [`MemoryDiagnostic`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    InsecureSkipVerify {
        context: Vec<KeyValue>,
    },
    Error {
        context: Vec<KeyValue>,
        message: String,
        error: String,
    },
}

/// [`Diagnostic`] that keeps everything in memory, for embedding in tests
#[derive(Debug, Clone, Default)]
pub struct MemoryDiagnostic {
    context: Vec<KeyValue>,
    records: Arc<Mutex<Vec<Record>>>,
}

impl MemoryDiagnostic {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything reported so far, including through derived sinks
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    /// Number of insecure-skip-verify warnings
    pub fn insecure_warnings(&self) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| matches!(r, Record::InsecureSkipVerify { .. }))
            .count()
    }

    /// Messages of the reported errors
    pub fn errors(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                Record::Error { message, .. } => Some(message.clone()),
                _ => None,
            })
            .collect()
    }
}

impl Diagnostic for MemoryDiagnostic {
    fn with_context(&self, ctx: &[KeyValue]) -> Arc<dyn Diagnostic> {
        let mut context = self.context.clone();
        context.extend_from_slice(ctx);
        Arc::new(MemoryDiagnostic {
            context,
            records: Arc::clone(&self.records),
        })
    }

    fn insecure_skip_verify(&self) {
        self.records.lock().push(Record::InsecureSkipVerify {
            context: self.context.clone(),
        });
    }

    fn error(&self, msg: &str, err: &(dyn StdError + 'static)) {
        self.records.lock().push(Record::Error {
            context: self.context.clone(),
            message: msg.to_string(),
            error: err.to_string(),
        });
    }
}
