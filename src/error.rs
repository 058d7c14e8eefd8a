//! Error types for qmgr.
//!
//! Validation and key-conflict errors are raised before any file or process
//! side effect. Batch operations (import, export, delete cleanup) never fail
//! on the first bad item; they collect [`ItemFailure`]s into an
//! [`OperationReport`] and only become [`QmgrError::PartialFailure`] when the
//! caller asks for a complete result.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for qmgr operations.
pub type Result<T> = std::result::Result<T, QmgrError>;

/// Errors that can occur while managing VM definitions and processes.
#[derive(Debug, Error)]
pub enum QmgrError {
    /// A VM record is malformed or incomplete.
    #[error("invalid VM definition: {0}")]
    Validation(String),

    /// No VM with this name exists in the store.
    #[error("no VM named '{0}'")]
    NotFound(String),

    /// A VM with this name already exists in the store.
    #[error("a VM named '{0}' already exists")]
    AlreadyExists(String),

    /// The VM already has a live process handle.
    #[error("VM '{0}' is already running")]
    Conflict(String),

    /// The VM executable could not be started.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// An external tool failed to start or exited non-zero.
    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    /// A batch operation completed for some items and failed for others.
    #[error(
        "{} item(s) failed ({} completed): {}",
        failures.len(),
        completed.len(),
        summarize(failures)
    )]
    PartialFailure {
        completed: Vec<String>,
        failures: Vec<ItemFailure>,
    },

    /// Filesystem error on a specific path.
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A stored or imported file could not be parsed.
    #[error("parse error in {context}: {message}")]
    Parse { context: String, message: String },

    /// A record could not be serialized.
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl QmgrError {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Wraps an I/O error with the path it happened on.
    #[must_use]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a parse error for `context` (a file path or section name).
    #[must_use]
    pub fn parse(context: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::Parse {
            context: context.into(),
            message: message.to_string(),
        }
    }
}

fn summarize(failures: &[ItemFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Batch reporting
// ---------------------------------------------------------------------------

/// One failed item in a batch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    /// What failed: a VM name, a section, or a file path.
    pub item: String,
    /// Human-readable reason.
    pub reason: String,
}

impl fmt::Display for ItemFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.item, self.reason)
    }
}

/// Outcome of a batch operation that continues past per-item failures.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationReport {
    /// Items that were processed successfully, in processing order.
    pub completed: Vec<String>,
    /// Items that failed, in processing order.
    pub failures: Vec<ItemFailure>,
}

impl OperationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&mut self, item: impl Into<String>) {
        self.completed.push(item.into());
    }

    pub fn fail(&mut self, item: impl Into<String>, reason: impl fmt::Display) {
        self.failures.push(ItemFailure {
            item: item.into(),
            reason: reason.to_string(),
        });
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Turn a report with failures into [`QmgrError::PartialFailure`].
    pub fn ensure_complete(self) -> Result<Vec<String>> {
        if self.failures.is_empty() {
            Ok(self.completed)
        } else {
            Err(QmgrError::PartialFailure {
                completed: self.completed,
                failures: self.failures,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_report_passes_through() {
        let mut report = OperationReport::new();
        report.complete("vm1");
        assert!(report.is_complete());
        assert_eq!(report.ensure_complete().unwrap(), vec!["vm1".to_string()]);
    }

    #[test]
    fn failures_become_partial_failure() {
        let mut report = OperationReport::new();
        report.complete("vm1");
        report.fail("/bundle/a.qcow2", "file not found");

        match report.ensure_complete() {
            Err(QmgrError::PartialFailure {
                completed,
                failures,
            }) => {
                assert_eq!(completed, vec!["vm1".to_string()]);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].item, "/bundle/a.qcow2");
            }
            other => panic!("expected PartialFailure, got {other:?}"),
        }
    }

    #[test]
    fn partial_failure_message_lists_items() {
        let err = QmgrError::PartialFailure {
            completed: vec![],
            failures: vec![ItemFailure {
                item: "a.iso".into(),
                reason: "permission denied".into(),
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("1 item(s) failed"), "got: {msg}");
        assert!(msg.contains("a.iso: permission denied"), "got: {msg}");
    }
}
