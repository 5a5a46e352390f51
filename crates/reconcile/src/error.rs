//! Error types for reconciliation runs.
//!
//! Errors are split by how far they reach: per-item problems are recorded
//! in the [`ReconciliationReport`](crate::ReconciliationReport) and never
//! surface here, while the variants below abort a run (or, for
//! [`Error::PartialExecution`], summarize one after the fact).

use crate::access::MissingCapability;
use crate::graph::CycleReport;
use crate::types::Stage;
use thiserror::Error;

/// Categories of collaborator errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Worth retrying (throttling, timeouts, dropped connections)
    Transient,
    /// Retrying will not help
    Permanent,
}

impl ErrorCategory {
    /// Whether this error category is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Marker a collaborator wraps into its `anyhow::Error` to flag a
/// transient failure.
///
/// ```ignore
/// return Err(reconcile::Transient::new("429 too many requests").into());
/// ```
#[derive(Debug, Error)]
#[error("{message}")]
pub struct Transient {
    message: String,
}

impl Transient {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Classify a collaborator error by looking for a [`Transient`] marker
/// anywhere in its cause chain.
pub fn category_of(err: &anyhow::Error) -> ErrorCategory {
    if err.chain().any(|cause| cause.is::<Transient>()) {
        ErrorCategory::Transient
    } else {
        ErrorCategory::Permanent
    }
}

/// An item whose identifying fields are absent or malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("missing identifier: {reason}")]
pub struct MissingIdentifier {
    pub reason: String,
}

impl MissingIdentifier {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors that abort (or summarize) a reconciliation run.
#[derive(Debug, Error)]
pub enum Error {
    /// The dependency graph of a batch is not a DAG
    #[error("dependency cycle detected: {0}")]
    CycleDetected(CycleReport),

    /// Required scopes are not covered by the principal's grants
    #[error("access denied for {kind}: missing {}", format_missing(.missing))]
    AccessDenied {
        kind: String,
        missing: Vec<MissingCapability>,
    },

    /// Some create/update/delete calls failed
    #[error("{kind}: {failed} of {attempted} operations failed")]
    PartialExecution {
        kind: String,
        failed: usize,
        attempted: usize,
    },

    /// No resource kind registered under this name
    #[error("unknown resource kind: {0}")]
    UnknownKind(String),

    /// A declaration could not be parsed into its write model
    #[error("{kind}: failed to load declaration: {reason}")]
    Load { kind: String, reason: String },

    /// A collaborator call failed in a way that cannot be pinned to one item
    #[error("{kind}: {stage} failed: {source:#}")]
    Collaborator {
        kind: String,
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },

    /// Invalid options or registry setup
    #[error("invalid configuration: {0}")]
    Config(String),
}

fn format_missing(missing: &[MissingCapability]) -> String {
    missing
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for reconciliation operations
pub type Result<T> = std::result::Result<T, Error>;
