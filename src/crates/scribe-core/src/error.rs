//! Error types for the execution kernel.
//!
//! Errors carry a coarse [`ErrorClass`] that drives the scheduler's retry
//! decisions: transient errors back off and retry, validation errors retry
//! with feedback, policy errors trigger a structural fallback, and fatal
//! errors terminate the node (and possibly the run) immediately.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result type using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Coarse classification used by the retry machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network failure, rate limit, timeout, provider 5xx. Retried with
    /// exponential backoff.
    Transient,
    /// A plan failed to parse or violated plan invariants. Retried with the
    /// validation message fed back to the planner.
    Validation,
    /// A structural rule was hit (e.g. maximum depth). Handled by a
    /// fallback, not a plain retry.
    Policy,
    /// Non-recoverable. Never retried.
    Fatal,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Validation => "validation",
            ErrorClass::Policy => "policy",
            ErrorClass::Fatal => "fatal",
        };
        write!(f, "{}", name)
    }
}

/// Errors produced by the engine and its collaborators.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A capability invocation failed terminally for one node.
    #[error("node '{nid}' failed after {attempts} attempt(s): {message}")]
    NodeFailed {
        /// Hierarchical id of the failing node
        nid: String,
        /// Error classification of the final attempt
        class: ErrorClass,
        /// Human-readable failure description
        message: String,
        /// Number of attempts consumed
        attempts: u32,
    },

    /// No candidate work, nothing in flight, root not terminal.
    #[error("scheduler deadlocked at node '{nid}': no runnable work remains")]
    Deadlock {
        /// Lowest blocked node, for diagnostics
        nid: String,
    },

    /// The run was cancelled cooperatively.
    #[error("run cancelled")]
    Cancelled,

    /// A capability name could not be resolved in the registry.
    #[error("unknown capability '{0}'")]
    UnknownCapability(String),

    /// A plan payload violated the plan invariants.
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    /// Configuration was structurally invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Snapshot or cache persistence failed.
    #[error("store error: {0}")]
    Store(#[from] scribe_store::StoreError),

    /// JSON (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Lookup of an unknown run.
    #[error("unknown run '{0}'")]
    UnknownRun(String),
}

impl EngineError {
    /// Create a terminal node failure.
    pub fn node_failed(
        nid: impl Into<String>,
        class: ErrorClass,
        message: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self::NodeFailed {
            nid: nid.into(),
            class,
            message: message.into(),
            attempts,
        }
    }

    /// Classification of this error for reporting.
    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::NodeFailed { class, .. } => *class,
            EngineError::Deadlock { .. } => ErrorClass::Fatal,
            EngineError::Cancelled => ErrorClass::Fatal,
            EngineError::InvalidPlan(_) => ErrorClass::Validation,
            _ => ErrorClass::Fatal,
        }
    }

    /// Error kind string surfaced through status and `run_finished`.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NodeFailed { class, .. } => match class {
                ErrorClass::Transient => "transient",
                ErrorClass::Validation => "validation",
                ErrorClass::Policy => "policy",
                ErrorClass::Fatal => "fatal",
            },
            EngineError::Deadlock { .. } => "deadlock",
            EngineError::Cancelled => "cancelled",
            EngineError::UnknownCapability(_) => "misconfiguration",
            EngineError::InvalidPlan(_) => "validation",
            EngineError::Configuration(_) => "misconfiguration",
            EngineError::Store(_) => "store",
            EngineError::Serialization(_) => "serialization",
            EngineError::Io(_) => "io",
            EngineError::UnknownRun(_) => "unknown_run",
        }
    }

    /// Node the error is attributable to, when known.
    pub fn failing_nid(&self) -> Option<&str> {
        match self {
            EngineError::NodeFailed { nid, .. } => Some(nid),
            EngineError::Deadlock { nid } => Some(nid),
            _ => None,
        }
    }
}
