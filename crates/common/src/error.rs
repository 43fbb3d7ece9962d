//! Error types for the common crate
//!
//! This module defines the error taxonomy shared by every component of the
//! Sync Orchestrator. Errors are kinds, not exception types: each variant maps
//! to a stable taxonomy string returned in response envelopes and step reports.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Domain, ResourceKind};

/// Result type for Sync Orchestrator operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Sync Orchestrator operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed request, rejected before any reservation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Resource unavailable and not preemptable/queueable
    #[error("Capacity denied for {domain}/{resource_kind}: requested {requested}, available {available}")]
    CapacityDenied {
        domain: Domain,
        resource_kind: ResourceKind,
        requested: u64,
        available: u64,
    },

    /// Optimistic-concurrency write rejected
    #[error("Version conflict on {domain}/{key}: expected {expected}, actual {actual}")]
    VersionConflict {
        domain: Domain,
        key: String,
        expected: u64,
        actual: u64,
    },

    /// A transaction or cascade step exceeded its bound
    #[error("Step '{step}' timed out after {timeout_ms}ms")]
    StepTimeout { step: String, timeout_ms: u64 },

    /// Domain agent failed to respond
    #[error("Agent for domain {domain} unreachable: {reason}")]
    AgentUnreachable { domain: Domain, reason: String },

    /// A rollback step itself failed
    #[error("Compensation of step '{step}' failed: {reason}")]
    CompensationFailure { step: String, reason: String },

    /// Monitor-detected drift beyond threshold
    #[error("Consistency divergence: score {score:.3} below threshold {threshold:.3}")]
    ConsistencyDivergence { score: f64, threshold: f64 },

    /// Envelope action with no registered handler
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// A participant voted to abort
    #[error("Aborted: {0}")]
    Aborted(String),

    /// Operation cancelled by the caller or by preemption
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Not found error
    #[error("Not found: {0}")]
    NotFound(String),

    /// Already exists error
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation not permitted in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the taxonomy code for this error
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::CapacityDenied { .. } => "CAPACITY_DENIED",
            Error::VersionConflict { .. } => "VERSION_CONFLICT",
            Error::StepTimeout { .. } => "STEP_TIMEOUT",
            Error::AgentUnreachable { .. } => "AGENT_UNREACHABLE",
            Error::CompensationFailure { .. } => "COMPENSATION_FAILURE",
            Error::ConsistencyDivergence { .. } => "CONSISTENCY_DIVERGENCE",
            Error::UnknownAction(_) => "UNKNOWN_ACTION",
            Error::Aborted(_) => "TRANSACTION_ABORTED",
            Error::Cancelled(_) => "CANCELLED",
            Error::NotFound(_) => "NOT_FOUND",
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::InvalidState(_) => "INVALID_STATE",
            Error::Config(_) => "CONFIG_ERROR",
            Error::Io(_) => "IO_ERROR",
            Error::Serialization(_) => "SERIALIZATION_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns true if the error is a validation error
    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    /// Returns true if the error is a capacity denial
    pub fn is_capacity_denied(&self) -> bool {
        matches!(self, Error::CapacityDenied { .. })
    }

    /// Returns true if the error is a version conflict
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, Error::VersionConflict { .. })
    }

    /// Returns true if the error is a step timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::StepTimeout { .. })
    }

    /// Returns true if the error is a not found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Returns true if this error must be routed to the cascade orchestrator
    /// instead of being returned raw to the caller
    pub fn is_failure_signal(&self) -> bool {
        matches!(self, Error::StepTimeout { .. } | Error::AgentUnreachable { .. })
    }

    /// Returns a serializable report of this error
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

/// Serializable error code and message pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Taxonomy code
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl From<&Error> for ErrorReport {
    fn from(error: &Error) -> Self {
        error.report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_codes() {
        let err = Error::CapacityDenied {
            domain: Domain::Memory,
            resource_kind: ResourceKind::MemoryBytes,
            requested: 4,
            available: 2,
        };
        assert_eq!(err.code(), "CAPACITY_DENIED");
        assert!(err.is_capacity_denied());
        assert!(!err.is_failure_signal());

        let err = Error::StepTimeout { step: "reserve".into(), timeout_ms: 10 };
        assert_eq!(err.code(), "STEP_TIMEOUT");
        assert!(err.is_failure_signal());

        let report = Error::UnknownAction("frobnicate".into()).report();
        assert_eq!(report.code, "UNKNOWN_ACTION");
        assert!(report.message.contains("frobnicate"));
    }
}
