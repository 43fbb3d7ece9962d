//! Common data models for the Sync Orchestrator
//!
//! This module defines the data model shared across the workspace: state
//! entities, allocations, transaction states, the bus/RPC message envelopes
//! and the domain-agent report types.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Error, ErrorReport};
use crate::types::{DegradationMode, Domain, EventPriority, Owner, ResourceKind};

/// Allocation identifier
pub type AllocationId = Uuid;

/// Caller-supplied transaction identifier
pub type TransactionId = String;

/// Identity of a state entity: owning domain plus key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Owning domain
    pub domain: Domain,
    /// Key within the domain
    pub key: String,
}

impl EntityKey {
    /// Creates a new entity key
    pub fn new(domain: Domain, key: impl Into<String>) -> Self {
        Self {
            domain,
            key: key.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.key)
    }
}

/// A named piece of state belonging to exactly one domain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntity {
    /// Owning domain
    pub domain: Domain,

    /// Key within the domain
    pub key: String,

    /// Side allowed to write the entity
    pub owner: Owner,

    /// Opaque payload
    pub value: Value,

    /// Monotonic version counter
    pub version: u64,

    /// Last write time
    pub last_updated: DateTime<Utc>,
}

/// Read-only, versioned snapshot of a state entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned {
    /// Value at the time of the read
    pub value: Value,

    /// Version at the time of the read
    pub version: u64,

    /// Last write time of the entity
    pub last_updated: DateTime<Utc>,
}

impl Versioned {
    /// Returns true if the snapshot is older than the staleness bound
    pub fn is_stale(&self, max_staleness: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.last_updated);
        age.to_std().map(|age| age > max_staleness).unwrap_or(false)
    }
}

/// Allocation lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AllocationStatus {
    /// Tentatively held (prepare phase)
    Reserved,
    /// Confirmed
    Committed,
    /// Returned to the pool
    Released,
}

impl AllocationStatus {
    /// Returns true if the allocation counts against capacity
    pub fn is_active(self) -> bool {
        matches!(self, AllocationStatus::Reserved | AllocationStatus::Committed)
    }
}

/// A reservation of a finite resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    /// Unique identifier
    pub id: AllocationId,

    /// Domain holding the capacity
    pub domain: Domain,

    /// Resource kind
    pub resource_kind: ResourceKind,

    /// Reserved amount
    pub amount: u64,

    /// Free-form purpose, for diagnostics
    pub purpose: String,

    /// Priority score at the time of the grant
    pub priority: f64,

    /// Lifecycle status
    pub status: AllocationStatus,

    /// Whether the resolver may preempt this allocation
    pub preemptable: bool,

    /// Transaction that holds the allocation, if any
    pub owner_transaction: Option<TransactionId>,

    /// Creation time
    pub created_at: DateTime<Utc>,

    /// Release time, set exactly once
    #[serde(default)]
    pub released_at: Option<DateTime<Utc>>,
}

/// Multi-domain transaction execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionMode {
    /// Prepare/vote/commit across at most two domains
    TwoPhase,
    /// Sequential steps with reverse-order compensation
    Saga,
}

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    Preparing,
    Executing,
    Committing,
    Committed,
    Aborting,
    Aborted,
    Compensating,
    Compensated,
}

impl TransactionState {
    /// Returns true for Committed, Aborted and Compensated
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted | TransactionState::Compensated
        )
    }

    /// Returns true while the caller may still cancel
    pub fn is_cancellable(self) -> bool {
        matches!(self, TransactionState::Preparing | TransactionState::Executing)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Status of a single transaction step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Prepared,
    Executed,
    Committed,
    Failed,
    Aborted,
    Compensated,
    CompensationFailed,
}

/// Caller-visible result class of an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationOutcome {
    /// Completed in Normal mode
    Completed,
    /// Completed, but under a degraded mode or with a post-decision agent failure
    CompletedDegraded { mode: DegradationMode },
    /// Fully failed, nothing reserved
    FailedNothingReserved { error: ErrorReport },
    /// Partially completed then compensated
    Compensated { partial_failure: bool },
}

/// Message envelope used on the propagation bus and for domain-agent RPC
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique per message
    pub message_id: String,

    /// Ties request to response / cascade step
    pub correlation_id: String,

    /// Target or source domain
    pub domain: Domain,

    /// Action name, e.g. "reserve", "commit", "compensate", "health_report"
    pub action: String,

    /// Delivery priority
    pub priority: EventPriority,

    /// Action-specific payload
    pub payload: Value,

    /// Timeout in milliseconds
    pub timeout_ms: u64,

    /// Creation time (RFC3339 on the wire)
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Creates a new envelope with a fresh message id
    pub fn new(
        domain: Domain,
        action: impl Into<String>,
        priority: EventPriority,
        payload: Value,
    ) -> Self {
        let message_id = Uuid::new_v4().to_string();
        Self {
            correlation_id: message_id.clone(),
            message_id,
            domain,
            action: action.into(),
            priority,
            payload,
            timeout_ms: 5_000,
            timestamp: Utc::now(),
        }
    }

    /// Sets the correlation id
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    /// Sets the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Correlation id of the request
    pub correlation_id: String,

    /// Whether the action succeeded
    pub success: bool,

    /// Result data on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Taxonomy code on failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    /// Human-readable failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ResponseEnvelope {
    /// Builds a success response
    pub fn ok(correlation_id: impl Into<String>, data: Value) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            success: true,
            data: Some(data),
            error_code: None,
            error_message: None,
        }
    }

    /// Builds a failure response from an error
    pub fn failure(correlation_id: impl Into<String>, error: &Error) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            success: false,
            data: None,
            error_code: Some(error.code().to_string()),
            error_message: Some(error.to_string()),
        }
    }
}

/// Participant vote in the prepare phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Commit,
    Abort(String),
}

/// Self-reported health status of a domain agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Version of another domain's entity held in an agent's read-only cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedVersion {
    /// Entity the cache mirrors
    pub entity: EntityKey,
    /// Cached version
    pub version: u64,
}

/// Periodic self-report of a domain agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Reporting domain
    pub domain: Domain,

    /// Overall status
    pub status: HealthStatus,

    /// Free-form metrics (e.g. "latency_ms", "error_rate")
    pub metrics: HashMap<String, f64>,

    /// Cached copies of other domains' entities
    pub cached_versions: Vec<CachedVersion>,

    /// Report time
    pub reported_at: DateTime<Utc>,
}

impl HealthReport {
    /// Creates a healthy report with no metrics
    pub fn healthy(domain: Domain) -> Self {
        Self {
            domain,
            status: HealthStatus::Healthy,
            metrics: HashMap::new(),
            cached_versions: Vec::new(),
            reported_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope::new(Domain::Memory, "reserve", EventPriority::P1, json!({"amount": 4}))
            .with_correlation("tx-1")
            .with_timeout(Duration::from_millis(250));
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["domain"], "Memory");
        assert_eq!(wire["priority"], "P1");
        assert_eq!(wire["timeout_ms"], 250);
        assert_eq!(wire["correlation_id"], "tx-1");
        assert!(wire["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_response_envelope_failure_omits_data() {
        let err = Error::UnknownAction("warp".into());
        let response = ResponseEnvelope::failure("c-1", &err);
        let wire = serde_json::to_value(&response).unwrap();
        assert_eq!(wire["success"], false);
        assert_eq!(wire["error_code"], "UNKNOWN_ACTION");
        assert!(wire.get("data").is_none());
    }

    #[test]
    fn test_transaction_state_classes() {
        assert!(TransactionState::Compensated.is_terminal());
        assert!(!TransactionState::Committing.is_terminal());
        assert!(TransactionState::Executing.is_cancellable());
        assert!(!TransactionState::Committing.is_cancellable());
    }
}
