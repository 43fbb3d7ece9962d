//! Transaction request and result types

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use common::error::ErrorReport;
use common::models::{AllocationId, OperationOutcome, StepStatus, TransactionId, TransactionMode, TransactionState};
use common::types::{DegradationMode, Domain, ResourceKind};
use resource_manager::WriteOp;

use crate::priority::PriorityFactors;

/// Resource cost of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceClaim {
    pub resource_kind: ResourceKind,
    pub amount: u64,
}

impl ResourceClaim {
    pub fn new(resource_kind: impl Into<ResourceKind>, amount: u64) -> Self {
        Self {
            resource_kind: resource_kind.into(),
            amount,
        }
    }
}

/// One step of a transaction
///
/// A step without declared resources or compensation falls back to the
/// operation catalog's cost and compensation for its action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionStep {
    /// Participant domain
    pub domain: Domain,

    /// Action executed (saga) or prepared (two-phase) on the domain
    pub action: String,

    /// Action payload, never inspected by the engine
    #[serde(default)]
    pub payload: Value,

    /// Compensating action
    #[serde(default)]
    pub compensation: Option<String>,

    /// Resources reserved for the step
    #[serde(default)]
    pub resources: Vec<ResourceClaim>,

    /// Registry writes made visible when the transaction commits
    #[serde(default)]
    pub writes: Vec<WriteOp>,

    /// Per-step bound, the coordinator default when unset
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl TransactionStep {
    pub fn new(domain: Domain, action: impl Into<String>) -> Self {
        Self {
            domain,
            action: action.into(),
            payload: Value::Null,
            compensation: None,
            resources: Vec::new(),
            writes: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_compensation(mut self, action: impl Into<String>) -> Self {
        self.compensation = Some(action.into());
        self
    }

    pub fn with_resource(mut self, resource_kind: impl Into<ResourceKind>, amount: u64) -> Self {
        self.resources.push(ResourceClaim::new(resource_kind, amount));
        self
    }

    pub fn with_write(mut self, write: WriteOp) -> Self {
        self.writes.push(write);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Label used for timeout attribution and reports
    pub fn label(&self, index: usize) -> String {
        format!("{}.{}[{}]", self.domain.as_str(), self.action, index + 1)
    }
}

/// Multi-domain operation submitted to the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Caller-supplied id, the idempotency key
    pub transaction_id: TransactionId,

    pub mode: TransactionMode,

    /// Priority factors, scored by the resolver
    pub priority: PriorityFactors,

    /// Whether the transaction's allocations may be preempted
    pub preemptable: bool,

    /// Steps in declaration order
    pub steps: Vec<TransactionStep>,
}

impl OperationRequest {
    /// Two-phase request with default priority
    pub fn two_phase(transaction_id: impl Into<TransactionId>) -> Self {
        Self::new(transaction_id, TransactionMode::TwoPhase)
    }

    /// Saga request with default priority
    pub fn saga(transaction_id: impl Into<TransactionId>) -> Self {
        Self::new(transaction_id, TransactionMode::Saga)
    }

    fn new(transaction_id: impl Into<TransactionId>, mode: TransactionMode) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            mode,
            priority: PriorityFactors::default(),
            preemptable: true,
            steps: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: PriorityFactors) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_preemptable(mut self, preemptable: bool) -> Self {
        self.preemptable = preemptable;
        self
    }

    pub fn with_step(mut self, step: TransactionStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Distinct participant domains in dependency order
    pub fn domains(&self) -> Vec<Domain> {
        let mut domains: Vec<Domain> = self.steps.iter().map(|s| s.domain).collect();
        domains.sort();
        domains.dedup();
        domains
    }
}

/// Outcome of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// Zero-based position in the request
    pub index: usize,

    pub domain: Domain,

    pub action: String,

    pub status: StepStatus,

    /// Allocations the step held
    #[serde(default)]
    pub allocations: Vec<AllocationId>,

    /// Result returned by the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    /// Failure attributed to this step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl StepReport {
    pub(crate) fn pending(index: usize, step: &TransactionStep) -> Self {
        Self {
            index,
            domain: step.domain,
            action: step.action.clone(),
            status: StepStatus::Pending,
            allocations: Vec::new(),
            output: None,
            error: None,
        }
    }
}

/// Terminal result of a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionResult {
    pub transaction_id: TransactionId,

    pub mode: TransactionMode,

    /// Terminal state
    pub state: TransactionState,

    /// Caller-visible result class
    pub outcome: OperationOutcome,

    pub steps: Vec<StepReport>,

    /// Set when at least one compensation failed
    pub partial_failure: bool,

    /// Degradation mode when the transaction finished
    pub degradation_mode: DegradationMode,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,
}

impl TransactionResult {
    /// Returns true if the transaction committed
    pub fn is_committed(&self) -> bool {
        self.state == TransactionState::Committed
    }

    /// First step error, if any
    pub fn first_error(&self) -> Option<&ErrorReport> {
        self.steps.iter().find_map(|s| s.error.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_builders() {
        let request = OperationRequest::saga("tx-1")
            .with_preemptable(false)
            .with_step(TransactionStep::new(Domain::Model, "load_model").with_payload(json!({"model": "m"})))
            .with_step(
                TransactionStep::new(Domain::Device, "acquire_device")
                    .with_resource(ResourceKind::DeviceTime, 10)
                    .with_timeout(Duration::from_millis(50)),
            )
            .with_step(TransactionStep::new(Domain::Model, "warm_up"));

        assert_eq!(request.mode, TransactionMode::Saga);
        assert!(!request.preemptable);
        assert_eq!(request.domains(), vec![Domain::Device, Domain::Model]);
        assert_eq!(request.steps[1].label(1), "device.acquire_device[2]");
        assert_eq!(request.steps[1].resources[0], ResourceClaim::new("device_time", 10));
    }
}
