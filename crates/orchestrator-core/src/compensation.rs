//! Compensating actions
//!
//! Compensations undo executed saga steps. Each one runs the step's named
//! compensating action if it has one, asks the agent to compensate every
//! allocation the step holds, and always returns the capacity to the ledger,
//! so a failing compensation never leaks resources.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, error, info};

use common::error::{Error, ErrorReport, Result};
use common::models::AllocationId;
use common::types::Domain;
use resource_manager::AllocationLedger;
use storage_adapter::PendingCompensation;

use crate::agent::AgentDirectory;
use crate::dispatch::ActionDispatcher;

/// Compensation owed by one executed step
#[derive(Debug, Clone, PartialEq)]
pub struct CompensationAction {
    pub label: String,
    pub domain: Domain,
    /// Named compensating action
    pub action: Option<String>,
    pub payload: Value,
    pub allocations: Vec<AllocationId>,
    pub timeout: Duration,
}

impl CompensationAction {
    pub fn from_pending(pending: PendingCompensation, timeout: Duration) -> Self {
        Self {
            label: pending.label,
            domain: pending.domain,
            action: pending.action,
            payload: pending.payload,
            allocations: pending.allocations,
            timeout,
        }
    }

    pub fn to_pending(&self) -> PendingCompensation {
        PendingCompensation {
            label: self.label.clone(),
            domain: self.domain,
            action: self.action.clone(),
            payload: self.payload.clone(),
            allocations: self.allocations.clone(),
        }
    }
}

/// Result of one compensation
#[derive(Debug, Clone, PartialEq)]
pub struct CompensationResult {
    pub label: String,
    pub domain: Domain,
    pub error: Option<ErrorReport>,
}

impl CompensationResult {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Results of a compensation run, in execution order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompensationReport {
    pub results: Vec<CompensationResult>,
}

impl CompensationReport {
    /// True if any compensation failed
    pub fn partial_failure(&self) -> bool {
        self.results.iter().any(|r| !r.succeeded())
    }

    pub fn failed_labels(&self) -> Vec<&str> {
        self.results
            .iter()
            .filter(|r| !r.succeeded())
            .map(|r| r.label.as_str())
            .collect()
    }
}

/// Runs compensations and recovery actions against agents
pub struct Compensator {
    agents: Arc<AgentDirectory>,
    dispatcher: Arc<ActionDispatcher>,
    ledger: Arc<AllocationLedger>,
}

impl Compensator {
    pub fn new(agents: Arc<AgentDirectory>, dispatcher: Arc<ActionDispatcher>, ledger: Arc<AllocationLedger>) -> Self {
        Self {
            agents,
            dispatcher,
            ledger,
        }
    }

    /// Invokes a named action on a domain's agent, bounded by `timeout`
    pub async fn invoke(&self, domain: Domain, action: &str, payload: Value, timeout: Duration) -> Result<Value> {
        debug!(%domain, action, "Invoking action");
        self.dispatcher.call(domain, action, payload, timeout).await
    }

    /// Runs one compensation
    ///
    /// The allocations are released whatever the agent answers.
    pub async fn run_one(&self, action: &CompensationAction) -> Result<()> {
        let mut failure: Option<Error> = None;

        if let Some(name) = &action.action {
            if let Err(e) = self
                .invoke(action.domain, name, action.payload.clone(), action.timeout)
                .await
            {
                failure = Some(e);
            }
        }

        for allocation_id in &action.allocations {
            if let Err(e) = self
                .agents
                .compensate(action.domain, *allocation_id, action.timeout)
                .await
            {
                failure.get_or_insert(e);
            }
        }

        for allocation_id in &action.allocations {
            if let Err(e) = self.ledger.release(*allocation_id) {
                error!(allocation_id = %allocation_id, "Failed to release compensated allocation: {}", e);
            }
        }

        match failure {
            None => {
                info!(step = %action.label, "Step compensated");
                Ok(())
            }
            Some(e) => {
                error!(step = %action.label, "Compensation failed: {}", e);
                Err(Error::CompensationFailure {
                    step: action.label.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Runs compensations in the given order, continuing past failures
    pub async fn compensate(&self, actions: &[CompensationAction]) -> CompensationReport {
        let mut report = CompensationReport::default();
        for action in actions {
            let error = self.run_one(action).await.err().map(|e| e.report());
            report.results.push(CompensationResult {
                label: action.label.clone(),
                domain: action.domain,
                error,
            });
        }
        report
    }
}
