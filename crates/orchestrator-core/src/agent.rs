//! Domain agents
//!
//! A domain agent is the black-box worker behind one domain. The engine
//! talks to it only through [`DomainAgent`]; every call goes through the
//! [`AgentDirectory`], which bounds it with a timeout so a crashed or hung
//! agent surfaces as `StepTimeout` or `AgentUnreachable`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info};

use common::error::{Error, Result};
use common::models::{AllocationId, EntityKey, HealthReport, TransactionId, Vote};
use common::types::Domain;
use common::utils::execute_with_timeout;

use crate::transaction::ResourceClaim;

/// Tentative reservation handed to an agent in the prepare phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReservation {
    pub transaction_id: TransactionId,

    /// Action the reservation is for
    pub action: String,

    #[serde(default)]
    pub payload: Value,

    /// Claimed resources
    #[serde(default)]
    pub claims: Vec<ResourceClaim>,

    /// Ledger allocations already granted for the claims
    #[serde(default)]
    pub allocation_ids: Vec<AllocationId>,
}

/// Progress update streamed while an operation executes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationProgress {
    pub domain: Domain,
    pub action: String,
    /// Completed fraction in [0, 1]
    pub fraction: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Contract every domain agent implements
#[async_trait]
pub trait DomainAgent: Send + Sync {
    /// Domain served by the agent
    fn domain(&self) -> Domain;

    /// Tentatively reserves and votes
    async fn reserve(&self, reservation: &AgentReservation) -> Result<Vote>;

    /// Confirms a reservation
    async fn commit(&self, allocation_id: AllocationId) -> Result<()>;

    /// Undoes the effect of an allocation
    async fn compensate(&self, allocation_id: AllocationId) -> Result<()>;

    /// Self-report of health, metrics and cached versions
    async fn health_report(&self) -> Result<HealthReport>;

    /// Executes an operation, streaming progress until the result
    async fn execute_operation(
        &self,
        action: &str,
        payload: Value,
        progress: mpsc::Sender<OperationProgress>,
    ) -> Result<Value>;

    /// Drops a cached copy of another domain's entity older than `version`
    async fn invalidate_cache(&self, entity: &EntityKey, version: u64) -> Result<()>;
}

/// Registered agents, one per domain
pub struct AgentDirectory {
    agents: RwLock<BTreeMap<Domain, Arc<dyn DomainAgent>>>,
    default_timeout: Duration,
}

impl AgentDirectory {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            agents: RwLock::new(BTreeMap::new()),
            default_timeout,
        }
    }

    /// Timeout applied when a caller has none of its own
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Registers an agent for its domain
    pub fn register(&self, agent: Arc<dyn DomainAgent>) -> Result<()> {
        let domain = agent.domain();
        let mut agents = self.agents.write();
        if agents.contains_key(&domain) {
            return Err(Error::AlreadyExists(format!("Agent for domain {}", domain)));
        }
        agents.insert(domain, agent);
        info!(%domain, "Domain agent registered");
        Ok(())
    }

    /// Removes the agent of a domain
    pub fn deregister(&self, domain: Domain) -> Option<Arc<dyn DomainAgent>> {
        let removed = self.agents.write().remove(&domain);
        if removed.is_some() {
            info!(%domain, "Domain agent deregistered");
        }
        removed
    }

    /// Removes every agent, most dependent domain first
    pub fn drain(&self) -> Vec<Arc<dyn DomainAgent>> {
        let mut agents = self.agents.write();
        let drained: Vec<_> = std::mem::take(&mut *agents).into_values().rev().collect();
        debug!(count = drained.len(), "Agent directory drained");
        drained
    }

    pub fn get(&self, domain: Domain) -> Result<Arc<dyn DomainAgent>> {
        self.agents
            .read()
            .get(&domain)
            .cloned()
            .ok_or_else(|| Error::AgentUnreachable {
                domain,
                reason: "no agent registered".to_string(),
            })
    }

    pub fn contains(&self, domain: Domain) -> bool {
        self.agents.read().contains_key(&domain)
    }

    /// Registered domains in dependency order
    pub fn domains(&self) -> Vec<Domain> {
        self.agents.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    pub async fn reserve(&self, domain: Domain, reservation: &AgentReservation, timeout: Duration) -> Result<Vote> {
        let agent = self.get(domain)?;
        execute_with_timeout(agent.reserve(reservation), timeout, &step_name(domain, "reserve")).await
    }

    pub async fn commit(&self, domain: Domain, allocation_id: AllocationId, timeout: Duration) -> Result<()> {
        let agent = self.get(domain)?;
        execute_with_timeout(agent.commit(allocation_id), timeout, &step_name(domain, "commit")).await
    }

    pub async fn compensate(&self, domain: Domain, allocation_id: AllocationId, timeout: Duration) -> Result<()> {
        let agent = self.get(domain)?;
        execute_with_timeout(agent.compensate(allocation_id), timeout, &step_name(domain, "compensate")).await
    }

    pub async fn health_report(&self, domain: Domain, timeout: Duration) -> Result<HealthReport> {
        let agent = self.get(domain)?;
        let report =
            execute_with_timeout(agent.health_report(), timeout, &step_name(domain, "health_report")).await?;
        if report.domain != domain {
            return Err(Error::Validation(format!(
                "Agent for {} reported health as {}",
                domain, report.domain
            )));
        }
        Ok(report)
    }

    pub async fn execute(
        &self,
        domain: Domain,
        action: &str,
        payload: Value,
        progress: mpsc::Sender<OperationProgress>,
        timeout: Duration,
    ) -> Result<Value> {
        let agent = self.get(domain)?;
        execute_with_timeout(
            agent.execute_operation(action, payload, progress),
            timeout,
            &step_name(domain, action),
        )
        .await
    }

    pub async fn invalidate_cache(
        &self,
        domain: Domain,
        entity: &EntityKey,
        version: u64,
        timeout: Duration,
    ) -> Result<()> {
        let agent = self.get(domain)?;
        execute_with_timeout(
            agent.invalidate_cache(entity, version),
            timeout,
            &step_name(domain, "invalidate_cache"),
        )
        .await
    }
}

fn step_name(domain: Domain, action: &str) -> String {
    format!("{}.{}", domain.as_str(), action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedAgent;

    #[tokio::test]
    async fn test_registration_order_and_drain() {
        let directory = AgentDirectory::new(Duration::from_millis(100));
        directory.register(Arc::new(ScriptedAgent::new(Domain::Model))).unwrap();
        directory.register(Arc::new(ScriptedAgent::new(Domain::Device))).unwrap();
        directory.register(Arc::new(ScriptedAgent::new(Domain::Inference))).unwrap();

        let err = directory
            .register(Arc::new(ScriptedAgent::new(Domain::Device)))
            .unwrap_err();
        assert_eq!(err.code(), "ALREADY_EXISTS");

        assert_eq!(directory.domains(), vec![Domain::Device, Domain::Model, Domain::Inference]);

        let drained: Vec<Domain> = directory.drain().iter().map(|a| a.domain()).collect();
        assert_eq!(drained, vec![Domain::Inference, Domain::Model, Domain::Device]);
        assert!(directory.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_agent_times_out_with_step_name() {
        let directory = AgentDirectory::new(Duration::from_millis(100));
        directory
            .register(Arc::new(ScriptedAgent::new(Domain::Memory).hanging_action("allocate_kv_cache")))
            .unwrap();

        let (tx, _rx) = mpsc::channel(4);
        let err = directory
            .execute(Domain::Memory, "allocate_kv_cache", Value::Null, tx, Duration::from_millis(50))
            .await
            .unwrap_err();

        match err {
            Error::StepTimeout { step, timeout_ms } => {
                assert_eq!(step, "memory.allocate_kv_cache");
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_agent_is_unreachable() {
        let directory = AgentDirectory::new(Duration::from_millis(100));
        let err = directory
            .health_report(Domain::Postprocessing, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AGENT_UNREACHABLE");
    }
}
