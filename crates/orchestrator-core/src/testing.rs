//! Scripted in-memory domain agents
//!
//! [`ScriptedAgent`] stands in for a real worker in tests and dry runs. It
//! holds no capacity of its own: reservations it votes on were already
//! granted by the ledger, so every outcome still goes through the real
//! ledger and registry.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use common::error::{Error, Result};
use common::models::{AllocationId, CachedVersion, EntityKey, HealthReport, HealthStatus, TransactionId, Vote};
use common::types::Domain;

use crate::agent::{AgentReservation, DomainAgent, OperationProgress};

/// A call received by a scripted agent
#[derive(Debug, Clone, PartialEq)]
pub enum AgentCall {
    Reserve(TransactionId),
    Commit(AllocationId),
    Compensate(AllocationId),
    Execute(String),
    HealthReport,
    InvalidateCache(EntityKey, u64),
}

/// Call log shared by several agents, in arrival order
#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<(Domain, AgentCall)>>,
}

impl CallLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, domain: Domain, call: AgentCall) {
        self.calls.lock().push((domain, call));
    }

    pub fn calls(&self) -> Vec<(Domain, AgentCall)> {
        self.calls.lock().clone()
    }

    /// Executed action names across all agents, in order
    pub fn executed(&self) -> Vec<(Domain, String)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|(domain, call)| match call {
                AgentCall::Execute(action) => Some((*domain, action.clone())),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug)]
struct Script {
    vote: Vote,
    failing_actions: HashSet<String>,
    hanging_actions: HashSet<String>,
    hang_reserve: bool,
    fail_compensate: bool,
    fail_commit: bool,
    fail_invalidate: bool,
    ignore_invalidate: bool,
    unreachable: bool,
    status: HealthStatus,
    metrics: HashMap<String, f64>,
    cached: BTreeMap<EntityKey, u64>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            vote: Vote::Commit,
            failing_actions: HashSet::new(),
            hanging_actions: HashSet::new(),
            hang_reserve: false,
            fail_compensate: false,
            fail_commit: false,
            fail_invalidate: false,
            ignore_invalidate: false,
            unreachable: false,
            status: HealthStatus::Healthy,
            metrics: HashMap::new(),
            cached: BTreeMap::new(),
        }
    }
}

/// Domain agent whose behaviour is set up front and adjustable at run time
pub struct ScriptedAgent {
    domain: Domain,
    script: Mutex<Script>,
    calls: Mutex<Vec<AgentCall>>,
    shared_log: Option<Arc<CallLog>>,
}

impl ScriptedAgent {
    /// A healthy agent that votes commit and succeeds at everything
    pub fn new(domain: Domain) -> Self {
        Self {
            domain,
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Vec::new()),
            shared_log: None,
        }
    }

    pub fn voting(self, vote: Vote) -> Self {
        self.script.lock().vote = vote;
        self
    }

    pub fn failing_action(self, action: &str) -> Self {
        self.script.lock().failing_actions.insert(action.to_string());
        self
    }

    pub fn hanging_action(self, action: &str) -> Self {
        self.script.lock().hanging_actions.insert(action.to_string());
        self
    }

    pub fn hanging_reserve(self) -> Self {
        self.script.lock().hang_reserve = true;
        self
    }

    pub fn failing_compensation(self) -> Self {
        self.script.lock().fail_compensate = true;
        self
    }

    pub fn failing_commit(self) -> Self {
        self.script.lock().fail_commit = true;
        self
    }

    /// Acknowledges invalidations but keeps serving the stale cache
    pub fn ignoring_invalidate(self) -> Self {
        self.script.lock().ignore_invalidate = true;
        self
    }

    pub fn with_metric(self, name: &str, value: f64) -> Self {
        self.set_metric(name, value);
        self
    }

    pub fn with_call_log(mut self, log: Arc<CallLog>) -> Self {
        self.shared_log = Some(log);
        self
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.script.lock().unreachable = unreachable;
    }

    pub fn set_status(&self, status: HealthStatus) {
        self.script.lock().status = status;
    }

    pub fn set_metric(&self, name: &str, value: f64) {
        self.script.lock().metrics.insert(name.to_string(), value);
    }

    pub fn set_failing_invalidate(&self, failing: bool) {
        self.script.lock().fail_invalidate = failing;
    }

    pub fn set_action_failing(&self, action: &str, failing: bool) {
        let mut script = self.script.lock();
        if failing {
            script.failing_actions.insert(action.to_string());
        } else {
            script.failing_actions.remove(action);
        }
    }

    /// Records a cached copy of another domain's entity
    pub fn cache_version(&self, entity: EntityKey, version: u64) {
        self.script.lock().cached.insert(entity, version);
    }

    pub fn cached_version(&self, entity: &EntityKey) -> Option<u64> {
        self.script.lock().cached.get(entity).copied()
    }

    pub fn calls(&self) -> Vec<AgentCall> {
        self.calls.lock().clone()
    }

    /// Allocations this agent was asked to compensate
    pub fn compensated(&self) -> Vec<AllocationId> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                AgentCall::Compensate(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    /// Executed action names, in order
    pub fn executed(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                AgentCall::Execute(action) => Some(action.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: AgentCall) {
        if let Some(log) = &self.shared_log {
            log.push(self.domain, call.clone());
        }
        self.calls.lock().push(call);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.script.lock().unreachable {
            return Err(Error::AgentUnreachable {
                domain: self.domain,
                reason: "scripted outage".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl DomainAgent for ScriptedAgent {
    fn domain(&self) -> Domain {
        self.domain
    }

    async fn reserve(&self, reservation: &AgentReservation) -> Result<Vote> {
        self.check_reachable()?;
        self.record(AgentCall::Reserve(reservation.transaction_id.clone()));

        let (hang, vote) = {
            let script = self.script.lock();
            (script.hang_reserve, script.vote.clone())
        };
        if hang {
            futures::future::pending::<()>().await;
        }
        Ok(vote)
    }

    async fn commit(&self, allocation_id: AllocationId) -> Result<()> {
        self.check_reachable()?;
        self.record(AgentCall::Commit(allocation_id));
        if self.script.lock().fail_commit {
            return Err(Error::Internal(format!("{} agent failed to commit", self.domain)));
        }
        Ok(())
    }

    async fn compensate(&self, allocation_id: AllocationId) -> Result<()> {
        self.check_reachable()?;
        self.record(AgentCall::Compensate(allocation_id));
        if self.script.lock().fail_compensate {
            return Err(Error::Internal(format!("{} agent failed to compensate", self.domain)));
        }
        Ok(())
    }

    async fn health_report(&self) -> Result<HealthReport> {
        self.check_reachable()?;
        self.record(AgentCall::HealthReport);

        let script = self.script.lock();
        Ok(HealthReport {
            domain: self.domain,
            status: script.status,
            metrics: script.metrics.clone(),
            cached_versions: script
                .cached
                .iter()
                .map(|(entity, version)| CachedVersion {
                    entity: entity.clone(),
                    version: *version,
                })
                .collect(),
            reported_at: Utc::now(),
        })
    }

    async fn execute_operation(
        &self,
        action: &str,
        payload: Value,
        progress: mpsc::Sender<OperationProgress>,
    ) -> Result<Value> {
        self.check_reachable()?;
        self.record(AgentCall::Execute(action.to_string()));

        let (hang, fail) = {
            let script = self.script.lock();
            (
                script.hanging_actions.contains(action),
                script.failing_actions.contains(action),
            )
        };

        let _ = progress
            .send(OperationProgress {
                domain: self.domain,
                action: action.to_string(),
                fraction: 0.0,
                message: None,
            })
            .await;

        if hang {
            futures::future::pending::<()>().await;
        }
        if fail {
            return Err(Error::Internal(format!("{}.{} failed", self.domain.as_str(), action)));
        }

        let _ = progress
            .send(OperationProgress {
                domain: self.domain,
                action: action.to_string(),
                fraction: 1.0,
                message: Some("done".to_string()),
            })
            .await;

        Ok(json!({ "domain": self.domain, "action": action, "input": payload }))
    }

    async fn invalidate_cache(&self, entity: &EntityKey, version: u64) -> Result<()> {
        self.check_reachable()?;
        self.record(AgentCall::InvalidateCache(entity.clone(), version));

        let mut script = self.script.lock();
        if script.fail_invalidate {
            return Err(Error::AgentUnreachable {
                domain: self.domain,
                reason: format!("cache of {} not refreshed", entity),
            });
        }
        if script.ignore_invalidate {
            return Ok(());
        }
        // A refetch after invalidation observes the owner's current version
        if let Some(cached) = script.cached.get_mut(entity) {
            *cached = (*cached).max(version);
        }
        Ok(())
    }
}
