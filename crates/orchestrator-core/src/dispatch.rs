//! Action dispatch
//!
//! Envelope actions are plain strings on the wire. They are resolved once,
//! against a table built at startup, into an [`AgentAction`]; anything not in
//! the table is an `UnknownAction` error rather than a runtime lookup.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use common::error::{Error, Result};
use common::models::{EntityKey, Envelope, ResponseEnvelope};
use common::types::{Domain, ResourceKind};

use crate::agent::{AgentDirectory, AgentReservation, OperationProgress};
use crate::transaction::ResourceClaim;

/// Envelope action resolved against the dispatch table
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AgentAction {
    Reserve,
    Commit,
    Compensate,
    HealthReport,
    InvalidateCache,
    /// Catalog or recovery operation run through `execute_operation`
    Execute(String),
}

impl AgentAction {
    pub fn name(&self) -> &str {
        match self {
            AgentAction::Reserve => "reserve",
            AgentAction::Commit => "commit",
            AgentAction::Compensate => "compensate",
            AgentAction::HealthReport => "health_report",
            AgentAction::InvalidateCache => "invalidate_cache",
            AgentAction::Execute(name) => name,
        }
    }
}

/// Stabilizing operations every agent accepts; used by cascades
pub const RECOVERY_ACTIONS: [&str; 8] = [
    "pause_intake",
    "resume_intake",
    "reconnect",
    "cancel_inflight",
    "release_idle",
    "shed_load",
    "flush_caches",
    "republish_state",
];

/// A catalog operation and its declared resource cost
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSpec {
    pub domain: Domain,
    pub name: String,
    pub cost: Vec<ResourceClaim>,
    pub compensation: Option<String>,
}

type CatalogRow = (Domain, &'static str, &'static [(&'static str, u64)], Option<&'static str>);

const BUILTIN_OPERATIONS: &[CatalogRow] = &[
    (Domain::Device, "acquire_device", &[("device_time", 100)], Some("release_device")),
    (Domain::Device, "release_device", &[], None),
    (Domain::Device, "probe_device", &[], None),
    (Domain::Memory, "allocate_kv_cache", &[("memory_bytes", 1 << 30)], Some("free_kv_cache")),
    (Domain::Memory, "free_kv_cache", &[], None),
    (Domain::Memory, "pin_buffers", &[("memory_bytes", 256 << 20)], Some("unpin_buffers")),
    (Domain::Memory, "unpin_buffers", &[], None),
    (Domain::Model, "load_model", &[("model_slot", 1)], Some("unload_model")),
    (Domain::Model, "unload_model", &[], None),
    (Domain::Model, "warm_up", &[], None),
    (Domain::Processing, "open_session", &[("processing_slot", 1)], Some("close_session")),
    (Domain::Processing, "close_session", &[], None),
    (Domain::Processing, "prepare_batch", &[], Some("discard_batch")),
    (Domain::Processing, "discard_batch", &[], None),
    (Domain::Inference, "run_inference", &[("inference_slot", 1)], Some("cancel_inference")),
    (Domain::Inference, "cancel_inference", &[], None),
    (Domain::Postprocessing, "postprocess", &[("postprocessing_slot", 1)], Some("discard_output")),
    (Domain::Postprocessing, "discard_output", &[], None),
];

/// Data-driven per-domain operation list
#[derive(Debug, Clone, Default)]
pub struct OperationCatalog {
    operations: BTreeMap<(Domain, String), OperationSpec>,
}

impl OperationCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in operation table
    pub fn builtin() -> Self {
        let mut catalog = Self::empty();
        for (domain, name, cost, compensation) in BUILTIN_OPERATIONS {
            catalog.insert(OperationSpec {
                domain: *domain,
                name: name.to_string(),
                cost: cost
                    .iter()
                    .map(|(kind, amount)| ResourceClaim::new(ResourceKind::from(*kind), *amount))
                    .collect(),
                compensation: compensation.map(str::to_string),
            });
        }
        catalog
    }

    pub fn insert(&mut self, spec: OperationSpec) {
        self.operations.insert((spec.domain, spec.name.clone()), spec);
    }

    pub fn get(&self, domain: Domain, name: &str) -> Option<&OperationSpec> {
        self.operations.get(&(domain, name.to_string()))
    }

    /// Operations of one domain
    pub fn operations(&self, domain: Domain) -> Vec<&OperationSpec> {
        self.operations
            .values()
            .filter(|spec| spec.domain == domain)
            .collect()
    }

    /// Returns true if the domain accepts the action
    pub fn accepts(&self, domain: Domain, name: &str) -> bool {
        is_recovery_action(name) || self.get(domain, name).is_some()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

pub fn is_recovery_action(name: &str) -> bool {
    RECOVERY_ACTIONS.contains(&name)
}

#[derive(Deserialize)]
struct AllocationPayload {
    allocation_id: Uuid,
}

#[derive(Deserialize)]
struct InvalidatePayload {
    entity: EntityKey,
    version: u64,
}

#[derive(Deserialize)]
struct ExecutePayload {
    operation: String,
    #[serde(default)]
    payload: Value,
}

/// Routes actions to the agents
pub struct ActionDispatcher {
    agents: Arc<AgentDirectory>,
    catalog: Arc<OperationCatalog>,
    table: HashMap<String, AgentAction>,
}

impl ActionDispatcher {
    /// Builds the dispatch table from the fixed agent actions and the catalog
    pub fn new(agents: Arc<AgentDirectory>, catalog: Arc<OperationCatalog>) -> Self {
        let mut table = HashMap::new();
        for action in [
            AgentAction::Reserve,
            AgentAction::Commit,
            AgentAction::Compensate,
            AgentAction::HealthReport,
            AgentAction::InvalidateCache,
        ] {
            table.insert(action.name().to_string(), action);
        }
        for name in RECOVERY_ACTIONS {
            table.insert(name.to_string(), AgentAction::Execute(name.to_string()));
        }
        for spec in catalog.operations.values() {
            table.insert(spec.name.clone(), AgentAction::Execute(spec.name.clone()));
        }

        debug!(actions = table.len(), "Dispatch table built");

        Self { agents, catalog, table }
    }

    pub fn catalog(&self) -> &OperationCatalog {
        &self.catalog
    }

    pub fn agents(&self) -> &Arc<AgentDirectory> {
        &self.agents
    }

    /// Resolves an action name
    pub fn resolve(&self, action: &str) -> Result<AgentAction> {
        self.table
            .get(action)
            .cloned()
            .ok_or_else(|| Error::UnknownAction(action.to_string()))
    }

    /// Resolves an action name for a specific domain
    ///
    /// Catalog operations only resolve on the domain that declares them.
    pub fn resolve_for(&self, domain: Domain, action: &str) -> Result<AgentAction> {
        let resolved = self.resolve(action)?;
        if let AgentAction::Execute(name) = &resolved {
            if !self.catalog.accepts(domain, name) {
                return Err(Error::UnknownAction(format!("{}.{}", domain.as_str(), name)));
            }
        }
        Ok(resolved)
    }

    /// Calls an action on a domain's agent
    pub async fn call(&self, domain: Domain, action: &str, payload: Value, timeout: Duration) -> Result<Value> {
        let resolved = if action == "execute" {
            let execute: ExecutePayload = serde_json::from_value(payload)?;
            return self.execute(domain, &execute.operation, execute.payload, timeout).await;
        } else {
            self.resolve_for(domain, action)?
        };

        match resolved {
            AgentAction::Reserve => {
                let reservation: AgentReservation = serde_json::from_value(payload)?;
                let vote = self.agents.reserve(domain, &reservation, timeout).await?;
                Ok(serde_json::to_value(vote)?)
            }
            AgentAction::Commit => {
                let target: AllocationPayload = serde_json::from_value(payload)?;
                self.agents.commit(domain, target.allocation_id, timeout).await?;
                Ok(json!({ "allocation_id": target.allocation_id }))
            }
            AgentAction::Compensate => {
                let target: AllocationPayload = serde_json::from_value(payload)?;
                self.agents.compensate(domain, target.allocation_id, timeout).await?;
                Ok(json!({ "allocation_id": target.allocation_id }))
            }
            AgentAction::HealthReport => {
                let report = self.agents.health_report(domain, timeout).await?;
                Ok(serde_json::to_value(report)?)
            }
            AgentAction::InvalidateCache => {
                let target: InvalidatePayload = serde_json::from_value(payload)?;
                self.agents
                    .invalidate_cache(domain, &target.entity, target.version, timeout)
                    .await?;
                Ok(json!({ "entity": target.entity, "version": target.version }))
            }
            AgentAction::Execute(name) => self.execute(domain, &name, payload, timeout).await,
        }
    }

    async fn execute(&self, domain: Domain, operation: &str, payload: Value, timeout: Duration) -> Result<Value> {
        if !self.catalog.accepts(domain, operation) {
            return Err(Error::UnknownAction(format!("{}.{}", domain.as_str(), operation)));
        }

        let (progress_tx, mut progress_rx) = mpsc::channel::<OperationProgress>(16);
        let drain = tokio::spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                trace!(
                    domain = %progress.domain,
                    action = %progress.action,
                    fraction = progress.fraction,
                    "Operation progress"
                );
            }
        });

        let result = self.agents.execute(domain, operation, payload, progress_tx, timeout).await;
        drain.abort();
        result
    }

    /// Handles a request envelope
    pub async fn dispatch(&self, envelope: &Envelope) -> ResponseEnvelope {
        match self
            .call(envelope.domain, &envelope.action, envelope.payload.clone(), envelope.timeout())
            .await
        {
            Ok(data) => ResponseEnvelope::ok(envelope.correlation_id.clone(), data),
            Err(e) => {
                warn!(
                    domain = %envelope.domain,
                    action = %envelope.action,
                    correlation_id = %envelope.correlation_id,
                    "Dispatch failed: {}",
                    e
                );
                ResponseEnvelope::failure(envelope.correlation_id.clone(), &e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{AgentCall, ScriptedAgent};
    use common::types::EventPriority;

    fn dispatcher() -> (ActionDispatcher, Arc<ScriptedAgent>) {
        let agents = Arc::new(AgentDirectory::new(Duration::from_millis(200)));
        let model = Arc::new(ScriptedAgent::new(Domain::Model));
        agents.register(model.clone()).unwrap();
        (ActionDispatcher::new(agents, Arc::new(OperationCatalog::builtin())), model)
    }

    #[test]
    fn test_catalog_costs() {
        let catalog = OperationCatalog::builtin();
        let load = catalog.get(Domain::Model, "load_model").unwrap();
        assert_eq!(load.cost, vec![ResourceClaim::new(ResourceKind::ModelSlot, 1)]);
        assert_eq!(load.compensation.as_deref(), Some("unload_model"));
        assert!(catalog.accepts(Domain::Inference, "shed_load"));
        assert!(!catalog.accepts(Domain::Inference, "load_model"));
    }

    #[test]
    fn test_resolution() {
        let (dispatcher, _) = dispatcher();
        assert_eq!(dispatcher.resolve("commit").unwrap(), AgentAction::Commit);
        assert_eq!(
            dispatcher.resolve_for(Domain::Model, "load_model").unwrap(),
            AgentAction::Execute("load_model".into())
        );
        assert_eq!(dispatcher.resolve("teleport").unwrap_err().code(), "UNKNOWN_ACTION");
        assert!(dispatcher.resolve_for(Domain::Device, "load_model").is_err());
    }

    #[tokio::test]
    async fn test_dispatch_envelopes() {
        let (dispatcher, model) = dispatcher();

        let health = Envelope::new(Domain::Model, "health_report", EventPriority::P1, json!({}));
        let response = dispatcher.dispatch(&health).await;
        assert!(response.success);
        assert_eq!(response.correlation_id, health.correlation_id);
        assert_eq!(response.data.unwrap()["domain"], "Model");

        let load = Envelope::new(Domain::Model, "execute", EventPriority::P2, json!({
            "operation": "load_model",
            "payload": {"model": "m"}
        }));
        assert!(dispatcher.dispatch(&load).await.success);

        let unknown = Envelope::new(Domain::Model, "frobnicate", EventPriority::P2, json!({}));
        let response = dispatcher.dispatch(&unknown).await;
        assert!(!response.success);
        assert_eq!(response.error_code.as_deref(), Some("UNKNOWN_ACTION"));

        assert_eq!(model.calls(), vec![AgentCall::HealthReport, AgentCall::Execute("load_model".into())]);
    }
}
