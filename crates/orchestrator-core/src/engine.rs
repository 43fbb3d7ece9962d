//! Orchestration engine
//!
//! Wires the registry, ledger, bus, agents and the coordination components
//! together and owns the background loops: failure signals, conflict queue
//! re-evaluation, consistency monitoring, bus redelivery, preemption
//! handling and retention sweeps.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::error::{Error, Result};
use common::types::{DegradationMode, Domain, Owner};
use event_bus::{BusSettings, PropagationBus};
use resource_manager::{ledger_from_config, AllocationLedger, DomainRegistry};
use settings::ConfigManager;
use storage_adapter::{PersistenceSettings, StorageManager};

use crate::agent::{AgentDirectory, DomainAgent};
use crate::cascade::{CascadeOrchestrator, CascadeReport, CascadeSettings, FailureKind, FailureSignal};
use crate::compensation::Compensator;
use crate::conflict::{Admission, ConflictRequest, ConflictResolver, PreemptionNotice, ResolverSettings};
use crate::consistency::{ConsistencyMonitor, MonitorSettings};
use crate::coordinator::{CoordinatorParts, CoordinatorSettings, TransactionCoordinator};
use crate::degradation::{ModeController, RecoverySettings, RecoveryValidator};
use crate::dispatch::{ActionDispatcher, OperationCatalog};
use crate::lifecycle::LifecycleManager;
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::priority::PriorityScorer;
use crate::state::OrchestratorState;
use crate::transaction::{OperationRequest, TransactionResult};

/// State entity an agent owns, registered with the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySeed {
    pub key: String,
    pub owner: Owner,
    #[serde(default)]
    pub value: Value,
}

impl EntitySeed {
    pub fn new(key: impl Into<String>, owner: Owner, value: Value) -> Self {
        Self {
            key: key.into(),
            owner,
            value,
        }
    }
}

/// The main orchestration engine
pub struct OrchestratorEngine {
    /// Configuration manager
    config_manager: Arc<ConfigManager>,

    ledger: Arc<AllocationLedger>,
    registry: Arc<DomainRegistry>,
    bus: Arc<PropagationBus>,
    agents: Arc<AgentDirectory>,
    dispatcher: Arc<ActionDispatcher>,
    modes: Arc<ModeController>,
    resolver: Arc<ConflictResolver>,
    cascade: Arc<CascadeOrchestrator>,
    monitor: Arc<ConsistencyMonitor>,
    coordinator: Arc<TransactionCoordinator>,
    storage: Arc<StorageManager>,
    metrics: Arc<EngineMetrics>,

    /// Lifecycle manager
    lifecycle: LifecycleManager,

    /// Failure signals from every component
    signals_tx: mpsc::UnboundedSender<FailureSignal>,

    /// Taken by the signal loop at start
    signals_rx: Mutex<Option<mpsc::UnboundedReceiver<FailureSignal>>>,

    /// Taken by the preemption loop at start
    notices_rx: Mutex<Option<mpsc::UnboundedReceiver<PreemptionNotice>>>,
}

impl OrchestratorEngine {
    /// Creates an engine, opening storage as configured
    pub async fn new(config_manager: Arc<ConfigManager>) -> Result<Self> {
        let persistence = PersistenceSettings::from_config(&config_manager);
        let storage = StorageManager::open(&persistence).await?;
        Self::with_storage(config_manager, Arc::new(storage))
    }

    /// Creates an engine over the given storage
    pub fn with_storage(config_manager: Arc<ConfigManager>, storage: Arc<StorageManager>) -> Result<Self> {
        let coordinator_settings = CoordinatorSettings::from_config(&config_manager);

        let ledger = ledger_from_config(&config_manager)?;
        let registry = Arc::new(DomainRegistry::new());
        let bus = Arc::new(PropagationBus::new(BusSettings::from_config(&config_manager)));
        let agents = Arc::new(AgentDirectory::new(coordinator_settings.default_step_timeout));
        let dispatcher = Arc::new(ActionDispatcher::new(agents.clone(), Arc::new(OperationCatalog::builtin())));
        let modes = Arc::new(ModeController::new());
        let metrics = Arc::new(EngineMetrics::new());

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let (resolver, notices_rx) = ConflictResolver::new(
            ledger.clone(),
            PriorityScorer::from_config(&config_manager)?,
            modes.clone(),
            ResolverSettings::from_config(&config_manager),
        );
        let resolver = Arc::new(resolver);

        let compensator = Arc::new(Compensator::new(agents.clone(), dispatcher.clone(), ledger.clone()));

        let cascade = Arc::new(CascadeOrchestrator::new(
            compensator.clone(),
            agents.clone(),
            modes.clone(),
            CascadeSettings::from_config(&config_manager),
        ));

        let recovery = Arc::new(RecoveryValidator::new(
            ledger.clone(),
            agents.clone(),
            dispatcher.clone(),
            modes.clone(),
            RecoverySettings::from_config(&config_manager),
        ));

        let monitor = Arc::new(ConsistencyMonitor::new(
            registry.clone(),
            agents.clone(),
            bus.clone(),
            modes.clone(),
            recovery,
            signals_tx.clone(),
            MonitorSettings::from_config(&config_manager),
        ));

        let coordinator = Arc::new(TransactionCoordinator::new(
            CoordinatorParts {
                agents: agents.clone(),
                dispatcher: dispatcher.clone(),
                registry: registry.clone(),
                ledger: ledger.clone(),
                bus: bus.clone(),
                resolver: resolver.clone(),
                compensator,
                modes: modes.clone(),
                storage: storage.clone(),
                metrics: metrics.clone(),
                signals: signals_tx.clone(),
            },
            coordinator_settings,
        ));

        info!(
            pools = ledger.pool_count(),
            durable = storage.is_durable(),
            "Orchestration engine created"
        );

        Ok(Self {
            config_manager,
            ledger,
            registry,
            bus,
            agents,
            dispatcher,
            modes,
            resolver,
            cascade,
            monitor,
            coordinator,
            storage,
            metrics,
            lifecycle: LifecycleManager::new(),
            signals_tx,
            signals_rx: Mutex::new(Some(signals_rx)),
            notices_rx: Mutex::new(Some(notices_rx)),
        })
    }

    pub fn config(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }

    pub fn ledger(&self) -> &Arc<AllocationLedger> {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<DomainRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<PropagationBus> {
        &self.bus
    }

    pub fn agents(&self) -> &Arc<AgentDirectory> {
        &self.agents
    }

    pub fn dispatcher(&self) -> &Arc<ActionDispatcher> {
        &self.dispatcher
    }

    pub fn coordinator(&self) -> &Arc<TransactionCoordinator> {
        &self.coordinator
    }

    pub fn cascade(&self) -> &Arc<CascadeOrchestrator> {
        &self.cascade
    }

    pub fn monitor(&self) -> &Arc<ConsistencyMonitor> {
        &self.monitor
    }

    pub fn storage(&self) -> &Arc<StorageManager> {
        &self.storage
    }

    pub fn resolver(&self) -> &Arc<ConflictResolver> {
        &self.resolver
    }

    /// Current degradation mode
    pub fn mode(&self) -> DegradationMode {
        self.modes.current()
    }

    pub fn modes(&self) -> &Arc<ModeController> {
        &self.modes
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn state(&self) -> OrchestratorState {
        self.lifecycle.state().await
    }

    /// Registers a domain agent and the state entities its domain owns
    pub fn register_agent(&self, agent: Arc<dyn DomainAgent>, seeds: Vec<EntitySeed>) -> Result<()> {
        let domain = agent.domain();
        self.agents.register(agent)?;

        for seed in seeds {
            if let Err(e) = self.registry.register(domain, &seed.key, seed.owner, seed.value) {
                self.agents.deregister(domain);
                self.registry.teardown(domain);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Removes a domain's agent and its state entities
    pub fn deregister_agent(&self, domain: Domain) -> Result<()> {
        if self.agents.deregister(domain).is_none() {
            return Err(Error::NotFound(format!("Agent for domain {}", domain)));
        }
        let removed = self.registry.teardown(domain);
        debug!(%domain, removed, "Domain state torn down");
        Ok(())
    }

    /// Runs a multi-domain transaction to a terminal state
    pub async fn submit(&self, request: OperationRequest) -> Result<TransactionResult> {
        let state = self.lifecycle.state().await;
        if state.is_stopping() || state.is_stopped() {
            return Err(Error::InvalidState(format!("Engine is {}", state)));
        }
        self.coordinator.submit(request).await
    }

    /// Cancels a transaction still in Preparing or Executing
    pub fn cancel(&self, transaction_id: &str) -> Result<()> {
        self.coordinator.cancel(transaction_id)
    }

    /// Arbitrates a standalone resource claim
    pub fn admit(&self, request: ConflictRequest) -> Admission {
        let admission = self.resolver.admit(request);
        self.metrics.record_preemptions(admission.preempted().len());
        admission
    }

    /// Queues a failure signal for the cascade loop
    pub fn report_failure(&self, signal: FailureSignal) -> Result<()> {
        self.signals_tx
            .send(signal)
            .map_err(|_| Error::InvalidState("Failure signal loop is not running".to_string()))
    }

    /// Runs the cascade for a failure signal and waits for its report
    pub async fn handle_failure(&self, signal: FailureSignal) -> CascadeReport {
        let report = self.cascade.handle(signal).await;
        self.metrics.record_cascade(&report);
        report
    }

    /// Restores persisted state and starts the background loops
    pub async fn start(&self) -> Result<()> {
        info!("Starting orchestration engine");

        let (signals_rx, notices_rx) = match (self.signals_rx.lock().take(), self.notices_rx.lock().take()) {
            (Some(signals), Some(notices)) => (signals, notices),
            _ => return Err(Error::InvalidState("Engine already started".to_string())),
        };

        if let Err(e) = self.restore().await {
            error!("Startup recovery failed: {}", e);
            self.lifecycle.handle_error(&e.to_string()).await?;
            return Err(e);
        }

        let cancel = self.lifecycle.shutdown_token();

        self.lifecycle.spawn(
            "failure-signals",
            signal_loop(self.cascade.clone(), self.metrics.clone(), signals_rx, cancel.clone()),
        );
        self.lifecycle.spawn(
            "preemption-notices",
            preemption_loop(self.coordinator.clone(), notices_rx, cancel.clone()),
        );
        self.lifecycle
            .spawn("conflict-resolver", self.resolver.clone().run(cancel.clone()));
        self.lifecycle
            .spawn("consistency-monitor", self.monitor.clone().run(cancel.clone()));
        self.lifecycle.spawn(
            "bus-redelivery",
            redelivery_loop(self.bus.clone(), self.signals_tx.clone(), cancel.clone()),
        );
        self.lifecycle
            .spawn("retention-sweep", retention_loop(self.coordinator.clone(), cancel));

        self.lifecycle.transition_to(OrchestratorState::Running).await?;

        info!(tasks = self.lifecycle.task_count(), "Orchestration engine started");

        Ok(())
    }

    /// Restores the ledger snapshot, replays the journal and releases orphans
    async fn restore(&self) -> Result<()> {
        if let Some(store) = self.storage.snapshots() {
            if let Some(snapshot) = store.load().await? {
                info!(
                    allocations = snapshot.allocations.len(),
                    taken_at = %snapshot.taken_at,
                    "Restoring ledger snapshot"
                );
                self.ledger.restore(snapshot)?;
            }
        }

        let records = self.storage.journal().load().await?;
        if !records.is_empty() {
            let recovered = self.coordinator.recover(records).await;
            info!(recovered = recovered.len(), "Transaction journal replayed");
        }

        let orphans = self.coordinator.reconcile_orphans();
        if orphans > 0 {
            warn!(orphans, "Orphaned allocations released at startup");
        }

        Ok(())
    }

    /// Stops the background loops and persists the ledger
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping orchestration engine");

        let grace = self.coordinator.settings().default_step_timeout;
        self.lifecycle.shutdown(grace).await?;

        self.resolver.drain("Engine stopped");
        self.bus.close();
        self.coordinator.save_snapshot().await;

        info!("Orchestration engine stopped");

        Ok(())
    }
}

async fn signal_loop(
    cascade: Arc<CascadeOrchestrator>,
    metrics: Arc<EngineMetrics>,
    mut signals: mpsc::UnboundedReceiver<FailureSignal>,
    cancel: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            _ = cancel.cancelled() => break,
            signal = signals.recv() => match signal {
                Some(signal) => signal,
                None => break,
            },
        };
        let report = cascade.handle(signal).await;
        metrics.record_cascade(&report);
    }
    debug!("Failure signal loop stopped");
}

async fn preemption_loop(
    coordinator: Arc<TransactionCoordinator>,
    mut notices: mpsc::UnboundedReceiver<PreemptionNotice>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            notice = notices.recv() => match notice {
                Some(notice) => coordinator.handle_preemption(notice).await,
                None => break,
            },
        }
    }
    debug!("Preemption loop stopped");
}

async fn redelivery_loop(
    bus: Arc<PropagationBus>,
    signals: mpsc::UnboundedSender<FailureSignal>,
    cancel: CancellationToken,
) {
    let ack_timeout = bus.settings().ack_timeout;
    let mut interval = tokio::time::interval(bus.settings().redelivery_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let report = bus.redeliver_unacked(ack_timeout);
                for domain in report.unreachable_domains() {
                    let _ = signals.send(FailureSignal::new(
                        domain,
                        FailureKind::AgentUnreachable,
                        "bus deliveries never acknowledged",
                    ));
                }
            }
        }
    }
    debug!("Redelivery loop stopped");
}

async fn retention_loop(coordinator: Arc<TransactionCoordinator>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(coordinator.settings().gc_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = coordinator.collect_garbage().await {
                    warn!("Retention sweep failed: {}", e);
                }
            }
        }
    }
    debug!("Retention loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::CascadeState;
    use crate::testing::ScriptedAgent;
    use crate::transaction::TransactionStep;
    use serde_json::json;

    fn engine() -> OrchestratorEngine {
        let config = Arc::new(ConfigManager::defaults().unwrap());
        OrchestratorEngine::with_storage(config, Arc::new(StorageManager::in_memory())).unwrap()
    }

    #[tokio::test]
    async fn test_engine_lifecycle() {
        let engine = engine();
        engine
            .register_agent(
                Arc::new(ScriptedAgent::new(Domain::Model)),
                vec![EntitySeed::new("active_model", Owner::Agent, json!(null))],
            )
            .unwrap();
        assert_eq!(engine.registry().read(Domain::Model, "active_model").unwrap().version, 1);

        engine.start().await.unwrap();
        assert!(engine.state().await.is_running());
        assert!(engine.start().await.is_err());

        let result = engine
            .submit(OperationRequest::saga("tx-1").with_step(TransactionStep::new(Domain::Model, "load_model")))
            .await
            .unwrap();
        assert!(result.is_committed());
        assert_eq!(engine.metrics().transactions_committed, 1);

        engine.stop().await.unwrap();
        assert!(engine.state().await.is_stopped());

        let err = engine
            .submit(OperationRequest::saga("tx-2").with_step(TransactionStep::new(Domain::Model, "warm_up")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_deregister_tears_down_domain_state() {
        let engine = engine();
        engine
            .register_agent(
                Arc::new(ScriptedAgent::new(Domain::Device)),
                vec![EntitySeed::new("device_state", Owner::Controller, json!({"ready": true}))],
            )
            .unwrap();

        engine.deregister_agent(Domain::Device).unwrap();
        assert!(engine.registry().read(Domain::Device, "device_state").is_err());
        assert!(engine.deregister_agent(Domain::Device).unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_handle_failure_records_cascade() {
        let engine = engine();
        engine
            .register_agent(Arc::new(ScriptedAgent::new(Domain::Memory)), Vec::new())
            .unwrap();

        let report = engine
            .handle_failure(FailureSignal::new(Domain::Memory, FailureKind::AgentUnreachable, "heartbeat lost"))
            .await;
        assert!(matches!(
            report.state,
            CascadeState::Stabilized | CascadeState::PartiallyStabilized | CascadeState::Failed
        ));
        assert_eq!(engine.metrics().failure_signals, 1);
    }
}
