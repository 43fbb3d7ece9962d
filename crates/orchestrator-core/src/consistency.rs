//! Consistency monitor
//!
//! Periodically compares each mirrored entity's authoritative version in the
//! registry with the cached versions the dependents report, and repairs
//! drift by bumping the owner's version, republishing it and asking every
//! holder to drop its cache. Repairs that do not take are handed to the
//! cascade orchestrator as domain-health signals, and so is memory pressure;
//! the monitor never changes the degradation mode itself.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::models::{EntityKey, Envelope};
use common::types::{DegradationMode, Domain, EventPriority};
use event_bus::PropagationBus;
use resource_manager::DomainRegistry;
use settings::ConfigManager;

use crate::agent::AgentDirectory;
use crate::cascade::{FailureKind, FailureSignal};
use crate::degradation::{MemoryTier, ModeController, RecoveryValidator};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    /// Aggregate score below which a repair pass runs
    pub threshold: f64,
    /// Score a repair pass must reach
    pub repair_target: f64,
    pub agent_timeout: Duration,
    /// Health reports older than this count as missing
    pub max_staleness: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            threshold: 0.90,
            repair_target: 0.95,
            agent_timeout: Duration::from_secs(2),
            max_staleness: Duration::from_secs(30),
        }
    }
}

impl MonitorSettings {
    pub fn from_config(config_manager: &ConfigManager) -> Self {
        let defaults = Self::default();
        Self {
            interval: config_manager
                .get_duration("monitor.interval_ms")
                .unwrap_or(defaults.interval),
            threshold: config_manager
                .get_f64("monitor.threshold")
                .unwrap_or(defaults.threshold),
            repair_target: config_manager
                .get_f64("monitor.repair_target")
                .unwrap_or(defaults.repair_target),
            agent_timeout: config_manager
                .get_duration("monitor.agent_timeout_ms")
                .unwrap_or(defaults.agent_timeout),
            max_staleness: config_manager
                .get_duration("monitor.max_staleness_ms")
                .unwrap_or(defaults.max_staleness),
        }
    }
}

/// Agreement on one mirrored entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityScore {
    pub entity: EntityKey,
    pub owner_version: u64,
    /// Domains caching the entity with their cached version
    pub holders: Vec<(Domain, u64)>,
    /// Fraction of holders agreeing with the owner
    pub score: f64,
}

impl EntityScore {
    pub fn stale_holders(&self) -> Vec<Domain> {
        self.holders
            .iter()
            .filter(|(_, version)| *version != self.owner_version)
            .map(|(domain, _)| *domain)
            .collect()
    }

    pub fn is_stale(&self) -> bool {
        self.score < 1.0
    }
}

/// Result of one scoring pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// Mean entity score, 1.0 when nothing is mirrored
    pub score: f64,
    pub entities: Vec<EntityScore>,
    /// Domains whose health report could not be obtained
    pub unreachable: Vec<Domain>,
    pub taken_at: DateTime<Utc>,
}

impl ConsistencyReport {
    pub fn stale_entities(&self) -> impl Iterator<Item = &EntityScore> {
        self.entities.iter().filter(|e| e.is_stale())
    }
}

/// Result of a repair pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairOutcome {
    pub before: f64,
    pub after: f64,
    pub bumped: Vec<EntityKey>,
    /// Holders that could not be told to refresh
    pub failed_domains: Vec<Domain>,
}

/// Background consistency monitor
pub struct ConsistencyMonitor {
    registry: Arc<DomainRegistry>,
    agents: Arc<AgentDirectory>,
    bus: Arc<PropagationBus>,
    modes: Arc<ModeController>,
    recovery: Arc<RecoveryValidator>,
    signals: mpsc::UnboundedSender<FailureSignal>,
    settings: MonitorSettings,
    last_report: Mutex<Option<ConsistencyReport>>,
}

impl ConsistencyMonitor {
    pub fn new(
        registry: Arc<DomainRegistry>,
        agents: Arc<AgentDirectory>,
        bus: Arc<PropagationBus>,
        modes: Arc<ModeController>,
        recovery: Arc<RecoveryValidator>,
        signals: mpsc::UnboundedSender<FailureSignal>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            registry,
            agents,
            bus,
            modes,
            recovery,
            signals,
            settings,
            last_report: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    pub fn last_report(&self) -> Option<ConsistencyReport> {
        self.last_report.lock().clone()
    }

    /// Scores every mirrored entity against the dependents' reports
    pub async fn score(&self) -> ConsistencyReport {
        let mut holders: BTreeMap<EntityKey, Vec<(Domain, u64)>> = BTreeMap::new();
        let mut unreachable = Vec::new();

        for domain in self.agents.domains() {
            match self.agents.health_report(domain, self.settings.agent_timeout).await {
                Ok(report) => {
                    let age = Utc::now().signed_duration_since(report.reported_at);
                    if age.to_std().map_or(false, |age| age > self.settings.max_staleness) {
                        debug!(%domain, "Health report too old to score");
                        unreachable.push(domain);
                        continue;
                    }
                    for cached in report.cached_versions {
                        holders.entry(cached.entity).or_default().push((domain, cached.version));
                    }
                }
                Err(e) => {
                    debug!(%domain, "No health report: {}", e);
                    unreachable.push(domain);
                }
            }
        }

        let mut entities = Vec::with_capacity(holders.len());
        for (entity, holders) in holders {
            let Ok(owner) = self.registry.read_entity(&entity) else {
                continue;
            };
            let agreeing = holders.iter().filter(|(_, v)| *v == owner.version).count();
            entities.push(EntityScore {
                score: agreeing as f64 / holders.len() as f64,
                entity,
                owner_version: owner.version,
                holders,
            });
        }

        let score = if entities.is_empty() {
            1.0
        } else {
            entities.iter().map(|e| e.score).sum::<f64>() / entities.len() as f64
        };

        let report = ConsistencyReport {
            score,
            entities,
            unreachable,
            taken_at: Utc::now(),
        };
        *self.last_report.lock() = Some(report.clone());
        report
    }

    /// Republishes every stale entity at a bumped version and invalidates
    /// the holders' caches, then re-scores
    pub async fn repair(&self, report: &ConsistencyReport) -> RepairOutcome {
        let mut bumped = Vec::new();
        let mut failed_domains: Vec<Domain> = Vec::new();

        for entity in report.stale_entities() {
            let current = match self.registry.force_bump(&entity.entity) {
                Ok(current) => current,
                Err(e) => {
                    warn!(entity = %entity.entity, "Repair bump failed: {}", e);
                    continue;
                }
            };

            self.bus.publish(
                Envelope::new(
                    entity.entity.domain,
                    "state_changed",
                    EventPriority::P1,
                    json!({
                        "entity": entity.entity,
                        "version": current.version,
                        "value": current.value,
                        "repair": true,
                    }),
                ),
                EventPriority::P1,
            );

            for (holder, _) in &entity.holders {
                if let Err(e) = self
                    .agents
                    .invalidate_cache(*holder, &entity.entity, current.version, self.settings.agent_timeout)
                    .await
                {
                    warn!(entity = %entity.entity, domain = %holder, "Cache invalidation failed: {}", e);
                    if !failed_domains.contains(holder) {
                        failed_domains.push(*holder);
                    }
                }
            }
            bumped.push(entity.entity.clone());
        }

        let after = self.score().await.score;
        info!(
            before = report.score,
            after,
            bumped = bumped.len(),
            failed = failed_domains.len(),
            "Repair pass finished"
        );

        RepairOutcome {
            before: report.score,
            after,
            bumped,
            failed_domains,
        }
    }

    /// One monitoring pass: score, repair, memory pressure, recovery
    pub async fn run_pass(&self) -> ConsistencyReport {
        let report = self.score().await;
        debug!(score = report.score, entities = report.entities.len(), "Consistency scored");

        if report.score < self.settings.threshold {
            warn!(score = report.score, threshold = self.settings.threshold, "Consistency below threshold");
            let outcome = self.repair(&report).await;

            for domain in &outcome.failed_domains {
                self.signal(FailureSignal::new(
                    *domain,
                    FailureKind::AgentUnreachable,
                    format!("cache repair failed, score {:.3}", outcome.after),
                ));
            }

            if outcome.after < self.settings.repair_target {
                let mut holders: Vec<Domain> = report
                    .stale_entities()
                    .flat_map(|e| e.stale_holders())
                    .filter(|domain| !outcome.failed_domains.contains(domain))
                    .collect();
                holders.sort();
                holders.dedup();
                for holder in holders {
                    self.signal(FailureSignal::new(
                        holder,
                        FailureKind::AgentUnreachable,
                        format!(
                            "cache still stale after repair, score {:.3}, target {:.3}",
                            outcome.after, self.settings.repair_target
                        ),
                    ));
                }
            }
        }

        let tier = self.recovery.memory_tier();
        if let Some(mode) = tier.pressure_mode() {
            self.signal(
                FailureSignal::new(Domain::Memory, FailureKind::ResourceExhaustion, format!("memory tier {:?}", tier))
                    .with_mode_floor(mode),
            );
        } else if tier < MemoryTier::High && self.modes.current() != DegradationMode::Normal {
            if let Some(outcome) = self.recovery.attempt().await {
                debug!(restored = outcome.restored, "Recovery attempted");
            }
        }

        report
    }

    fn signal(&self, signal: FailureSignal) {
        if self.signals.send(signal).is_err() {
            debug!("Failure signal dropped, orchestrator not listening");
        }
    }

    /// Runs passes on the configured interval until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_ms = self.settings.interval.as_millis() as u64, "Consistency monitor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.run_pass().await;
                }
            }
        }

        info!("Consistency monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::degradation::RecoverySettings;
    use crate::dispatch::{ActionDispatcher, OperationCatalog};
    use crate::testing::ScriptedAgent;
    use common::types::{Owner, ResourceKind};
    use event_bus::{BusSettings, EventPattern};
    use resource_manager::{AllocationLedger, ReserveRequest};
    use serde_json::Value;

    struct Fixture {
        monitor: ConsistencyMonitor,
        registry: Arc<DomainRegistry>,
        ledger: Arc<AllocationLedger>,
        bus: Arc<PropagationBus>,
        modes: Arc<ModeController>,
        signals: mpsc::UnboundedReceiver<FailureSignal>,
    }

    fn fixture(agents: Vec<Arc<ScriptedAgent>>) -> Fixture {
        let directory = Arc::new(AgentDirectory::new(Duration::from_millis(100)));
        for agent in agents {
            directory.register(agent).unwrap();
        }
        let registry = Arc::new(DomainRegistry::new());
        let ledger = Arc::new(AllocationLedger::new());
        ledger.declare_capacity(Domain::Memory, ResourceKind::MemoryBytes, 100).unwrap();
        let bus = Arc::new(PropagationBus::new(BusSettings::default()));
        let modes = Arc::new(ModeController::new());
        let dispatcher = Arc::new(ActionDispatcher::new(directory.clone(), Arc::new(OperationCatalog::builtin())));
        let recovery = Arc::new(RecoveryValidator::new(
            ledger.clone(),
            directory.clone(),
            dispatcher,
            modes.clone(),
            RecoverySettings {
                cooldown: Duration::ZERO,
                ..RecoverySettings::default()
            },
        ));
        let (tx, signals) = mpsc::unbounded_channel();
        let monitor = ConsistencyMonitor::new(
            registry.clone(),
            directory,
            bus.clone(),
            modes.clone(),
            recovery,
            tx,
            MonitorSettings::default(),
        );
        Fixture {
            monitor,
            registry,
            ledger,
            bus,
            modes,
            signals,
        }
    }

    fn seed(registry: &DomainRegistry, agent: &ScriptedAgent, count: usize, stale: usize) {
        for i in 0..count {
            let key = format!("model-{}", i);
            registry.register(Domain::Model, &key, Owner::Controller, Value::Null).unwrap();
            let cached = if i < stale { 0 } else { 1 };
            agent.cache_version(EntityKey::new(Domain::Model, key), cached);
        }
    }

    fn seed_cache(agent: &ScriptedAgent, count: usize, stale: usize) {
        for i in 0..count {
            let cached = if i < stale { 0 } else { 1 };
            agent.cache_version(EntityKey::new(Domain::Model, format!("model-{}", i)), cached);
        }
    }

    #[tokio::test]
    async fn test_nothing_mirrored_scores_one() {
        let f = fixture(vec![Arc::new(ScriptedAgent::new(Domain::Inference))]);
        let report = f.monitor.score().await;
        assert_eq!(report.score, 1.0);
        assert!(report.unreachable.is_empty());
    }

    #[tokio::test]
    async fn test_drift_is_repaired_and_republished() {
        let inference = Arc::new(ScriptedAgent::new(Domain::Inference));
        let mut f = fixture(vec![inference.clone()]);
        seed(&f.registry, &inference, 20, 3);
        let watcher = f.bus.subscribe(Domain::Inference, EventPattern::action("state_changed"));

        let before = f.monitor.score().await;
        assert!((before.score - 0.85).abs() < 1e-9);

        let report = f.monitor.run_pass().await;
        assert!(report.score < f.monitor.settings().threshold);

        let after = f.monitor.last_report().unwrap();
        assert!(after.score >= f.monitor.settings().repair_target);
        assert_eq!(watcher.queued(), 3);
        assert_eq!(
            inference.cached_version(&EntityKey::new(Domain::Model, "model-0")),
            Some(2)
        );
        assert!(f.signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_repair_reports_unreachable_holder() {
        let inference = Arc::new(ScriptedAgent::new(Domain::Inference));
        inference.set_failing_invalidate(true);
        let mut f = fixture(vec![inference.clone()]);
        seed(&f.registry, &inference, 20, 3);

        f.monitor.run_pass().await;

        let signal = f.signals.try_recv().unwrap();
        assert_eq!(signal.domain, Domain::Inference);
        assert_eq!(signal.kind, FailureKind::AgentUnreachable);
        assert!(f.signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_invalidation_is_reported_even_when_score_recovers() {
        let inference = Arc::new(ScriptedAgent::new(Domain::Inference));
        let processing = Arc::new(ScriptedAgent::new(Domain::Processing));
        processing.set_failing_invalidate(true);
        let mut f = fixture(vec![inference.clone(), processing.clone()]);
        seed(&f.registry, &inference, 20, 3);
        processing.cache_version(EntityKey::new(Domain::Model, "model-0"), 0);

        f.monitor.run_pass().await;

        let after = f.monitor.last_report().unwrap();
        assert!(after.score >= f.monitor.settings().repair_target);
        let signal = f.signals.try_recv().unwrap();
        assert_eq!(signal.domain, Domain::Processing);
        assert_eq!(signal.kind, FailureKind::AgentUnreachable);
        assert!(f.signals.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_holders_still_stale_after_repair_are_reported_unreachable() {
        let inference = Arc::new(ScriptedAgent::new(Domain::Inference).ignoring_invalidate());
        let processing = Arc::new(ScriptedAgent::new(Domain::Processing).ignoring_invalidate());
        let mut f = fixture(vec![inference.clone(), processing.clone()]);
        seed(&f.registry, &inference, 20, 3);
        seed_cache(&processing, 20, 3);

        f.monitor.run_pass().await;

        let after = f.monitor.last_report().unwrap();
        assert!(after.score < f.monitor.settings().repair_target);

        let mut signalled = Vec::new();
        while let Ok(signal) = f.signals.try_recv() {
            assert_eq!(signal.kind, FailureKind::AgentUnreachable);
            signalled.push(signal.domain);
        }
        assert_eq!(signalled, vec![Domain::Processing, Domain::Inference]);
    }

    #[tokio::test]
    async fn test_memory_pressure_is_signalled_not_applied() {
        let mut f = fixture(vec![Arc::new(ScriptedAgent::new(Domain::Memory))]);
        f.ledger
            .reserve(ReserveRequest::new(Domain::Memory, ResourceKind::MemoryBytes, 91))
            .unwrap();

        f.monitor.run_pass().await;

        assert_eq!(f.modes.current(), DegradationMode::Normal);
        let signal = f.signals.try_recv().unwrap();
        assert_eq!(signal.kind, FailureKind::ResourceExhaustion);
        assert_eq!(signal.domain, Domain::Memory);
        assert_eq!(signal.mode_floor, Some(DegradationMode::MinimalOperation));
    }

    #[tokio::test]
    async fn test_recovery_after_pressure_clears() {
        let mut f = fixture(vec![Arc::new(ScriptedAgent::new(Domain::Memory))]);
        let id = f
            .ledger
            .reserve(ReserveRequest::new(Domain::Memory, ResourceKind::MemoryBytes, 96))
            .unwrap();
        f.monitor.run_pass().await;
        let signal = f.signals.try_recv().unwrap();
        assert_eq!(signal.mode_floor, Some(DegradationMode::SafetyFirst));
        f.modes.raise_to(DegradationMode::SafetyFirst, &signal.detail);

        f.ledger.release(id).unwrap();
        f.monitor.run_pass().await;
        assert_eq!(f.modes.current(), DegradationMode::Normal);
        assert!(f.signals.try_recv().is_err());
    }
}
