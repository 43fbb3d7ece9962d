//! Degradation modes and recovery validation
//!
//! The mode is process-wide. Only the cascade orchestrator raises it, memory
//! pressure included; only the recovery validator brings it back to Normal. Callers observe it through a `watch` channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::models::{Envelope, HealthStatus};
use common::types::{CapabilityRestrictions, DegradationMode, EventPriority, ResourceKind};
use resource_manager::AllocationLedger;
use settings::ConfigManager;

use crate::agent::AgentDirectory;
use crate::dispatch::ActionDispatcher;

/// A recorded mode change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeTransition {
    pub from: DegradationMode,
    pub to: DegradationMode,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Holder of the process-wide degradation mode
pub struct ModeController {
    tx: watch::Sender<DegradationMode>,
    history: Mutex<Vec<ModeTransition>>,
}

impl ModeController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(DegradationMode::Normal);
        Self {
            tx,
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn current(&self) -> DegradationMode {
        *self.tx.borrow()
    }

    /// Restrictions of the current mode
    pub fn restrictions(&self) -> CapabilityRestrictions {
        self.current().restrictions()
    }

    pub fn subscribe(&self) -> watch::Receiver<DegradationMode> {
        self.tx.subscribe()
    }

    pub fn history(&self) -> Vec<ModeTransition> {
        self.history.lock().clone()
    }

    /// Raises severity one level
    pub(crate) fn escalate(&self, reason: &str) -> DegradationMode {
        let target = self.current().escalated();
        self.raise_to(target, reason)
    }

    /// Raises severity to at least `target`; never lowers it
    pub(crate) fn raise_to(&self, target: DegradationMode, reason: &str) -> DegradationMode {
        let mut from = self.current();
        let changed = self.tx.send_if_modified(|mode| {
            from = *mode;
            if target > *mode {
                *mode = target;
                true
            } else {
                false
            }
        });

        if changed {
            warn!(%from, to = %target, reason, "Degradation mode raised");
            self.record(from, target, reason);
        }
        self.current()
    }

    /// Returns to Normal after a passed validation
    pub(crate) fn restore_normal(&self, reason: &str) {
        let from = self.tx.send_replace(DegradationMode::Normal);
        if from != DegradationMode::Normal {
            info!(%from, reason, "Degradation mode restored to Normal");
            self.record(from, DegradationMode::Normal, reason);
        }
    }

    fn record(&self, from: DegradationMode, to: DegradationMode, reason: &str) {
        self.history.lock().push(ModeTransition {
            from,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        });
    }
}

impl Default for ModeController {
    fn default() -> Self {
        Self::new()
    }
}

/// Memory pressure band of a utilization figure
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MemoryTier {
    Nominal,
    Elevated,
    High,
    Critical,
    Exhausted,
}

impl MemoryTier {
    /// Classifies a utilization in [0, 1] against ascending tier thresholds
    pub fn classify(utilization: f64, thresholds: &[f64]) -> Self {
        let crossed = thresholds.iter().filter(|t| utilization >= **t).count();
        match crossed {
            0 => MemoryTier::Nominal,
            1 => MemoryTier::Elevated,
            2 => MemoryTier::High,
            3 => MemoryTier::Critical,
            _ => MemoryTier::Exhausted,
        }
    }

    /// Mode the tier calls for, if any
    pub fn pressure_mode(self) -> Option<DegradationMode> {
        match self {
            MemoryTier::Nominal | MemoryTier::Elevated => None,
            MemoryTier::High => Some(DegradationMode::PerformanceConservation),
            MemoryTier::Critical => Some(DegradationMode::MinimalOperation),
            MemoryTier::Exhausted => Some(DegradationMode::SafetyFirst),
        }
    }
}

/// Recovery validation tunables
#[derive(Debug, Clone)]
pub struct RecoverySettings {
    /// Ascending memory utilization thresholds
    pub memory_tiers: Vec<f64>,
    pub latency_ceiling_ms: f64,
    pub error_rate_ceiling: f64,
    /// Minimum time between two validation attempts
    pub cooldown: Duration,
    pub agent_timeout: Duration,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            memory_tiers: vec![0.80, 0.85, 0.90, 0.95],
            latency_ceiling_ms: 500.0,
            error_rate_ceiling: 0.05,
            cooldown: Duration::from_secs(30),
            agent_timeout: Duration::from_secs(2),
        }
    }
}

impl RecoverySettings {
    pub fn from_config(config_manager: &ConfigManager) -> Self {
        let defaults = Self::default();
        let mut memory_tiers = config_manager
            .get_f64_list("recovery.memory_tiers")
            .unwrap_or(defaults.memory_tiers);
        memory_tiers.sort_by(f64::total_cmp);

        Self {
            memory_tiers,
            latency_ceiling_ms: config_manager
                .get_f64("recovery.latency_ceiling_ms")
                .unwrap_or(defaults.latency_ceiling_ms),
            error_rate_ceiling: config_manager
                .get_f64("recovery.error_rate_ceiling")
                .unwrap_or(defaults.error_rate_ceiling),
            cooldown: config_manager
                .get_duration("recovery.cooldown_ms")
                .unwrap_or(defaults.cooldown),
            agent_timeout: config_manager
                .get_duration("monitor.agent_timeout_ms")
                .unwrap_or(defaults.agent_timeout),
        }
    }
}

/// Phases of the validation pipeline, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryPhase {
    ResourceAvailability,
    FunctionalityRestoration,
    IntegrationTest,
    PerformanceThreshold,
}

impl RecoveryPhase {
    pub const ALL: [RecoveryPhase; 4] = [
        RecoveryPhase::ResourceAvailability,
        RecoveryPhase::FunctionalityRestoration,
        RecoveryPhase::IntegrationTest,
        RecoveryPhase::PerformanceThreshold,
    ];
}

/// Result of one validation attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    /// Mode when the attempt started
    pub from: DegradationMode,
    pub restored: bool,
    pub passed: Vec<RecoveryPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<RecoveryPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Four-phase validation gating the return to Normal
pub struct RecoveryValidator {
    ledger: Arc<AllocationLedger>,
    agents: Arc<AgentDirectory>,
    dispatcher: Arc<ActionDispatcher>,
    modes: Arc<ModeController>,
    settings: RecoverySettings,
    last_attempt: Mutex<Option<Instant>>,
}

impl RecoveryValidator {
    pub fn new(
        ledger: Arc<AllocationLedger>,
        agents: Arc<AgentDirectory>,
        dispatcher: Arc<ActionDispatcher>,
        modes: Arc<ModeController>,
        settings: RecoverySettings,
    ) -> Self {
        Self {
            ledger,
            agents,
            dispatcher,
            modes,
            settings,
            last_attempt: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &RecoverySettings {
        &self.settings
    }

    /// Worst memory tier across all memory pools
    pub fn memory_tier(&self) -> MemoryTier {
        self.ledger
            .usage()
            .iter()
            .filter(|u| u.resource_kind == ResourceKind::MemoryBytes)
            .map(|u| MemoryTier::classify(u.utilization(), &self.settings.memory_tiers))
            .max()
            .unwrap_or(MemoryTier::Nominal)
    }

    /// Runs the pipeline if the system is degraded and the cooldown elapsed
    pub async fn attempt(&self) -> Option<RecoveryOutcome> {
        if self.modes.current() == DegradationMode::Normal {
            return None;
        }
        {
            let mut last = self.last_attempt.lock();
            if let Some(at) = *last {
                if at.elapsed() < self.settings.cooldown {
                    return None;
                }
            }
            *last = Some(Instant::now());
        }
        Some(self.validate().await)
    }

    /// Runs every phase in order, restoring Normal only if all pass
    pub async fn validate(&self) -> RecoveryOutcome {
        let from = self.modes.current();
        let mut passed = Vec::new();

        for phase in RecoveryPhase::ALL {
            let result = match phase {
                RecoveryPhase::ResourceAvailability => self.check_resources(),
                RecoveryPhase::FunctionalityRestoration => self.check_functionality().await,
                RecoveryPhase::IntegrationTest => self.check_integration().await,
                RecoveryPhase::PerformanceThreshold => self.check_performance().await,
            };

            if let Err(e) = result {
                info!(?phase, %from, "Recovery halted: {}", e);
                return RecoveryOutcome {
                    from,
                    restored: false,
                    passed,
                    failed_phase: Some(phase),
                    reason: Some(e.to_string()),
                };
            }
            debug!(?phase, "Recovery phase passed");
            passed.push(phase);
        }

        self.modes.restore_normal("recovery validation passed");

        RecoveryOutcome {
            from,
            restored: true,
            passed,
            failed_phase: None,
            reason: None,
        }
    }

    fn check_resources(&self) -> Result<()> {
        let first_tier = self.settings.memory_tiers.first().copied().unwrap_or(0.80);
        let last_tier = self.settings.memory_tiers.last().copied().unwrap_or(0.95);

        for usage in self.ledger.usage() {
            let utilization = usage.utilization();
            let limit = if usage.resource_kind == ResourceKind::MemoryBytes {
                first_tier
            } else {
                last_tier
            };
            if utilization >= limit {
                return Err(Error::InvalidState(format!(
                    "{}/{} at {:.0}% utilization",
                    usage.domain,
                    usage.resource_kind,
                    utilization * 100.0
                )));
            }
        }
        Ok(())
    }

    async fn check_functionality(&self) -> Result<()> {
        for domain in self.agents.domains() {
            let report = self.agents.health_report(domain, self.settings.agent_timeout).await?;
            if report.status != HealthStatus::Healthy {
                return Err(Error::InvalidState(format!(
                    "{} reports {:?}",
                    domain, report.status
                )));
            }
        }
        Ok(())
    }

    async fn check_integration(&self) -> Result<()> {
        for domain in self.agents.domains() {
            let probe = Envelope::new(domain, "health_report", EventPriority::P1, json!({}))
                .with_correlation(format!("recovery-probe-{}", domain.as_str()))
                .with_timeout(self.settings.agent_timeout);
            let response = self.dispatcher.dispatch(&probe).await;
            if !response.success || response.correlation_id != probe.correlation_id {
                return Err(Error::InvalidState(format!(
                    "Integration probe to {} failed: {}",
                    domain,
                    response.error_message.unwrap_or_default()
                )));
            }
        }
        Ok(())
    }

    async fn check_performance(&self) -> Result<()> {
        for domain in self.agents.domains() {
            let report = self.agents.health_report(domain, self.settings.agent_timeout).await?;
            if let Some(latency) = report.metrics.get("latency_ms") {
                if *latency > self.settings.latency_ceiling_ms {
                    return Err(Error::InvalidState(format!(
                        "{} latency {:.1}ms above {:.1}ms",
                        domain, latency, self.settings.latency_ceiling_ms
                    )));
                }
            }
            if let Some(error_rate) = report.metrics.get("error_rate") {
                if *error_rate > self.settings.error_rate_ceiling {
                    return Err(Error::InvalidState(format!(
                        "{} error rate {:.3} above {:.3}",
                        domain, error_rate, self.settings.error_rate_ceiling
                    )));
                }
            }
        }
        Ok(())
    }
}
