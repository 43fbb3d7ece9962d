//! Cascade and recovery orchestrator
//!
//! A failure signal from a domain selects a [`CascadeDefinition`] by failure
//! kind. Its steps are expanded against the dependency order and run one at
//! a time through the compensation machinery, each bounded by its own
//! timeout and `on_timeout` policy. How often the same kind fired within the
//! rolling window decides whether the cascade runs at all and how far the
//! degradation mode is raised.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use common::error::{Error, ErrorReport};
use common::types::{DegradationMode, Domain};
use common::utils::format_duration;
use settings::ConfigManager;

use crate::agent::AgentDirectory;
use crate::compensation::Compensator;
use crate::degradation::ModeController;

/// Reports retained for inspection
const REPORT_HISTORY: usize = 256;

/// Kind of a failure signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    StepTimeout,
    AgentUnreachable,
    ResourceExhaustion,
    ConsistencyDivergence,
    CompensationFailure,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::StepTimeout => "step_timeout",
            FailureKind::AgentUnreachable => "agent_unreachable",
            FailureKind::ResourceExhaustion => "resource_exhaustion",
            FailureKind::ConsistencyDivergence => "consistency_divergence",
            FailureKind::CompensationFailure => "compensation_failure",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A domain failure reported to the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSignal {
    pub domain: Domain,
    pub kind: FailureKind,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Mode the condition calls for whatever the cascade outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_floor: Option<DegradationMode>,
    pub detected_at: DateTime<Utc>,
}

impl FailureSignal {
    pub fn new(domain: Domain, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            domain,
            kind,
            detail: detail.into(),
            correlation_id: None,
            mode_floor: None,
            detected_at: Utc::now(),
        }
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_mode_floor(mut self, mode: DegradationMode) -> Self {
        self.mode_floor = Some(mode);
        self
    }

    /// Signal for an error that takes the failure-signal path, if it does
    pub fn from_error(domain: Domain, error: &Error) -> Option<Self> {
        let (domain, kind) = match error {
            Error::StepTimeout { .. } => (domain, FailureKind::StepTimeout),
            Error::AgentUnreachable { domain, .. } => (*domain, FailureKind::AgentUnreachable),
            Error::CompensationFailure { .. } => (domain, FailureKind::CompensationFailure),
            Error::ConsistencyDivergence { .. } => (domain, FailureKind::ConsistencyDivergence),
            _ => return None,
        };
        Some(Self::new(domain, kind, error.to_string()))
    }
}

/// What to do when a step exhausts its attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnTimeout {
    AbortCascade,
    SkipStep,
    /// Retries this many times, then skips
    Retry(u32),
}

impl OnTimeout {
    fn attempts(self) -> u32 {
        match self {
            OnTimeout::Retry(n) => n + 1,
            _ => 1,
        }
    }
}

/// Domains a step applies to, relative to the failed domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepTarget {
    Failed,
    Fixed(Domain),
    /// Every domain after the failed one in dependency order
    Dependents,
    /// Every domain before the failed one in dependency order
    Dependencies,
}

impl StepTarget {
    /// Upper bound on the number of domains the target expands to
    fn max_fan_out(self) -> u32 {
        match self {
            StepTarget::Failed | StepTarget::Fixed(_) => 1,
            StepTarget::Dependents | StepTarget::Dependencies => Domain::ALL.len() as u32 - 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeStep {
    pub target: StepTarget,
    pub action: String,
    pub timeout: Duration,
    pub on_timeout: OnTimeout,
}

impl CascadeStep {
    pub fn new(target: StepTarget, action: impl Into<String>, timeout: Duration, on_timeout: OnTimeout) -> Self {
        Self {
            target,
            action: action.into(),
            timeout,
            on_timeout,
        }
    }
}

/// Statically declared recovery sequence for one failure kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeDefinition {
    pub name: String,
    pub trigger: FailureKind,
    pub steps: Vec<CascadeStep>,
}

impl CascadeDefinition {
    /// The built-in definitions, one per failure kind
    pub fn defaults(step_timeout: Duration) -> Vec<CascadeDefinition> {
        use OnTimeout::*;
        use StepTarget::*;

        let step = |target, action: &str, on_timeout| CascadeStep::new(target, action, step_timeout, on_timeout);

        vec![
            CascadeDefinition {
                name: "agent_unreachable".to_string(),
                trigger: FailureKind::AgentUnreachable,
                steps: vec![
                    step(Failed, "reconnect", Retry(2)),
                    step(Dependents, "pause_intake", SkipStep),
                    step(Failed, "republish_state", SkipStep),
                    step(Dependents, "resume_intake", SkipStep),
                ],
            },
            CascadeDefinition {
                name: "step_timeout".to_string(),
                trigger: FailureKind::StepTimeout,
                steps: vec![
                    step(Failed, "cancel_inflight", SkipStep),
                    step(Failed, "release_idle", SkipStep),
                ],
            },
            CascadeDefinition {
                name: "resource_exhaustion".to_string(),
                trigger: FailureKind::ResourceExhaustion,
                steps: vec![
                    step(Failed, "release_idle", Retry(1)),
                    step(Dependents, "shed_load", SkipStep),
                ],
            },
            CascadeDefinition {
                name: "consistency_divergence".to_string(),
                trigger: FailureKind::ConsistencyDivergence,
                steps: vec![
                    step(Failed, "flush_caches", SkipStep),
                    step(Failed, "republish_state", AbortCascade),
                ],
            },
            CascadeDefinition {
                name: "compensation_failure".to_string(),
                trigger: FailureKind::CompensationFailure,
                steps: vec![step(Failed, "release_idle", SkipStep)],
            },
        ]
    }

    /// Worst-case running time, whatever the failed domain
    pub fn bound(&self, overhead: Duration) -> Duration {
        self.steps
            .iter()
            .map(|s| s.timeout * s.on_timeout.attempts() * s.target.max_fan_out())
            .sum::<Duration>()
            + overhead
    }
}

/// Response band of the escalation matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EscalationLevel {
    LogOnly,
    AutomatedRecovery,
    ForcedDegradation,
    SystemProtection,
}

/// Maps failure frequency within the window to an escalation level
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationMatrix {
    pub window: Duration,
    pub automated_recovery_at: u32,
    pub forced_degradation_at: u32,
    pub system_protection_at: u32,
}

impl Default for EscalationMatrix {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3_600),
            automated_recovery_at: 1,
            forced_degradation_at: 5,
            system_protection_at: 10,
        }
    }
}

impl EscalationMatrix {
    pub fn from_config(config_manager: &ConfigManager) -> Self {
        let defaults = Self::default();
        let band = |key: &str, default: u32| config_manager.get_u64(key).map(|v| v as u32).unwrap_or(default);
        Self {
            window: config_manager.get_duration("cascade.window_ms").unwrap_or(defaults.window),
            automated_recovery_at: band("cascade.automated_recovery_at", defaults.automated_recovery_at),
            forced_degradation_at: band("cascade.forced_degradation_at", defaults.forced_degradation_at),
            system_protection_at: band("cascade.system_protection_at", defaults.system_protection_at),
        }
    }

    /// Level for `count` signals of one kind in the window, this one included
    pub fn classify(&self, count: u32) -> EscalationLevel {
        if count < self.automated_recovery_at {
            EscalationLevel::LogOnly
        } else if count < self.forced_degradation_at {
            EscalationLevel::AutomatedRecovery
        } else if count <= self.system_protection_at {
            EscalationLevel::ForcedDegradation
        } else {
            EscalationLevel::SystemProtection
        }
    }
}

#[derive(Debug, Clone)]
pub struct CascadeSettings {
    pub matrix: EscalationMatrix,
    /// Fixed allowance on top of the step timeouts
    pub overhead: Duration,
    pub step_timeout: Duration,
}

impl Default for CascadeSettings {
    fn default() -> Self {
        Self {
            matrix: EscalationMatrix::default(),
            overhead: Duration::from_millis(250),
            step_timeout: Duration::from_secs(5),
        }
    }
}

impl CascadeSettings {
    pub fn from_config(config_manager: &ConfigManager) -> Self {
        let defaults = Self::default();
        Self {
            matrix: EscalationMatrix::from_config(config_manager),
            overhead: config_manager
                .get_duration("cascade.overhead_ms")
                .unwrap_or(defaults.overhead),
            step_timeout: config_manager
                .get_duration("transaction.default_step_timeout_ms")
                .unwrap_or(defaults.step_timeout),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CascadeState {
    Detected,
    Propagating,
    Stabilized,
    PartiallyStabilized,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepOutcome {
    Succeeded,
    Skipped,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeStepReport {
    pub domain: Domain,
    pub action: String,
    pub attempts: u32,
    pub outcome: StepOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

/// Account of one cascade instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CascadeReport {
    pub cascade_id: u64,
    /// Definition run, if one matched and the level called for it
    pub definition: Option<String>,
    pub signal: FailureSignal,
    pub level: EscalationLevel,
    pub state: CascadeState,
    pub steps: Vec<CascadeStepReport>,
    pub mode_before: DegradationMode,
    pub mode_after: DegradationMode,
    pub elapsed: Duration,
}

/// Runs cascades for failure signals
pub struct CascadeOrchestrator {
    definitions: HashMap<FailureKind, CascadeDefinition>,
    compensator: Arc<Compensator>,
    agents: Arc<AgentDirectory>,
    modes: Arc<ModeController>,
    settings: CascadeSettings,
    occurrences: Mutex<HashMap<FailureKind, VecDeque<Instant>>>,
    next_id: AtomicU64,
    reports: Mutex<VecDeque<CascadeReport>>,
}

impl CascadeOrchestrator {
    pub fn new(
        compensator: Arc<Compensator>,
        agents: Arc<AgentDirectory>,
        modes: Arc<ModeController>,
        settings: CascadeSettings,
    ) -> Self {
        let definitions = CascadeDefinition::defaults(settings.step_timeout)
            .into_iter()
            .map(|d| (d.trigger, d))
            .collect();
        Self {
            definitions,
            compensator,
            agents,
            modes,
            settings,
            occurrences: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            reports: Mutex::new(VecDeque::new()),
        }
    }

    /// Replaces the definition for its trigger
    pub fn define(&mut self, definition: CascadeDefinition) {
        self.definitions.insert(definition.trigger, definition);
    }

    pub fn definition(&self, kind: FailureKind) -> Option<&CascadeDefinition> {
        self.definitions.get(&kind)
    }

    pub fn settings(&self) -> &CascadeSettings {
        &self.settings
    }

    /// Most recent reports, oldest first
    pub fn reports(&self) -> Vec<CascadeReport> {
        self.reports.lock().iter().cloned().collect()
    }

    /// Signals of a kind within the current window
    pub fn occurrences(&self, kind: FailureKind) -> u32 {
        let now = Instant::now();
        let mut occurrences = self.occurrences.lock();
        let entries = occurrences.entry(kind).or_default();
        Self::expire(entries, now, self.settings.matrix.window);
        entries.len() as u32
    }

    fn record_occurrence(&self, kind: FailureKind, now: Instant) -> u32 {
        let mut occurrences = self.occurrences.lock();
        let entries = occurrences.entry(kind).or_default();
        Self::expire(entries, now, self.settings.matrix.window);
        entries.push_back(now);
        entries.len() as u32
    }

    fn expire(entries: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while entries
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) >= window)
        {
            entries.pop_front();
        }
    }

    /// Handles one failure signal to completion
    pub async fn handle(&self, signal: FailureSignal) -> CascadeReport {
        let started = Instant::now();
        let cascade_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let count = self.record_occurrence(signal.kind, started);
        let level = self.settings.matrix.classify(count);
        let mode_before = self.modes.current();

        warn!(
            cascade_id,
            domain = %signal.domain,
            kind = %signal.kind,
            count,
            ?level,
            "Failure signal received: {}",
            signal.detail
        );

        let mut report = CascadeReport {
            cascade_id,
            definition: None,
            signal,
            level,
            state: CascadeState::Detected,
            steps: Vec::new(),
            mode_before,
            mode_after: mode_before,
            elapsed: Duration::ZERO,
        };

        if let Some(floor) = report.signal.mode_floor {
            self.modes
                .raise_to(floor, &format!("{} on {}: {}", report.signal.kind, report.signal.domain, report.signal.detail));
        }

        match level {
            EscalationLevel::LogOnly => {
                info!(cascade_id, "Below escalation threshold, logged only");
                report.state = CascadeState::Stabilized;
            }
            EscalationLevel::SystemProtection => {
                error!(cascade_id, kind = %report.signal.kind, count, "Failure rate beyond protection threshold");
                self.modes
                    .raise_to(DegradationMode::SafetyFirst, &format!("{} repeated {} times", report.signal.kind, count));
                report.state = CascadeState::Failed;
            }
            EscalationLevel::AutomatedRecovery | EscalationLevel::ForcedDegradation => {
                match self.definitions.get(&report.signal.kind) {
                    Some(definition) => {
                        report.definition = Some(definition.name.clone());
                        report.state = CascadeState::Propagating;
                        let (state, steps) = self.run_definition(cascade_id, definition, &report.signal).await;
                        report.state = state;
                        report.steps = steps;
                    }
                    None => {
                        warn!(cascade_id, kind = %report.signal.kind, "No cascade defined");
                        report.state = CascadeState::Failed;
                    }
                }

                let reason = format!("{} cascade on {}", report.signal.kind, report.signal.domain);
                if level == EscalationLevel::ForcedDegradation {
                    self.modes.escalate(&reason);
                }
                if matches!(report.state, CascadeState::PartiallyStabilized | CascadeState::Failed) {
                    self.modes.escalate(&reason);
                }
            }
        }

        report.mode_after = self.modes.current();
        report.elapsed = started.elapsed();

        info!(
            cascade_id,
            state = ?report.state,
            mode = %report.mode_after,
            elapsed = %format_duration(report.elapsed),
            "Cascade finished"
        );

        let mut reports = self.reports.lock();
        reports.push_back(report.clone());
        while reports.len() > REPORT_HISTORY {
            reports.pop_front();
        }
        drop(reports);

        report
    }

    /// Steps expanded against the failed domain, in execution order
    fn expand<'a>(&self, definition: &'a CascadeDefinition, failed: Domain) -> Vec<(&'a CascadeStep, Domain)> {
        let mut plan = Vec::new();
        for step in &definition.steps {
            let domains: Vec<Domain> = match step.target {
                StepTarget::Failed => vec![failed],
                StepTarget::Fixed(domain) => vec![domain],
                StepTarget::Dependents => failed.dependents().collect(),
                StepTarget::Dependencies => failed.dependencies().collect(),
            };
            for domain in domains {
                if domain == failed || self.agents.contains(domain) {
                    plan.push((step, domain));
                }
            }
        }
        plan
    }

    async fn run_definition(
        &self,
        cascade_id: u64,
        definition: &CascadeDefinition,
        signal: &FailureSignal,
    ) -> (CascadeState, Vec<CascadeStepReport>) {
        let plan = self.expand(definition, signal.domain);
        let bound = plan
            .iter()
            .map(|(step, _)| step.timeout * step.on_timeout.attempts())
            .sum::<Duration>()
            + self.settings.overhead;

        debug!(cascade_id, steps = plan.len(), bound_ms = bound.as_millis() as u64, "Cascade propagating");

        let reports = Mutex::new(Vec::with_capacity(plan.len()));
        let run = async {
            let mut skipped = false;
            for (step, domain) in &plan {
                let step_report = self.run_step(cascade_id, step, *domain, signal).await;
                let outcome = step_report.outcome;
                reports.lock().push(step_report);
                match outcome {
                    StepOutcome::Succeeded => {}
                    StepOutcome::Skipped => skipped = true,
                    StepOutcome::Aborted => return CascadeState::Failed,
                }
            }
            if skipped {
                CascadeState::PartiallyStabilized
            } else {
                CascadeState::Stabilized
            }
        };

        let state = match tokio::time::timeout(bound, run).await {
            Ok(state) => state,
            Err(_) => {
                error!(cascade_id, bound_ms = bound.as_millis() as u64, "Cascade exceeded its bound");
                CascadeState::Failed
            }
        };

        (state, reports.into_inner())
    }

    async fn run_step(
        &self,
        cascade_id: u64,
        step: &CascadeStep,
        domain: Domain,
        signal: &FailureSignal,
    ) -> CascadeStepReport {
        let payload = json!({
            "cascade_id": cascade_id,
            "failed_domain": signal.domain,
            "failure": signal.kind,
            "detail": signal.detail,
        });

        let attempts = step.on_timeout.attempts();
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self
                .compensator
                .invoke(domain, &step.action, payload.clone(), step.timeout)
                .await
            {
                Ok(_) => {
                    debug!(cascade_id, %domain, action = %step.action, attempt, "Cascade step succeeded");
                    return CascadeStepReport {
                        domain,
                        action: step.action.clone(),
                        attempts: attempt,
                        outcome: StepOutcome::Succeeded,
                        error: None,
                    };
                }
                Err(e) => {
                    warn!(cascade_id, %domain, action = %step.action, attempt, "Cascade step failed: {}", e);
                    last_error = Some(e.report());
                }
            }
        }

        let outcome = match step.on_timeout {
            OnTimeout::AbortCascade => StepOutcome::Aborted,
            OnTimeout::SkipStep | OnTimeout::Retry(_) => StepOutcome::Skipped,
        };
        CascadeStepReport {
            domain,
            action: step.action.clone(),
            attempts,
            outcome,
            error: last_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{ActionDispatcher, OperationCatalog};
    use crate::testing::{CallLog, ScriptedAgent};
    use resource_manager::AllocationLedger;

    fn orchestrator(agents: Vec<ScriptedAgent>, settings: CascadeSettings) -> (CascadeOrchestrator, Arc<ModeController>) {
        let directory = Arc::new(AgentDirectory::new(Duration::from_millis(100)));
        for agent in agents {
            directory.register(Arc::new(agent)).unwrap();
        }
        let dispatcher = Arc::new(ActionDispatcher::new(directory.clone(), Arc::new(OperationCatalog::builtin())));
        let compensator = Arc::new(Compensator::new(
            directory.clone(),
            dispatcher,
            Arc::new(AllocationLedger::new()),
        ));
        let modes = Arc::new(ModeController::new());
        (
            CascadeOrchestrator::new(compensator, directory, modes.clone(), settings),
            modes,
        )
    }

    fn fast_settings() -> CascadeSettings {
        CascadeSettings {
            step_timeout: Duration::from_millis(100),
            ..CascadeSettings::default()
        }
    }

    #[test]
    fn test_escalation_bands() {
        let matrix = EscalationMatrix::default();
        assert_eq!(matrix.classify(1), EscalationLevel::AutomatedRecovery);
        assert_eq!(matrix.classify(4), EscalationLevel::AutomatedRecovery);
        assert_eq!(matrix.classify(5), EscalationLevel::ForcedDegradation);
        assert_eq!(matrix.classify(10), EscalationLevel::ForcedDegradation);
        assert_eq!(matrix.classify(11), EscalationLevel::SystemProtection);

        let lenient = EscalationMatrix {
            automated_recovery_at: 3,
            ..EscalationMatrix::default()
        };
        assert_eq!(lenient.classify(2), EscalationLevel::LogOnly);
    }

    #[test]
    fn test_signal_from_error() {
        let timeout = Error::StepTimeout {
            step: "model.load_model".to_string(),
            timeout_ms: 10,
        };
        let signal = FailureSignal::from_error(Domain::Model, &timeout).unwrap();
        assert_eq!(signal.kind, FailureKind::StepTimeout);

        let unreachable = Error::AgentUnreachable {
            domain: Domain::Memory,
            reason: "gone".to_string(),
        };
        assert_eq!(FailureSignal::from_error(Domain::Model, &unreachable).unwrap().domain, Domain::Memory);
        assert!(FailureSignal::from_error(Domain::Model, &Error::Validation("x".into())).is_none());
    }

    #[tokio::test]
    async fn test_cascade_runs_in_dependency_order() {
        let log = CallLog::new();
        let (orchestrator, modes) = orchestrator(
            vec![
                ScriptedAgent::new(Domain::Inference).with_call_log(log.clone()),
                ScriptedAgent::new(Domain::Model).with_call_log(log.clone()),
                ScriptedAgent::new(Domain::Processing).with_call_log(log.clone()),
                ScriptedAgent::new(Domain::Device).with_call_log(log.clone()),
            ],
            fast_settings(),
        );

        let report = orchestrator
            .handle(FailureSignal::new(Domain::Model, FailureKind::AgentUnreachable, "heartbeat lost"))
            .await;

        assert_eq!(report.state, CascadeState::Stabilized);
        assert_eq!(report.level, EscalationLevel::AutomatedRecovery);
        assert_eq!(modes.current(), DegradationMode::Normal);

        let executed = log.executed();
        assert_eq!(
            executed,
            vec![
                (Domain::Model, "reconnect".to_string()),
                (Domain::Processing, "pause_intake".to_string()),
                (Domain::Inference, "pause_intake".to_string()),
                (Domain::Model, "republish_state".to_string()),
                (Domain::Processing, "resume_intake".to_string()),
                (Domain::Inference, "resume_intake".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_steps_end_partially_stabilized_within_bound() {
        let (orchestrator, modes) = orchestrator(
            vec![ScriptedAgent::new(Domain::Memory)
                .hanging_action("release_idle")
                .hanging_action("shed_load")],
            fast_settings(),
        );
        let definition = orchestrator.definition(FailureKind::ResourceExhaustion).unwrap().clone();

        let report = orchestrator
            .handle(FailureSignal::new(Domain::Memory, FailureKind::ResourceExhaustion, "pool full"))
            .await;

        assert_eq!(report.state, CascadeState::PartiallyStabilized);
        assert_eq!(report.steps[0].attempts, 2);
        assert_eq!(report.steps[0].error.as_ref().unwrap().code, "STEP_TIMEOUT");
        assert!(report.elapsed <= definition.bound(orchestrator.settings().overhead));
        assert_eq!(modes.current(), DegradationMode::PerformanceConservation);
    }

    #[tokio::test]
    async fn test_mode_floor_is_applied_even_when_cascade_stabilizes() {
        let (orchestrator, modes) = orchestrator(vec![ScriptedAgent::new(Domain::Memory)], fast_settings());

        let report = orchestrator
            .handle(
                FailureSignal::new(Domain::Memory, FailureKind::ResourceExhaustion, "memory tier Critical")
                    .with_mode_floor(DegradationMode::MinimalOperation),
            )
            .await;

        assert_eq!(report.state, CascadeState::Stabilized);
        assert_eq!(report.mode_before, DegradationMode::Normal);
        assert_eq!(report.mode_after, DegradationMode::MinimalOperation);
        assert_eq!(modes.current(), DegradationMode::MinimalOperation);
    }

    #[tokio::test]
    async fn test_abort_policy_fails_cascade() {
        let (orchestrator, modes) = orchestrator(
            vec![ScriptedAgent::new(Domain::Model).failing_action("republish_state")],
            fast_settings(),
        );

        let report = orchestrator
            .handle(FailureSignal::new(Domain::Model, FailureKind::ConsistencyDivergence, "drift"))
            .await;

        assert_eq!(report.state, CascadeState::Failed);
        assert_eq!(report.steps.last().unwrap().outcome, StepOutcome::Aborted);
        assert_eq!(modes.current(), DegradationMode::PerformanceConservation);
    }

    #[tokio::test]
    async fn test_repeated_signals_escalate_to_protection() {
        let (orchestrator, modes) = orchestrator(vec![ScriptedAgent::new(Domain::Device)], fast_settings());
        let signal = FailureSignal::new(Domain::Device, FailureKind::StepTimeout, "slow");

        for _ in 0..4 {
            let report = orchestrator.handle(signal.clone()).await;
            assert_eq!(report.state, CascadeState::Stabilized);
        }
        assert_eq!(modes.current(), DegradationMode::Normal);

        let fifth = orchestrator.handle(signal.clone()).await;
        assert_eq!(fifth.level, EscalationLevel::ForcedDegradation);
        assert_eq!(modes.current(), DegradationMode::PerformanceConservation);

        for _ in 0..6 {
            orchestrator.handle(signal.clone()).await;
        }
        assert_eq!(orchestrator.occurrences(FailureKind::StepTimeout), 11);
        let last = orchestrator.reports().pop().unwrap();
        assert_eq!(last.level, EscalationLevel::SystemProtection);
        assert!(last.steps.is_empty());
        assert_eq!(modes.current(), DegradationMode::SafetyFirst);
    }
}
