//! Transaction coordinator
//!
//! Runs multi-domain operations either as a two-phase commit (all
//! participants prepare concurrently, then all commit or all abort) or as a
//! saga (steps execute in order, executed steps are compensated in reverse
//! on failure). Every state transition is journaled before it takes effect
//! on the agents, registry writes become visible only at commit, and a
//! resubmitted transaction id returns the recorded result.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::error::{Error, ErrorReport, Result};
use common::models::{
    AllocationId, Envelope, OperationOutcome, StepStatus, TransactionId, TransactionMode, TransactionState, Vote,
};
use common::types::{Domain, EventPriority};
use event_bus::PropagationBus;
use resource_manager::{AllocationLedger, DomainRegistry, WriteOp};
use settings::ConfigManager;
use storage_adapter::{latest_by_transaction, JournalRecord, StorageManager};

use crate::agent::{AgentDirectory, AgentReservation};
use crate::cascade::{FailureKind, FailureSignal};
use crate::compensation::{CompensationAction, Compensator};
use crate::conflict::{Admission, ConflictRequest, ConflictResolver, PreemptionNotice};
use crate::degradation::ModeController;
use crate::dispatch::{ActionDispatcher, AgentAction};
use crate::metrics::EngineMetrics;
use crate::transaction::{OperationRequest, StepReport, TransactionResult, TransactionStep};

/// Coordinator tunables
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Bound of a step without its own timeout
    pub default_step_timeout: Duration,
    /// How long terminal results stay queryable
    pub audit_retention: Duration,
    /// Period of the retention sweep
    pub gc_interval: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            default_step_timeout: Duration::from_secs(5),
            audit_retention: Duration::from_secs(3_600),
            gc_interval: Duration::from_secs(60),
        }
    }
}

impl CoordinatorSettings {
    pub fn from_config(config_manager: &ConfigManager) -> Self {
        let defaults = Self::default();
        Self {
            default_step_timeout: config_manager
                .get_duration("transaction.default_step_timeout_ms")
                .unwrap_or(defaults.default_step_timeout),
            audit_retention: config_manager
                .get_duration("transaction.audit_retention_ms")
                .unwrap_or(defaults.audit_retention),
            gc_interval: config_manager
                .get_duration("transaction.gc_interval_ms")
                .unwrap_or(defaults.gc_interval),
        }
    }
}

/// Components the coordinator drives
pub struct CoordinatorParts {
    pub agents: Arc<AgentDirectory>,
    pub dispatcher: Arc<ActionDispatcher>,
    pub registry: Arc<DomainRegistry>,
    pub ledger: Arc<AllocationLedger>,
    pub bus: Arc<PropagationBus>,
    pub resolver: Arc<ConflictResolver>,
    pub compensator: Arc<Compensator>,
    pub modes: Arc<ModeController>,
    pub storage: Arc<StorageManager>,
    pub metrics: Arc<EngineMetrics>,
    pub signals: mpsc::UnboundedSender<FailureSignal>,
}

struct LiveTransaction {
    state: Mutex<TransactionState>,
    cancel: CancellationToken,
    cancel_reason: Mutex<Option<String>>,
}

impl LiveTransaction {
    fn new(state: TransactionState) -> Self {
        Self {
            state: Mutex::new(state),
            cancel: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
        }
    }

    fn request_cancel(&self, reason: String) {
        self.cancel_reason.lock().get_or_insert(reason);
        self.cancel.cancel();
    }
}

/// Per-run context of an in-flight transaction
struct TxContext {
    id: TransactionId,
    mode: TransactionMode,
    priority: f64,
    preemptable: bool,
    live: Arc<LiveTransaction>,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl TxContext {
    fn cancel_error(&self) -> Error {
        let reason = self
            .live
            .cancel_reason
            .lock()
            .clone()
            .unwrap_or_else(|| "cancelled by caller".to_string());
        Error::Cancelled(format!("Transaction {}: {}", self.id, reason))
    }
}

/// Single bound shared by every stage of one step
#[derive(Debug, Clone, Copy)]
struct StepDeadline {
    timeout: Duration,
    at: Instant,
}

impl StepDeadline {
    fn start(timeout: Duration) -> Self {
        Self {
            timeout,
            at: Instant::now() + timeout,
        }
    }

    /// Time left, `None` once the deadline has passed
    fn remaining(&self) -> Option<Duration> {
        let remaining = self.at.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }

    fn exceeded(&self, label: &str) -> Error {
        Error::StepTimeout {
            step: label.to_string(),
            timeout_ms: self.timeout.as_millis() as u64,
        }
    }

    /// Runs one stage of the step within what is left of the bound
    async fn bound<T, F>(&self, label: &str, stage: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout_at(self.at, stage).await {
            Ok(result) => result,
            Err(_) => Err(self.exceeded(label)),
        }
    }
}

/// Transaction coordinator
pub struct TransactionCoordinator {
    agents: Arc<AgentDirectory>,
    dispatcher: Arc<ActionDispatcher>,
    registry: Arc<DomainRegistry>,
    ledger: Arc<AllocationLedger>,
    bus: Arc<PropagationBus>,
    resolver: Arc<ConflictResolver>,
    compensator: Arc<Compensator>,
    modes: Arc<ModeController>,
    storage: Arc<StorageManager>,
    metrics: Arc<EngineMetrics>,
    signals: mpsc::UnboundedSender<FailureSignal>,
    settings: CoordinatorSettings,

    /// In-flight transactions
    live: DashMap<TransactionId, Arc<LiveTransaction>>,

    /// Terminal results with the time they finished
    completed: DashMap<TransactionId, (TransactionResult, Instant)>,
}

impl TransactionCoordinator {
    pub fn new(parts: CoordinatorParts, settings: CoordinatorSettings) -> Self {
        Self {
            agents: parts.agents,
            dispatcher: parts.dispatcher,
            registry: parts.registry,
            ledger: parts.ledger,
            bus: parts.bus,
            resolver: parts.resolver,
            compensator: parts.compensator,
            modes: parts.modes,
            storage: parts.storage,
            metrics: parts.metrics,
            signals: parts.signals,
            settings,
            live: DashMap::new(),
            completed: DashMap::new(),
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Number of in-flight transactions
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Current state of a transaction, live or retained
    pub fn state_of(&self, transaction_id: &str) -> Option<TransactionState> {
        if let Some(live) = self.live.get(transaction_id) {
            return Some(*live.state.lock());
        }
        self.completed.get(transaction_id).map(|entry| entry.0.state)
    }

    /// Retained terminal result
    pub fn result(&self, transaction_id: &str) -> Option<TransactionResult> {
        self.completed.get(transaction_id).map(|entry| entry.0.clone())
    }

    /// Runs a transaction to a terminal state
    ///
    /// Malformed requests and requests the current degradation mode does not
    /// admit are rejected with an error before anything is reserved. Runtime
    /// failures are reported through the result's outcome.
    pub async fn submit(&self, request: OperationRequest) -> Result<TransactionResult> {
        if let Some(entry) = self.completed.get(&request.transaction_id) {
            info!(transaction_id = %request.transaction_id, "Duplicate submission, returning recorded result");
            self.metrics.record_duplicate();
            return Ok(entry.0.clone());
        }

        let steps = self.resolve_steps(&request)?;
        self.check_mode(&request)?;

        let live = Arc::new(LiveTransaction::new(match request.mode {
            TransactionMode::TwoPhase => TransactionState::Preparing,
            TransactionMode::Saga => TransactionState::Executing,
        }));
        match self.live.entry(request.transaction_id.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::AlreadyExists(format!(
                    "Transaction {} is in flight",
                    request.transaction_id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(live.clone());
            }
        }

        self.metrics.record_submission();

        let ctx = TxContext {
            id: request.transaction_id.clone(),
            mode: request.mode,
            priority: self.resolver.scorer().score(&request.priority),
            preemptable: request.preemptable,
            live,
            started_at: Utc::now(),
            started: Instant::now(),
        };

        info!(
            transaction_id = %ctx.id,
            mode = ?ctx.mode,
            steps = steps.len(),
            priority = ctx.priority,
            "Transaction started"
        );

        let result = match ctx.mode {
            TransactionMode::TwoPhase => self.run_two_phase(&ctx, &steps).await,
            TransactionMode::Saga => self.run_saga(&ctx, &steps).await,
        };

        Ok(result)
    }

    /// Cancels a transaction still in Preparing or Executing
    pub fn cancel(&self, transaction_id: &str) -> Result<()> {
        let live = self.live.get(transaction_id).map(|l| Arc::clone(l.value()));
        match live {
            Some(live) => {
                let state = *live.state.lock();
                if !state.is_cancellable() {
                    return Err(Error::InvalidState(format!(
                        "Transaction {} is {} and can no longer be cancelled",
                        transaction_id, state
                    )));
                }
                info!(transaction_id, %state, "Cancellation requested");
                live.request_cancel("cancelled by caller".to_string());
                Ok(())
            }
            None if self.completed.contains_key(transaction_id) => Err(Error::InvalidState(format!(
                "Transaction {} already finished",
                transaction_id
            ))),
            None => Err(Error::NotFound(format!("Transaction {}", transaction_id))),
        }
    }

    /// Reacts to an allocation taken away by preemption
    ///
    /// A live owner is cancelled into its abort or compensation path. Any
    /// other holder is asked to compensate; the capacity is already back in
    /// the pool.
    pub async fn handle_preemption(&self, notice: PreemptionNotice) {
        let victim = notice.victim;

        if let Some(owner) = &victim.owner_transaction {
            let live = self.live.get(owner).map(|l| Arc::clone(l.value()));
            if let Some(live) = live {
                warn!(
                    transaction_id = %owner,
                    allocation_id = %victim.id,
                    requester = %notice.requester_id,
                    "Allocation of live transaction preempted"
                );
                live.request_cancel(format!(
                    "allocation {} preempted by {}",
                    victim.id, notice.requester_id
                ));
                return;
            }
        }

        if let Err(e) = self
            .agents
            .compensate(victim.domain, victim.id, self.settings.default_step_timeout)
            .await
        {
            warn!(allocation_id = %victim.id, domain = %victim.domain, "Preempted holder not compensated: {}", e);
        }
    }

    fn step_timeout(&self, step: &TransactionStep) -> Duration {
        step.timeout.unwrap_or(self.settings.default_step_timeout)
    }

    /// Validates the request and fills catalog defaults into its steps
    fn resolve_steps(&self, request: &OperationRequest) -> Result<Vec<TransactionStep>> {
        if request.transaction_id.trim().is_empty() {
            return Err(Error::Validation("Transaction id is empty".to_string()));
        }
        if request.steps.is_empty() {
            return Err(Error::Validation(format!(
                "Transaction {} has no steps",
                request.transaction_id
            )));
        }
        if request.mode == TransactionMode::TwoPhase && request.domains().len() > 2 {
            return Err(Error::Validation(format!(
                "Two-phase transaction {} spans {} domains, at most 2 allowed",
                request.transaction_id,
                request.domains().len()
            )));
        }

        let catalog = self.dispatcher.catalog();
        let mut steps = Vec::with_capacity(request.steps.len());
        for (index, step) in request.steps.iter().enumerate() {
            let label = step.label(index);
            match self.dispatcher.resolve_for(step.domain, &step.action) {
                Ok(AgentAction::Execute(_)) => {}
                Ok(other) => {
                    return Err(Error::Validation(format!(
                        "Step {} names agent primitive '{}', not an operation",
                        label,
                        other.name()
                    )))
                }
                Err(e) => return Err(Error::Validation(format!("Step {}: {}", label, e))),
            }

            let mut step = step.clone();
            if let Some(spec) = catalog.get(step.domain, &step.action) {
                if step.resources.is_empty() {
                    step.resources = spec.cost.clone();
                }
                if step.compensation.is_none() {
                    step.compensation = spec.compensation.clone();
                }
            }
            if step.resources.iter().any(|c| c.amount == 0) {
                return Err(Error::Validation(format!("Step {} claims zero of a resource", label)));
            }
            if step.timeout.is_some_and(|t| t.is_zero()) {
                return Err(Error::Validation(format!("Step {} has a zero timeout", label)));
            }
            steps.push(step);
        }

        Ok(steps)
    }

    fn check_mode(&self, request: &OperationRequest) -> Result<()> {
        let mode = self.modes.current();
        let restrictions = mode.restrictions();

        if !restrictions.allows(request.priority.operation_class) {
            return Err(Error::InvalidState(format!(
                "{:?} operations are not admitted in {} mode",
                request.priority.operation_class, mode
            )));
        }
        if request.mode == TransactionMode::Saga && !restrictions.allow_saga {
            return Err(Error::InvalidState(format!("Saga transactions are not admitted in {} mode", mode)));
        }
        if let Some(max) = restrictions.max_concurrent_transactions {
            if self.live.len() >= max {
                return Err(Error::InvalidState(format!(
                    "{} mode admits at most {} concurrent transactions",
                    mode, max
                )));
            }
        }
        Ok(())
    }

    /// Records a state transition in the live table and the journal
    async fn transition<F>(&self, ctx: &TxContext, state: TransactionState, build: F)
    where
        F: FnOnce(JournalRecord) -> JournalRecord,
    {
        *ctx.live.state.lock() = state;
        let record = build(JournalRecord::new(ctx.id.clone(), ctx.mode, state));
        if let Err(e) = self.storage.journal().append(&record).await {
            error!(transaction_id = %ctx.id, %state, "Journal append failed: {}", e);
        }
        debug!(transaction_id = %ctx.id, %state, "Transaction state entered");
    }

    fn signal_error(&self, ctx: &TxContext, domain: Domain, error: &Error) {
        if let Some(signal) = FailureSignal::from_error(domain, error) {
            let _ = self.signals.send(signal.with_correlation(ctx.id.clone()));
        }
    }

    fn release_all(&self, allocations: &[AllocationId]) {
        for id in allocations {
            if let Err(e) = self.ledger.release(*id) {
                warn!(allocation_id = %id, "Release failed: {}", e);
            }
        }
    }

    /// Releases everything the transaction still holds outside `keep`
    fn release_transaction(&self, transaction_id: &str, keep: &HashSet<AllocationId>) {
        for allocation in self.ledger.allocations_for_transaction(transaction_id) {
            if !keep.contains(&allocation.id) {
                if let Err(e) = self.ledger.release(allocation.id) {
                    warn!(transaction_id, allocation_id = %allocation.id, "Release failed: {}", e);
                }
            }
        }
    }

    /// Obtains the step's claimed resources through the conflict resolver
    ///
    /// Capacity waits share the step's deadline. On failure the claims
    /// granted so far are released.
    async fn acquire(
        &self,
        ctx: &TxContext,
        label: &str,
        step: &TransactionStep,
        deadline: StepDeadline,
    ) -> Result<Vec<AllocationId>> {
        let mut granted = Vec::with_capacity(step.resources.len());

        for claim in &step.resources {
            let result = match deadline.remaining() {
                None => Err(deadline.exceeded(label)),
                Some(remaining) => {
                    let request = ConflictRequest::new(
                        format!("{}/{}", ctx.id, label),
                        step.domain,
                        claim.resource_kind.clone(),
                        claim.amount,
                        ctx.priority,
                    )
                    .with_preemptable(ctx.preemptable)
                    .with_purpose(label)
                    .with_owner(ctx.id.clone())
                    .with_max_wait(remaining);

                    match self.resolver.admit(request) {
                        Admission::Granted {
                            allocation_id,
                            preempted,
                        } => {
                            self.metrics.record_preemptions(preempted.len());
                            Ok(allocation_id)
                        }
                        Admission::Queued(ticket) => {
                            debug!(transaction_id = %ctx.id, step = label, ticket = ticket.request_id, "Waiting for capacity");
                            match tokio::time::timeout_at(deadline.at, ticket.wait()).await {
                                Ok(result) => result,
                                Err(_) => Err(deadline.exceeded(label)),
                            }
                        }
                        Admission::Denied(e) => Err(e),
                    }
                }
            };

            match result {
                Ok(id) => granted.push(id),
                Err(e) => {
                    self.release_all(&granted);
                    return Err(e);
                }
            }
        }

        Ok(granted)
    }

    async fn prepare_step(
        &self,
        ctx: &TxContext,
        index: usize,
        step: &TransactionStep,
    ) -> (Vec<AllocationId>, Result<Vote>) {
        let label = step.label(index);
        let deadline = StepDeadline::start(self.step_timeout(step));

        let allocations = match self.acquire(ctx, &label, step, deadline).await {
            Ok(allocations) => allocations,
            Err(e) => return (Vec::new(), Err(e)),
        };

        let reservation = AgentReservation {
            transaction_id: ctx.id.clone(),
            action: step.action.clone(),
            payload: step.payload.clone(),
            claims: step.resources.clone(),
            allocation_ids: allocations.clone(),
        };
        let vote = deadline
            .bound(&label, self.agents.reserve(step.domain, &reservation, deadline.timeout))
            .await;
        (allocations, vote)
    }

    async fn run_two_phase(&self, ctx: &TxContext, steps: &[TransactionStep]) -> TransactionResult {
        let mut reports: Vec<StepReport> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| StepReport::pending(i, s))
            .collect();

        self.transition(ctx, TransactionState::Preparing, |r| r).await;

        let prepare = join_all(
            steps
                .iter()
                .enumerate()
                .map(|(index, step)| self.prepare_step(ctx, index, step)),
        );
        let prepared = tokio::select! {
            results = prepare => Some(results),
            _ = ctx.live.cancel.cancelled() => None,
        };

        let mut failure: Option<Error> = None;
        match prepared {
            None => failure = Some(ctx.cancel_error()),
            Some(results) => {
                for (index, (allocations, vote)) in results.into_iter().enumerate() {
                    let report = &mut reports[index];
                    report.allocations = allocations;
                    match vote {
                        Ok(Vote::Commit) => report.status = StepStatus::Prepared,
                        Ok(Vote::Abort(reason)) => {
                            let e = Error::Aborted(format!("{} voted abort: {}", steps[index].label(index), reason));
                            report.status = StepStatus::Failed;
                            report.error = Some(e.report());
                            failure.get_or_insert(e);
                        }
                        Err(e) => {
                            self.signal_error(ctx, steps[index].domain, &e);
                            report.status = StepStatus::Failed;
                            report.error = Some(e.report());
                            failure.get_or_insert(e);
                        }
                    }
                }
            }
        }

        if failure.is_none() && ctx.live.cancel.is_cancelled() {
            failure = Some(ctx.cancel_error());
        }

        if let Some(error) = failure {
            return self.abort_two_phase(ctx, steps, reports, error).await;
        }

        match self.commit_transaction(ctx, steps, &mut reports).await {
            Ok(degraded) => self.finish_committed(ctx, reports, degraded).await,
            Err(e) => {
                warn!(transaction_id = %ctx.id, "Commit failed, aborting: {}", e);
                self.abort_two_phase(ctx, steps, reports, e).await
            }
        }
    }

    async fn abort_two_phase(
        &self,
        ctx: &TxContext,
        steps: &[TransactionStep],
        mut reports: Vec<StepReport>,
        error: Error,
    ) -> TransactionResult {
        let held: Vec<AllocationId> = reports.iter().flat_map(|r| r.allocations.clone()).collect();
        self.transition(ctx, TransactionState::Aborting, |r| {
            r.with_allocations(held).with_detail(error.to_string())
        })
        .await;

        for (report, step) in reports.iter_mut().zip(steps) {
            if report.status == StepStatus::Prepared {
                let timeout = self.step_timeout(step);
                for id in &report.allocations {
                    if let Err(e) = self.agents.compensate(step.domain, *id, timeout).await {
                        warn!(transaction_id = %ctx.id, allocation_id = %id, "Participant did not undo its reservation: {}", e);
                    }
                }
            }
            if report.status != StepStatus::Failed {
                report.status = StepStatus::Aborted;
            }
        }

        self.release_transaction(&ctx.id, &HashSet::new());

        let detail = error.to_string();
        self.transition(ctx, TransactionState::Aborted, |r| r.with_detail(detail)).await;

        warn!(transaction_id = %ctx.id, "Transaction aborted: {}", error);

        self.finish(
            ctx,
            TransactionState::Aborted,
            OperationOutcome::FailedNothingReserved { error: error.report() },
            reports,
            false,
        )
        .await
    }

    /// Commits the ledger and the staged writes, then confirms with the agents
    ///
    /// An error before the registry write leaves nothing visible. Agent
    /// confirmation failures after it only degrade the result.
    async fn commit_transaction(
        &self,
        ctx: &TxContext,
        steps: &[TransactionStep],
        reports: &mut [StepReport],
    ) -> Result<bool> {
        let allocations: Vec<AllocationId> = reports.iter().flat_map(|r| r.allocations.clone()).collect();
        let writes: Vec<WriteOp> = steps.iter().flat_map(|s| s.writes.clone()).collect();

        self.transition(ctx, TransactionState::Committing, |r| {
            r.with_allocations(allocations.clone()).with_writes(writes.clone())
        })
        .await;

        for id in &allocations {
            self.ledger.commit(*id)?;
        }
        let versions = self.registry.write_batch(writes.clone())?;

        let mut degraded = false;
        for (report, step) in reports.iter_mut().zip(steps) {
            let timeout = self.step_timeout(step);
            for id in &report.allocations {
                if let Err(e) = self.agents.commit(step.domain, *id, timeout).await {
                    warn!(transaction_id = %ctx.id, allocation_id = %id, "Participant did not confirm commit: {}", e);
                    self.signal_error(ctx, step.domain, &e);
                    report.error.get_or_insert(e.report());
                    degraded = true;
                }
            }
            report.status = StepStatus::Committed;
        }

        for (write, version) in writes.iter().zip(versions) {
            self.bus.publish(
                Envelope::new(
                    write.entity.domain,
                    "state_changed",
                    EventPriority::P1,
                    json!({
                        "entity": write.entity,
                        "version": version,
                        "transaction_id": ctx.id,
                    }),
                )
                .with_correlation(ctx.id.clone()),
                EventPriority::P1,
            );
        }

        Ok(degraded)
    }

    async fn finish_committed(&self, ctx: &TxContext, reports: Vec<StepReport>, degraded: bool) -> TransactionResult {
        self.transition(ctx, TransactionState::Committed, |r| r).await;

        let outcome = if degraded {
            OperationOutcome::CompletedDegraded {
                mode: self.modes.current(),
            }
        } else {
            OperationOutcome::Completed
        };
        info!(transaction_id = %ctx.id, degraded, "Transaction committed");

        self.finish(ctx, TransactionState::Committed, outcome, reports, false).await
    }

    async fn execute_step(
        &self,
        ctx: &TxContext,
        label: &str,
        step: &TransactionStep,
        timeout: Duration,
    ) -> Result<(Vec<AllocationId>, Value)> {
        let deadline = StepDeadline::start(timeout);
        let allocations = self.acquire(ctx, label, step, deadline).await?;
        let call = self
            .dispatcher
            .call(step.domain, &step.action, step.payload.clone(), timeout);
        match deadline.bound(label, call).await {
            Ok(output) => Ok((allocations, output)),
            Err(e) => {
                self.release_all(&allocations);
                Err(e)
            }
        }
    }

    async fn run_saga(&self, ctx: &TxContext, steps: &[TransactionStep]) -> TransactionResult {
        let mut reports: Vec<StepReport> = steps
            .iter()
            .enumerate()
            .map(|(i, s)| StepReport::pending(i, s))
            .collect();
        let mut executed: Vec<(usize, CompensationAction)> = Vec::new();
        let mut failure: Option<Error> = None;

        self.transition(ctx, TransactionState::Executing, |r| r).await;

        for (index, step) in steps.iter().enumerate() {
            if ctx.live.cancel.is_cancelled() {
                failure = Some(ctx.cancel_error());
                break;
            }

            let label = step.label(index);
            let timeout = self.step_timeout(step);
            let outcome = tokio::select! {
                result = self.execute_step(ctx, &label, step, timeout) => result,
                _ = ctx.live.cancel.cancelled() => Err(ctx.cancel_error()),
            };

            match outcome {
                Ok((allocations, output)) => {
                    debug!(transaction_id = %ctx.id, step = %label, "Step executed");
                    let report = &mut reports[index];
                    report.status = StepStatus::Executed;
                    report.allocations = allocations.clone();
                    report.output = Some(output);

                    executed.push((
                        index,
                        CompensationAction {
                            label,
                            domain: step.domain,
                            action: step.compensation.clone(),
                            payload: step.payload.clone(),
                            allocations,
                            timeout,
                        },
                    ));

                    let held = executed.iter().flat_map(|(_, a)| a.allocations.clone()).collect();
                    let pending = executed.iter().map(|(_, a)| a.to_pending()).collect();
                    self.transition(ctx, TransactionState::Executing, |r| {
                        r.with_allocations(held).with_compensations(pending)
                    })
                    .await;
                }
                Err(e) => {
                    warn!(transaction_id = %ctx.id, step = %label, "Step failed: {}", e);
                    self.signal_error(ctx, step.domain, &e);
                    reports[index].status = StepStatus::Failed;
                    reports[index].error = Some(e.report());
                    failure = Some(e);
                    break;
                }
            }
        }

        let error = match failure {
            Some(e) => e,
            None => match self.commit_transaction(ctx, steps, &mut reports).await {
                Ok(degraded) => return self.finish_committed(ctx, reports, degraded).await,
                Err(e) => {
                    warn!(transaction_id = %ctx.id, "Saga commit failed, compensating: {}", e);
                    e
                }
            },
        };

        let keep: HashSet<AllocationId> = executed
            .iter()
            .flat_map(|(_, a)| a.allocations.iter().copied())
            .collect();
        self.release_transaction(&ctx.id, &keep);

        if executed.is_empty() {
            let detail = error.to_string();
            self.transition(ctx, TransactionState::Aborting, |r| r.with_detail(detail.clone())).await;
            self.transition(ctx, TransactionState::Aborted, |r| r.with_detail(detail)).await;
            warn!(transaction_id = %ctx.id, "Saga failed before any step executed: {}", error);
            return self
                .finish(
                    ctx,
                    TransactionState::Aborted,
                    OperationOutcome::FailedNothingReserved { error: error.report() },
                    reports,
                    false,
                )
                .await;
        }

        let pending = executed.iter().map(|(_, a)| a.to_pending()).collect();
        self.transition(ctx, TransactionState::Compensating, |r| {
            r.with_allocations(keep.iter().copied().collect())
                .with_compensations(pending)
                .with_detail(error.to_string())
        })
        .await;

        let actions: Vec<CompensationAction> = executed.iter().rev().map(|(_, a)| a.clone()).collect();
        let compensation = self.compensator.compensate(&actions).await;

        for (result, (index, action)) in compensation.results.iter().zip(executed.iter().rev()) {
            let report = &mut reports[*index];
            match &result.error {
                None => report.status = StepStatus::Compensated,
                Some(e) => {
                    report.status = StepStatus::CompensationFailed;
                    report.error = Some(e.clone());
                    let _ = self.signals.send(
                        FailureSignal::new(action.domain, FailureKind::CompensationFailure, e.message.clone())
                            .with_correlation(ctx.id.clone()),
                    );
                }
            }
        }

        let partial_failure = compensation.partial_failure();
        self.transition(ctx, TransactionState::Compensated, |r| {
            r.with_partial_failure(partial_failure).with_detail(error.to_string())
        })
        .await;

        if partial_failure {
            error!(
                transaction_id = %ctx.id,
                failed = ?compensation.failed_labels(),
                "Saga compensated with failures"
            );
        } else {
            info!(transaction_id = %ctx.id, "Saga compensated");
        }

        self.finish(
            ctx,
            TransactionState::Compensated,
            OperationOutcome::Compensated { partial_failure },
            reports,
            partial_failure,
        )
        .await
    }

    /// Retires a live transaction into the completed table
    async fn finish(
        &self,
        ctx: &TxContext,
        state: TransactionState,
        outcome: OperationOutcome,
        steps: Vec<StepReport>,
        partial_failure: bool,
    ) -> TransactionResult {
        let result = TransactionResult {
            transaction_id: ctx.id.clone(),
            mode: ctx.mode,
            state,
            outcome,
            steps,
            partial_failure,
            degradation_mode: self.modes.current(),
            started_at: ctx.started_at,
            finished_at: Utc::now(),
        };

        self.metrics.record_outcome(&result.outcome, ctx.started.elapsed());
        self.completed
            .insert(ctx.id.clone(), (result.clone(), Instant::now()));
        self.live.remove(&ctx.id);

        self.save_snapshot().await;

        result
    }

    /// Persists the ledger if storage is durable
    pub async fn save_snapshot(&self) {
        if let Some(store) = self.storage.snapshots() {
            if let Err(e) = store.save(&self.ledger.snapshot()).await {
                error!("Ledger snapshot failed: {}", e);
            }
        }
    }

    /// Drives transactions interrupted by a restart to a terminal state
    ///
    /// Terminal records are retained for idempotent resubmission. Returns the
    /// results of the transactions that had to be finished.
    pub async fn recover(&self, records: Vec<JournalRecord>) -> Vec<TransactionResult> {
        let mut recovered = Vec::new();

        for (id, record) in latest_by_transaction(records) {
            if self.live.contains_key(&id) || self.completed.contains_key(&id) {
                continue;
            }

            if record.state.is_terminal() {
                self.completed
                    .insert(id, (self.result_from_record(&record), Instant::now()));
                continue;
            }

            warn!(transaction_id = %id, state = %record.state, "Recovering interrupted transaction");

            let mut degraded = false;
            let (state, partial_failure) = match record.state {
                TransactionState::Committing => {
                    degraded = self.recover_commit(&record).await;
                    (TransactionState::Committed, false)
                }
                TransactionState::Executing | TransactionState::Compensating if !record.compensations.is_empty() => {
                    self.recover_compensation(&record).await
                }
                _ => (self.recover_abort(&record).await, false),
            };

            let finished = JournalRecord::new(id.clone(), record.mode, state)
                .with_partial_failure(partial_failure)
                .with_degraded(degraded)
                .with_detail(format!("recovered from {} after restart", record.state));
            if let Err(e) = self.storage.journal().append(&finished).await {
                error!(transaction_id = %id, "Journal append failed: {}", e);
            }

            let result = self.result_from_record(&finished);
            self.completed.insert(id, (result.clone(), Instant::now()));
            recovered.push(result);
        }

        if !recovered.is_empty() {
            info!(count = recovered.len(), "Interrupted transactions recovered");
            self.save_snapshot().await;
        }

        recovered
    }

    /// Finishes an interrupted commit; returns true when a participant did
    /// not confirm
    async fn recover_commit(&self, record: &JournalRecord) -> bool {
        for id in &record.allocations {
            if let Err(e) = self.ledger.commit(*id) {
                warn!(transaction_id = %record.transaction_id, allocation_id = %id, "Allocation not committed on recovery: {}", e);
            }
        }
        if let Err(e) = self.registry.write_batch(record.writes.clone()) {
            warn!(transaction_id = %record.transaction_id, "Staged writes not applied on recovery: {}", e);
        }
        let mut degraded = false;
        for id in &record.allocations {
            if let Some(allocation) = self.ledger.get(*id) {
                if let Err(e) = self
                    .agents
                    .commit(allocation.domain, *id, self.settings.default_step_timeout)
                    .await
                {
                    warn!(transaction_id = %record.transaction_id, allocation_id = %id, "Participant did not confirm recovered commit: {}", e);
                    degraded = true;
                }
            }
        }
        degraded
    }

    async fn recover_compensation(&self, record: &JournalRecord) -> (TransactionState, bool) {
        let actions: Vec<CompensationAction> = record
            .compensations
            .iter()
            .rev()
            .cloned()
            .map(|p| CompensationAction::from_pending(p, self.settings.default_step_timeout))
            .collect();
        let report = self.compensator.compensate(&actions).await;
        self.release_transaction(&record.transaction_id, &HashSet::new());
        (
            TransactionState::Compensated,
            record.partial_failure || report.partial_failure(),
        )
    }

    async fn recover_abort(&self, record: &JournalRecord) -> TransactionState {
        let mut held: Vec<AllocationId> = record.allocations.clone();
        held.extend(
            self.ledger
                .allocations_for_transaction(&record.transaction_id)
                .into_iter()
                .map(|a| a.id),
        );
        held.sort();
        held.dedup();

        for id in held {
            if let Some(allocation) = self.ledger.get(id) {
                if allocation.status.is_active() {
                    if let Err(e) = self
                        .agents
                        .compensate(allocation.domain, id, self.settings.default_step_timeout)
                        .await
                    {
                        warn!(transaction_id = %record.transaction_id, allocation_id = %id, "Participant did not undo its reservation on recovery: {}", e);
                    }
                }
            }
            if let Err(e) = self.ledger.release(id) {
                warn!(transaction_id = %record.transaction_id, allocation_id = %id, "Release failed: {}", e);
            }
        }
        TransactionState::Aborted
    }

    fn result_from_record(&self, record: &JournalRecord) -> TransactionResult {
        let outcome = match record.state {
            TransactionState::Committed if record.degraded => OperationOutcome::CompletedDegraded {
                mode: self.modes.current(),
            },
            TransactionState::Committed => OperationOutcome::Completed,
            TransactionState::Compensated => OperationOutcome::Compensated {
                partial_failure: record.partial_failure,
            },
            _ => OperationOutcome::FailedNothingReserved {
                error: ErrorReport::from(&Error::Aborted(
                    record.detail.clone().unwrap_or_else(|| "aborted".to_string()),
                )),
            },
        };

        TransactionResult {
            transaction_id: record.transaction_id.clone(),
            mode: record.mode,
            state: record.state,
            outcome,
            steps: Vec::new(),
            partial_failure: record.partial_failure,
            degradation_mode: self.modes.current(),
            started_at: record.recorded_at,
            finished_at: record.recorded_at,
        }
    }

    /// Releases active allocations whose owning transaction is neither live
    /// nor committed
    pub fn reconcile_orphans(&self) -> usize {
        let mut released = 0;
        for allocation in self.ledger.snapshot().allocations {
            if !allocation.status.is_active() {
                continue;
            }
            let Some(owner) = &allocation.owner_transaction else {
                continue;
            };
            if self.live.contains_key(owner) {
                continue;
            }
            let committed = self
                .completed
                .get(owner)
                .map_or(false, |entry| entry.0.state == TransactionState::Committed);
            if committed {
                continue;
            }
            if self.ledger.release(allocation.id).unwrap_or(false) {
                warn!(allocation_id = %allocation.id, transaction_id = %owner, "Orphaned allocation released");
                released += 1;
            }
        }
        released
    }

    /// Drops results past the audit window, prunes released allocations and
    /// compacts the journal
    ///
    /// Returns the number of results dropped.
    pub async fn collect_garbage(&self) -> Result<usize> {
        let retention = self.settings.audit_retention;
        let now = Instant::now();

        let before = self.completed.len();
        self.completed
            .retain(|_, (_, finished)| now.saturating_duration_since(*finished) < retention);
        let expired = before.saturating_sub(self.completed.len());

        let pruned = self.ledger.prune_released(retention);

        let keep: HashSet<TransactionId> = self
            .live
            .iter()
            .map(|e| e.key().clone())
            .chain(self.completed.iter().map(|e| e.key().clone()))
            .collect();
        let compacted = self.storage.journal().compact(&keep).await?;

        debug!(expired, pruned, compacted, "Retention sweep finished");

        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ResolverSettings;
    use crate::dispatch::OperationCatalog;
    use crate::priority::{PriorityFactors, PriorityScorer};
    use crate::testing::ScriptedAgent;
    use common::types::{DegradationMode, ResourceKind};
    use event_bus::BusSettings;

    struct Fixture {
        coordinator: TransactionCoordinator,
        ledger: Arc<AllocationLedger>,
        modes: Arc<ModeController>,
    }

    fn fixture(agents: Vec<ScriptedAgent>) -> Fixture {
        let directory = Arc::new(AgentDirectory::new(Duration::from_millis(200)));
        for agent in agents {
            directory.register(Arc::new(agent)).unwrap();
        }
        let ledger = Arc::new(AllocationLedger::new());
        ledger.declare_capacity(Domain::Model, ResourceKind::ModelSlot, 2).unwrap();
        let modes = Arc::new(ModeController::new());
        let dispatcher = Arc::new(ActionDispatcher::new(directory.clone(), Arc::new(OperationCatalog::builtin())));
        let (resolver, _notices) = ConflictResolver::new(
            ledger.clone(),
            PriorityScorer::default(),
            modes.clone(),
            ResolverSettings::default(),
        );
        let (signals, _rx) = mpsc::unbounded_channel();
        let parts = CoordinatorParts {
            agents: directory.clone(),
            dispatcher: dispatcher.clone(),
            registry: Arc::new(DomainRegistry::new()),
            ledger: ledger.clone(),
            bus: Arc::new(PropagationBus::new(BusSettings::default())),
            resolver: Arc::new(resolver),
            compensator: Arc::new(Compensator::new(directory, dispatcher, ledger.clone())),
            modes: modes.clone(),
            storage: Arc::new(StorageManager::in_memory()),
            metrics: Arc::new(EngineMetrics::new()),
            signals,
        };
        Fixture {
            coordinator: TransactionCoordinator::new(parts, CoordinatorSettings::default()),
            ledger,
            modes,
        }
    }

    #[tokio::test]
    async fn test_rejects_malformed_requests() {
        let f = fixture(vec![ScriptedAgent::new(Domain::Model)]);

        let empty = OperationRequest::saga("tx-empty");
        assert!(f.coordinator.submit(empty).await.unwrap_err().is_validation());

        let wide = OperationRequest::two_phase("tx-wide")
            .with_step(TransactionStep::new(Domain::Device, "acquire_device"))
            .with_step(TransactionStep::new(Domain::Model, "load_model"))
            .with_step(TransactionStep::new(Domain::Inference, "run_inference"));
        assert!(f.coordinator.submit(wide).await.unwrap_err().is_validation());

        let misplaced = OperationRequest::saga("tx-misplaced")
            .with_step(TransactionStep::new(Domain::Device, "load_model"));
        assert!(f.coordinator.submit(misplaced).await.unwrap_err().is_validation());

        let primitive = OperationRequest::saga("tx-primitive")
            .with_step(TransactionStep::new(Domain::Model, "commit"));
        assert!(f.coordinator.submit(primitive).await.unwrap_err().is_validation());

        assert_eq!(f.coordinator.live_count(), 0);
    }

    #[tokio::test]
    async fn test_catalog_cost_is_reserved_and_committed() {
        let f = fixture(vec![ScriptedAgent::new(Domain::Model)]);
        let request = OperationRequest::saga("tx-load").with_step(TransactionStep::new(Domain::Model, "load_model"));

        let result = f.coordinator.submit(request).await.unwrap();
        assert!(result.is_committed());
        assert_eq!(result.outcome, OperationOutcome::Completed);

        let usage = f.ledger.pool_usage(Domain::Model, &ResourceKind::ModelSlot).unwrap();
        assert_eq!(usage.committed, 1);
        assert_eq!(usage.reserved, 0);
        assert_eq!(f.coordinator.state_of("tx-load"), Some(TransactionState::Committed));
    }

    #[tokio::test]
    async fn test_safety_first_rejects_sagas_and_background_work() {
        let f = fixture(vec![ScriptedAgent::new(Domain::Model)]);
        f.modes.raise_to(DegradationMode::SafetyFirst, "test");

        let saga = OperationRequest::saga("tx-saga")
            .with_priority(PriorityFactors::critical())
            .with_step(TransactionStep::new(Domain::Model, "warm_up"));
        assert_eq!(f.coordinator.submit(saga).await.unwrap_err().code(), "INVALID_STATE");

        let background = OperationRequest::two_phase("tx-bg")
            .with_priority(PriorityFactors::background())
            .with_step(TransactionStep::new(Domain::Model, "warm_up"));
        assert_eq!(f.coordinator.submit(background).await.unwrap_err().code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_cancel_unknown_and_finished() {
        let f = fixture(vec![ScriptedAgent::new(Domain::Model)]);
        assert!(f.coordinator.cancel("nope").unwrap_err().is_not_found());

        let request = OperationRequest::saga("tx-done").with_step(TransactionStep::new(Domain::Model, "warm_up"));
        f.coordinator.submit(request).await.unwrap();
        assert_eq!(f.coordinator.cancel("tx-done").unwrap_err().code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn test_recover_finishes_interrupted_transactions() {
        let f = fixture(vec![ScriptedAgent::new(Domain::Model)]);
        let held = f
            .ledger
            .reserve(resource_manager::ReserveRequest::new(Domain::Model, ResourceKind::ModelSlot, 1).with_owner("tx-a"))
            .unwrap();

        let records = vec![
            JournalRecord::new("tx-a", TransactionMode::TwoPhase, TransactionState::Preparing)
                .with_allocations(vec![held]),
            JournalRecord::new("tx-b", TransactionMode::Saga, TransactionState::Executing),
            JournalRecord::new("tx-b", TransactionMode::Saga, TransactionState::Committing),
            JournalRecord::new("tx-b", TransactionMode::Saga, TransactionState::Committed),
        ];

        let recovered = f.coordinator.recover(records).await;
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].state, TransactionState::Aborted);
        assert!(!f.ledger.get(held).unwrap().status.is_active());

        assert_eq!(f.coordinator.state_of("tx-b"), Some(TransactionState::Committed));
        assert_eq!(f.coordinator.reconcile_orphans(), 0);
    }

    #[tokio::test]
    async fn test_recovered_commit_is_degraded_when_participant_does_not_confirm() {
        let f = fixture(vec![ScriptedAgent::new(Domain::Model).failing_commit()]);
        let held = f
            .ledger
            .reserve(resource_manager::ReserveRequest::new(Domain::Model, ResourceKind::ModelSlot, 1).with_owner("tx-c"))
            .unwrap();

        let records = vec![JournalRecord::new("tx-c", TransactionMode::Saga, TransactionState::Committing)
            .with_allocations(vec![held])];

        let recovered = f.coordinator.recover(records).await;
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].state, TransactionState::Committed);
        assert_eq!(
            recovered[0].outcome,
            OperationOutcome::CompletedDegraded {
                mode: DegradationMode::Normal
            }
        );
        assert_eq!(f.ledger.get(held).unwrap().status, common::models::AllocationStatus::Committed);
        assert_eq!(
            f.coordinator.result("tx-c").map(|r| r.outcome),
            Some(recovered[0].outcome.clone())
        );
    }
}
