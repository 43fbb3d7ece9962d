//! Conflict resolver
//!
//! Arbitrates competing claims on a pool. A request that fits is granted at
//! once; otherwise the lowest-priority preemptable allocations are preempted
//! if that frees enough capacity and every victim has strictly lower
//! priority; otherwise the request waits in a queue that is re-evaluated on
//! every release, aging the waiting requests, until its wait bound expires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use common::models::{Allocation, AllocationId, TransactionId};
use common::types::{Domain, ResourceKind};
use resource_manager::{AllocationLedger, PoolKey, ReserveRequest};
use settings::ConfigManager;

use crate::degradation::ModeController;
use crate::priority::PriorityScorer;

/// A pending resource claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRequest {
    pub requester_id: String,
    pub domain: Domain,
    pub resource_kind: ResourceKind,
    pub amount: u64,
    /// Base priority score
    pub priority_score: f64,
    pub submitted_at: DateTime<Utc>,
    /// Whether the granted allocation may itself be preempted later
    pub preemptable: bool,
    pub purpose: String,
    /// Transaction that will own the allocation
    #[serde(default)]
    pub owner_transaction: Option<TransactionId>,
    /// Queue wait bound; the resolver default when unset, zero never queues
    #[serde(default)]
    pub max_wait: Option<Duration>,
}

impl ConflictRequest {
    pub fn new(
        requester_id: impl Into<String>,
        domain: Domain,
        resource_kind: impl Into<ResourceKind>,
        amount: u64,
        priority_score: f64,
    ) -> Self {
        Self {
            requester_id: requester_id.into(),
            domain,
            resource_kind: resource_kind.into(),
            amount,
            priority_score,
            submitted_at: Utc::now(),
            preemptable: true,
            purpose: String::new(),
            owner_transaction: None,
            max_wait: None,
        }
    }

    pub fn with_preemptable(mut self, preemptable: bool) -> Self {
        self.preemptable = preemptable;
        self
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = purpose.into();
        self
    }

    pub fn with_owner(mut self, transaction_id: impl Into<TransactionId>) -> Self {
        self.owner_transaction = Some(transaction_id.into());
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    fn pool_key(&self) -> PoolKey {
        PoolKey::new(self.domain, self.resource_kind.clone())
    }

    fn reserve_request(&self, priority: f64, capacity_fraction: f64) -> ReserveRequest {
        let mut request = ReserveRequest::new(self.domain, self.resource_kind.clone(), self.amount)
            .with_purpose(self.purpose.clone())
            .with_priority(priority)
            .with_preemptable(self.preemptable)
            .with_capacity_fraction(capacity_fraction);
        if let Some(owner) = &self.owner_transaction {
            request = request.with_owner(owner.clone());
        }
        request
    }
}

/// Answer to an admission request
#[derive(Debug)]
pub enum Admission {
    Granted {
        allocation_id: AllocationId,
        preempted: Vec<AllocationId>,
    },
    Queued(QueueTicket),
    Denied(Error),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted { .. })
    }

    pub fn preempted(&self) -> &[AllocationId] {
        match self {
            Admission::Granted { preempted, .. } => preempted,
            _ => &[],
        }
    }
}

/// Handle on a queued request
///
/// Dropping the ticket withdraws the request; a grant that races the drop
/// is released again.
#[derive(Debug)]
pub struct QueueTicket {
    pub request_id: u64,
    receiver: oneshot::Receiver<Result<AllocationId>>,
}

impl QueueTicket {
    /// Waits for the grant or the denial
    pub async fn wait(self) -> Result<AllocationId> {
        self.receiver
            .await
            .unwrap_or_else(|_| Err(Error::Cancelled("Conflict resolver stopped".to_string())))
    }
}

/// Sent for every allocation taken away by preemption
#[derive(Debug, Clone)]
pub struct PreemptionNotice {
    /// The victim as it was before release
    pub victim: Allocation,
    pub preempted_by: AllocationId,
    pub requester_id: String,
}

/// Resolver tunables
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub max_queue_wait: Duration,
    pub max_queue_length: usize,
    /// Period of the deadline sweep between release events
    pub sweep_interval: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            max_queue_wait: Duration::from_secs(30),
            max_queue_length: 1_024,
            sweep_interval: Duration::from_millis(250),
        }
    }
}

impl ResolverSettings {
    pub fn from_config(config_manager: &ConfigManager) -> Self {
        let defaults = Self::default();
        Self {
            max_queue_wait: config_manager
                .get_duration("resolver.max_queue_wait_ms")
                .unwrap_or(defaults.max_queue_wait),
            max_queue_length: config_manager
                .get_usize("resolver.max_queue_length")
                .unwrap_or(defaults.max_queue_length),
            sweep_interval: defaults.sweep_interval,
        }
    }
}

struct Waiter {
    id: u64,
    request: ConflictRequest,
    enqueued_at: Instant,
    deadline: Instant,
    reply: oneshot::Sender<Result<AllocationId>>,
}

/// Conflict resolver
pub struct ConflictResolver {
    ledger: Arc<AllocationLedger>,
    scorer: PriorityScorer,
    modes: Arc<ModeController>,
    settings: ResolverSettings,
    queue: Mutex<Vec<Waiter>>,
    next_ticket: AtomicU64,
    notices: mpsc::UnboundedSender<PreemptionNotice>,
}

impl ConflictResolver {
    /// Creates a resolver and the stream of its preemption notices
    pub fn new(
        ledger: Arc<AllocationLedger>,
        scorer: PriorityScorer,
        modes: Arc<ModeController>,
        settings: ResolverSettings,
    ) -> (Self, mpsc::UnboundedReceiver<PreemptionNotice>) {
        let (notices, notices_rx) = mpsc::unbounded_channel();
        let resolver = Self {
            ledger,
            scorer,
            modes,
            settings,
            queue: Mutex::new(Vec::new()),
            next_ticket: AtomicU64::new(1),
            notices,
        };
        (resolver, notices_rx)
    }

    pub fn scorer(&self) -> &PriorityScorer {
        &self.scorer
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    /// Number of queued requests
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Admits, queues or denies a request
    pub fn admit(&self, request: ConflictRequest) -> Admission {
        if request.amount == 0 || !request.priority_score.is_finite() {
            return Admission::Denied(Error::Validation(format!(
                "Malformed claim from {}: amount {}, priority {}",
                request.requester_id, request.amount, request.priority_score
            )));
        }

        let denial = match self.try_grant(&request, request.priority_score) {
            Ok((allocation_id, preempted)) => {
                return Admission::Granted {
                    allocation_id,
                    preempted,
                }
            }
            Err(e @ Error::CapacityDenied { .. }) => e,
            Err(e) => return Admission::Denied(e),
        };

        let max_wait = request.max_wait.unwrap_or(self.settings.max_queue_wait);
        if max_wait.is_zero() {
            debug!(requester = %request.requester_id, "Claim denied without queueing");
            return Admission::Denied(denial);
        }

        let mut queue = self.queue.lock();
        if queue.len() >= self.settings.max_queue_length {
            warn!(requester = %request.requester_id, "Resolver queue full, claim denied");
            return Admission::Denied(denial);
        }

        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (reply, receiver) = oneshot::channel();
        let now = Instant::now();
        info!(
            ticket = id,
            requester = %request.requester_id,
            pool = %request.pool_key(),
            amount = request.amount,
            "Claim queued"
        );
        queue.push(Waiter {
            id,
            request,
            enqueued_at: now,
            deadline: now + max_wait,
            reply,
        });

        Admission::Queued(QueueTicket {
            request_id: id,
            receiver,
        })
    }

    /// Grant by fit, then by preemption if the mode allows it
    fn try_grant(&self, request: &ConflictRequest, priority: f64) -> Result<(AllocationId, Vec<AllocationId>)> {
        let restrictions = self.modes.restrictions();
        let reserve = request.reserve_request(priority, restrictions.capacity_fraction);

        let denial = match self.ledger.reserve(reserve.clone()) {
            Ok(id) => return Ok((id, Vec::new())),
            Err(e @ Error::CapacityDenied { .. }) => e,
            Err(e) => return Err(e),
        };

        if !restrictions.allow_preemption {
            return Err(denial);
        }

        let Some(victims) = self.plan_preemption(request, priority, restrictions.capacity_fraction) else {
            return Err(denial);
        };

        match self.ledger.preempt_and_reserve(reserve, &victims) {
            Ok((id, preempted)) => {
                let ids = preempted.iter().map(|a| a.id).collect();
                for victim in preempted {
                    info!(
                        victim = %victim.id,
                        victim_priority = victim.priority,
                        preempted_by = %id,
                        priority,
                        "Allocation preempted"
                    );
                    let _ = self.notices.send(PreemptionNotice {
                        victim,
                        preempted_by: id,
                        requester_id: request.requester_id.clone(),
                    });
                }
                Ok((id, ids))
            }
            Err(e) => {
                debug!("Preemption plan went stale: {}", e);
                Err(denial)
            }
        }
    }

    /// Lowest-priority eligible victims that free enough capacity, if any
    fn plan_preemption(&self, request: &ConflictRequest, priority: f64, fraction: f64) -> Option<Vec<AllocationId>> {
        let usage = self.ledger.pool_usage(request.domain, &request.resource_kind).ok()?;
        let usable = (((usage.capacity as f64) * fraction).floor() as u64).min(usage.capacity);
        let mut available = usable.saturating_sub(usage.reserved + usage.committed);

        let mut victims = Vec::new();
        for allocation in self.ledger.active_allocations(request.domain, &request.resource_kind) {
            if available >= request.amount {
                break;
            }
            if !allocation.preemptable || allocation.priority >= priority {
                continue;
            }
            if request.owner_transaction.is_some() && allocation.owner_transaction == request.owner_transaction {
                continue;
            }
            available += allocation.amount;
            victims.push(allocation.id);
        }

        (available >= request.amount && !victims.is_empty()).then_some(victims)
    }

    /// Re-evaluates queued requests, optionally only those of one pool
    ///
    /// Expired requests are denied. Eligible ones are tried in descending
    /// effective priority, each with its aged priority.
    pub fn reevaluate(&self, pool: Option<&PoolKey>) {
        let mut queue = self.queue.lock();
        if queue.is_empty() {
            return;
        }

        let now = Instant::now();
        let mut waiting = Vec::with_capacity(queue.len());
        let mut candidates = Vec::new();

        for waiter in queue.drain(..) {
            if waiter.reply.is_closed() {
                debug!(ticket = waiter.id, "Queued claim withdrawn");
            } else if now >= waiter.deadline {
                info!(ticket = waiter.id, requester = %waiter.request.requester_id, "Queued claim expired");
                let available = self
                    .ledger
                    .pool_usage(waiter.request.domain, &waiter.request.resource_kind)
                    .map(|u| u.available)
                    .unwrap_or(0);
                let _ = waiter.reply.send(Err(Error::CapacityDenied {
                    domain: waiter.request.domain,
                    resource_kind: waiter.request.resource_kind.clone(),
                    requested: waiter.request.amount,
                    available,
                }));
            } else if pool.map_or(true, |p| *p == waiter.request.pool_key()) {
                candidates.push(waiter);
            } else {
                waiting.push(waiter);
            }
        }

        let effective = |w: &Waiter| {
            self.scorer
                .effective(w.request.priority_score, now.saturating_duration_since(w.enqueued_at))
        };
        candidates.sort_by(|a, b| effective(b).total_cmp(&effective(a)).then_with(|| a.id.cmp(&b.id)));

        for waiter in candidates {
            let priority = effective(&waiter);
            match self.try_grant(&waiter.request, priority) {
                Ok((allocation_id, _)) => {
                    info!(
                        ticket = waiter.id,
                        allocation_id = %allocation_id,
                        effective_priority = priority,
                        "Queued claim granted"
                    );
                    if waiter.reply.send(Ok(allocation_id)).is_err() {
                        let _ = self.ledger.release(allocation_id);
                    }
                }
                Err(Error::CapacityDenied { .. }) => waiting.push(waiter),
                Err(e) => {
                    let _ = waiter.reply.send(Err(e));
                }
            }
        }

        waiting.sort_by_key(|w| w.id);
        *queue = waiting;
    }

    /// Denies every queued request
    pub fn drain(&self, reason: &str) {
        for waiter in self.queue.lock().drain(..) {
            let _ = waiter.reply.send(Err(Error::Cancelled(reason.to_string())));
        }
    }

    /// Re-evaluates the queue on releases and on a periodic sweep
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut releases = self.ledger.subscribe_releases();
        let mut sweep = tokio::time::interval(self.settings.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Conflict resolver started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                released = releases.recv() => match released {
                    Ok(pool) => self.reevaluate(Some(&pool)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Release notifications lagged, re-evaluating all pools");
                        self.reevaluate(None);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = sweep.tick() => self.reevaluate(None),
            }
        }

        self.drain("Conflict resolver stopped");
        info!("Conflict resolver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::DegradationMode;

    const GB: u64 = 1 << 30;

    fn resolver() -> (Arc<ConflictResolver>, Arc<AllocationLedger>, mpsc::UnboundedReceiver<PreemptionNotice>, Arc<ModeController>) {
        let ledger = Arc::new(AllocationLedger::new());
        ledger.declare_capacity(Domain::Memory, ResourceKind::MemoryBytes, 10 * GB).unwrap();
        let modes = Arc::new(ModeController::new());
        let (resolver, notices) = ConflictResolver::new(
            ledger.clone(),
            PriorityScorer::default(),
            modes.clone(),
            ResolverSettings::default(),
        );
        (Arc::new(resolver), ledger, notices, modes)
    }

    fn claim(id: &str, amount: u64, priority: f64) -> ConflictRequest {
        ConflictRequest::new(id, Domain::Memory, ResourceKind::MemoryBytes, amount, priority)
    }

    #[test]
    fn test_fit_is_granted_immediately() {
        let (resolver, ledger, _, _) = resolver();
        let admission = resolver.admit(claim("a", 4 * GB, 5.0));
        assert!(admission.is_granted());
        assert!(admission.preempted().is_empty());
        assert_eq!(ledger.pool_usage(Domain::Memory, &ResourceKind::MemoryBytes).unwrap().reserved, 4 * GB);
    }

    #[test]
    fn test_preempts_lowest_priority_first() {
        let (resolver, ledger, mut notices, _) = resolver();
        let Admission::Granted { allocation_id: low, .. } = resolver.admit(claim("low", 4 * GB, 2.0)) else {
            panic!("expected grant");
        };
        let Admission::Granted { allocation_id: mid, .. } = resolver.admit(claim("mid", 4 * GB, 4.0)) else {
            panic!("expected grant");
        };

        let admission = resolver.admit(claim("urgent", 4 * GB, 9.0));
        assert_eq!(admission.preempted(), &[low]);
        assert!(ledger.get(mid).unwrap().status.is_active());

        let notice = notices.try_recv().unwrap();
        assert_eq!(notice.victim.id, low);
        assert_eq!(notice.requester_id, "urgent");
    }

    #[test]
    fn test_never_preempts_equal_priority_or_non_preemptable() {
        let (resolver, _, _, _) = resolver();
        assert!(resolver.admit(claim("pinned", 5 * GB, 1.0).with_preemptable(false)).is_granted());
        assert!(resolver.admit(claim("peer", 5 * GB, 6.0)).is_granted());

        match resolver.admit(claim("same", 2 * GB, 6.0).with_max_wait(Duration::ZERO)) {
            Admission::Denied(e) => assert!(e.is_capacity_denied()),
            other => panic!("unexpected admission: {:?}", other),
        }
    }

    #[test]
    fn test_safety_first_disables_preemption() {
        let (resolver, _, _, modes) = resolver();
        assert!(resolver.admit(claim("low", 5 * GB, 1.0)).is_granted());
        modes.raise_to(DegradationMode::SafetyFirst, "test");

        // Usable capacity is halved and the low-priority holder stays put
        let admission = resolver.admit(claim("urgent", GB, 9.0).with_max_wait(Duration::ZERO));
        assert!(matches!(admission, Admission::Denied(_)));
    }

    #[tokio::test]
    async fn test_queued_claim_granted_on_release() {
        let (resolver, ledger, _, _) = resolver();
        let Admission::Granted { allocation_id: holder, .. } =
            resolver.admit(claim("holder", 8 * GB, 9.0).with_preemptable(false))
        else {
            panic!("expected grant");
        };

        let Admission::Queued(ticket) = resolver.admit(claim("waiter", 4 * GB, 3.0)) else {
            panic!("expected queue");
        };
        assert_eq!(resolver.queue_len(), 1);

        let cancel = CancellationToken::new();
        let runner = tokio::spawn(resolver.clone().run(cancel.clone()));
        tokio::task::yield_now().await;

        ledger.release(holder).unwrap();
        let granted = ticket.wait().await.unwrap();
        let allocation = ledger.get(granted).unwrap();
        assert!(allocation.status.is_active());
        assert!(allocation.priority >= 3.0);
        assert_eq!(resolver.queue_len(), 0);

        cancel.cancel();
        runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_claim_denied_after_bound() {
        let (resolver, _, _, _) = resolver();
        assert!(resolver.admit(claim("holder", 9 * GB, 9.0).with_preemptable(false)).is_granted());

        let Admission::Queued(ticket) = resolver.admit(claim("waiter", 4 * GB, 3.0).with_max_wait(Duration::from_secs(2)))
        else {
            panic!("expected queue");
        };

        let cancel = CancellationToken::new();
        let runner = tokio::spawn(resolver.clone().run(cancel.clone()));

        let err = ticket.wait().await.unwrap_err();
        assert!(err.is_capacity_denied());

        cancel.cancel();
        runner.await.unwrap();
    }
}
