//! Allocation ledger implementation
//!
//! The ledger is the single source of truth for capacity. Each
//! `domain+resource_kind` pool has its own mutex; the capacity check and the
//! reservation happen inside that one critical section. Reservations spanning
//! several pools lock them in the global order (domain order, then resource
//! kind name).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::error::{Error, Result};
use common::models::{Allocation, AllocationId, AllocationStatus, TransactionId};
use common::types::{Domain, ResourceKind};
use common::utils::format_amount;

/// Capacity of the release notification channel
const RELEASE_CHANNEL_CAPACITY: usize = 1024;

/// Identity of a capacity pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolKey {
    pub domain: Domain,
    pub resource_kind: ResourceKind,
}

impl PoolKey {
    pub fn new(domain: Domain, resource_kind: ResourceKind) -> Self {
        Self {
            domain,
            resource_kind,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.resource_kind)
    }
}

/// A request to reserve capacity
#[derive(Debug, Clone)]
pub struct ReserveRequest {
    /// Domain holding the capacity
    pub domain: Domain,

    /// Resource kind
    pub resource_kind: ResourceKind,

    /// Amount to reserve
    pub amount: u64,

    /// Free-form purpose, for diagnostics
    pub purpose: String,

    /// Priority score of the requester
    pub priority: f64,

    /// Whether the allocation may later be preempted
    pub preemptable: bool,

    /// Transaction that will hold the allocation
    pub owner_transaction: Option<TransactionId>,

    /// Fraction of the declared capacity usable by this request
    pub capacity_fraction: f64,
}

impl ReserveRequest {
    /// Creates a request with full capacity usable and no owner
    pub fn new(domain: Domain, resource_kind: ResourceKind, amount: u64) -> Self {
        Self {
            domain,
            resource_kind,
            amount,
            purpose: String::new(),
            priority: 0.0,
            preemptable: true,
            owner_transaction: None,
            capacity_fraction: 1.0,
        }
    }

    pub fn with_purpose(mut self, purpose: impl Into<String>) -> Self {
        self.purpose = purpose.into();
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_preemptable(mut self, preemptable: bool) -> Self {
        self.preemptable = preemptable;
        self
    }

    pub fn with_owner(mut self, transaction_id: impl Into<TransactionId>) -> Self {
        self.owner_transaction = Some(transaction_id.into());
        self
    }

    pub fn with_capacity_fraction(mut self, fraction: f64) -> Self {
        self.capacity_fraction = fraction;
        self
    }

    /// Pool the request draws from
    pub fn pool_key(&self) -> PoolKey {
        PoolKey::new(self.domain, self.resource_kind.clone())
    }

    fn validate(&self) -> Result<()> {
        if self.amount == 0 {
            return Err(Error::Validation(format!(
                "Reservation of zero {} on {}",
                self.resource_kind, self.domain
            )));
        }
        if !self.priority.is_finite() {
            return Err(Error::Validation("Priority must be a finite number".to_string()));
        }
        if !(self.capacity_fraction > 0.0 && self.capacity_fraction <= 1.0) {
            return Err(Error::Validation(format!(
                "Capacity fraction {} outside (0, 1]",
                self.capacity_fraction
            )));
        }
        Ok(())
    }
}

/// Usage counters of a pool
#[derive(Debug, Default)]
struct Pool {
    capacity: u64,
    reserved: u64,
    committed: u64,
}

impl Pool {
    fn in_use(&self) -> u64 {
        self.reserved + self.committed
    }

    fn available(&self, capacity_fraction: f64) -> u64 {
        let usable = ((self.capacity as f64) * capacity_fraction).floor() as u64;
        usable.min(self.capacity).saturating_sub(self.in_use())
    }
}

/// Point-in-time usage of a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolUsage {
    pub domain: Domain,
    pub resource_kind: ResourceKind,
    pub capacity: u64,
    pub reserved: u64,
    pub committed: u64,
    pub available: u64,
}

impl PoolUsage {
    /// Fraction of capacity in use
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        (self.reserved + self.committed) as f64 / self.capacity as f64
    }
}

/// Declared capacity of a pool, as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    pub domain: Domain,
    pub resource_kind: ResourceKind,
    pub capacity: u64,
}

/// Persistable image of the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Declared pools
    pub pools: Vec<PoolSnapshot>,

    /// Every allocation still retained, active or released
    pub allocations: Vec<Allocation>,

    /// Time the snapshot was taken
    pub taken_at: DateTime<Utc>,
}

/// Allocation ledger
pub struct AllocationLedger {
    /// Pools by domain and resource kind
    pools: DashMap<PoolKey, Arc<Mutex<Pool>>>,

    /// Allocations by id
    allocations: DashMap<AllocationId, Allocation>,

    /// Release notifications
    release_tx: broadcast::Sender<PoolKey>,
}

impl AllocationLedger {
    /// Creates an empty ledger
    pub fn new() -> Self {
        let (release_tx, _) = broadcast::channel(RELEASE_CHANNEL_CAPACITY);

        Self {
            pools: DashMap::new(),
            allocations: DashMap::new(),
            release_tx,
        }
    }

    /// Declares (or re-declares) the capacity of a pool
    ///
    /// Shrinking a pool below its current usage is rejected.
    pub fn declare_capacity(&self, domain: Domain, resource_kind: ResourceKind, capacity: u64) -> Result<()> {
        let key = PoolKey::new(domain, resource_kind);
        let pool = self.pool_or_insert(&key);
        let mut pool = pool.lock();

        if capacity < pool.in_use() {
            return Err(Error::Validation(format!(
                "Capacity {} for {} is below current usage {}",
                capacity,
                key,
                pool.in_use()
            )));
        }

        pool.capacity = capacity;

        debug!(pool = %key, capacity = %format_amount(&key.resource_kind, capacity), "Capacity declared");

        Ok(())
    }

    /// Number of declared pools
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Reserves capacity from a single pool
    pub fn reserve(&self, request: ReserveRequest) -> Result<AllocationId> {
        request.validate()?;
        let key = request.pool_key();
        let pool = self.pool(&key)?;

        let mut pool = pool.lock();
        let available = pool.available(request.capacity_fraction);
        if request.amount > available {
            return Err(Error::CapacityDenied {
                domain: request.domain,
                resource_kind: request.resource_kind,
                requested: request.amount,
                available,
            });
        }

        pool.reserved += request.amount;
        let allocation = Self::new_allocation(request);
        let id = allocation.id;

        debug!(
            allocation_id = %id,
            pool = %key,
            amount = %format_amount(&key.resource_kind, allocation.amount),
            "Capacity reserved"
        );

        self.allocations.insert(id, allocation);

        Ok(id)
    }

    /// Reserves capacity from several pools, all or none
    ///
    /// Pool locks are acquired in global order so concurrent multi-pool
    /// reservations cannot deadlock.
    pub fn reserve_all(&self, requests: Vec<ReserveRequest>) -> Result<Vec<AllocationId>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let mut demand: BTreeMap<PoolKey, (u64, f64)> = BTreeMap::new();
        for request in &requests {
            request.validate()?;
            let key = request.pool_key();
            let entry = demand.entry(key.clone()).or_insert((0, 1.0));
            entry.0 = entry.0.checked_add(request.amount).ok_or_else(|| {
                Error::Validation(format!("Combined demand on pool {} overflows", key))
            })?;
            entry.1 = entry.1.min(request.capacity_fraction);
        }

        let pools = demand
            .keys()
            .map(|key| self.pool(key).map(|pool| (key.clone(), pool)))
            .collect::<Result<Vec<_>>>()?;

        // BTreeMap iteration order is the global lock order
        let mut guards = Vec::with_capacity(pools.len());
        for (key, pool) in &pools {
            guards.push((key, pool.lock()));
        }

        for (key, guard) in &guards {
            let (amount, fraction) = demand[*key];
            let available = guard.available(fraction);
            if amount > available {
                return Err(Error::CapacityDenied {
                    domain: key.domain,
                    resource_kind: key.resource_kind.clone(),
                    requested: amount,
                    available,
                });
            }
        }

        for (key, guard) in guards.iter_mut() {
            guard.reserved += demand[*key].0;
        }

        let ids = requests
            .into_iter()
            .map(|request| {
                let allocation = Self::new_allocation(request);
                let id = allocation.id;
                self.allocations.insert(id, allocation);
                id
            })
            .collect::<Vec<_>>();

        debug!(count = ids.len(), pools = guards.len(), "Multi-pool reservation granted");

        Ok(ids)
    }

    /// Atomically releases the given victims and reserves the request
    ///
    /// Victims must be active, preemptable, in the request's pool and of
    /// strictly lower priority than the request. Returns the new allocation
    /// id and the victims as they were before release.
    pub fn preempt_and_reserve(
        &self,
        request: ReserveRequest,
        victims: &[AllocationId],
    ) -> Result<(AllocationId, Vec<Allocation>)> {
        request.validate()?;
        let key = request.pool_key();
        let pool = self.pool(&key)?;
        let mut pool = pool.lock();

        let mut victims = victims.to_vec();
        victims.sort();
        victims.dedup();

        let mut freed = 0u64;
        let mut preempted = Vec::with_capacity(victims.len());
        for victim_id in &victims {
            let victim = self
                .allocations
                .get(victim_id)
                .map(|a| a.clone())
                .ok_or_else(|| Error::NotFound(format!("Allocation {}", victim_id)))?;

            if victim.domain != key.domain || victim.resource_kind != key.resource_kind {
                return Err(Error::Validation(format!(
                    "Allocation {} is not in pool {}",
                    victim_id, key
                )));
            }
            if !victim.status.is_active() {
                return Err(Error::InvalidState(format!(
                    "Allocation {} is already released",
                    victim_id
                )));
            }
            if !victim.preemptable {
                return Err(Error::Validation(format!(
                    "Allocation {} is not preemptable",
                    victim_id
                )));
            }
            if victim.priority >= request.priority {
                return Err(Error::Validation(format!(
                    "Allocation {} has priority {:.3}, not below {:.3}",
                    victim_id, victim.priority, request.priority
                )));
            }

            freed = freed.saturating_add(victim.amount);
            preempted.push(victim);
        }

        let available = pool.available(request.capacity_fraction).saturating_add(freed);
        if request.amount > available {
            return Err(Error::CapacityDenied {
                domain: request.domain,
                resource_kind: request.resource_kind,
                requested: request.amount,
                available,
            });
        }

        let now = Utc::now();
        for victim in &preempted {
            if let Some(mut allocation) = self.allocations.get_mut(&victim.id) {
                Self::debit(&mut pool, &allocation);
                allocation.status = AllocationStatus::Released;
                allocation.released_at = Some(now);
            }
        }

        pool.reserved += request.amount;
        let allocation = Self::new_allocation(request);
        let id = allocation.id;
        self.allocations.insert(id, allocation);

        info!(
            allocation_id = %id,
            pool = %key,
            preempted = preempted.len(),
            "Capacity granted by preemption"
        );

        drop(pool);
        let _ = self.release_tx.send(key);

        Ok((id, preempted))
    }

    /// Confirms a reservation
    ///
    /// Committing an already committed allocation is a no-op.
    pub fn commit(&self, id: AllocationId) -> Result<()> {
        let key = self.pool_key_of(id)?;
        let pool = self.pool(&key)?;
        let mut pool = pool.lock();

        let mut allocation = self
            .allocations
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("Allocation {}", id)))?;

        match allocation.status {
            AllocationStatus::Committed => Ok(()),
            AllocationStatus::Released => Err(Error::InvalidState(format!(
                "Allocation {} was released before commit",
                id
            ))),
            AllocationStatus::Reserved => {
                pool.reserved -= allocation.amount;
                pool.committed += allocation.amount;
                allocation.status = AllocationStatus::Committed;
                debug!(allocation_id = %id, pool = %key, "Allocation committed");
                Ok(())
            }
        }
    }

    /// Returns an allocation's capacity to its pool
    ///
    /// Returns true on the first release and false on every later call.
    pub fn release(&self, id: AllocationId) -> Result<bool> {
        let key = self.pool_key_of(id)?;
        let pool = self.pool(&key)?;
        let mut pool = pool.lock();

        let released = {
            let mut allocation = self
                .allocations
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("Allocation {}", id)))?;

            if allocation.status.is_active() {
                Self::debit(&mut pool, &allocation);
                allocation.status = AllocationStatus::Released;
                allocation.released_at = Some(Utc::now());
                true
            } else {
                false
            }
        };
        drop(pool);

        if released {
            debug!(allocation_id = %id, pool = %key, "Allocation released");
            let _ = self.release_tx.send(key);
        }

        Ok(released)
    }

    /// Gets an allocation
    pub fn get(&self, id: AllocationId) -> Option<Allocation> {
        self.allocations.get(&id).map(|a| a.clone())
    }

    /// Active allocations of a pool, lowest priority first
    pub fn active_allocations(&self, domain: Domain, resource_kind: &ResourceKind) -> Vec<Allocation> {
        let mut active: Vec<_> = self
            .allocations
            .iter()
            .filter(|a| a.domain == domain && &a.resource_kind == resource_kind && a.status.is_active())
            .map(|a| a.clone())
            .collect();
        active.sort_by(|a, b| {
            a.priority
                .total_cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        active
    }

    /// Active allocations held by a transaction
    pub fn allocations_for_transaction(&self, transaction_id: &str) -> Vec<Allocation> {
        self.allocations
            .iter()
            .filter(|a| a.owner_transaction.as_deref() == Some(transaction_id) && a.status.is_active())
            .map(|a| a.clone())
            .collect()
    }

    /// Usage of a single pool
    pub fn pool_usage(&self, domain: Domain, resource_kind: &ResourceKind) -> Result<PoolUsage> {
        let key = PoolKey::new(domain, resource_kind.clone());
        let pool = self.pool(&key)?;
        let pool = pool.lock();
        Ok(PoolUsage {
            domain,
            resource_kind: resource_kind.clone(),
            capacity: pool.capacity,
            reserved: pool.reserved,
            committed: pool.committed,
            available: pool.available(1.0),
        })
    }

    /// Usage of every pool, in global order
    pub fn usage(&self) -> Vec<PoolUsage> {
        let mut keys: Vec<PoolKey> = self.pools.iter().map(|p| p.key().clone()).collect();
        keys.sort();
        keys.into_iter()
            .filter_map(|key| self.pool_usage(key.domain, &key.resource_kind).ok())
            .collect()
    }

    /// Fraction of a pool's capacity in use
    pub fn utilization(&self, domain: Domain, resource_kind: &ResourceKind) -> Result<f64> {
        self.pool_usage(domain, resource_kind).map(|usage| usage.utilization())
    }

    /// Subscribes to release notifications
    ///
    /// A pool key is sent every time capacity is returned to it.
    pub fn subscribe_releases(&self) -> broadcast::Receiver<PoolKey> {
        self.release_tx.subscribe()
    }

    /// Takes a persistable snapshot
    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut pools: Vec<PoolSnapshot> = self
            .pools
            .iter()
            .map(|entry| PoolSnapshot {
                domain: entry.key().domain,
                resource_kind: entry.key().resource_kind.clone(),
                capacity: entry.value().lock().capacity,
            })
            .collect();
        pools.sort_by(|a, b| (a.domain, &a.resource_kind).cmp(&(b.domain, &b.resource_kind)));

        let mut allocations: Vec<Allocation> = self.allocations.iter().map(|a| a.clone()).collect();
        allocations.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        LedgerSnapshot {
            pools,
            allocations,
            taken_at: Utc::now(),
        }
    }

    /// Replaces the ledger contents with a snapshot
    ///
    /// Usage counters are rebuilt from the active allocations; a snapshot
    /// whose active allocations exceed a pool's capacity is rejected.
    pub fn restore(&self, snapshot: LedgerSnapshot) -> Result<()> {
        let mut pools: BTreeMap<PoolKey, Pool> = snapshot
            .pools
            .iter()
            .map(|p| {
                (
                    PoolKey::new(p.domain, p.resource_kind.clone()),
                    Pool {
                        capacity: p.capacity,
                        ..Pool::default()
                    },
                )
            })
            .collect();

        for allocation in snapshot.allocations.iter().filter(|a| a.status.is_active()) {
            let key = PoolKey::new(allocation.domain, allocation.resource_kind.clone());
            let pool = pools.get_mut(&key).ok_or_else(|| {
                Error::Validation(format!("Snapshot allocation {} references undeclared pool {}", allocation.id, key))
            })?;
            match allocation.status {
                AllocationStatus::Committed => pool.committed += allocation.amount,
                _ => pool.reserved += allocation.amount,
            }
            if pool.in_use() > pool.capacity {
                return Err(Error::Validation(format!(
                    "Snapshot exceeds capacity of {}: {} > {}",
                    key,
                    pool.in_use(),
                    pool.capacity
                )));
            }
        }

        self.pools.clear();
        for (key, pool) in pools {
            self.pools.insert(key, Arc::new(Mutex::new(pool)));
        }

        self.allocations.clear();
        for allocation in snapshot.allocations {
            self.allocations.insert(allocation.id, allocation);
        }

        info!(
            pools = self.pools.len(),
            allocations = self.allocations.len(),
            taken_at = %snapshot.taken_at,
            "Allocation ledger restored from snapshot"
        );

        Ok(())
    }

    /// Drops released allocations older than the retention window
    pub fn prune_released(&self, retention: Duration) -> usize {
        let now = Utc::now();
        let before = self.allocations.len();

        self.allocations.retain(|_, allocation| match allocation.released_at {
            Some(released_at) if allocation.status == AllocationStatus::Released => now
                .signed_duration_since(released_at)
                .to_std()
                .map(|age| age <= retention)
                .unwrap_or(true),
            _ => true,
        });

        let pruned = before - self.allocations.len();
        if pruned > 0 {
            debug!(pruned, "Pruned released allocations");
        }
        pruned
    }

    fn pool(&self, key: &PoolKey) -> Result<Arc<Mutex<Pool>>> {
        self.pools
            .get(key)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| Error::Validation(format!("No capacity declared for {}", key)))
    }

    fn pool_or_insert(&self, key: &PoolKey) -> Arc<Mutex<Pool>> {
        Arc::clone(self.pools.entry(key.clone()).or_default().value())
    }

    fn pool_key_of(&self, id: AllocationId) -> Result<PoolKey> {
        self.allocations
            .get(&id)
            .map(|a| PoolKey::new(a.domain, a.resource_kind.clone()))
            .ok_or_else(|| Error::NotFound(format!("Allocation {}", id)))
    }

    fn debit(pool: &mut Pool, allocation: &Allocation) {
        match allocation.status {
            AllocationStatus::Reserved => pool.reserved -= allocation.amount,
            AllocationStatus::Committed => pool.committed -= allocation.amount,
            AllocationStatus::Released => {
                warn!(allocation_id = %allocation.id, "Debit of a released allocation ignored");
            }
        }
    }

    fn new_allocation(request: ReserveRequest) -> Allocation {
        Allocation {
            id: Uuid::new_v4(),
            domain: request.domain,
            resource_kind: request.resource_kind,
            amount: request.amount,
            purpose: request.purpose,
            priority: request.priority,
            status: AllocationStatus::Reserved,
            preemptable: request.preemptable,
            owner_transaction: request.owner_transaction,
            created_at: Utc::now(),
            released_at: None,
        }
    }
}

impl Default for AllocationLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GB: u64 = 1024 * 1024 * 1024;

    fn ledger() -> AllocationLedger {
        let ledger = AllocationLedger::new();
        ledger.declare_capacity(Domain::Memory, ResourceKind::MemoryBytes, 10 * GB).unwrap();
        ledger.declare_capacity(Domain::Device, ResourceKind::DeviceTime, 1000).unwrap();
        ledger
    }

    fn memory(amount: u64) -> ReserveRequest {
        ReserveRequest::new(Domain::Memory, ResourceKind::MemoryBytes, amount)
    }

    #[test]
    fn test_reserve_within_capacity() {
        let ledger = ledger();
        let id = ledger.reserve(memory(8 * GB).with_purpose("weights")).unwrap();

        let usage = ledger.pool_usage(Domain::Memory, &ResourceKind::MemoryBytes).unwrap();
        assert_eq!(usage.reserved, 8 * GB);
        assert_eq!(usage.available, 2 * GB);
        assert_eq!(ledger.get(id).unwrap().status, AllocationStatus::Reserved);
    }

    #[test]
    fn test_reserve_over_capacity_denied() {
        let ledger = ledger();
        ledger.reserve(memory(8 * GB)).unwrap();
        let err = ledger.reserve(memory(4 * GB)).unwrap_err();
        match err {
            Error::CapacityDenied { requested, available, .. } => {
                assert_eq!(requested, 4 * GB);
                assert_eq!(available, 2 * GB);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_reserve_rejects_malformed_requests() {
        let ledger = ledger();
        assert!(ledger.reserve(memory(0)).unwrap_err().is_validation());
        assert!(ledger
            .reserve(ReserveRequest::new(Domain::Model, ResourceKind::ModelSlot, 1))
            .unwrap_err()
            .is_validation());
        assert!(ledger
            .reserve(memory(1).with_capacity_fraction(0.0))
            .unwrap_err()
            .is_validation());
    }

    #[test]
    fn test_capacity_fraction_limits_usable_capacity() {
        let ledger = ledger();
        let err = ledger
            .reserve(memory(6 * GB).with_capacity_fraction(0.5))
            .unwrap_err();
        assert!(err.is_capacity_denied());
        assert!(ledger.reserve(memory(5 * GB).with_capacity_fraction(0.5)).is_ok());
    }

    #[test]
    fn test_release_is_idempotent() {
        let ledger = ledger();
        let mut releases = ledger.subscribe_releases();
        let id = ledger.reserve(memory(4 * GB)).unwrap();
        ledger.commit(id).unwrap();

        assert!(ledger.release(id).unwrap());
        assert!(!ledger.release(id).unwrap());
        assert!(!ledger.release(id).unwrap());

        let usage = ledger.pool_usage(Domain::Memory, &ResourceKind::MemoryBytes).unwrap();
        assert_eq!(usage.committed, 0);
        assert_eq!(usage.available, 10 * GB);

        assert_eq!(
            releases.try_recv().unwrap(),
            PoolKey::new(Domain::Memory, ResourceKind::MemoryBytes)
        );
        assert!(releases.try_recv().is_err());
    }

    #[test]
    fn test_commit_after_release_fails() {
        let ledger = ledger();
        let id = ledger.reserve(memory(GB)).unwrap();
        ledger.commit(id).unwrap();
        ledger.commit(id).unwrap();
        ledger.release(id).unwrap();
        assert!(matches!(ledger.commit(id).unwrap_err(), Error::InvalidState(_)));
    }

    #[test]
    fn test_reserve_all_is_all_or_nothing() {
        let ledger = ledger();
        let err = ledger
            .reserve_all(vec![
                ReserveRequest::new(Domain::Device, ResourceKind::DeviceTime, 100),
                memory(11 * GB),
            ])
            .unwrap_err();
        assert!(err.is_capacity_denied());
        assert_eq!(ledger.utilization(Domain::Device, &ResourceKind::DeviceTime).unwrap(), 0.0);

        let ids = ledger
            .reserve_all(vec![
                memory(2 * GB),
                ReserveRequest::new(Domain::Device, ResourceKind::DeviceTime, 100),
                memory(3 * GB),
            ])
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(
            ledger.pool_usage(Domain::Memory, &ResourceKind::MemoryBytes).unwrap().reserved,
            5 * GB
        );
    }

    #[test]
    fn test_reserve_all_rejects_overflowing_demand() {
        let ledger = ledger();
        let err = ledger
            .reserve_all(vec![memory(u64::MAX), memory(u64::MAX)])
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(
            ledger.pool_usage(Domain::Memory, &ResourceKind::MemoryBytes).unwrap().reserved,
            0
        );
        assert!(ledger.active_allocations(Domain::Memory, &ResourceKind::MemoryBytes).is_empty());
    }

    #[test]
    fn test_preempt_and_reserve() {
        let ledger = ledger();
        let victim = ledger.reserve(memory(8 * GB).with_priority(4.0)).unwrap();

        let (granted, preempted) = ledger
            .preempt_and_reserve(memory(4 * GB).with_priority(9.0), &[victim])
            .unwrap();

        assert_eq!(preempted.len(), 1);
        assert_eq!(preempted[0].id, victim);
        assert_eq!(ledger.get(victim).unwrap().status, AllocationStatus::Released);
        assert_eq!(ledger.get(granted).unwrap().amount, 4 * GB);
        assert!(!ledger.release(victim).unwrap());
    }

    #[test]
    fn test_preempt_counts_repeated_victim_once() {
        let ledger = ledger();
        let victim = ledger.reserve(memory(4 * GB).with_priority(4.0)).unwrap();
        ledger.reserve(memory(6 * GB).with_priority(9.0).with_preemptable(false)).unwrap();

        let err = ledger
            .preempt_and_reserve(memory(8 * GB).with_priority(9.0), &[victim, victim])
            .unwrap_err();
        assert!(err.is_capacity_denied());
        assert_eq!(ledger.get(victim).unwrap().status, AllocationStatus::Reserved);

        let (_, preempted) = ledger
            .preempt_and_reserve(memory(4 * GB).with_priority(9.0), &[victim, victim])
            .unwrap();
        assert_eq!(preempted.len(), 1);
        assert_eq!(
            ledger.pool_usage(Domain::Memory, &ResourceKind::MemoryBytes).unwrap().reserved,
            10 * GB
        );
    }

    #[test]
    fn test_preempt_refuses_protected_victims() {
        let ledger = ledger();
        let pinned = ledger
            .reserve(memory(8 * GB).with_priority(4.0).with_preemptable(false))
            .unwrap();
        assert!(ledger
            .preempt_and_reserve(memory(4 * GB).with_priority(9.0), &[pinned])
            .unwrap_err()
            .is_validation());

        let equal = ledger.reserve(memory(GB).with_priority(9.0)).unwrap();
        assert!(ledger
            .preempt_and_reserve(memory(GB).with_priority(9.0), &[equal])
            .unwrap_err()
            .is_validation());
        assert_eq!(ledger.get(pinned).unwrap().status, AllocationStatus::Reserved);
        assert_eq!(ledger.get(equal).unwrap().status, AllocationStatus::Reserved);
    }

    #[test]
    fn test_active_allocations_sorted_by_priority() {
        let ledger = ledger();
        ledger.reserve(memory(GB).with_priority(5.0)).unwrap();
        ledger.reserve(memory(GB).with_priority(1.0)).unwrap();
        let released = ledger.reserve(memory(GB).with_priority(0.5)).unwrap();
        ledger.release(released).unwrap();

        let active = ledger.active_allocations(Domain::Memory, &ResourceKind::MemoryBytes);
        let priorities: Vec<f64> = active.iter().map(|a| a.priority).collect();
        assert_eq!(priorities, vec![1.0, 5.0]);
    }

    #[test]
    fn test_snapshot_restore() {
        let ledger = ledger();
        let kept = ledger.reserve(memory(3 * GB).with_owner("tx-1")).unwrap();
        ledger.commit(kept).unwrap();
        let dropped = ledger.reserve(memory(GB)).unwrap();
        ledger.release(dropped).unwrap();

        let snapshot = ledger.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();

        let restored = AllocationLedger::new();
        restored.restore(serde_json::from_str(&json).unwrap()).unwrap();

        let usage = restored.pool_usage(Domain::Memory, &ResourceKind::MemoryBytes).unwrap();
        assert_eq!(usage.committed, 3 * GB);
        assert_eq!(restored.allocations_for_transaction("tx-1").len(), 1);
        assert!(!restored.release(dropped).unwrap());
    }

    #[test]
    fn test_shrinking_below_usage_rejected() {
        let ledger = ledger();
        ledger.reserve(memory(6 * GB)).unwrap();
        assert!(ledger
            .declare_capacity(Domain::Memory, ResourceKind::MemoryBytes, 5 * GB)
            .is_err());
        assert!(ledger
            .declare_capacity(Domain::Memory, ResourceKind::MemoryBytes, 12 * GB)
            .is_ok());
    }

    #[test]
    fn test_prune_released() {
        let ledger = ledger();
        let id = ledger.reserve(memory(GB)).unwrap();
        let active = ledger.reserve(memory(GB)).unwrap();
        ledger.release(id).unwrap();

        assert_eq!(ledger.prune_released(Duration::from_secs(3600)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(ledger.prune_released(Duration::ZERO), 1);
        assert!(ledger.get(id).is_none());
        assert!(ledger.get(active).is_some());
    }
}
