//! Property-based tests for allocation ledger invariants.
//!
//! Random sequences of reserve, commit, release and preemption operations
//! must never push a pool above its declared capacity, and repeated releases
//! must never double-free.

use proptest::prelude::*;

use common::models::{AllocationId, AllocationStatus};
use common::types::{Domain, ResourceKind};
use resource_manager::{AllocationLedger, ReserveRequest};

const CAPACITY: u64 = 100;

#[derive(Debug, Clone)]
enum Op {
    Reserve { amount: u64, priority: u8, preemptable: bool },
    ReserveBoth { memory: u64, device: u64 },
    Commit(usize),
    Release { index: usize, times: u8 },
    Preempt { amount: u64, priority: u8 },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..60, 0u8..10, any::<bool>()).prop_map(|(amount, priority, preemptable)| Op::Reserve {
            amount,
            priority,
            preemptable
        }),
        (1u64..60, 1u64..60).prop_map(|(memory, device)| Op::ReserveBoth { memory, device }),
        any::<usize>().prop_map(Op::Commit),
        (any::<usize>(), 1u8..4).prop_map(|(index, times)| Op::Release { index, times }),
        (1u64..80, 0u8..10).prop_map(|(amount, priority)| Op::Preempt { amount, priority }),
    ]
}

fn ledger() -> AllocationLedger {
    let ledger = AllocationLedger::new();
    ledger
        .declare_capacity(Domain::Memory, ResourceKind::MemoryBytes, CAPACITY)
        .unwrap();
    ledger
        .declare_capacity(Domain::Device, ResourceKind::DeviceTime, CAPACITY)
        .unwrap();
    ledger
}

fn memory(amount: u64, priority: u8) -> ReserveRequest {
    ReserveRequest::new(Domain::Memory, ResourceKind::MemoryBytes, amount).with_priority(f64::from(priority))
}

/// Sum of active allocation amounts, recomputed from the allocations themselves
fn active_sum(ledger: &AllocationLedger, domain: Domain, kind: &ResourceKind) -> u64 {
    ledger
        .active_allocations(domain, kind)
        .iter()
        .map(|a| a.amount)
        .sum()
}

fn assert_capacity_invariant(ledger: &AllocationLedger) {
    for (domain, kind) in [
        (Domain::Memory, ResourceKind::MemoryBytes),
        (Domain::Device, ResourceKind::DeviceTime),
    ] {
        let usage = ledger.pool_usage(domain, &kind).unwrap();
        let active = active_sum(ledger, domain, &kind);
        assert!(active <= usage.capacity, "{domain}/{kind}: {active} > {}", usage.capacity);
        assert_eq!(usage.reserved + usage.committed, active);
        assert_eq!(usage.available, usage.capacity - active);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn capacity_is_never_exceeded(ops in prop::collection::vec(arb_op(), 1..60)) {
        let ledger = ledger();
        let mut ids: Vec<AllocationId> = Vec::new();

        for op in ops {
            match op {
                Op::Reserve { amount, priority, preemptable } => {
                    if let Ok(id) = ledger.reserve(memory(amount, priority).with_preemptable(preemptable)) {
                        ids.push(id);
                    }
                }
                Op::ReserveBoth { memory: m, device } => {
                    if let Ok(granted) = ledger.reserve_all(vec![
                        memory(m, 5),
                        ReserveRequest::new(Domain::Device, ResourceKind::DeviceTime, device),
                    ]) {
                        ids.extend(granted);
                    }
                }
                Op::Commit(index) if !ids.is_empty() => {
                    let _ = ledger.commit(ids[index % ids.len()]);
                }
                Op::Release { index, times } if !ids.is_empty() => {
                    let id = ids[index % ids.len()];
                    for _ in 0..times {
                        ledger.release(id).unwrap();
                    }
                }
                Op::Preempt { amount, priority } => {
                    let request = memory(amount, priority);
                    let victims: Vec<AllocationId> = ledger
                        .active_allocations(Domain::Memory, &ResourceKind::MemoryBytes)
                        .into_iter()
                        .filter(|a| a.preemptable && a.priority < request.priority)
                        .map(|a| a.id)
                        .collect();
                    if let Ok((id, preempted)) = ledger.preempt_and_reserve(request.clone(), &victims) {
                        for victim in &preempted {
                            prop_assert!(victim.preemptable);
                            prop_assert!(victim.priority < request.priority);
                        }
                        ids.push(id);
                    }
                }
                _ => {}
            }

            assert_capacity_invariant(&ledger);
        }
    }

    #[test]
    fn repeated_release_never_double_frees(
        amounts in prop::collection::vec(1u64..30, 1..4),
        repeats in 2usize..6,
    ) {
        let ledger = ledger();
        let ids: Vec<AllocationId> = amounts
            .iter()
            .filter_map(|&amount| ledger.reserve(memory(amount, 1)).ok())
            .collect();
        let held: u64 = ids.iter().filter_map(|id| ledger.get(*id)).map(|a| a.amount).sum();

        let first = ids[0];
        let first_amount = ledger.get(first).unwrap().amount;

        prop_assert!(ledger.release(first).unwrap());
        for _ in 1..repeats {
            prop_assert!(!ledger.release(first).unwrap());
        }

        let usage = ledger.pool_usage(Domain::Memory, &ResourceKind::MemoryBytes).unwrap();
        prop_assert_eq!(usage.reserved, held - first_amount);
        prop_assert_eq!(ledger.get(first).unwrap().status, AllocationStatus::Released);
    }
}
