//! Engine counters
//!
//! Lock-free counters updated on the hot paths and read as a serializable
//! snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use common::models::OperationOutcome;

use crate::cascade::{CascadeReport, CascadeState};

/// Counters of the orchestration engine
#[derive(Debug, Default)]
pub struct EngineMetrics {
    transactions_submitted: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_degraded: AtomicU64,
    transactions_aborted: AtomicU64,
    transactions_compensated: AtomicU64,
    partial_failures: AtomicU64,
    duplicate_submissions: AtomicU64,
    preemptions: AtomicU64,
    failure_signals: AtomicU64,
    cascades_stabilized: AtomicU64,
    cascades_partial: AtomicU64,
    cascades_failed: AtomicU64,
    total_latency_us: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub transactions_submitted: u64,
    pub transactions_committed: u64,
    pub transactions_degraded: u64,
    pub transactions_aborted: u64,
    pub transactions_compensated: u64,
    pub partial_failures: u64,
    pub duplicate_submissions: u64,
    pub preemptions: u64,
    pub failure_signals: u64,
    pub cascades_stabilized: u64,
    pub cascades_partial: u64,
    pub cascades_failed: u64,
    /// Mean latency of finished transactions
    pub average_latency_ms: f64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submission(&self) {
        self.transactions_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicate_submissions.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a finished transaction
    pub fn record_outcome(&self, outcome: &OperationOutcome, latency: Duration) {
        let counter = match outcome {
            OperationOutcome::Completed => &self.transactions_committed,
            OperationOutcome::CompletedDegraded { .. } => &self.transactions_degraded,
            OperationOutcome::FailedNothingReserved { .. } => &self.transactions_aborted,
            OperationOutcome::Compensated { partial_failure } => {
                if *partial_failure {
                    self.partial_failures.fetch_add(1, Ordering::Relaxed);
                }
                &self.transactions_compensated
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.total_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_preemptions(&self, count: usize) {
        self.preemptions.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_cascade(&self, report: &CascadeReport) {
        self.failure_signals.fetch_add(1, Ordering::Relaxed);
        let counter = match report.state {
            CascadeState::Stabilized => &self.cascades_stabilized,
            CascadeState::PartiallyStabilized => &self.cascades_partial,
            CascadeState::Failed => &self.cascades_failed,
            CascadeState::Detected | CascadeState::Propagating => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        let finished = load(&self.transactions_committed)
            + load(&self.transactions_degraded)
            + load(&self.transactions_aborted)
            + load(&self.transactions_compensated);
        let average_latency_ms = if finished == 0 {
            0.0
        } else {
            load(&self.total_latency_us) as f64 / finished as f64 / 1_000.0
        };

        MetricsSnapshot {
            transactions_submitted: load(&self.transactions_submitted),
            transactions_committed: load(&self.transactions_committed),
            transactions_degraded: load(&self.transactions_degraded),
            transactions_aborted: load(&self.transactions_aborted),
            transactions_compensated: load(&self.transactions_compensated),
            partial_failures: load(&self.partial_failures),
            duplicate_submissions: load(&self.duplicate_submissions),
            preemptions: load(&self.preemptions),
            failure_signals: load(&self.failure_signals),
            cascades_stabilized: load(&self.cascades_stabilized),
            cascades_partial: load(&self.cascades_partial),
            cascades_failed: load(&self.cascades_failed),
            average_latency_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcomes_and_latency() {
        let metrics = EngineMetrics::new();
        metrics.record_submission();
        metrics.record_submission();
        metrics.record_outcome(&OperationOutcome::Completed, Duration::from_millis(10));
        metrics.record_outcome(
            &OperationOutcome::Compensated { partial_failure: true },
            Duration::from_millis(30),
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transactions_submitted, 2);
        assert_eq!(snapshot.transactions_committed, 1);
        assert_eq!(snapshot.transactions_compensated, 1);
        assert_eq!(snapshot.partial_failures, 1);
        assert!((snapshot.average_latency_ms - 20.0).abs() < 1e-9);
    }
}
