//! Core orchestration logic for the Sync Orchestrator
//!
//! This crate coordinates the six cooperating domains: transactions across
//! domains (two-phase commit and sagas), conflict resolution for contended
//! capacity, recovery cascades on failure signals, degradation modes and the
//! background consistency monitor. Domain agents plug in through the
//! [`agent::DomainAgent`] trait.

pub mod agent;
pub mod cascade;
pub mod compensation;
pub mod conflict;
pub mod consistency;
pub mod coordinator;
pub mod degradation;
pub mod dispatch;
pub mod engine;
pub mod lifecycle;
pub mod metrics;
pub mod priority;
pub mod state;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transaction;

// Re-export commonly used types
pub use agent::{AgentDirectory, AgentReservation, DomainAgent, OperationProgress};
pub use cascade::{CascadeReport, CascadeState, EscalationLevel, FailureKind, FailureSignal};
pub use conflict::{Admission, ConflictRequest, ConflictResolver};
pub use consistency::{ConsistencyMonitor, ConsistencyReport};
pub use coordinator::TransactionCoordinator;
pub use degradation::{MemoryTier, ModeController};
pub use dispatch::{ActionDispatcher, AgentAction, OperationCatalog};
pub use engine::{EntitySeed, OrchestratorEngine};
pub use lifecycle::LifecycleManager;
pub use metrics::MetricsSnapshot;
pub use priority::{PriorityFactors, PriorityScorer};
pub use state::OrchestratorState;
pub use transaction::{OperationRequest, ResourceClaim, StepReport, TransactionResult, TransactionStep};
