//! Propagation bus for the Sync Orchestrator
//!
//! Asynchronous, priority-ordered event distribution between domains. P0
//! events overtake anything queued at P1 or below; within a tier delivery is
//! FIFO. Delivery is at-least-once: every delivery must be acknowledged by
//! the subscribing domain or it is redelivered, and a subscriber that never
//! acknowledges is eventually reported as unreachable.

mod bus;
mod pattern;
mod sequence;

pub use bus::{BusEvent, BusSettings, DeliveryId, PropagationBus, RedeliveryReport, Subscription, SubscriptionId};
pub use pattern::EventPattern;
pub use sequence::{SequenceStatus, SequenceTracker};
