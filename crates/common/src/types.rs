//! Common types for the Sync Orchestrator
//!
//! This module defines the fixed vocabulary of the system: the six
//! cooperating domains and their dependency order, resource kinds, event
//! priorities, ownership tags, degradation modes and the priority factor
//! classes used by the conflict resolver.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the six cooperating domains
///
/// Declaration order is the dependency order used for initialization and
/// cascade sequencing: Device → Memory → Model → Processing → Inference →
/// Postprocessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Domain {
    /// Compute devices (GPU/CPU)
    Device,
    /// Device and host memory
    Memory,
    /// Model artifacts and load slots
    Model,
    /// Processing sessions
    Processing,
    /// Inference execution
    Inference,
    /// Postprocessing of results
    Postprocessing,
}

impl Domain {
    /// All domains in dependency order
    pub const ALL: [Domain; 6] = [
        Domain::Device,
        Domain::Memory,
        Domain::Model,
        Domain::Processing,
        Domain::Inference,
        Domain::Postprocessing,
    ];

    /// Position of the domain in the dependency order
    pub fn order(self) -> usize {
        self as usize
    }

    /// Domains that depend on this one (all domains after it)
    pub fn dependents(self) -> impl Iterator<Item = Domain> {
        Self::ALL.into_iter().skip(self.order() + 1)
    }

    /// Domains this one depends on (all domains before it)
    pub fn dependencies(self) -> impl Iterator<Item = Domain> {
        Self::ALL.into_iter().take(self.order())
    }

    /// Lowercase name used in configuration keys and log fields
    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Device => "device",
            Domain::Memory => "memory",
            Domain::Model => "model",
            Domain::Processing => "processing",
            Domain::Inference => "inference",
            Domain::Postprocessing => "postprocessing",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Device => write!(f, "Device"),
            Domain::Memory => write!(f, "Memory"),
            Domain::Model => write!(f, "Model"),
            Domain::Processing => write!(f, "Processing"),
            Domain::Inference => write!(f, "Inference"),
            Domain::Postprocessing => write!(f, "Postprocessing"),
        }
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "device" => Ok(Domain::Device),
            "memory" => Ok(Domain::Memory),
            "model" => Ok(Domain::Model),
            "processing" => Ok(Domain::Processing),
            "inference" => Ok(Domain::Inference),
            "postprocessing" => Ok(Domain::Postprocessing),
            _ => Err(format!("Unknown domain: {}", s)),
        }
    }
}

/// Kind of finite resource tracked by the allocation ledger
///
/// Ordered by name, which together with [`Domain`] order gives the global
/// lock ordering for multi-resource reservations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ResourceKind {
    /// Device compute time
    DeviceTime,
    /// Memory in bytes
    MemoryBytes,
    /// Model load slot
    ModelSlot,
    /// Any other named resource
    Custom(String),
}

impl ResourceKind {
    /// Canonical name of the resource kind
    pub fn as_str(&self) -> &str {
        match self {
            ResourceKind::DeviceTime => "device_time",
            ResourceKind::MemoryBytes => "memory_bytes",
            ResourceKind::ModelSlot => "model_slot",
            ResourceKind::Custom(name) => name,
        }
    }
}

impl From<String> for ResourceKind {
    fn from(s: String) -> Self {
        match s.to_lowercase().replace('-', "_").as_str() {
            "device_time" => ResourceKind::DeviceTime,
            "memory_bytes" => ResourceKind::MemoryBytes,
            "model_slot" => ResourceKind::ModelSlot,
            _ => ResourceKind::Custom(s),
        }
    }
}

impl From<&str> for ResourceKind {
    fn from(s: &str) -> Self {
        ResourceKind::from(s.to_string())
    }
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> Self {
        kind.as_str().to_string()
    }
}

impl PartialOrd for ResourceKind {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ResourceKind {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Delivery priority tier on the propagation bus (P0 is most urgent)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventPriority {
    /// Critical, e.g. domain-health-critical
    P0,
    /// High
    P1,
    /// Normal
    P2,
    /// Low
    P3,
}

impl EventPriority {
    /// All tiers, most urgent first
    pub const ALL: [EventPriority; 4] = [
        EventPriority::P0,
        EventPriority::P1,
        EventPriority::P2,
        EventPriority::P3,
    ];

    /// Index of the tier (0 for P0)
    pub fn tier(self) -> usize {
        self as usize
    }
}

impl fmt::Display for EventPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.tier())
    }
}

/// Side of the pipeline owning a state entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Owner {
    /// The resource-owning controller
    Controller,
    /// The domain agent
    Agent,
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Owner::Controller => write!(f, "Controller"),
            Owner::Agent => write!(f, "Agent"),
        }
    }
}

/// Operation class factor of the dynamic priority score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationClass {
    Critical,
    Interactive,
    Scheduled,
    Batch,
    Background,
}

impl OperationClass {
    /// Factor value normalized to [0, 10]
    pub fn score(self) -> f64 {
        match self {
            OperationClass::Critical => 10.0,
            OperationClass::Interactive => 8.0,
            OperationClass::Scheduled => 6.0,
            OperationClass::Batch => 4.0,
            OperationClass::Background => 2.0,
        }
    }
}

/// Urgency factor of the dynamic priority score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Urgency {
    Immediate,
    TimeSensitive,
    Scheduled,
    BestEffort,
}

impl Urgency {
    /// Factor value normalized to [0, 10]
    pub fn score(self) -> f64 {
        match self {
            Urgency::Immediate => 10.0,
            Urgency::TimeSensitive => 7.0,
            Urgency::Scheduled => 4.0,
            Urgency::BestEffort => 1.0,
        }
    }
}

/// Requester context factor of the dynamic priority score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequesterContext {
    LiveUserFacing,
    ActiveSession,
    Queued,
    Background,
}

impl RequesterContext {
    /// Factor value normalized to [0, 10]
    pub fn score(self) -> f64 {
        match self {
            RequesterContext::LiveUserFacing => 10.0,
            RequesterContext::ActiveSession => 7.0,
            RequesterContext::Queued => 4.0,
            RequesterContext::Background => 1.0,
        }
    }
}

/// System-health class factor of the dynamic priority score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthClass {
    Recovery,
    Maintenance,
    Optimization,
    Cleanup,
}

impl HealthClass {
    /// Factor value normalized to [0, 10]
    pub fn score(self) -> f64 {
        match self {
            HealthClass::Recovery => 10.0,
            HealthClass::Maintenance => 7.0,
            HealthClass::Optimization => 4.0,
            HealthClass::Cleanup => 1.0,
        }
    }
}

/// System-wide operating posture
///
/// Ordered by severity: `Normal < PerformanceConservation < MinimalOperation < SafetyFirst`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DegradationMode {
    Normal,
    PerformanceConservation,
    MinimalOperation,
    SafetyFirst,
}

impl DegradationMode {
    /// Severity level (0 for Normal)
    pub fn severity(self) -> u8 {
        self as u8
    }

    /// The next more severe mode, saturating at SafetyFirst
    pub fn escalated(self) -> Self {
        match self {
            DegradationMode::Normal => DegradationMode::PerformanceConservation,
            DegradationMode::PerformanceConservation => DegradationMode::MinimalOperation,
            DegradationMode::MinimalOperation | DegradationMode::SafetyFirst => {
                DegradationMode::SafetyFirst
            }
        }
    }

    /// Declarative capability restrictions of this mode
    pub fn restrictions(self) -> CapabilityRestrictions {
        match self {
            DegradationMode::Normal => CapabilityRestrictions {
                allowed_classes: vec![
                    OperationClass::Critical,
                    OperationClass::Interactive,
                    OperationClass::Scheduled,
                    OperationClass::Batch,
                    OperationClass::Background,
                ],
                allow_saga: true,
                allow_preemption: true,
                max_concurrent_transactions: None,
                capacity_fraction: 1.0,
            },
            DegradationMode::PerformanceConservation => CapabilityRestrictions {
                allowed_classes: vec![
                    OperationClass::Critical,
                    OperationClass::Interactive,
                    OperationClass::Scheduled,
                    OperationClass::Batch,
                ],
                allow_saga: true,
                allow_preemption: true,
                max_concurrent_transactions: Some(64),
                capacity_fraction: 0.9,
            },
            DegradationMode::MinimalOperation => CapabilityRestrictions {
                allowed_classes: vec![OperationClass::Critical, OperationClass::Interactive],
                allow_saga: true,
                allow_preemption: true,
                max_concurrent_transactions: Some(16),
                capacity_fraction: 0.75,
            },
            DegradationMode::SafetyFirst => CapabilityRestrictions {
                allowed_classes: vec![OperationClass::Critical],
                allow_saga: false,
                allow_preemption: false,
                max_concurrent_transactions: Some(4),
                capacity_fraction: 0.5,
            },
        }
    }
}

impl fmt::Display for DegradationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradationMode::Normal => write!(f, "Normal"),
            DegradationMode::PerformanceConservation => write!(f, "PerformanceConservation"),
            DegradationMode::MinimalOperation => write!(f, "MinimalOperation"),
            DegradationMode::SafetyFirst => write!(f, "SafetyFirst"),
        }
    }
}

/// Which operations remain enabled in a degradation mode, and with what limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRestrictions {
    /// Operation classes still admitted
    pub allowed_classes: Vec<OperationClass>,

    /// Whether saga-mode transactions may start
    pub allow_saga: bool,

    /// Whether the resolver may preempt allocations
    pub allow_preemption: bool,

    /// Upper bound on in-flight transactions
    pub max_concurrent_transactions: Option<usize>,

    /// Fraction of declared capacity new reservations may fill
    pub capacity_fraction: f64,
}

impl CapabilityRestrictions {
    /// Returns true if the operation class is admitted
    pub fn allows(&self, class: OperationClass) -> bool {
        self.allowed_classes.contains(&class)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_order() {
        assert!(Domain::Device < Domain::Memory);
        assert_eq!(Domain::Model.order(), 2);
        let dependents: Vec<_> = Domain::Inference.dependents().collect();
        assert_eq!(dependents, vec![Domain::Postprocessing]);
        let deps: Vec<_> = Domain::Model.dependencies().collect();
        assert_eq!(deps, vec![Domain::Device, Domain::Memory]);
        assert_eq!("Memory".parse::<Domain>().unwrap(), Domain::Memory);
        assert!("gpu".parse::<Domain>().is_err());
    }

    #[test]
    fn test_resource_kind_ordering_by_name() {
        let mut kinds = vec![
            ResourceKind::ModelSlot,
            ResourceKind::DeviceTime,
            ResourceKind::MemoryBytes,
        ];
        kinds.sort();
        assert_eq!(
            kinds,
            vec![ResourceKind::DeviceTime, ResourceKind::MemoryBytes, ResourceKind::ModelSlot]
        );
        assert_eq!(ResourceKind::from("memory-bytes"), ResourceKind::MemoryBytes);
        assert_eq!(ResourceKind::from("kv_cache"), ResourceKind::Custom("kv_cache".into()));
    }

    #[test]
    fn test_resource_kind_serde_as_string() {
        let json = serde_json::to_string(&ResourceKind::ModelSlot).unwrap();
        assert_eq!(json, "\"model_slot\"");
        let kind: ResourceKind = serde_json::from_str("\"device_time\"").unwrap();
        assert_eq!(kind, ResourceKind::DeviceTime);
    }

    #[test]
    fn test_degradation_escalation() {
        assert_eq!(DegradationMode::Normal.escalated(), DegradationMode::PerformanceConservation);
        assert_eq!(DegradationMode::SafetyFirst.escalated(), DegradationMode::SafetyFirst);
        assert!(DegradationMode::MinimalOperation > DegradationMode::PerformanceConservation);
        assert!(!DegradationMode::SafetyFirst.restrictions().allows(OperationClass::Batch));
        assert!(DegradationMode::Normal.restrictions().allows(OperationClass::Background));
    }
}
