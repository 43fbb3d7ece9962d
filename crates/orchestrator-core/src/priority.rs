//! Dynamic priority scoring
//!
//! A score is the weighted sum of four factors, each normalized to [0, 10].
//! Queued requests additionally earn an aging bonus that grows linearly with
//! wait time, so a request's effective priority strictly increases while it
//! waits.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use common::error::{Error, Result};
use common::types::{HealthClass, OperationClass, RequesterContext, Urgency};
use settings::ConfigManager;

/// The four classification factors of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityFactors {
    pub operation_class: OperationClass,
    pub urgency: Urgency,
    pub requester_context: RequesterContext,
    pub health_class: HealthClass,
}

impl PriorityFactors {
    pub fn new(
        operation_class: OperationClass,
        urgency: Urgency,
        requester_context: RequesterContext,
        health_class: HealthClass,
    ) -> Self {
        Self {
            operation_class,
            urgency,
            requester_context,
            health_class,
        }
    }

    /// Highest classification on every factor
    pub fn critical() -> Self {
        Self::new(
            OperationClass::Critical,
            Urgency::Immediate,
            RequesterContext::LiveUserFacing,
            HealthClass::Recovery,
        )
    }

    /// Lowest classification on every factor
    pub fn background() -> Self {
        Self::new(
            OperationClass::Background,
            Urgency::BestEffort,
            RequesterContext::Background,
            HealthClass::Cleanup,
        )
    }
}

impl Default for PriorityFactors {
    /// A scheduled request from an active session
    fn default() -> Self {
        Self::new(
            OperationClass::Scheduled,
            Urgency::Scheduled,
            RequesterContext::ActiveSession,
            HealthClass::Maintenance,
        )
    }
}

/// Factor weights
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityWeights {
    pub operation_class: f64,
    pub urgency: f64,
    pub requester_context: f64,
    pub health_class: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            operation_class: 0.4,
            urgency: 0.3,
            requester_context: 0.2,
            health_class: 0.1,
        }
    }
}

impl PriorityWeights {
    /// Reads the `priority.weight_*` keys
    pub fn from_config(config_manager: &ConfigManager) -> Result<Self> {
        let defaults = Self::default();
        let weights = Self {
            operation_class: config_manager
                .get_f64("priority.weight_operation_class")
                .unwrap_or(defaults.operation_class),
            urgency: config_manager
                .get_f64("priority.weight_urgency")
                .unwrap_or(defaults.urgency),
            requester_context: config_manager
                .get_f64("priority.weight_requester_context")
                .unwrap_or(defaults.requester_context),
            health_class: config_manager
                .get_f64("priority.weight_health_class")
                .unwrap_or(defaults.health_class),
        };
        weights.validate()?;

        if weights != defaults {
            warn!(?weights, "Priority weights differ from the defaults, fairness bounds change accordingly");
        }

        Ok(weights)
    }

    /// Weights must be finite, non-negative and not all zero
    pub fn validate(&self) -> Result<()> {
        let all = [self.operation_class, self.urgency, self.requester_context, self.health_class];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(Error::Config(format!("Invalid priority weights {:?}", self)));
        }
        if all.iter().sum::<f64>() <= 0.0 {
            return Err(Error::Config("Priority weights sum to zero".to_string()));
        }
        Ok(())
    }
}

/// Scores requests and ages queued ones
#[derive(Debug, Clone, Copy)]
pub struct PriorityScorer {
    weights: PriorityWeights,
    aging_bonus_per_sec: f64,
}

impl PriorityScorer {
    /// Creates a scorer; the aging rate must be positive
    pub fn new(weights: PriorityWeights, aging_bonus_per_sec: f64) -> Result<Self> {
        weights.validate()?;
        if !(aging_bonus_per_sec.is_finite() && aging_bonus_per_sec > 0.0) {
            return Err(Error::Config(format!(
                "Aging bonus must be positive, got {}",
                aging_bonus_per_sec
            )));
        }
        Ok(Self {
            weights,
            aging_bonus_per_sec,
        })
    }

    pub fn from_config(config_manager: &ConfigManager) -> Result<Self> {
        let weights = PriorityWeights::from_config(config_manager)?;
        let rate = config_manager.get_f64("priority.aging_bonus_per_sec").unwrap_or(0.05);
        Self::new(weights, rate)
    }

    pub fn weights(&self) -> PriorityWeights {
        self.weights
    }

    /// Base score of a request
    pub fn score(&self, factors: &PriorityFactors) -> f64 {
        self.weights.operation_class * factors.operation_class.score()
            + self.weights.urgency * factors.urgency.score()
            + self.weights.requester_context * factors.requester_context.score()
            + self.weights.health_class * factors.health_class.score()
    }

    /// Bonus earned after waiting `waited`
    pub fn aging_bonus(&self, waited: Duration) -> f64 {
        self.aging_bonus_per_sec * waited.as_secs_f64()
    }

    /// Base score plus aging bonus
    pub fn effective(&self, base: f64, waited: Duration) -> f64 {
        base + self.aging_bonus(waited)
    }
}

impl Default for PriorityScorer {
    fn default() -> Self {
        Self {
            weights: PriorityWeights::default(),
            aging_bonus_per_sec: 0.05,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_weights_bound_scores() {
        let scorer = PriorityScorer::default();
        assert!((scorer.score(&PriorityFactors::critical()) - 10.0).abs() < 1e-9);
        assert!((scorer.score(&PriorityFactors::background()) - 1.4).abs() < 1e-9);
        assert!(scorer.score(&PriorityFactors::critical()) > scorer.score(&PriorityFactors::default()));
    }

    #[test]
    fn test_invalid_weights_rejected() {
        let weights = PriorityWeights {
            urgency: -0.1,
            ..PriorityWeights::default()
        };
        assert!(weights.validate().is_err());
        assert!(PriorityScorer::new(PriorityWeights::default(), 0.0).is_err());
    }

    #[test]
    fn test_weights_from_config() {
        let config = ConfigManager::from_toml("[priority]\nweight_urgency = 0.5").unwrap();
        let weights = PriorityWeights::from_config(&config).unwrap();
        assert_eq!(weights.urgency, 0.5);
        assert_eq!(weights.operation_class, 0.4);
    }

    proptest! {
        #[test]
        fn effective_priority_strictly_increases_with_wait(
            base in 0.0f64..10.0,
            rate in 0.001f64..1.0,
            earlier_ms in 0u64..3_600_000,
            extra_ms in 1u64..3_600_000,
        ) {
            let scorer = PriorityScorer::new(PriorityWeights::default(), rate).unwrap();
            let earlier = scorer.effective(base, Duration::from_millis(earlier_ms));
            let later = scorer.effective(base, Duration::from_millis(earlier_ms + extra_ms));
            prop_assert!(later > earlier);
        }
    }
}
