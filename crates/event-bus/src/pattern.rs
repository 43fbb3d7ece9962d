//! Subscription patterns

use serde::{Deserialize, Serialize};

use common::models::Envelope;
use common::types::Domain;

/// Selects which published events a subscription receives
///
/// An action pattern ending in `*` matches by prefix; `None` matches any
/// action. A source of `None` matches every publishing domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventPattern {
    /// Publishing domain filter
    pub source: Option<Domain>,

    /// Action filter
    pub action: Option<String>,
}

impl EventPattern {
    /// Matches every event
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches events with the given action pattern
    pub fn action(action: impl Into<String>) -> Self {
        Self {
            source: None,
            action: Some(action.into()),
        }
    }

    /// Restricts the pattern to one publishing domain
    pub fn from_source(mut self, source: Domain) -> Self {
        self.source = Some(source);
        self
    }

    /// Returns true if the envelope matches
    pub fn matches(&self, envelope: &Envelope) -> bool {
        if let Some(source) = self.source {
            if envelope.domain != source {
                return false;
            }
        }

        match &self.action {
            None => true,
            Some(pattern) => match pattern.strip_suffix('*') {
                Some(prefix) => envelope.action.starts_with(prefix),
                None => envelope.action == *pattern,
            },
        }
    }
}
