//! Consumer-side sequence tracking
//!
//! Deliveries are stamped with a sequence number per source domain, counted
//! per subscription and starting at 1. Because P0 events overtake queued
//! lower-priority ones, numbers may arrive out of order; a hole is only a
//! missed delivery if it persists.

use std::collections::{BTreeSet, HashMap};

use common::types::Domain;

/// Classification of an observed delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceStatus {
    /// First observation, process it
    New,
    /// Already processed, acknowledge and skip
    Duplicate,
}

#[derive(Debug, Default)]
struct SourceStream {
    /// Every sequence up to and including this one has been observed
    watermark: u64,
    /// Observed sequences above the watermark
    ahead: BTreeSet<u64>,
}

/// Tracks observed sequence numbers per source domain
#[derive(Debug, Default)]
pub struct SequenceTracker {
    streams: HashMap<Domain, SourceStream>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a delivery
    pub fn observe(&mut self, source: Domain, sequence: u64) -> SequenceStatus {
        let stream = self.streams.entry(source).or_default();

        if sequence <= stream.watermark || !stream.ahead.insert(sequence) {
            return SequenceStatus::Duplicate;
        }

        while stream.ahead.remove(&(stream.watermark + 1)) {
            stream.watermark += 1;
        }

        SequenceStatus::New
    }

    /// Sequence numbers below the highest observed one that were never seen
    pub fn missing(&self, source: Domain) -> Vec<u64> {
        let Some(stream) = self.streams.get(&source) else {
            return Vec::new();
        };
        let Some(&highest) = stream.ahead.iter().next_back() else {
            return Vec::new();
        };

        (stream.watermark + 1..highest)
            .filter(|seq| !stream.ahead.contains(seq))
            .collect()
    }

    /// Returns true if any source has a hole
    pub fn has_gaps(&self) -> bool {
        self.streams.values().any(|s| !s.ahead.is_empty())
    }

    /// Highest contiguous sequence observed from a source
    pub fn watermark(&self, source: Domain) -> u64 {
        self.streams.get(&source).map(|s| s.watermark).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicates_detected() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.observe(Domain::Model, 1), SequenceStatus::New);
        assert_eq!(tracker.observe(Domain::Model, 1), SequenceStatus::Duplicate);
        assert_eq!(tracker.observe(Domain::Memory, 1), SequenceStatus::New);
        assert_eq!(tracker.watermark(Domain::Model), 1);
    }

    #[test]
    fn test_gap_reported_until_filled() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(Domain::Device, 1);
        tracker.observe(Domain::Device, 4);
        tracker.observe(Domain::Device, 2);

        assert_eq!(tracker.missing(Domain::Device), vec![3]);
        assert!(tracker.has_gaps());

        assert_eq!(tracker.observe(Domain::Device, 3), SequenceStatus::New);
        assert!(tracker.missing(Domain::Device).is_empty());
        assert_eq!(tracker.watermark(Domain::Device), 4);
        assert_eq!(tracker.observe(Domain::Device, 4), SequenceStatus::Duplicate);
        assert!(!tracker.has_gaps());
    }
}
