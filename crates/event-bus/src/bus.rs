//! Propagation bus implementation

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use common::error::{Error, Result};
use common::models::Envelope;
use common::types::{Domain, EventPriority};
use settings::ConfigManager;

use crate::pattern::EventPattern;

/// Identifier of one published event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryId(pub u64);

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "d-{}", self.0)
    }
}

/// Identifier of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

/// An event as delivered to one subscription
#[derive(Debug, Clone, PartialEq)]
pub struct BusEvent {
    /// Identifier shared by every copy of the published event
    pub delivery_id: DeliveryId,

    /// Receiving subscription
    pub subscription_id: SubscriptionId,

    /// Publishing domain
    pub source: Domain,

    /// Per-source sequence number within the subscription, starting at 1
    pub sequence: u64,

    /// Delivery priority
    pub priority: EventPriority,

    /// Delivery attempt, 1 for the first delivery
    pub attempt: u32,

    /// Published envelope
    pub envelope: Envelope,
}

/// Bus tunables
#[derive(Debug, Clone)]
pub struct BusSettings {
    /// Time after which an unacknowledged delivery is redelivered
    pub ack_timeout: Duration,

    /// Redeliveries before a delivery is abandoned
    pub max_redeliveries: u32,

    /// Events retained per source and subscription for resync
    pub history_per_source: usize,

    /// Period of the redelivery sweep
    pub redelivery_interval: Duration,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(2_000),
            max_redeliveries: 5,
            history_per_source: 1_024,
            redelivery_interval: Duration::from_millis(500),
        }
    }
}

impl BusSettings {
    /// Reads the `bus.*` keys
    pub fn from_config(config_manager: &ConfigManager) -> Self {
        let defaults = Self::default();
        Self {
            ack_timeout: config_manager
                .get_duration("bus.ack_timeout_ms")
                .unwrap_or(defaults.ack_timeout),
            max_redeliveries: config_manager
                .get_u64("bus.max_redeliveries")
                .map(|n| n as u32)
                .unwrap_or(defaults.max_redeliveries),
            history_per_source: config_manager
                .get_usize("bus.history_per_source")
                .unwrap_or(defaults.history_per_source),
            redelivery_interval: config_manager
                .get_duration("bus.redelivery_interval_ms")
                .unwrap_or(defaults.redelivery_interval),
        }
    }
}

/// Outcome of a redelivery sweep
#[derive(Debug, Default)]
pub struct RedeliveryReport {
    /// Deliveries re-enqueued
    pub redelivered: usize,

    /// Deliveries given up on, with the domain that never acknowledged
    pub abandoned: Vec<(DeliveryId, Domain)>,
}

impl RedeliveryReport {
    /// Domains that exhausted their redeliveries, without duplicates
    pub fn unreachable_domains(&self) -> Vec<Domain> {
        let mut domains: Vec<Domain> = self.abandoned.iter().map(|(_, d)| *d).collect();
        domains.sort();
        domains.dedup();
        domains
    }
}

#[derive(Debug, Default)]
struct SubscriberInner {
    /// One queue per priority tier
    queues: [VecDeque<BusEvent>; 4],
    /// Next sequence number per source
    next_sequence: HashMap<Domain, u64>,
    /// Retained deliveries per source, oldest first
    history: HashMap<Domain, VecDeque<BusEvent>>,
}

impl SubscriberInner {
    fn enqueue(&mut self, event: BusEvent) {
        self.queues[event.priority.tier()].push_back(event);
    }

    fn pop(&mut self) -> Option<BusEvent> {
        self.queues.iter_mut().find_map(|queue| queue.pop_front())
    }
}

struct Subscriber {
    id: SubscriptionId,
    domain: Domain,
    pattern: EventPattern,
    inner: Mutex<SubscriberInner>,
    notify: Notify,
    closed: AtomicBool,
}

impl Subscriber {
    fn push(&self, event: BusEvent) {
        self.inner.lock().enqueue(event);
        self.notify.notify_one();
    }
}

struct PendingDelivery {
    /// One copy per subscription of the domain
    events: Vec<BusEvent>,
    sent_at: Instant,
    redeliveries: u32,
}

type SubscriberMap = DashMap<SubscriptionId, Arc<Subscriber>>;

/// Priority-ordered, at-least-once propagation bus
pub struct PropagationBus {
    settings: BusSettings,
    subscribers: Arc<SubscriberMap>,
    pending: DashMap<(DeliveryId, Domain), PendingDelivery>,
    next_delivery: AtomicU64,
    next_subscription: AtomicU64,
}

impl PropagationBus {
    /// Creates a new bus
    pub fn new(settings: BusSettings) -> Self {
        Self {
            settings,
            subscribers: Arc::new(DashMap::new()),
            pending: DashMap::new(),
            next_delivery: AtomicU64::new(1),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Bus settings
    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    /// Subscribes a domain to events matching a pattern
    pub fn subscribe(&self, domain: Domain, pattern: EventPattern) -> Subscription {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let subscriber = Arc::new(Subscriber {
            id,
            domain,
            pattern,
            inner: Mutex::new(SubscriberInner::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });

        self.subscribers.insert(id, Arc::clone(&subscriber));
        debug!(%domain, subscription = id.0, "Subscription registered");

        Subscription {
            subscriber,
            registry: Arc::clone(&self.subscribers),
        }
    }

    /// Publishes an event to every matching subscription
    ///
    /// The envelope's domain is the publishing source; its priority is
    /// overwritten by `priority`.
    pub fn publish(&self, mut envelope: Envelope, priority: EventPriority) -> DeliveryId {
        envelope.priority = priority;
        let delivery_id = DeliveryId(self.next_delivery.fetch_add(1, Ordering::Relaxed));
        let source = envelope.domain;

        let mut by_domain: HashMap<Domain, Vec<BusEvent>> = HashMap::new();
        let subscribers: Vec<Arc<Subscriber>> = self
            .subscribers
            .iter()
            .filter(|s| s.pattern.matches(&envelope))
            .map(|s| Arc::clone(s.value()))
            .collect();

        for subscriber in subscribers {
            let event = {
                let mut inner = subscriber.inner.lock();
                let next = inner.next_sequence.entry(source).or_insert(1);
                let sequence = *next;
                *next += 1;

                let event = BusEvent {
                    delivery_id,
                    subscription_id: subscriber.id,
                    source,
                    sequence,
                    priority,
                    attempt: 1,
                    envelope: envelope.clone(),
                };

                let history = inner.history.entry(source).or_default();
                history.push_back(event.clone());
                while history.len() > self.settings.history_per_source {
                    history.pop_front();
                }

                inner.enqueue(event.clone());
                event
            };
            subscriber.notify.notify_one();
            by_domain.entry(subscriber.domain).or_default().push(event);
        }

        let fan_out = by_domain.len();
        let now = Instant::now();
        for (domain, events) in by_domain {
            self.pending.insert(
                (delivery_id, domain),
                PendingDelivery {
                    events,
                    sent_at: now,
                    redeliveries: 0,
                },
            );
        }

        trace!(
            delivery = %delivery_id,
            %source,
            action = %envelope.action,
            %priority,
            fan_out,
            "Event published"
        );

        delivery_id
    }

    /// Acknowledges a delivery on behalf of a domain
    ///
    /// Returns false if nothing was pending, e.g. for a duplicate ack.
    pub fn acknowledge(&self, delivery_id: DeliveryId, domain: Domain) -> bool {
        self.pending.remove(&(delivery_id, domain)).is_some()
    }

    /// Redelivers every delivery not acknowledged within `ack_timeout`
    ///
    /// A delivery that has been redelivered `max_redeliveries` times is
    /// abandoned and its domain reported in the result.
    pub fn redeliver_unacked(&self, ack_timeout: Duration) -> RedeliveryReport {
        let now = Instant::now();
        let mut report = RedeliveryReport::default();

        let overdue: Vec<(DeliveryId, Domain)> = self
            .pending
            .iter()
            .filter(|p| now.duration_since(p.sent_at) >= ack_timeout)
            .map(|p| *p.key())
            .collect();

        for key in overdue {
            let exhausted = match self.pending.get(&key) {
                Some(pending) => pending.redeliveries >= self.settings.max_redeliveries,
                None => continue,
            };

            if exhausted {
                if self.pending.remove(&key).is_some() {
                    warn!(delivery = %key.0, domain = %key.1, "Delivery abandoned after redeliveries");
                    report.abandoned.push(key);
                }
                continue;
            }

            let events = match self.pending.get_mut(&key) {
                Some(mut pending) => {
                    pending.redeliveries += 1;
                    pending.sent_at = now;
                    for event in pending.events.iter_mut() {
                        event.attempt += 1;
                    }
                    pending.events.clone()
                }
                None => continue,
            };

            let mut delivered = false;
            for event in events {
                if let Some(subscriber) = self.subscribers.get(&event.subscription_id).map(|s| Arc::clone(s.value())) {
                    subscriber.push(event);
                    delivered = true;
                }
            }

            if delivered {
                report.redelivered += 1;
            } else {
                // Every subscription of the domain is gone
                self.pending.remove(&key);
            }
        }

        if report.redelivered > 0 {
            debug!(redelivered = report.redelivered, "Unacknowledged deliveries re-enqueued");
        }

        report
    }

    /// Replays retained deliveries from `from_sequence` onward to a subscription
    ///
    /// Fails if history no longer reaches back to `from_sequence`.
    pub fn resync(&self, subscription_id: SubscriptionId, source: Domain, from_sequence: u64) -> Result<usize> {
        let subscriber = self
            .subscribers
            .get(&subscription_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| Error::NotFound(format!("Subscription {}", subscription_id.0)))?;

        let replay = {
            let mut inner = subscriber.inner.lock();
            let history = inner.history.get(&source).cloned().unwrap_or_default();

            if let Some(oldest) = history.front() {
                if oldest.sequence > from_sequence {
                    return Err(Error::InvalidState(format!(
                        "History for {} starts at sequence {}, resync requested from {}",
                        source, oldest.sequence, from_sequence
                    )));
                }
            }

            let replay: Vec<BusEvent> = history
                .into_iter()
                .filter(|e| e.sequence >= from_sequence)
                .collect();
            for event in &replay {
                inner.enqueue(event.clone());
            }
            replay.len()
        };

        subscriber.notify.notify_one();
        debug!(
            subscription = subscription_id.0,
            %source,
            from_sequence,
            replayed = replay,
            "Subscription resynchronised"
        );

        Ok(replay)
    }

    /// Closes every subscription
    pub fn close(&self) {
        for subscriber in self.subscribers.iter() {
            subscriber.closed.store(true, Ordering::Release);
            subscriber.notify.notify_one();
        }
    }

    /// Number of deliveries awaiting acknowledgment
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// Receiving end of a subscription
///
/// Dropping it unsubscribes.
pub struct Subscription {
    subscriber: Arc<Subscriber>,
    registry: Arc<SubscriberMap>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.subscriber.id
    }

    pub fn domain(&self) -> Domain {
        self.subscriber.domain
    }

    /// Takes the next event without waiting
    pub fn try_recv(&self) -> Option<BusEvent> {
        self.subscriber.inner.lock().pop()
    }

    /// Waits for the next event
    ///
    /// Returns `None` once the bus is closed and the queue is drained.
    pub async fn recv(&self) -> Option<BusEvent> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.subscriber.closed.load(Ordering::Acquire) {
                return None;
            }
            self.subscriber.notify.notified().await;
        }
    }

    /// Number of queued events
    pub fn queued(&self) -> usize {
        self.subscriber.inner.lock().queues.iter().map(VecDeque::len).sum()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove(&self.subscriber.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::{SequenceStatus, SequenceTracker};
    use serde_json::json;

    fn event(source: Domain, action: &str) -> Envelope {
        Envelope::new(source, action, EventPriority::P2, json!({ "action": action }))
    }

    fn bus() -> PropagationBus {
        PropagationBus::new(BusSettings {
            max_redeliveries: 2,
            history_per_source: 4,
            ..BusSettings::default()
        })
    }

    #[test]
    fn test_p0_overtakes_queued_events() {
        let bus = bus();
        let sub = bus.subscribe(Domain::Inference, EventPattern::all());

        bus.publish(event(Domain::Model, "first"), EventPriority::P1);
        bus.publish(event(Domain::Model, "second"), EventPriority::P1);
        bus.publish(event(Domain::Device, "critical"), EventPriority::P0);
        bus.publish(event(Domain::Model, "third"), EventPriority::P3);

        let order: Vec<String> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| e.envelope.action)
            .collect();
        assert_eq!(order, vec!["critical", "first", "second", "third"]);
    }

    #[test]
    fn test_pattern_filters_deliveries() {
        let bus = bus();
        let model = bus.subscribe(Domain::Model, EventPattern::action("memory_*"));
        let all = bus.subscribe(Domain::Processing, EventPattern::all());

        bus.publish(event(Domain::Memory, "memory_pressure"), EventPriority::P1);
        bus.publish(event(Domain::Device, "device_lost"), EventPriority::P1);

        assert_eq!(model.queued(), 1);
        assert_eq!(all.queued(), 2);
    }

    #[test]
    fn test_sequence_numbers_per_source() {
        let bus = bus();
        let sub = bus.subscribe(Domain::Postprocessing, EventPattern::all());

        bus.publish(event(Domain::Model, "a"), EventPriority::P2);
        bus.publish(event(Domain::Memory, "b"), EventPriority::P2);
        bus.publish(event(Domain::Model, "c"), EventPriority::P2);

        let seqs: Vec<(Domain, u64)> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| (e.source, e.sequence))
            .collect();
        assert_eq!(
            seqs,
            vec![(Domain::Model, 1), (Domain::Memory, 1), (Domain::Model, 2)]
        );
    }

    #[test]
    fn test_ack_stops_redelivery() {
        let bus = bus();
        let sub = bus.subscribe(Domain::Model, EventPattern::all());

        let acked = bus.publish(event(Domain::Memory, "a"), EventPriority::P2);
        bus.publish(event(Domain::Memory, "b"), EventPriority::P2);
        assert_eq!(bus.pending_count(), 2);

        assert!(bus.acknowledge(acked, Domain::Model));
        assert!(!bus.acknowledge(acked, Domain::Model));

        while sub.try_recv().is_some() {}
        let report = bus.redeliver_unacked(Duration::ZERO);
        assert_eq!(report.redelivered, 1);

        let redelivered = sub.try_recv().unwrap();
        assert_eq!(redelivered.envelope.action, "b");
        assert_eq!(redelivered.attempt, 2);
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn test_redelivery_is_idempotent_for_tracking_consumer() {
        let bus = bus();
        let sub = bus.subscribe(Domain::Model, EventPattern::all());
        let mut tracker = SequenceTracker::new();

        bus.publish(event(Domain::Memory, "a"), EventPriority::P2);
        let first = sub.try_recv().unwrap();
        assert_eq!(tracker.observe(first.source, first.sequence), SequenceStatus::New);

        bus.redeliver_unacked(Duration::ZERO);
        let again = sub.try_recv().unwrap();
        assert_eq!(again.delivery_id, first.delivery_id);
        assert_eq!(tracker.observe(again.source, again.sequence), SequenceStatus::Duplicate);
    }

    #[test]
    fn test_unacknowledging_domain_is_abandoned() {
        let bus = bus();
        let _sub = bus.subscribe(Domain::Inference, EventPattern::all());
        let delivery = bus.publish(event(Domain::Model, "a"), EventPriority::P1);

        assert_eq!(bus.redeliver_unacked(Duration::ZERO).redelivered, 1);
        assert_eq!(bus.redeliver_unacked(Duration::ZERO).redelivered, 1);

        let report = bus.redeliver_unacked(Duration::ZERO);
        assert_eq!(report.redelivered, 0);
        assert_eq!(report.abandoned, vec![(delivery, Domain::Inference)]);
        assert_eq!(report.unreachable_domains(), vec![Domain::Inference]);
        assert_eq!(bus.pending_count(), 0);
    }

    #[test]
    fn test_resync_replays_missing_range() {
        let bus = bus();
        let sub = bus.subscribe(Domain::Model, EventPattern::all());
        for action in ["a", "b", "c"] {
            bus.publish(event(Domain::Memory, action), EventPriority::P2);
        }
        while sub.try_recv().is_some() {}

        assert_eq!(bus.resync(sub.id(), Domain::Memory, 2).unwrap(), 2);
        assert_eq!(sub.try_recv().unwrap().sequence, 2);
        assert_eq!(sub.try_recv().unwrap().sequence, 3);

        for action in ["d", "e", "f"] {
            bus.publish(event(Domain::Memory, action), EventPriority::P2);
        }
        // History holds only the last four deliveries
        let err = bus.resync(sub.id(), Domain::Memory, 1).unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = bus();
        let sub = bus.subscribe(Domain::Model, EventPattern::all());
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);

        bus.publish(event(Domain::Memory, "a"), EventPriority::P2);
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_recv_waits_for_publish() {
        let bus = Arc::new(bus());
        let sub = bus.subscribe(Domain::Model, EventPattern::all());

        let publisher = Arc::clone(&bus);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(event(Domain::Device, "late"), EventPriority::P1);
        });

        let received = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.envelope.action, "late");

        bus.close();
        assert!(sub.recv().await.is_none());
    }
}
