//! Outbox relay: drains pending outbox entries to an event bus.
//!
//! Delivery is at-least-once. Entries for one aggregate are published in
//! increasing `id` order; when one fails, later entries for the same
//! aggregate wait for the next pass. Once an entry is parked, later entries
//! for its aggregate stay unsent until an operator resolves it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::{OutboxEntry, Result, store::OutboxStore};

/// Error returned by an event publisher.
#[derive(Debug, Clone, Error)]
#[error("Publish failed: {0}")]
pub struct PublishError(pub String);

/// Destination for outbox entries (a message broker in production).
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes one entry. The aggregate id is the partition key.
    async fn publish(&self, entry: &OutboxEntry) -> std::result::Result<(), PublishError>;
}

/// A message observed on the in-memory bus.
#[derive(Debug, Clone, Serialize)]
pub struct PublishedMessage {
    pub outbox_id: i64,
    pub topic: String,
    pub key: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Default)]
struct BusState {
    messages: Vec<PublishedMessage>,
    failing_publishes: usize,
}

/// In-memory event bus for testing. Records every published message.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventBus {
    state: Arc<Mutex<BusState>>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` publishes fail.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().unwrap().failing_publishes = count;
    }

    /// Returns every message published so far.
    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.state.lock().unwrap().messages.clone()
    }

    /// Returns the messages published to `topic`.
    pub fn messages_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventBus {
    async fn publish(&self, entry: &OutboxEntry) -> std::result::Result<(), PublishError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(PublishError("broker unavailable".to_string()));
        }
        state.messages.push(PublishedMessage {
            outbox_id: entry.id,
            topic: entry.topic.clone(),
            key: entry.aggregate_id.to_string(),
            event_type: entry.event_type.clone(),
            payload: entry.payload.clone(),
        });
        Ok(())
    }
}

/// Publisher that logs each event instead of sending it anywhere.
///
/// Used when no broker is configured; the log line stands in for the user
/// notification.
#[derive(Debug, Clone, Default)]
pub struct TracingPublisher;

#[async_trait]
impl EventPublisher for TracingPublisher {
    async fn publish(&self, entry: &OutboxEntry) -> std::result::Result<(), PublishError> {
        tracing::info!(
            outbox_id = entry.id,
            topic = %entry.topic,
            event_type = %entry.event_type,
            aggregate_id = %entry.aggregate_id,
            payload = %entry.payload,
            "event published"
        );
        Ok(())
    }
}

/// Outcome of one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub dispatched: usize,
    pub failed: usize,
    /// Entries held back because an earlier entry for the same aggregate failed.
    pub deferred: usize,
}

/// Polls the outbox and publishes pending entries.
pub struct OutboxRelay<S: OutboxStore, P: EventPublisher> {
    store: S,
    publisher: P,
    batch_size: usize,
    poll_interval: Duration,
}

impl<S: OutboxStore, P: EventPublisher> OutboxRelay<S, P> {
    pub fn new(store: S, publisher: P) -> Self {
        Self {
            store,
            publisher,
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Publishes one batch of pending entries.
    #[tracing::instrument(skip(self))]
    pub async fn dispatch_batch(&self) -> Result<DispatchReport> {
        let entries = self.store.pending_entries(self.batch_size).await?;
        let mut report = DispatchReport::default();
        let mut blocked: HashSet<Uuid> = HashSet::new();

        for entry in entries {
            if blocked.contains(&entry.aggregate_id) {
                report.deferred += 1;
                continue;
            }

            match self.publisher.publish(&entry).await {
                Ok(()) => {
                    self.store.mark_dispatched(entry.id).await?;
                    metrics::counter!("outbox_dispatched_total").increment(1);
                    report.dispatched += 1;
                }
                Err(e) => {
                    self.store
                        .record_dispatch_failure(entry.id, &e.to_string())
                        .await?;
                    metrics::counter!("outbox_dispatch_failures_total").increment(1);
                    if entry.retry_count + 1 >= entry.max_retries {
                        tracing::error!(
                            outbox_id = entry.id,
                            event_type = %entry.event_type,
                            error = %e,
                            "outbox entry parked after exhausting retries"
                        );
                    } else {
                        tracing::warn!(outbox_id = entry.id, error = %e, "outbox publish failed");
                    }
                    blocked.insert(entry.aggregate_id);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Runs the relay until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.dispatch_batch().await {
                        tracing::warn!(error = %e, "outbox relay pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("outbox relay stopped");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        Fingerprint, InMemoryRedemptionStore, NewOutboxEntry, NewRedemption, Transition,
        store::{IdempotencyStore, RedemptionRepository},
    };
    use common::{BenefitId, PartnerId, RedemptionStatus, UserId};

    async fn seed(store: &InMemoryRedemptionStore, key: &str) -> common::RedemptionId {
        let user = UserId::new("u1");
        let benefit = BenefitId::new("b1");
        let fp = Fingerprint::of_request(&user, &benefit, 10);
        let new = NewRedemption::new(user, benefit, 10, key);
        let id = new.id;
        let event = NewOutboxEntry::redemption(
            id,
            "redemption.requested",
            "redemption.requested.v1",
            serde_json::json!({"n": 1}),
        );
        store.reserve(key, &fp, new, vec![event]).await.unwrap();
        id
    }

    async fn fail(store: &InMemoryRedemptionStore, id: common::RedemptionId) {
        let r = store.get(id).await.unwrap().unwrap();
        let r = store
            .transition(
                Transition::of(&r, RedemptionStatus::PointsReserving)
                    .with_partner_id(PartnerId::new("p")),
            )
            .await
            .unwrap();
        store
            .transition(
                Transition::of(&r, RedemptionStatus::Failed)
                    .with_error("insufficient balance")
                    .with_event(NewOutboxEntry::redemption(
                        id,
                        "redemption.failed",
                        "redemption.failed.v1",
                        serde_json::json!({"n": 2}),
                    )),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dispatches_pending_entries_in_order() {
        let store = InMemoryRedemptionStore::new();
        let bus = InMemoryEventBus::new();
        let id = seed(&store, "k1").await;
        fail(&store, id).await;

        let relay = OutboxRelay::new(store.clone(), bus.clone());
        let report = relay.dispatch_batch().await.unwrap();
        assert_eq!(report.dispatched, 2);

        let messages = bus.messages();
        assert_eq!(messages[0].event_type, "redemption.requested");
        assert_eq!(messages[1].event_type, "redemption.failed");
        assert_eq!(messages[1].key, id.to_string());
        assert!(store.pending_entries(10).await.unwrap().is_empty());

        // Nothing left to send on a second pass
        assert_eq!(relay.dispatch_batch().await.unwrap().dispatched, 0);
    }

    #[tokio::test]
    async fn failed_entry_defers_later_entries_of_same_aggregate() {
        let store = InMemoryRedemptionStore::new();
        let bus = InMemoryEventBus::new();
        let first = seed(&store, "k1").await;
        fail(&store, first).await;
        let other = seed(&store, "k2").await;

        bus.fail_next_publishes(1);
        let relay = OutboxRelay::new(store.clone(), bus.clone());
        let report = relay.dispatch_batch().await.unwrap();
        assert_eq!(
            report,
            DispatchReport {
                dispatched: 1,
                failed: 1,
                deferred: 1
            }
        );
        assert_eq!(bus.messages()[0].key, other.to_string());

        let report = relay.dispatch_batch().await.unwrap();
        assert_eq!(report.dispatched, 2);
        let for_first: Vec<_> = bus
            .messages()
            .into_iter()
            .filter(|m| m.key == first.to_string())
            .map(|m| m.event_type)
            .collect();
        assert_eq!(for_first, vec!["redemption.requested", "redemption.failed"]);
    }

    #[tokio::test]
    async fn entry_is_parked_after_max_retries() {
        let store = InMemoryRedemptionStore::new();
        let bus = InMemoryEventBus::new();
        let user = UserId::new("u1");
        let benefit = BenefitId::new("b1");
        let fp = Fingerprint::of_request(&user, &benefit, 10);
        let new = NewRedemption::new(user, benefit, 10, "k1");
        let event = NewOutboxEntry::redemption(
            new.id,
            "redemption.requested",
            "redemption.requested.v1",
            serde_json::json!({}),
        )
        .with_max_retries(2);
        store.reserve("k1", &fp, new, vec![event]).await.unwrap();

        bus.fail_next_publishes(5);
        let relay = OutboxRelay::new(store.clone(), bus.clone());
        relay.dispatch_batch().await.unwrap();
        relay.dispatch_batch().await.unwrap();
        let report = relay.dispatch_batch().await.unwrap();

        assert_eq!(report, DispatchReport::default());
        let entries = store.outbox_entries().await;
        assert!(entries[0].is_parked());
        assert!(bus.messages().is_empty());
    }

    #[tokio::test]
    async fn parked_entry_keeps_later_entries_of_same_aggregate_unsent() {
        let store = InMemoryRedemptionStore::new();
        let bus = InMemoryEventBus::new();
        let user = UserId::new("u1");
        let benefit = BenefitId::new("b1");
        let fp = Fingerprint::of_request(&user, &benefit, 10);
        let new = NewRedemption::new(user, benefit, 10, "k1");
        let id = new.id;
        let event = NewOutboxEntry::redemption(
            id,
            "redemption.requested",
            "redemption.requested.v1",
            serde_json::json!({}),
        )
        .with_max_retries(2);
        store.reserve("k1", &fp, new, vec![event]).await.unwrap();

        bus.fail_next_publishes(2);
        let relay = OutboxRelay::new(store.clone(), bus.clone());
        relay.dispatch_batch().await.unwrap();
        relay.dispatch_batch().await.unwrap();
        assert!(store.outbox_entries().await[0].is_parked());

        // The terminal event is written after its predecessor was parked
        fail(&store, id).await;
        let other = seed(&store, "k2").await;

        let report = relay.dispatch_batch().await.unwrap();
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.deferred, 0);
        let messages = bus.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].key, other.to_string());

        assert_eq!(relay.dispatch_batch().await.unwrap(), DispatchReport::default());
        assert!(bus.messages().iter().all(|m| m.key != id.to_string()));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = InMemoryRedemptionStore::new();
        let bus = InMemoryEventBus::new();
        seed(&store, "k1").await;

        let relay = OutboxRelay::new(store.clone(), bus.clone())
            .with_poll_interval(Duration::from_millis(5));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { relay.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(bus.messages().len(), 1);
    }
}
