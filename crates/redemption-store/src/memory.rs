use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::{RedemptionId, UserId};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    Fingerprint, IdempotencyRecord, NewOutboxEntry, NewRedemption, OutboxEntry, Redemption,
    ReserveOutcome, Result, StoreError, Transition,
    store::{IdempotencyStore, OutboxStore, RedemptionRepository},
};

#[derive(Debug, Default)]
struct MemoryState {
    redemptions: HashMap<RedemptionId, Redemption>,
    keys: HashMap<String, IdempotencyRecord>,
    outbox: Vec<OutboxEntry>,
    last_outbox_id: i64,
    failing_commits: usize,
    commits_before_failure: usize,
}

impl MemoryState {
    /// Stages outbox entries for a unit of work. Only callable while the
    /// state lock is held, i.e. inside the same unit as the state change.
    fn append_events(&mut self, events: Vec<NewOutboxEntry>) -> Vec<OutboxEntry> {
        let now = Utc::now();
        events
            .into_iter()
            .map(|event| {
                self.last_outbox_id += 1;
                event.into_entry(self.last_outbox_id, now)
            })
            .collect()
    }

    /// Consumes one injected commit failure, if any are armed.
    fn take_commit_failure(&mut self) -> bool {
        if self.failing_commits == 0 {
            return false;
        }
        if self.commits_before_failure > 0 {
            self.commits_before_failure -= 1;
            return false;
        }
        self.failing_commits -= 1;
        true
    }
}

/// In-memory redemption store for testing.
///
/// Implements the same atomicity contract as the PostgreSQL store: every
/// write stages all of its changes under one lock and publishes them
/// together. Commit failures can be injected to simulate a crash between
/// the state write and the outbox write.
#[derive(Clone, Default)]
pub struct InMemoryRedemptionStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryRedemptionStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` writes stage their changes and then abort
    /// before committing, as if the process died mid-transaction.
    pub async fn fail_next_commits(&self, count: usize) {
        let mut state = self.state.write().await;
        state.failing_commits = count;
        state.commits_before_failure = 0;
    }

    /// Lets `successes` writes commit normally, then fails the next one.
    pub async fn fail_commit_after(&self, successes: usize) {
        self.fail_commits_after(successes, 1).await;
    }

    /// Lets `successes` writes commit normally, then fails the next `count`.
    pub async fn fail_commits_after(&self, successes: usize, count: usize) {
        let mut state = self.state.write().await;
        state.failing_commits = count;
        state.commits_before_failure = successes;
    }

    /// Returns the number of redemptions stored.
    pub async fn redemption_count(&self) -> usize {
        self.state.read().await.redemptions.len()
    }

    /// Returns every outbox entry in id order.
    pub async fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.state.read().await.outbox.clone()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryRedemptionStore {
    async fn reserve(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
        redemption: NewRedemption,
        events: Vec<NewOutboxEntry>,
    ) -> Result<ReserveOutcome> {
        let mut state = self.state.write().await;

        if let Some(record) = state.keys.get(key) {
            return Ok(ReserveOutcome::existing(record, fingerprint));
        }

        let now = Utc::now();
        let created = redemption.into_redemption(now);
        let record = IdempotencyRecord {
            key: key.to_string(),
            redemption_id: created.id,
            request_fingerprint: fingerprint.clone(),
            created_at: now,
        };
        let last_outbox_id = state.last_outbox_id;
        let staged = state.append_events(events);

        if state.take_commit_failure() {
            state.last_outbox_id = last_outbox_id;
            return Err(StoreError::Unavailable(
                "injected failure before commit".to_string(),
            ));
        }

        state.keys.insert(record.key.clone(), record);
        state.redemptions.insert(created.id, created.clone());
        state.outbox.extend(staged);

        Ok(ReserveOutcome::Created(created))
    }

    async fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        Ok(self.state.read().await.keys.get(key).cloned())
    }
}

#[async_trait]
impl RedemptionRepository for InMemoryRedemptionStore {
    async fn get(&self, id: RedemptionId) -> Result<Option<Redemption>> {
        Ok(self.state.read().await.redemptions.get(&id).cloned())
    }

    async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<Redemption>> {
        let state = self.state.read().await;
        let mut redemptions: Vec<_> = state
            .redemptions
            .values()
            .filter(|r| &r.user_id == user_id)
            .cloned()
            .collect();
        redemptions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(redemptions)
    }

    async fn list_in_flight(&self) -> Result<Vec<Redemption>> {
        let state = self.state.read().await;
        let mut redemptions: Vec<_> = state
            .redemptions
            .values()
            .filter(|r| !r.status.is_terminal())
            .cloned()
            .collect();
        redemptions.sort_by_key(|r| r.created_at);
        Ok(redemptions)
    }

    async fn transition(&self, transition: Transition) -> Result<Redemption> {
        transition.validate()?;

        let mut state = self.state.write().await;

        let current = state
            .redemptions
            .get(&transition.redemption_id)
            .ok_or(StoreError::NotFound(transition.redemption_id))?;

        if current.version != transition.expected_version {
            return Err(StoreError::ConcurrencyConflict {
                redemption_id: transition.redemption_id,
                expected: transition.expected_version,
                actual: current.version,
            });
        }
        if current.status != transition.from {
            return Err(StoreError::InvalidTransition {
                redemption_id: transition.redemption_id,
                from: current.status,
                to: transition.to,
            });
        }

        let next = current.apply(&transition, Utc::now());
        let last_outbox_id = state.last_outbox_id;
        let staged = state.append_events(transition.events);

        if state.take_commit_failure() {
            state.last_outbox_id = last_outbox_id;
            return Err(StoreError::Unavailable(
                "injected failure before commit".to_string(),
            ));
        }

        state.redemptions.insert(next.id, next.clone());
        state.outbox.extend(staged);

        Ok(next)
    }
}

#[async_trait]
impl OutboxStore for InMemoryRedemptionStore {
    async fn pending_entries(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let state = self.state.read().await;
        let mut parked: HashSet<Uuid> = HashSet::new();
        let mut pending = Vec::new();

        for entry in &state.outbox {
            if pending.len() >= limit {
                break;
            }
            if entry.is_parked() {
                parked.insert(entry.aggregate_id);
            } else if entry.is_pending() && !parked.contains(&entry.aggregate_id) {
                pending.push(entry.clone());
            }
        }
        Ok(pending)
    }

    async fn entries_for_aggregate(&self, aggregate_id: Uuid) -> Result<Vec<OutboxEntry>> {
        let state = self.state.read().await;
        Ok(state
            .outbox
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .cloned()
            .collect())
    }

    async fn mark_dispatched(&self, id: i64) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(entry) = state.outbox.iter_mut().find(|e| e.id == id) {
            entry.dispatched_at.get_or_insert_with(Utc::now);
        }
        Ok(())
    }

    async fn record_dispatch_failure(&self, id: i64, error: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(entry) = state.outbox.iter_mut().find(|e| e.id == id) {
            entry.retry_count += 1;
            entry.last_error = Some(error.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{BenefitId, PartnerId, RedemptionStatus};

    fn new_redemption(user: &str, key: &str, points: i64) -> (NewRedemption, Fingerprint) {
        let user_id = UserId::new(user);
        let benefit_id = BenefitId::new("benefit-1");
        let fingerprint = Fingerprint::of_request(&user_id, &benefit_id, points);
        (
            NewRedemption::new(user_id, benefit_id, points, key),
            fingerprint,
        )
    }

    fn requested_event(id: RedemptionId) -> NewOutboxEntry {
        NewOutboxEntry::redemption(
            id,
            "redemption.requested",
            "redemption.requested.v1",
            serde_json::json!({}),
        )
    }

    async fn create(store: &InMemoryRedemptionStore, user: &str, key: &str) -> Redemption {
        let (new, fp) = new_redemption(user, key, 100);
        let event = requested_event(new.id);
        match store.reserve(key, &fp, new, vec![event]).await.unwrap() {
            ReserveOutcome::Created(r) => r,
            ReserveOutcome::Existing { .. } => panic!("expected a fresh key"),
        }
    }

    #[tokio::test]
    async fn reserve_creates_record_redemption_and_event() {
        let store = InMemoryRedemptionStore::new();
        let created = create(&store, "u1", "k1").await;

        assert_eq!(created.status, RedemptionStatus::Requested);
        let record = store.get_record("k1").await.unwrap().unwrap();
        assert_eq!(record.redemption_id, created.id);

        let events = store
            .entries_for_aggregate(created.id.as_uuid())
            .await
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "redemption.requested");
    }

    #[tokio::test]
    async fn reserve_existing_key_reports_fingerprint_match() {
        let store = InMemoryRedemptionStore::new();
        let created = create(&store, "u1", "k1").await;

        let (same, fp) = new_redemption("u1", "k1", 100);
        match store.reserve("k1", &fp, same, vec![]).await.unwrap() {
            ReserveOutcome::Existing {
                redemption_id,
                fingerprint_matches,
            } => {
                assert_eq!(redemption_id, created.id);
                assert!(fingerprint_matches);
            }
            ReserveOutcome::Created(_) => panic!("key reused"),
        }

        let (different, fp) = new_redemption("u1", "k1", 999);
        match store.reserve("k1", &fp, different, vec![]).await.unwrap() {
            ReserveOutcome::Existing {
                fingerprint_matches,
                ..
            } => assert!(!fingerprint_matches),
            ReserveOutcome::Created(_) => panic!("key reused"),
        }

        assert_eq!(store.redemption_count().await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reserve_has_single_winner() {
        let store = InMemoryRedemptionStore::new();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let (new, fp) = new_redemption("u1", "same-key", 100);
                store.reserve("same-key", &fp, new, vec![]).await.unwrap()
            }));
        }

        let mut created = 0;
        for handle in handles {
            if let ReserveOutcome::Created(_) = handle.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(store.redemption_count().await, 1);
    }

    #[tokio::test]
    async fn transition_rejects_stale_version() {
        let store = InMemoryRedemptionStore::new();
        let created = create(&store, "u1", "k1").await;

        let advanced = store
            .transition(
                Transition::of(&created, RedemptionStatus::PointsReserving)
                    .with_partner_id(PartnerId::new("acme")),
            )
            .await
            .unwrap();
        assert_eq!(advanced.version, 2);
        assert_eq!(advanced.partner_id, Some(PartnerId::new("acme")));

        // Stale copy still at version 1
        let result = store
            .transition(Transition::of(&created, RedemptionStatus::PointsReserving))
            .await;
        assert!(matches!(
            result,
            Err(StoreError::ConcurrencyConflict {
                expected: 1,
                actual: 2,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn injected_commit_failure_writes_neither_state_nor_event() {
        let store = InMemoryRedemptionStore::new();
        let created = create(&store, "u1", "k1").await;

        store.fail_next_commits(1).await;
        let transition = Transition::of(&created, RedemptionStatus::Failed)
            .with_error("benefit not found")
            .with_event(NewOutboxEntry::redemption(
                created.id,
                "redemption.failed",
                "redemption.failed.v1",
                serde_json::json!({}),
            ));
        let result = store.transition(transition.clone()).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));

        let stored = store.get(created.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RedemptionStatus::Requested);
        assert_eq!(store.outbox_entries().await.len(), 1);

        // Retrying the same unit of work succeeds and ids stay gap-free
        let failed = store.transition(transition).await.unwrap();
        assert_eq!(failed.status, RedemptionStatus::Failed);
        let entries = store.outbox_entries().await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].id, 2);
    }

    #[tokio::test]
    async fn injected_failure_on_reserve_leaves_key_free() {
        let store = InMemoryRedemptionStore::new();
        store.fail_next_commits(1).await;

        let (new, fp) = new_redemption("u1", "k1", 100);
        let event = requested_event(new.id);
        assert!(store.reserve("k1", &fp, new, vec![event]).await.is_err());
        assert!(store.get_record("k1").await.unwrap().is_none());
        assert_eq!(store.redemption_count().await, 0);
        assert!(store.outbox_entries().await.is_empty());
    }

    #[tokio::test]
    async fn list_for_user_is_newest_first_and_scoped() {
        let store = InMemoryRedemptionStore::new();
        let first = create(&store, "u1", "k1").await;
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let second = create(&store, "u1", "k2").await;
        create(&store, "u2", "k3").await;

        let listed = store.list_for_user(&UserId::new("u1")).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
    }

    #[tokio::test]
    async fn outbox_dispatch_bookkeeping() {
        let store = InMemoryRedemptionStore::new();
        create(&store, "u1", "k1").await;
        create(&store, "u1", "k2").await;

        let pending = store.pending_entries(10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending[0].id < pending[1].id);

        store.mark_dispatched(pending[0].id).await.unwrap();
        store
            .record_dispatch_failure(pending[1].id, "broker down")
            .await
            .unwrap();

        let pending = store.pending_entries(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 1);
        assert_eq!(pending[0].last_error.as_deref(), Some("broker down"));
    }

    #[tokio::test]
    async fn parked_entry_holds_back_later_entries_of_its_aggregate() {
        let store = InMemoryRedemptionStore::new();
        let created = create(&store, "u1", "k1").await;
        let other = create(&store, "u2", "k2").await;
        store
            .transition(
                Transition::of(&created, RedemptionStatus::PointsReserving)
                    .with_partner_id(PartnerId::new("p")),
            )
            .await
            .unwrap();

        let first = store.pending_entries(10).await.unwrap()[0].clone();
        assert_eq!(first.aggregate_id, created.id.as_uuid());
        for _ in 0..first.max_retries {
            store
                .record_dispatch_failure(first.id, "broker down")
                .await
                .unwrap();
        }

        let reserving = store.get(created.id).await.unwrap().unwrap();
        store
            .transition(
                Transition::of(&reserving, RedemptionStatus::Failed)
                    .with_error("insufficient balance")
                    .with_event(NewOutboxEntry::redemption(
                        created.id,
                        "redemption.failed",
                        "redemption.failed.v1",
                        serde_json::json!({}),
                    )),
            )
            .await
            .unwrap();

        let pending = store.pending_entries(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].aggregate_id, other.id.as_uuid());
        let for_created = store
            .entries_for_aggregate(created.id.as_uuid())
            .await
            .unwrap();
        assert_eq!(for_created.len(), 2);
        assert!(for_created[0].is_parked());
    }

    #[tokio::test]
    async fn fail_commit_after_lets_earlier_writes_through() {
        let store = InMemoryRedemptionStore::new();
        let created = create(&store, "u1", "k1").await;

        store.fail_commit_after(1).await;
        let reserving = store
            .transition(Transition::of(&created, RedemptionStatus::PointsReserving))
            .await
            .unwrap();
        let result = store
            .transition(Transition::of(&reserving, RedemptionStatus::Fulfilling))
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));

        // Armed failure is consumed
        store
            .transition(Transition::of(&reserving, RedemptionStatus::Fulfilling))
            .await
            .unwrap();
    }
}
