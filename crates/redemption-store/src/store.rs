use async_trait::async_trait;
use common::{RedemptionId, UserId};

use crate::{
    Fingerprint, IdempotencyRecord, NewOutboxEntry, NewRedemption, OutboxEntry, Redemption,
    ReserveOutcome, Result, Transition,
};

/// Request deduplication keyed by a caller-supplied idempotency key.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically claims `key` for `redemption`.
    ///
    /// On a fresh key the idempotency record, the `requested` redemption and
    /// `events` are committed as one unit and `Created` is returned. If the
    /// key already exists nothing is written and `Existing` is returned.
    /// Of several concurrent callers with the same key exactly one sees
    /// `Created`.
    async fn reserve(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
        redemption: NewRedemption,
        events: Vec<NewOutboxEntry>,
    ) -> Result<ReserveOutcome>;

    /// Reads the record for `key`, if any.
    async fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>>;
}

/// Durable redemption records; the single source of truth for saga progress.
#[async_trait]
pub trait RedemptionRepository: Send + Sync {
    /// Loads a redemption by id.
    async fn get(&self, id: RedemptionId) -> Result<Option<Redemption>>;

    /// Lists a user's redemptions, newest first.
    async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<Redemption>>;

    /// Lists every redemption that has not reached a terminal status,
    /// oldest first.
    async fn list_in_flight(&self) -> Result<Vec<Redemption>>;

    /// Applies a status change together with its outbox entries.
    ///
    /// Fails with `ConcurrencyConflict` if the stored version is not
    /// `transition.expected_version`; in that case nothing is written.
    /// Returns the updated redemption.
    async fn transition(&self, transition: Transition) -> Result<Redemption>;
}

/// Read and bookkeeping side of the transactional outbox.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns up to `limit` undelivered entries with attempts left,
    /// in increasing `id` order.
    ///
    /// Entries that follow a parked entry of the same aggregate are left
    /// out until the parked entry is resolved.
    async fn pending_entries(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Returns every entry for an aggregate in increasing `id` order.
    async fn entries_for_aggregate(&self, aggregate_id: uuid::Uuid) -> Result<Vec<OutboxEntry>>;

    /// Records a confirmed delivery.
    async fn mark_dispatched(&self, id: i64) -> Result<()>;

    /// Records a failed delivery attempt.
    async fn record_dispatch_failure(&self, id: i64, error: &str) -> Result<()>;
}

/// Everything the saga coordinator needs from durable storage.
pub trait RedemptionStore: IdempotencyStore + RedemptionRepository + OutboxStore {}

impl<T: IdempotencyStore + RedemptionRepository + OutboxStore + ?Sized> RedemptionStore for T {}
