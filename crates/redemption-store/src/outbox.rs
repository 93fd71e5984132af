//! Transactional outbox entries.
//!
//! Entries are only ever written by the repository inside the unit of work
//! that changes the state they describe. The dispatch side reads pending
//! entries in `id` order and marks them delivered.

use chrono::{DateTime, Utc};
use common::RedemptionId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Aggregate name recorded on outbox entries about redemptions.
pub const REDEMPTION_AGGREGATE: &str = "redemption";

/// Default number of dispatch attempts before an entry is parked.
pub const DEFAULT_MAX_RETRIES: i32 = 5;

/// An outbox entry waiting to be written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboxEntry {
    pub aggregate: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub topic: String,
    pub max_retries: i32,
}

impl NewOutboxEntry {
    /// Creates an entry about a redemption.
    pub fn redemption(
        redemption_id: RedemptionId,
        event_type: impl Into<String>,
        topic: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            aggregate: REDEMPTION_AGGREGATE.to_string(),
            aggregate_id: redemption_id.as_uuid(),
            event_type: event_type.into(),
            payload,
            topic: topic.into(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Materializes the stored entry once the store has assigned its id.
    pub(crate) fn into_entry(self, id: i64, created_at: DateTime<Utc>) -> OutboxEntry {
        OutboxEntry {
            id,
            aggregate: self.aggregate,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            payload: self.payload,
            topic: self.topic,
            created_at,
            dispatched_at: None,
            retry_count: 0,
            max_retries: self.max_retries,
            last_error: None,
        }
    }
}

/// A durable domain event awaiting (or done with) dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Store-assigned, monotonically increasing; the dispatch order.
    pub id: i64,
    pub aggregate: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub topic: String,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
}

impl OutboxEntry {
    /// True while the entry has not been delivered and still has attempts left.
    pub fn is_pending(&self) -> bool {
        self.dispatched_at.is_none() && self.retry_count < self.max_retries
    }

    /// True when dispatch gave up on this entry.
    pub fn is_parked(&self) -> bool {
        self.dispatched_at.is_none() && self.retry_count >= self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_entry_targets_redemption_aggregate() {
        let id = RedemptionId::new();
        let entry = NewOutboxEntry::redemption(
            id,
            "redemption.completed",
            "redemption.completed.v1",
            serde_json::json!({"points": 10}),
        );
        assert_eq!(entry.aggregate, REDEMPTION_AGGREGATE);
        assert_eq!(entry.aggregate_id, id.as_uuid());
        assert_eq!(entry.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn entry_parks_after_max_retries() {
        let mut entry = NewOutboxEntry::redemption(
            RedemptionId::new(),
            "redemption.failed",
            "redemption.failed.v1",
            serde_json::json!({}),
        )
        .with_max_retries(2)
        .into_entry(1, Utc::now());

        assert!(entry.is_pending());
        entry.retry_count = 2;
        assert!(!entry.is_pending());
        assert!(entry.is_parked());

        entry.dispatched_at = Some(Utc::now());
        assert!(!entry.is_parked());
    }
}
