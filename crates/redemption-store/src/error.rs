use common::{RedemptionId, RedemptionStatus};
use thiserror::Error;

/// Errors that can occur when interacting with the redemption store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer advanced the redemption since it was loaded.
    /// The expected version did not match the stored version.
    #[error(
        "Concurrency conflict for redemption {redemption_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        redemption_id: RedemptionId,
        expected: i64,
        actual: i64,
    },

    /// The redemption was not found.
    #[error("Redemption not found: {0}")]
    NotFound(RedemptionId),

    /// The requested status change is not part of the saga state machine.
    #[error("Invalid transition for redemption {redemption_id}: {from} -> {to}")]
    InvalidTransition {
        redemption_id: RedemptionId,
        from: RedemptionStatus,
        to: RedemptionStatus,
    },

    /// The transition is missing data its target status requires.
    #[error("Incomplete transition to {to}: {reason}")]
    IncompleteTransition {
        to: RedemptionStatus,
        reason: &'static str,
    },

    /// A stored row could not be decoded into the domain model.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// The store could not complete the unit of work. Nothing was committed.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
