//! Saga error types.

use common::RedemptionId;
use redemption_store::StoreError;
use thiserror::Error;

/// Errors returned synchronously by the coordinator.
///
/// Step failures are not errors here: they are recorded on the redemption
/// as a `failed` status.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The request failed validation; nothing was persisted.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The idempotency key was already used with a different payload.
    #[error("Idempotency key '{key}' was already used with a different request")]
    IdempotencyConflict { key: String },

    /// Redemption not found.
    #[error("Redemption not found: {0}")]
    NotFound(RedemptionId),

    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns true if another writer advanced the redemption first.
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, SagaError::Store(StoreError::ConcurrencyConflict { .. }))
    }

    /// Returns true if the store could not be reached and the same pass may
    /// succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SagaError::Store(
                StoreError::Unavailable(_)
                    | StoreError::Database(sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut)
            )
        )
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_store_outages_are_retryable() {
        assert!(SagaError::Store(StoreError::Unavailable("down".to_string())).is_retryable());
        assert!(SagaError::Store(StoreError::Database(sqlx::Error::PoolTimedOut)).is_retryable());
        assert!(!SagaError::Store(StoreError::Database(sqlx::Error::RowNotFound)).is_retryable());
        assert!(!SagaError::NotFound(RedemptionId::new()).is_retryable());
        assert!(!SagaError::InvalidRequest("bad".to_string()).is_retryable());
    }
}
