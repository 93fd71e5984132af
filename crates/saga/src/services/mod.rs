//! External collaborators of the redemption saga and their in-memory doubles.

pub mod catalog;
pub mod ledger;
pub mod partner;
pub mod postgres_ledger;

use std::time::Duration;

use common::BenefitId;
use thiserror::Error;

pub use catalog::{BenefitCatalog, BenefitInfo, InMemoryBenefitCatalog};
pub use ledger::{BalanceLedger, InMemoryBalanceLedger};
pub use partner::{FulfillmentResult, InMemoryPartnerGateway, PartnerGateway};
pub use postgres_ledger::PostgresBalanceLedger;

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("benefit not found: {0}")]
    BenefitNotFound(BenefitId),

    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance { available: i64, requested: i64 },

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("service unavailable: {0}")]
    Transient(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl ServiceError {
    /// Whether the call may succeed if repeated.
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Transient(_) | ServiceError::Timeout(_))
    }
}
