//! Saga coordinator for loyalty point redemptions.
//!
//! A redemption moves through these steps:
//! 1. Validate the benefit against the catalog
//! 2. Reserve the points on the user's balance
//! 3. Fulfill the benefit through the partner gateway
//!
//! If fulfillment fails after points were reserved, the reservation is
//! reversed before the redemption is marked failed. Progress is persisted
//! after every step, so a saga can be resumed from any non-terminal status.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod redemption_saga;
mod retry;
pub mod services;
pub mod view;

pub use config::{EventTopics, RetryPolicy, SagaConfig};
pub use coordinator::{RedemptionAccepted, RedemptionCoordinator, RedemptionRequest};
pub use error::{Result, SagaError};
pub use events::{RedemptionCompleted, RedemptionEvent, RedemptionFailed, RedemptionRequested};
pub use services::{
    BalanceLedger, BenefitCatalog, BenefitInfo, FulfillmentResult, InMemoryBalanceLedger,
    InMemoryBenefitCatalog, InMemoryPartnerGateway, PartnerGateway, PostgresBalanceLedger,
    ServiceError,
};
pub use view::RedemptionView;
