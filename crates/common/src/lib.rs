//! Shared types for the loyalty redemption services.

pub mod status;
pub mod types;

pub use status::RedemptionStatus;
pub use types::{BenefitId, PartnerId, RedemptionId, UserId};
