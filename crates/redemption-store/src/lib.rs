//! Durable state for the redemption saga.
//!
//! Three stores share one atomic unit of work:
//! - the redemption repository (saga progress),
//! - the idempotency store (request deduplication),
//! - the transactional outbox (events awaiting dispatch).
//!
//! Every state change and the outbox entries describing it are committed
//! together or not at all.

pub mod error;
pub mod idempotency;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod redemption;
pub mod relay;
pub mod store;

pub use error::{Result, StoreError};
pub use idempotency::{Fingerprint, IdempotencyRecord, ReserveOutcome};
pub use memory::InMemoryRedemptionStore;
pub use outbox::{NewOutboxEntry, OutboxEntry, REDEMPTION_AGGREGATE};
pub use postgres::PostgresRedemptionStore;
pub use redemption::{NewRedemption, Redemption, Transition};
pub use relay::{
    DispatchReport, EventPublisher, InMemoryEventBus, OutboxRelay, PublishError, PublishedMessage,
    TracingPublisher,
};
pub use store::{IdempotencyStore, OutboxStore, RedemptionRepository, RedemptionStore};
