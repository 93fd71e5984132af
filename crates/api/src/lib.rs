//! HTTP service for loyalty point redemptions.
//!
//! Accepts redemption requests, runs each saga in the background and
//! serves redemption status, with structured logging (tracing) and
//! Prometheus metrics.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use common::UserId;
use metrics_exporter_prometheus::PrometheusHandle;
use redemption_store::{InMemoryRedemptionStore, RedemptionStore};
use saga::{
    BalanceLedger, BenefitInfo, InMemoryBalanceLedger, InMemoryBenefitCatalog,
    InMemoryPartnerGateway, RedemptionCoordinator, SagaConfig,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use routes::redemptions::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S, L>(state: Arc<AppState<S, L>>, metrics_handle: PrometheusHandle) -> Router
where
    S: RedemptionStore + 'static,
    L: BalanceLedger + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/v1/redeem", post(routes::redemptions::redeem::<S, L>))
        .route("/v1/redemptions", get(routes::redemptions::list::<S, L>))
        .route("/v1/redemptions/{id}", get(routes::redemptions::get::<S, L>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Builds the application state around a store and ledger, with the demo
/// benefit catalog and an in-memory partner gateway.
pub fn create_state<S, L>(store: S, ledger: L, config: SagaConfig) -> Arc<AppState<S, L>>
where
    S: RedemptionStore + 'static,
    L: BalanceLedger + 'static,
{
    let coordinator = RedemptionCoordinator::new(
        store,
        demo_catalog(),
        ledger,
        InMemoryPartnerGateway::new(),
        config,
    );
    Arc::new(AppState { coordinator })
}

/// Creates state backed entirely by in-memory stores, with seeded balances.
pub fn create_in_memory_state(
    config: SagaConfig,
) -> (
    Arc<AppState<InMemoryRedemptionStore, InMemoryBalanceLedger>>,
    InMemoryRedemptionStore,
    InMemoryBalanceLedger,
) {
    let store = InMemoryRedemptionStore::new();
    let ledger = InMemoryBalanceLedger::new();
    for (user, points) in DEMO_BALANCES {
        ledger.credit(&UserId::new(*user), *points);
    }
    let state = create_state(store.clone(), ledger.clone(), config);
    (state, store, ledger)
}

/// Users credited when running without a database.
pub const DEMO_BALANCES: &[(&str, i64)] = &[("demo-user", 5000), ("user-2000", 2000)];

/// The benefits offered by this service.
pub fn demo_catalog() -> InMemoryBenefitCatalog {
    let catalog = InMemoryBenefitCatalog::new();
    catalog.insert(BenefitInfo::new("benefit-1", "$25 Gift Card", 2000, "giftco"));
    catalog.insert(BenefitInfo::new(
        "benefit-2",
        "Free Movie Ticket",
        1500,
        "entertainmentco",
    ));
    catalog
}
