//! Redemption endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use common::{BenefitId, RedemptionId, RedemptionStatus};
use redemption_store::RedemptionStore;
use saga::{
    BalanceLedger, InMemoryBenefitCatalog, InMemoryPartnerGateway, RedemptionCoordinator,
    RedemptionRequest, RedemptionView,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::ApiError;

/// Header carrying the client-chosen idempotency key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Shared application state accessible from all handlers.
pub struct AppState<S, L> {
    pub coordinator: RedemptionCoordinator<S, InMemoryBenefitCatalog, L, InMemoryPartnerGateway>,
}

// -- Request types --

#[derive(Deserialize)]
pub struct RedeemRequest {
    pub benefit_id: String,
    pub points: i64,
}

// -- Response types --

#[derive(Serialize)]
pub struct RedeemResponse {
    pub redemption_id: RedemptionId,
    pub status: RedemptionStatus,
    pub message: &'static str,
}

// -- Handlers --

/// POST /v1/redeem: accepts a redemption and runs its saga in the background.
///
/// Answers 202 for a new redemption and 200 when the idempotency key
/// replays an earlier request.
#[tracing::instrument(skip_all, fields(user_id = %user_id))]
pub async fn redeem<S, L>(
    State(state): State<Arc<AppState<S, L>>>,
    Identity(user_id): Identity,
    headers: HeaderMap,
    payload: Result<Json<RedeemRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<RedeemResponse>), ApiError>
where
    S: RedemptionStore + 'static,
    L: BalanceLedger + 'static,
{
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest("Idempotency-Key header is required".to_string()))?;

    let Json(req) = payload.map_err(|e| {
        tracing::debug!(error = %e, "rejected request body");
        ApiError::BadRequest("invalid request body".to_string())
    })?;

    let accepted = state
        .coordinator
        .request_redemption(RedemptionRequest::new(
            user_id,
            BenefitId::new(req.benefit_id),
            req.points,
            idempotency_key,
        ))
        .await?;

    let (status, message) = if accepted.replayed {
        metrics::counter!("redemption_requests_replayed_total").increment(1);
        (StatusCode::OK, "redemption already exists")
    } else {
        (StatusCode::ACCEPTED, "redemption request accepted")
    };

    Ok((
        status,
        Json(RedeemResponse {
            redemption_id: accepted.redemption_id,
            status: accepted.status,
            message,
        }),
    ))
}

/// GET /v1/redemptions/{id}: a redemption owned by the caller.
#[tracing::instrument(skip_all, fields(user_id = %user_id, redemption_id = %id))]
pub async fn get<S, L>(
    State(state): State<Arc<AppState<S, L>>>,
    Identity(user_id): Identity,
    Path(id): Path<String>,
) -> Result<Json<RedemptionView>, ApiError>
where
    S: RedemptionStore + 'static,
    L: BalanceLedger + 'static,
{
    let not_found = || ApiError::NotFound("redemption not found".to_string());

    let id = Uuid::parse_str(&id).map_err(|_| not_found())?;
    let view = state
        .coordinator
        .get_redemption(RedemptionId::from_uuid(id))
        .await?
        .filter(|view| view.is_owned_by(&user_id))
        .ok_or_else(not_found)?;

    Ok(Json(view))
}

/// GET /v1/redemptions: the caller's redemptions, newest first.
#[tracing::instrument(skip_all, fields(user_id = %user_id))]
pub async fn list<S, L>(
    State(state): State<Arc<AppState<S, L>>>,
    Identity(user_id): Identity,
) -> Result<Json<Vec<RedemptionView>>, ApiError>
where
    S: RedemptionStore + 'static,
    L: BalanceLedger + 'static,
{
    Ok(Json(state.coordinator.list_redemptions(&user_id).await?))
}
