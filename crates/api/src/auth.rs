//! Caller identity.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use common::UserId;

use crate::error::ApiError;

/// Header carrying the authenticated user, set by the gateway in front of
/// this service.
pub const USER_ID_HEADER: &str = "x-user-id";

/// The user making the request. Rejects with 401 when the header is missing
/// or blank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for Identity {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| ApiError::Unauthorized("user ID required".to_string()))?;

        Ok(Identity(UserId::new(user_id)))
    }
}
