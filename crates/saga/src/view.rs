//! Read model returned to callers.

use chrono::{DateTime, Utc};
use common::{BenefitId, RedemptionId, RedemptionStatus, UserId};
use redemption_store::Redemption;
use serde::Serialize;

/// Caller-facing view of a redemption.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedemptionView {
    pub id: RedemptionId,
    /// Owner, used for access checks; not part of the serialized view.
    #[serde(skip)]
    pub user_id: UserId,
    pub status: RedemptionStatus,
    pub points: i64,
    pub benefit_id: BenefitId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partner_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub requires_reconciliation: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RedemptionView {
    /// Returns true if `user_id` owns this redemption.
    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        &self.user_id == user_id
    }
}

impl From<Redemption> for RedemptionView {
    fn from(redemption: Redemption) -> Self {
        Self {
            id: redemption.id,
            user_id: redemption.user_id,
            status: redemption.status,
            points: redemption.points,
            benefit_id: redemption.benefit_id,
            partner_ref: redemption.partner_ref,
            error_message: redemption.error_message,
            requires_reconciliation: redemption.requires_reconciliation,
            created_at: redemption.created_at,
            completed_at: redemption.completed_at,
        }
    }
}
