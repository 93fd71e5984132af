//! Integration events written to the outbox.

use chrono::{DateTime, Utc};
use common::{BenefitId, PartnerId, RedemptionId, UserId};
use redemption_store::{NewOutboxEntry, NewRedemption, Redemption};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::SagaConfig;

/// Events published about a redemption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RedemptionEvent {
    /// A redemption was accepted.
    Requested(RedemptionRequested),

    /// The benefit was delivered.
    Completed(RedemptionCompleted),

    /// The redemption ended without delivering the benefit.
    Failed(RedemptionFailed),
}

/// Payload of `redemption.requested`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedemptionRequested {
    pub event_id: Uuid,
    pub redemption_id: RedemptionId,
    pub user_id: UserId,
    pub benefit_id: BenefitId,
    pub points: i64,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
}

/// Payload of `redemption.completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedemptionCompleted {
    pub event_id: Uuid,
    pub redemption_id: RedemptionId,
    pub user_id: UserId,
    pub benefit_id: BenefitId,
    pub partner_id: Option<PartnerId>,
    pub points: i64,
    pub partner_ref: String,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
}

/// Payload of `redemption.failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedemptionFailed {
    pub event_id: Uuid,
    pub redemption_id: RedemptionId,
    pub user_id: UserId,
    pub benefit_id: BenefitId,
    pub points: i64,
    pub error_message: String,
    pub requires_reconciliation: bool,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
}

impl RedemptionEvent {
    /// Creates a `redemption.requested` event for a new redemption.
    pub fn requested(redemption: &NewRedemption) -> Self {
        RedemptionEvent::Requested(RedemptionRequested {
            event_id: Uuid::new_v4(),
            redemption_id: redemption.id,
            user_id: redemption.user_id.clone(),
            benefit_id: redemption.benefit_id.clone(),
            points: redemption.points,
            timestamp: Utc::now(),
        })
    }

    /// Creates a `redemption.completed` event.
    pub fn completed(redemption: &Redemption, partner_ref: impl Into<String>) -> Self {
        RedemptionEvent::Completed(RedemptionCompleted {
            event_id: Uuid::new_v4(),
            redemption_id: redemption.id,
            user_id: redemption.user_id.clone(),
            benefit_id: redemption.benefit_id.clone(),
            partner_id: redemption.partner_id.clone(),
            points: redemption.points,
            partner_ref: partner_ref.into(),
            timestamp: Utc::now(),
        })
    }

    /// Creates a `redemption.failed` event.
    pub fn failed(
        redemption: &Redemption,
        error_message: impl Into<String>,
        requires_reconciliation: bool,
    ) -> Self {
        RedemptionEvent::Failed(RedemptionFailed {
            event_id: Uuid::new_v4(),
            redemption_id: redemption.id,
            user_id: redemption.user_id.clone(),
            benefit_id: redemption.benefit_id.clone(),
            points: redemption.points,
            error_message: error_message.into(),
            requires_reconciliation,
            timestamp: Utc::now(),
        })
    }

    /// The outbox `event_type` of this event.
    pub fn event_type(&self) -> &'static str {
        match self {
            RedemptionEvent::Requested(_) => "redemption.requested",
            RedemptionEvent::Completed(_) => "redemption.completed",
            RedemptionEvent::Failed(_) => "redemption.failed",
        }
    }

    /// The redemption this event describes.
    pub fn redemption_id(&self) -> RedemptionId {
        match self {
            RedemptionEvent::Requested(data) => data.redemption_id,
            RedemptionEvent::Completed(data) => data.redemption_id,
            RedemptionEvent::Failed(data) => data.redemption_id,
        }
    }

    /// Builds the outbox entry for this event. The payload is the bare event
    /// body, without the enum tag.
    pub fn to_outbox_entry(&self, config: &SagaConfig) -> serde_json::Result<NewOutboxEntry> {
        let (topic, payload) = match self {
            RedemptionEvent::Requested(data) => {
                (&config.topics.requested, serde_json::to_value(data)?)
            }
            RedemptionEvent::Completed(data) => {
                (&config.topics.completed, serde_json::to_value(data)?)
            }
            RedemptionEvent::Failed(data) => (&config.topics.failed, serde_json::to_value(data)?),
        };

        Ok(NewOutboxEntry::redemption(
            self.redemption_id(),
            self.event_type(),
            topic.clone(),
            payload,
        )
        .with_max_retries(config.outbox_max_retries))
    }
}
