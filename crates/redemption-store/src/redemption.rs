//! Redemption records and the transitions applied to them.

use chrono::{DateTime, Utc};
use common::{BenefitId, PartnerId, RedemptionId, RedemptionStatus, UserId};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::outbox::NewOutboxEntry;

/// One redemption saga instance as persisted by the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Redemption {
    pub id: RedemptionId,
    pub user_id: UserId,
    pub benefit_id: BenefitId,
    /// Set once the benefit has been validated.
    pub partner_id: Option<PartnerId>,
    pub points: i64,
    pub idempotency_key: String,
    pub status: RedemptionStatus,
    /// Set only on successful fulfillment.
    pub partner_ref: Option<String>,
    /// Set only when the status is `failed`.
    pub error_message: Option<String>,
    /// The step error that started compensation.
    pub failure_reason: Option<String>,
    /// Set when compensation could not be completed and the user's balance
    /// needs an operator.
    pub requires_reconciliation: bool,
    /// Incremented by every transition; used for optimistic concurrency.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Redemption {
    /// Returns a copy of this redemption with `transition` applied.
    ///
    /// Both stores use this so the in-memory and SQL paths agree on what a
    /// transition writes.
    pub(crate) fn apply(&self, transition: &Transition, now: DateTime<Utc>) -> Redemption {
        let mut next = self.clone();
        next.status = transition.to;
        if let Some(partner_id) = &transition.partner_id {
            next.partner_id = Some(partner_id.clone());
        }
        if let Some(partner_ref) = &transition.partner_ref {
            next.partner_ref = Some(partner_ref.clone());
        }
        if let Some(reason) = &transition.failure_reason {
            next.failure_reason = Some(reason.clone());
        }
        if let Some(message) = &transition.error_message {
            next.error_message = Some(message.clone());
        }
        next.requires_reconciliation |= transition.requires_reconciliation;
        next.version += 1;
        next.updated_at = now;
        if transition.to.is_terminal() {
            next.completed_at = Some(now);
        }
        next
    }
}

/// A redemption about to be created for a fresh idempotency key.
#[derive(Debug, Clone)]
pub struct NewRedemption {
    pub id: RedemptionId,
    pub user_id: UserId,
    pub benefit_id: BenefitId,
    pub points: i64,
    pub idempotency_key: String,
}

impl NewRedemption {
    pub fn new(
        user_id: UserId,
        benefit_id: BenefitId,
        points: i64,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            id: RedemptionId::new(),
            user_id,
            benefit_id,
            points,
            idempotency_key: idempotency_key.into(),
        }
    }

    /// Materializes the initial `requested` record.
    pub fn into_redemption(self, now: DateTime<Utc>) -> Redemption {
        Redemption {
            id: self.id,
            user_id: self.user_id,
            benefit_id: self.benefit_id,
            partner_id: None,
            points: self.points,
            idempotency_key: self.idempotency_key,
            status: RedemptionStatus::Requested,
            partner_ref: None,
            error_message: None,
            failure_reason: None,
            requires_reconciliation: false,
            version: 1,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// A single status change and the outbox entries that describe it.
///
/// Applied by [`RedemptionRepository::transition`](crate::RedemptionRepository::transition)
/// as one atomic unit guarded by `expected_version`.
#[derive(Debug, Clone)]
pub struct Transition {
    pub redemption_id: RedemptionId,
    pub expected_version: i64,
    pub from: RedemptionStatus,
    pub to: RedemptionStatus,
    pub partner_id: Option<PartnerId>,
    pub partner_ref: Option<String>,
    pub failure_reason: Option<String>,
    pub error_message: Option<String>,
    pub requires_reconciliation: bool,
    pub events: Vec<NewOutboxEntry>,
}

impl Transition {
    /// Starts a transition of `redemption` from its current status to `to`.
    pub fn of(redemption: &Redemption, to: RedemptionStatus) -> Self {
        Self {
            redemption_id: redemption.id,
            expected_version: redemption.version,
            from: redemption.status,
            to,
            partner_id: None,
            partner_ref: None,
            failure_reason: None,
            error_message: None,
            requires_reconciliation: false,
            events: Vec::new(),
        }
    }

    pub fn with_partner_id(mut self, partner_id: PartnerId) -> Self {
        self.partner_id = Some(partner_id);
        self
    }

    pub fn with_partner_ref(mut self, partner_ref: impl Into<String>) -> Self {
        self.partner_ref = Some(partner_ref.into());
        self
    }

    pub fn with_failure_reason(mut self, reason: impl Into<String>) -> Self {
        self.failure_reason = Some(reason.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn needing_reconciliation(mut self) -> Self {
        self.requires_reconciliation = true;
        self
    }

    pub fn with_event(mut self, entry: NewOutboxEntry) -> Self {
        self.events.push(entry);
        self
    }

    /// Checks the transition against the state machine and the data
    /// each target status requires.
    pub fn validate(&self) -> Result<()> {
        if !self.from.can_transition_to(self.to) {
            return Err(StoreError::InvalidTransition {
                redemption_id: self.redemption_id,
                from: self.from,
                to: self.to,
            });
        }
        match self.to {
            RedemptionStatus::Completed if self.partner_ref.is_none() => {
                Err(StoreError::IncompleteTransition {
                    to: self.to,
                    reason: "completed redemptions need a partner reference",
                })
            }
            RedemptionStatus::Failed if self.error_message.is_none() => {
                Err(StoreError::IncompleteTransition {
                    to: self.to,
                    reason: "failed redemptions need an error message",
                })
            }
            RedemptionStatus::Completed | RedemptionStatus::Failed if self.events.is_empty() => {
                Err(StoreError::IncompleteTransition {
                    to: self.to,
                    reason: "terminal transitions must publish an outbox event",
                })
            }
            _ => Ok(()),
        }
    }
}
