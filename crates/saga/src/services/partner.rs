//! Partner gateway trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use common::{PartnerId, RedemptionId, UserId};

use super::ServiceError;

/// Result of a successful fulfillment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentResult {
    /// Reference assigned by the partner (voucher code, order number).
    pub partner_ref: String,
}

/// Trait for delivering a benefit through its partner.
#[async_trait]
pub trait PartnerGateway: Send + Sync {
    /// Fulfills the benefit for `redemption_id`.
    ///
    /// Keyed by `redemption_id`: repeating a call for an already fulfilled
    /// redemption returns the original reference.
    async fn fulfill(
        &self,
        partner_id: &PartnerId,
        redemption_id: RedemptionId,
        user_id: &UserId,
        points: i64,
    ) -> Result<FulfillmentResult, ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryPartnerState {
    fulfillments: HashMap<RedemptionId, String>,
    next_id: u32,
    reject_reason: Option<String>,
    failing_calls: usize,
    latency: Option<Duration>,
    calls: usize,
}

/// In-memory partner gateway for testing and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPartnerGateway {
    state: Arc<RwLock<InMemoryPartnerState>>,
}

impl InMemoryPartnerGateway {
    /// Creates a gateway that accepts every request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail permanently with `reason` until cleared.
    pub fn reject_with(&self, reason: Option<&str>) {
        self.state.write().unwrap().reject_reason = reason.map(str::to_string);
    }

    /// Makes the next `count` calls fail transiently.
    pub fn fail_next_calls(&self, count: usize) {
        self.state.write().unwrap().failing_calls = count;
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.write().unwrap().latency = Some(latency);
    }

    /// Returns the number of calls received.
    pub fn call_count(&self) -> usize {
        self.state.read().unwrap().calls
    }

    /// Returns the number of redemptions fulfilled.
    pub fn fulfillment_count(&self) -> usize {
        self.state.read().unwrap().fulfillments.len()
    }
}

#[async_trait]
impl PartnerGateway for InMemoryPartnerGateway {
    async fn fulfill(
        &self,
        partner_id: &PartnerId,
        redemption_id: RedemptionId,
        _user_id: &UserId,
        _points: i64,
    ) -> Result<FulfillmentResult, ServiceError> {
        let latency = {
            let mut state = self.state.write().unwrap();
            state.calls += 1;
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.write().unwrap();

        if let Some(partner_ref) = state.fulfillments.get(&redemption_id) {
            return Ok(FulfillmentResult {
                partner_ref: partner_ref.clone(),
            });
        }

        if state.failing_calls > 0 {
            state.failing_calls -= 1;
            return Err(ServiceError::Transient(format!(
                "partner {partner_id} returned 503"
            )));
        }

        if let Some(reason) = &state.reject_reason {
            return Err(ServiceError::Rejected(reason.clone()));
        }

        state.next_id += 1;
        let partner_ref = format!("{}-{:06}", partner_id.as_str().to_uppercase(), state.next_id);
        state
            .fulfillments
            .insert(redemption_id, partner_ref.clone());

        Ok(FulfillmentResult { partner_ref })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fulfill_assigns_reference() {
        let gateway = InMemoryPartnerGateway::new();
        let result = gateway
            .fulfill(&PartnerId::new("acme"), RedemptionId::new(), &UserId::new("u1"), 10)
            .await
            .unwrap();

        assert_eq!(result.partner_ref, "ACME-000001");
        assert_eq!(gateway.fulfillment_count(), 1);
    }

    #[tokio::test]
    async fn test_fulfill_is_idempotent_per_redemption() {
        let gateway = InMemoryPartnerGateway::new();
        let partner = PartnerId::new("acme");
        let user = UserId::new("u1");
        let redemption = RedemptionId::new();

        let first = gateway.fulfill(&partner, redemption, &user, 10).await.unwrap();
        let second = gateway.fulfill(&partner, redemption, &user, 10).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(gateway.fulfillment_count(), 1);
        assert_eq!(gateway.call_count(), 2);
    }

    #[tokio::test]
    async fn test_reject_and_transient() {
        let gateway = InMemoryPartnerGateway::new();
        let partner = PartnerId::new("acme");
        let user = UserId::new("u1");

        gateway.fail_next_calls(1);
        let transient = gateway
            .fulfill(&partner, RedemptionId::new(), &user, 10)
            .await
            .unwrap_err();
        assert!(transient.is_transient());

        gateway.reject_with(Some("out of stock"));
        let rejected = gateway
            .fulfill(&partner, RedemptionId::new(), &user, 10)
            .await
            .unwrap_err();
        assert_eq!(rejected, ServiceError::Rejected("out of stock".to_string()));
        assert_eq!(gateway.fulfillment_count(), 0);
    }
}
