//! Benefit catalog trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::{BenefitId, PartnerId};
use serde::{Deserialize, Serialize};

use super::ServiceError;

/// Catalog entry for a redeemable benefit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenefitInfo {
    pub benefit_id: BenefitId,
    pub name: String,
    /// Exact number of points a redemption of this benefit costs.
    pub points_cost: i64,
    /// Partner that delivers the benefit.
    pub partner_id: PartnerId,
    pub active: bool,
}

impl BenefitInfo {
    /// Creates an active benefit.
    pub fn new(
        benefit_id: impl Into<BenefitId>,
        name: impl Into<String>,
        points_cost: i64,
        partner_id: impl Into<PartnerId>,
    ) -> Self {
        Self {
            benefit_id: benefit_id.into(),
            name: name.into(),
            points_cost,
            partner_id: partner_id.into(),
            active: true,
        }
    }
}

/// Trait for benefit lookups.
#[async_trait]
pub trait BenefitCatalog: Send + Sync {
    /// Returns the catalog entry for `benefit_id`.
    ///
    /// Inactive benefits are returned with `active = false`; unknown ones
    /// fail with [`ServiceError::BenefitNotFound`].
    async fn validate(&self, benefit_id: &BenefitId) -> Result<BenefitInfo, ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryCatalogState {
    benefits: HashMap<BenefitId, BenefitInfo>,
    failing_lookups: usize,
    lookups: usize,
}

/// In-memory benefit catalog for testing and local runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBenefitCatalog {
    state: Arc<RwLock<InMemoryCatalogState>>,
}

impl InMemoryBenefitCatalog {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a benefit.
    pub fn insert(&self, benefit: BenefitInfo) {
        self.state
            .write()
            .unwrap()
            .benefits
            .insert(benefit.benefit_id.clone(), benefit);
    }

    /// Marks a benefit inactive.
    pub fn deactivate(&self, benefit_id: &BenefitId) {
        if let Some(benefit) = self.state.write().unwrap().benefits.get_mut(benefit_id) {
            benefit.active = false;
        }
    }

    /// Makes the next `count` lookups fail transiently.
    pub fn fail_next_lookups(&self, count: usize) {
        self.state.write().unwrap().failing_lookups = count;
    }

    /// Returns the number of lookups served, including failed ones.
    pub fn lookup_count(&self) -> usize {
        self.state.read().unwrap().lookups
    }
}

#[async_trait]
impl BenefitCatalog for InMemoryBenefitCatalog {
    async fn validate(&self, benefit_id: &BenefitId) -> Result<BenefitInfo, ServiceError> {
        let mut state = self.state.write().unwrap();
        state.lookups += 1;

        if state.failing_lookups > 0 {
            state.failing_lookups -= 1;
            return Err(ServiceError::Transient("catalog unavailable".to_string()));
        }

        state
            .benefits
            .get(benefit_id)
            .cloned()
            .ok_or_else(|| ServiceError::BenefitNotFound(benefit_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_and_deactivate() {
        let catalog = InMemoryBenefitCatalog::new();
        catalog.insert(BenefitInfo::new("b1", "Coffee", 500, "cafe"));

        let info = catalog.validate(&BenefitId::new("b1")).await.unwrap();
        assert!(info.active);
        assert_eq!(info.points_cost, 500);

        catalog.deactivate(&BenefitId::new("b1"));
        let info = catalog.validate(&BenefitId::new("b1")).await.unwrap();
        assert!(!info.active);
    }

    #[tokio::test]
    async fn test_unknown_benefit() {
        let catalog = InMemoryBenefitCatalog::new();
        let result = catalog.validate(&BenefitId::new("nope")).await;
        assert_eq!(
            result,
            Err(ServiceError::BenefitNotFound(BenefitId::new("nope")))
        );
    }

    #[tokio::test]
    async fn test_injected_transient_failure() {
        let catalog = InMemoryBenefitCatalog::new();
        catalog.insert(BenefitInfo::new("b1", "Coffee", 500, "cafe"));
        catalog.fail_next_lookups(1);

        let first = catalog.validate(&BenefitId::new("b1")).await;
        assert!(first.unwrap_err().is_transient());
        assert!(catalog.validate(&BenefitId::new("b1")).await.is_ok());
        assert_eq!(catalog.lookup_count(), 2);
    }
}
