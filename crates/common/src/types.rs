use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a redemption (one saga instance).
///
/// Wraps a UUID so redemption IDs cannot be mixed up with other
/// UUID-based identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RedemptionId(Uuid);

impl RedemptionId {
    /// Creates a new random redemption ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a redemption ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RedemptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RedemptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for RedemptionId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<RedemptionId> for Uuid {
    fn from(id: RedemptionId) -> Self {
        id.0
    }
}

/// Identity of the user a redemption belongs to.
///
/// Extracted once at the service edge and passed explicitly from there on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a benefit in the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BenefitId(String);

impl BenefitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for BenefitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BenefitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of the partner that fulfills a benefit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartnerId(String);

impl PartnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PartnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartnerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redemption_id_new_creates_unique_ids() {
        let id1 = RedemptionId::new();
        let id2 = RedemptionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn redemption_id_from_uuid_preserves_value() {
        let uuid = Uuid::new_v4();
        let id = RedemptionId::from_uuid(uuid);
        assert_eq!(id.as_uuid(), uuid);
    }

    #[test]
    fn string_ids_serialize_transparently() {
        let user = UserId::new("user-123");
        assert_eq!(serde_json::to_string(&user).unwrap(), "\"user-123\"");

        let benefit: BenefitId = serde_json::from_str("\"benefit-1\"").unwrap();
        assert_eq!(benefit.as_str(), "benefit-1");
    }

    #[test]
    fn blank_ids_are_empty() {
        assert!(UserId::new("  ").is_empty());
        assert!(BenefitId::new("").is_empty());
        assert!(!BenefitId::new("benefit-1").is_empty());
    }
}
