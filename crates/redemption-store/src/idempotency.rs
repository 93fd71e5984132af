//! Idempotency keys and request fingerprints.

use chrono::{DateTime, Utc};
use common::{BenefitId, RedemptionId, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::redemption::Redemption;

/// Namespace for request fingerprints (UUIDv5).
const FINGERPRINT_NAMESPACE: Uuid = Uuid::from_u128(0x6c6f_7961_6c74_7972_6564_656d_7074_696f);

/// Deterministic digest of a normalized redemption request.
///
/// Two requests carrying the same idempotency key must have equal
/// fingerprints, otherwise the key is being reused for a different payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprints the payload of a redemption request.
    ///
    /// Identifiers are trimmed so cosmetic whitespace does not count as a
    /// different payload.
    pub fn of_request(user_id: &UserId, benefit_id: &BenefitId, points: i64) -> Self {
        let normalized = format!(
            "user={}\nbenefit={}\npoints={}",
            user_id.as_str().trim(),
            benefit_id.as_str().trim(),
            points
        );
        Self(
            Uuid::new_v5(&FINGERPRINT_NAMESPACE, normalized.as_bytes())
                .simple()
                .to_string(),
        )
    }

    /// Wraps a fingerprint read back from storage.
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Write-once pairing of an idempotency key with the redemption it created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub redemption_id: RedemptionId,
    pub request_fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
}

/// Outcome of reserving an idempotency key.
#[derive(Debug, Clone)]
pub enum ReserveOutcome {
    /// The key was fresh; the redemption was created with it.
    Created(Redemption),
    /// The key was already taken.
    Existing {
        redemption_id: RedemptionId,
        fingerprint_matches: bool,
    },
}

impl ReserveOutcome {
    pub(crate) fn existing(record: &IdempotencyRecord, fingerprint: &Fingerprint) -> Self {
        ReserveOutcome::Existing {
            redemption_id: record.redemption_id,
            fingerprint_matches: &record.request_fingerprint == fingerprint,
        }
    }
}
