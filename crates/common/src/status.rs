//! Redemption lifecycle state machine.

use serde::{Deserialize, Serialize};

/// The status of a redemption saga.
///
/// State transitions:
/// ```text
/// Requested ──► PointsReserving ──► Fulfilling ──► Completed
///     │               │    │             │
///     │               │    └─────┐       ▼
///     │               │          └──► Reversing
///     ▼               ▼                  │
///   Failed ◄──────────┴──────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionStatus {
    /// Request accepted and persisted, benefit not yet validated.
    #[default]
    Requested,

    /// Benefit validated; points are being reserved at the ledger.
    #[serde(alias = "points_reserved")]
    PointsReserving,

    /// Points reserved; the partner is fulfilling the benefit.
    Fulfilling,

    /// A step failed after points may have been reserved; the reservation
    /// is being reversed.
    Reversing,

    /// Benefit fulfilled (terminal state).
    Completed,

    /// Saga ended without fulfillment (terminal state).
    Failed,
}

impl RedemptionStatus {
    /// Returns true if the saga may move from `self` to `next`.
    pub fn can_transition_to(&self, next: RedemptionStatus) -> bool {
        use RedemptionStatus::*;
        matches!(
            (self, next),
            (Requested, PointsReserving)
                | (Requested, Failed)
                | (PointsReserving, Fulfilling)
                | (PointsReserving, Failed)
                | (PointsReserving, Reversing)
                | (Fulfilling, Completed)
                | (Fulfilling, Reversing)
                | (Reversing, Failed)
        )
    }

    /// Returns true if a ledger reservation may exist in this state.
    pub fn may_hold_reservation(&self) -> bool {
        matches!(
            self,
            RedemptionStatus::PointsReserving
                | RedemptionStatus::Fulfilling
                | RedemptionStatus::Reversing
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RedemptionStatus::Completed | RedemptionStatus::Failed)
    }

    /// Returns the persisted status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RedemptionStatus::Requested => "requested",
            RedemptionStatus::PointsReserving => "points_reserving",
            RedemptionStatus::Fulfilling => "fulfilling",
            RedemptionStatus::Reversing => "reversing",
            RedemptionStatus::Completed => "completed",
            RedemptionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RedemptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RedemptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(RedemptionStatus::Requested),
            "points_reserving" | "points_reserved" => Ok(RedemptionStatus::PointsReserving),
            "fulfilling" => Ok(RedemptionStatus::Fulfilling),
            "reversing" => Ok(RedemptionStatus::Reversing),
            "completed" => Ok(RedemptionStatus::Completed),
            "failed" => Ok(RedemptionStatus::Failed),
            other => Err(format!("unknown redemption status: {other}")),
        }
    }
}
