//! Redemption saga constants.

/// The saga type identifier for loyalty redemptions.
pub const SAGA_TYPE: &str = "LoyaltyRedemption";

/// Step name: Look the benefit up in the catalog.
pub const STEP_VALIDATE_BENEFIT: &str = "validate_benefit";

/// Step name: Reserve points on the user's balance.
pub const STEP_RESERVE_POINTS: &str = "reserve_points";

/// Step name: Ask the partner to deliver the benefit.
pub const STEP_FULFILL: &str = "fulfill";

/// Step name: Give reserved points back (compensation).
pub const STEP_REVERSE_POINTS: &str = "reverse_points";

/// Longest accepted idempotency key.
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
