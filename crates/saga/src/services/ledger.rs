//! Points ledger trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{RedemptionId, UserId};

use super::ServiceError;

/// Trait for point balance operations.
///
/// Both operations are keyed by `(user_id, redemption_id)` and are
/// idempotent: repeating a reserve never deducts twice, and reversing twice
/// returns the points once. Reversing a redemption that was never reserved
/// records it as reversed, so a reserve arriving afterwards is rejected.
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    /// Deducts `points` from the user's available balance.
    async fn reserve(
        &self,
        user_id: &UserId,
        redemption_id: RedemptionId,
        points: i64,
    ) -> Result<(), ServiceError>;

    /// Gives the points held for `redemption_id` back to the user.
    async fn reverse(&self, user_id: &UserId, redemption_id: RedemptionId)
    -> Result<(), ServiceError>;
}

#[derive(Debug, Clone)]
struct Reservation {
    user_id: UserId,
    points: i64,
    reversed: bool,
}

#[derive(Debug, Default)]
struct InMemoryLedgerState {
    balances: HashMap<UserId, i64>,
    reservations: HashMap<RedemptionId, Reservation>,
    failing_reserves: usize,
    lost_reserve_responses: usize,
    failing_reverses: usize,
    reserve_calls: usize,
    reverse_calls: usize,
    latency: Option<Duration>,
    active_calls: usize,
    peak_concurrency: usize,
}

/// In-memory points ledger for testing and local runs.
///
/// All balances live behind one lock, so operations for the same user are
/// serialized. An optional latency is awaited outside the lock.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBalanceLedger {
    state: Arc<Mutex<InMemoryLedgerState>>,
}

impl InMemoryBalanceLedger {
    /// Creates a ledger with no balances.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `points` to the user's available balance.
    pub fn credit(&self, user_id: &UserId, points: i64) {
        *self
            .state
            .lock()
            .unwrap()
            .balances
            .entry(user_id.clone())
            .or_default() += points;
    }

    /// Returns the user's available balance.
    pub fn balance(&self, user_id: &UserId) -> i64 {
        self.state
            .lock()
            .unwrap()
            .balances
            .get(user_id)
            .copied()
            .unwrap_or(0)
    }

    /// Makes the next `count` reserve calls fail transiently without
    /// touching the balance.
    pub fn fail_next_reserves(&self, count: usize) {
        self.state.lock().unwrap().failing_reserves = count;
    }

    /// Makes the next `count` reserve calls apply the deduction and then
    /// report a transient failure, as if the response was lost.
    pub fn lose_next_reserve_responses(&self, count: usize) {
        self.state.lock().unwrap().lost_reserve_responses = count;
    }

    /// Makes the next `count` reverse calls fail transiently.
    pub fn fail_next_reverses(&self, count: usize) {
        self.state.lock().unwrap().failing_reverses = count;
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = Some(latency);
    }

    /// Returns the number of reserve calls received.
    pub fn reserve_calls(&self) -> usize {
        self.state.lock().unwrap().reserve_calls
    }

    /// Returns the number of reverse calls received.
    pub fn reverse_calls(&self) -> usize {
        self.state.lock().unwrap().reverse_calls
    }

    /// Returns the highest number of calls that were in progress at once.
    pub fn peak_concurrency(&self) -> usize {
        self.state.lock().unwrap().peak_concurrency
    }

    /// Returns true if a reservation for `redemption_id` is currently held.
    pub fn has_reservation(&self, redemption_id: RedemptionId) -> bool {
        self.state
            .lock()
            .unwrap()
            .reservations
            .get(&redemption_id)
            .is_some_and(|r| !r.reversed)
    }

    async fn simulate_latency(&self) {
        let latency = {
            let mut state = self.state.lock().unwrap();
            state.active_calls += 1;
            state.peak_concurrency = state.peak_concurrency.max(state.active_calls);
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn finish_call(state: &mut InMemoryLedgerState) {
        state.active_calls = state.active_calls.saturating_sub(1);
    }
}

#[async_trait]
impl BalanceLedger for InMemoryBalanceLedger {
    async fn reserve(
        &self,
        user_id: &UserId,
        redemption_id: RedemptionId,
        points: i64,
    ) -> Result<(), ServiceError> {
        self.simulate_latency().await;
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        Self::finish_call(state);
        state.reserve_calls += 1;

        if state.failing_reserves > 0 {
            state.failing_reserves -= 1;
            return Err(ServiceError::Transient("ledger unavailable".to_string()));
        }

        if let Some(existing) = state.reservations.get(&redemption_id) {
            if existing.reversed {
                return Err(ServiceError::Rejected(
                    "reservation was already reversed".to_string(),
                ));
            }
        } else {
            let available = state.balances.get(user_id).copied().unwrap_or(0);
            if available < points {
                return Err(ServiceError::InsufficientBalance {
                    available,
                    requested: points,
                });
            }
            state.balances.insert(user_id.clone(), available - points);
            state.reservations.insert(
                redemption_id,
                Reservation {
                    user_id: user_id.clone(),
                    points,
                    reversed: false,
                },
            );
        }

        if state.lost_reserve_responses > 0 {
            state.lost_reserve_responses -= 1;
            return Err(ServiceError::Transient(
                "ledger response lost".to_string(),
            ));
        }

        Ok(())
    }

    async fn reverse(
        &self,
        user_id: &UserId,
        redemption_id: RedemptionId,
    ) -> Result<(), ServiceError> {
        self.simulate_latency().await;
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        Self::finish_call(state);
        state.reverse_calls += 1;

        if state.failing_reverses > 0 {
            state.failing_reverses -= 1;
            return Err(ServiceError::Transient("ledger unavailable".to_string()));
        }

        let reservation = state
            .reservations
            .entry(redemption_id)
            .or_insert_with(|| Reservation {
                user_id: user_id.clone(),
                points: 0,
                reversed: true,
            });
        if reservation.reversed {
            return Ok(());
        }
        reservation.reversed = true;
        let (owner, points) = (reservation.user_id.clone(), reservation.points);
        *state.balances.entry(owner).or_default() += points;

        Ok(())
    }
}
