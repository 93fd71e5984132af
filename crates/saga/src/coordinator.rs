//! Saga coordinator for loyalty redemptions.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use common::{BenefitId, RedemptionId, RedemptionStatus, UserId};
use futures_util::future::join_all;
use redemption_store::{
    Fingerprint, NewRedemption, Redemption, RedemptionStore, ReserveOutcome, Transition,
};

use crate::config::SagaConfig;
use crate::error::{Result, SagaError};
use crate::events::RedemptionEvent;
use crate::redemption_saga::{
    MAX_IDEMPOTENCY_KEY_LEN, SAGA_TYPE, STEP_FULFILL, STEP_RESERVE_POINTS, STEP_REVERSE_POINTS,
    STEP_VALIDATE_BENEFIT,
};
use crate::retry::with_retry;
use crate::services::{BalanceLedger, BenefitCatalog, PartnerGateway};
use crate::view::RedemptionView;

/// Shortest pause between passes of a driver waiting out a store outage.
const MIN_DRIVE_BACKOFF: Duration = Duration::from_millis(10);

/// A request to redeem points for a benefit.
#[derive(Debug, Clone)]
pub struct RedemptionRequest {
    pub user_id: UserId,
    pub benefit_id: BenefitId,
    pub points: i64,
    pub idempotency_key: String,
}

impl RedemptionRequest {
    pub fn new(
        user_id: impl Into<UserId>,
        benefit_id: impl Into<BenefitId>,
        points: i64,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            benefit_id: benefit_id.into(),
            points,
            idempotency_key: idempotency_key.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.user_id.is_empty() {
            return Err(SagaError::InvalidRequest("user_id is required".to_string()));
        }
        if self.benefit_id.is_empty() {
            return Err(SagaError::InvalidRequest(
                "benefit_id is required".to_string(),
            ));
        }
        if self.points <= 0 {
            return Err(SagaError::InvalidRequest(
                "points must be greater than zero".to_string(),
            ));
        }
        if self.idempotency_key.trim().is_empty() {
            return Err(SagaError::InvalidRequest(
                "idempotency key is required".to_string(),
            ));
        }
        if self.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(SagaError::InvalidRequest(format!(
                "idempotency key must be at most {MAX_IDEMPOTENCY_KEY_LEN} characters"
            )));
        }
        Ok(())
    }

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_request(&self.user_id, &self.benefit_id, self.points)
    }
}

/// Answer to an accepted request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedemptionAccepted {
    pub redemption_id: RedemptionId,
    /// Status at the time of the answer; the saga continues in the
    /// background.
    pub status: RedemptionStatus,
    /// True when the idempotency key had already been used for the same
    /// request.
    pub replayed: bool,
}

struct Inner<S, C, L, P> {
    store: S,
    catalog: C,
    ledger: L,
    partner: P,
    config: SagaConfig,
    in_flight: Mutex<HashSet<RedemptionId>>,
}

/// Orchestrates redemption sagas.
///
/// The coordinator drives each redemption through
/// validate benefit → reserve points → fulfill, compensating the points
/// reservation when fulfillment fails. The persisted status is the only
/// saga state: [`drive`](Self::drive) loads it and performs the next
/// step, so any non-terminal redemption can be resumed.
pub struct RedemptionCoordinator<S, C, L, P> {
    inner: Arc<Inner<S, C, L, P>>,
}

impl<S, C, L, P> Clone for RedemptionCoordinator<S, C, L, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Marks a redemption as driven by this process until dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<RedemptionId>>,
    id: RedemptionId,
}

impl<'a> InFlightGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<RedemptionId>>, id: RedemptionId) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
        inserted.then_some(Self { set, id })
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

impl<S, C, L, P> RedemptionCoordinator<S, C, L, P>
where
    S: RedemptionStore + 'static,
    C: BenefitCatalog + 'static,
    L: BalanceLedger + 'static,
    P: PartnerGateway + 'static,
{
    /// Creates a new coordinator.
    pub fn new(store: S, catalog: C, ledger: L, partner: P, config: SagaConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                catalog,
                ledger,
                partner,
                config,
                in_flight: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &SagaConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    /// Accepts a request and drives the saga on a background task.
    ///
    /// Returns as soon as the redemption is persisted. Only validation and
    /// idempotency errors are returned here; step failures end up on the
    /// redemption itself.
    pub async fn request_redemption(
        &self,
        request: RedemptionRequest,
    ) -> Result<RedemptionAccepted> {
        let accepted = self.accept(request).await?;
        if !accepted.status.is_terminal() {
            self.spawn_drive(accepted.redemption_id);
        }
        Ok(accepted)
    }

    /// Validates and persists a request without starting the saga.
    ///
    /// A fresh key creates the redemption, its idempotency record and the
    /// `redemption.requested` event in one write. A known key with the same
    /// payload returns the existing redemption; a different payload is an
    /// [`SagaError::IdempotencyConflict`].
    #[tracing::instrument(
        skip(self, request),
        fields(
            saga_type = SAGA_TYPE,
            user_id = %request.user_id,
            benefit_id = %request.benefit_id,
            idempotency_key = %request.idempotency_key
        )
    )]
    pub async fn accept(&self, request: RedemptionRequest) -> Result<RedemptionAccepted> {
        request.validate()?;

        let fingerprint = request.fingerprint();
        let key = request.idempotency_key.clone();
        let new = NewRedemption::new(
            request.user_id,
            request.benefit_id,
            request.points,
            key.clone(),
        );
        let requested = RedemptionEvent::requested(&new).to_outbox_entry(&self.inner.config)?;

        match self
            .inner
            .store
            .reserve(&key, &fingerprint, new, vec![requested])
            .await?
        {
            ReserveOutcome::Created(redemption) => {
                metrics::counter!("redemptions_requested_total").increment(1);
                tracing::info!(redemption_id = %redemption.id, "redemption accepted");
                Ok(RedemptionAccepted {
                    redemption_id: redemption.id,
                    status: redemption.status,
                    replayed: false,
                })
            }
            ReserveOutcome::Existing {
                fingerprint_matches: false,
                ..
            } => {
                tracing::warn!("idempotency key reused with a different request");
                Err(SagaError::IdempotencyConflict { key })
            }
            ReserveOutcome::Existing {
                redemption_id,
                fingerprint_matches: true,
            } => {
                let redemption = self.load(redemption_id).await?;
                tracing::info!(
                    %redemption_id,
                    status = %redemption.status,
                    "replayed redemption request"
                );
                Ok(RedemptionAccepted {
                    redemption_id,
                    status: redemption.status,
                    replayed: true,
                })
            }
        }
    }

    /// Drives a redemption until it is terminal, in a single pass.
    ///
    /// A store error ends the pass and is returned; see
    /// [`drive_until_settled`](Self::drive_until_settled) for a driver that
    /// waits outages out. Each pass loads the persisted redemption and runs only the step for
    /// its current status, so calling this again after a crash continues
    /// where the last committed transition left off. If this process is
    /// already driving the redemption, or another writer advances it first,
    /// the current persisted state is returned.
    #[tracing::instrument(skip(self), fields(saga_type = SAGA_TYPE))]
    pub async fn drive(&self, id: RedemptionId) -> Result<Redemption> {
        let Some(_guard) = InFlightGuard::acquire(&self.inner.in_flight, id) else {
            tracing::debug!("redemption already being driven");
            return self.load(id).await;
        };

        let started = Instant::now();
        let redemption = self.load(id).await?;
        if redemption.status.is_terminal() {
            return Ok(redemption);
        }

        match self.run(redemption).await {
            Ok(settled) => {
                metrics::histogram!("redemption_saga_duration_seconds")
                    .record(started.elapsed().as_secs_f64());
                Ok(settled)
            }
            Err(e) if e.is_concurrency_conflict() => {
                tracing::warn!(error = %e, "redemption advanced by another writer");
                self.load(id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Drives a redemption, repeating the pass while the store is
    /// unavailable.
    ///
    /// A failed store write leaves the redemption at its last committed
    /// status, so every retry resumes from there. The saga deadline keeps
    /// running across retries: once it has passed, the next pass that
    /// reaches the store aborts the saga instead of advancing it. Errors
    /// other than store outages are returned as is.
    pub async fn drive_until_settled(&self, id: RedemptionId) -> Result<Redemption> {
        let policy = &self.inner.config.step_retry;
        let mut attempt = 0u32;
        loop {
            match self.drive(id).await {
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    let backoff = policy.backoff_for(attempt).max(MIN_DRIVE_BACKOFF);
                    metrics::counter!("redemption_drive_retries_total").increment(1);
                    tracing::warn!(
                        redemption_id = %id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "store unavailable, retrying saga pass"
                    );
                    tokio::time::sleep(backoff).await;
                }
                result => return result,
            }
        }
    }

    /// Drives every non-terminal redemption concurrently.
    ///
    /// Called at startup to finish sagas interrupted by a restart.
    #[tracing::instrument(skip(self))]
    pub async fn resume_in_flight(&self) -> Result<Vec<Redemption>> {
        let pending = self.inner.store.list_in_flight().await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        tracing::info!(count = pending.len(), "resuming in-flight redemptions");

        let results = join_all(pending.iter().map(|r| self.drive_until_settled(r.id))).await;

        let mut settled = Vec::with_capacity(results.len());
        for (redemption, result) in pending.iter().zip(results) {
            match result {
                Ok(r) => settled.push(r),
                Err(e) => {
                    tracing::warn!(redemption_id = %redemption.id, error = %e, "failed to resume redemption")
                }
            }
        }
        Ok(settled)
    }

    /// Loads a redemption view by ID.
    pub async fn get_redemption(&self, id: RedemptionId) -> Result<Option<RedemptionView>> {
        Ok(self.inner.store.get(id).await?.map(RedemptionView::from))
    }

    /// Lists a user's redemptions, newest first.
    pub async fn list_redemptions(&self, user_id: &UserId) -> Result<Vec<RedemptionView>> {
        Ok(self
            .inner
            .store
            .list_for_user(user_id)
            .await?
            .into_iter()
            .map(RedemptionView::from)
            .collect())
    }

    /// Polls until the redemption is terminal or `timeout` elapses, then
    /// returns its latest state.
    pub async fn await_settled(&self, id: RedemptionId, timeout: Duration) -> Result<Redemption> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let redemption = self.load(id).await?;
            if redemption.status.is_terminal() || tokio::time::Instant::now() >= deadline {
                return Ok(redemption);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Returns true if this process is currently driving `id`.
    pub fn is_in_flight(&self, id: RedemptionId) -> bool {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    fn spawn_drive(&self, id: RedemptionId) {
        if self.is_in_flight(id) {
            return;
        }
        let coordinator = self.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.drive_until_settled(id).await {
                tracing::warn!(redemption_id = %id, error = %e, "saga driver stopped");
            }
        });
    }

    async fn load(&self, id: RedemptionId) -> Result<Redemption> {
        self.inner
            .store
            .get(id)
            .await?
            .ok_or(SagaError::NotFound(id))
    }

    /// Runs the forward steps under the saga deadline, then compensation
    /// (which is not bounded by it) if the saga ended up reversing.
    ///
    /// The deadline is measured from the redemption's creation, so time
    /// spent before a restart or between retried passes counts against it.
    async fn run(&self, redemption: Redemption) -> Result<Redemption> {
        let id = redemption.id;
        let remaining = self.remaining_budget(&redemption);

        let redemption = if remaining.is_zero() && redemption.status != RedemptionStatus::Reversing {
            self.abort_timed_out(id).await?
        } else {
            match tokio::time::timeout(remaining, self.advance(redemption)).await {
                Ok(result) => result?,
                Err(_) => self.abort_timed_out(id).await?,
            }
        };

        if redemption.status == RedemptionStatus::Reversing {
            return self.compensate(&redemption).await;
        }
        Ok(redemption)
    }

    fn remaining_budget(&self, redemption: &Redemption) -> Duration {
        let elapsed = (Utc::now() - redemption.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.inner.config.saga_timeout.saturating_sub(elapsed)
    }

    async fn advance(&self, mut redemption: Redemption) -> Result<Redemption> {
        loop {
            redemption = match redemption.status {
                RedemptionStatus::Requested => self.validate_benefit(&redemption).await?,
                RedemptionStatus::PointsReserving => self.reserve_points(&redemption).await?,
                RedemptionStatus::Fulfilling => self.fulfill(&redemption).await?,
                RedemptionStatus::Reversing
                | RedemptionStatus::Completed
                | RedemptionStatus::Failed => return Ok(redemption),
            };
        }
    }

    async fn abort_timed_out(&self, id: RedemptionId) -> Result<Redemption> {
        // The interrupted step may have committed; start from the stored state.
        let redemption = self.load(id).await?;
        let timeout = self.inner.config.saga_timeout;
        tracing::warn!(
            redemption_id = %id,
            status = %redemption.status,
            timeout_ms = timeout.as_millis() as u64,
            "saga timed out"
        );

        let reason = format!(
            "saga timed out after {}ms during {}",
            timeout.as_millis(),
            redemption.status
        );
        match redemption.status {
            RedemptionStatus::Requested => self.fail(&redemption, reason).await,
            RedemptionStatus::PointsReserving | RedemptionStatus::Fulfilling => {
                self.begin_compensation(&redemption, reason).await
            }
            RedemptionStatus::Reversing | RedemptionStatus::Completed | RedemptionStatus::Failed => {
                Ok(redemption)
            }
        }
    }

    #[tracing::instrument(skip(self, redemption), fields(redemption_id = %redemption.id))]
    async fn validate_benefit(&self, redemption: &Redemption) -> Result<Redemption> {
        tracing::info!(step = STEP_VALIDATE_BENEFIT, "saga step started");
        let config = &self.inner.config;

        let lookup = with_retry(
            STEP_VALIDATE_BENEFIT,
            &config.step_retry,
            config.step_timeout,
            || self.inner.catalog.validate(&redemption.benefit_id),
        )
        .await;

        match lookup {
            Ok(benefit) if !benefit.active => {
                self.fail(
                    redemption,
                    format!("benefit {} is not active", benefit.benefit_id),
                )
                .await
            }
            Ok(benefit) if benefit.points_cost != redemption.points => {
                self.fail(
                    redemption,
                    format!(
                        "benefit {} costs {} points, but {} were requested",
                        benefit.benefit_id, benefit.points_cost, redemption.points
                    ),
                )
                .await
            }
            Ok(benefit) => {
                self.advance_to(
                    Transition::of(redemption, RedemptionStatus::PointsReserving)
                        .with_partner_id(benefit.partner_id),
                )
                .await
            }
            Err(e) => self.fail(redemption, e.to_string()).await,
        }
    }

    #[tracing::instrument(skip(self, redemption), fields(redemption_id = %redemption.id))]
    async fn reserve_points(&self, redemption: &Redemption) -> Result<Redemption> {
        tracing::info!(step = STEP_RESERVE_POINTS, points = redemption.points, "saga step started");
        let config = &self.inner.config;

        let reservation = with_retry(
            STEP_RESERVE_POINTS,
            &config.step_retry,
            config.step_timeout,
            || {
                self.inner
                    .ledger
                    .reserve(&redemption.user_id, redemption.id, redemption.points)
            },
        )
        .await;

        match reservation {
            Ok(()) => {
                self.advance_to(Transition::of(redemption, RedemptionStatus::Fulfilling))
                    .await
            }
            // The ledger may have applied the reservation; reversing is safe
            // either way.
            Err(e) if e.is_transient() => {
                self.begin_compensation(
                    redemption,
                    format!("points reservation outcome unknown: {e}"),
                )
                .await
            }
            Err(e) => self.fail(redemption, e.to_string()).await,
        }
    }

    #[tracing::instrument(skip(self, redemption), fields(redemption_id = %redemption.id))]
    async fn fulfill(&self, redemption: &Redemption) -> Result<Redemption> {
        tracing::info!(step = STEP_FULFILL, "saga step started");
        let config = &self.inner.config;

        let Some(partner_id) = redemption.partner_id.clone() else {
            return self
                .begin_compensation(redemption, "no partner assigned to redemption".to_string())
                .await;
        };

        let fulfillment = with_retry(STEP_FULFILL, &config.step_retry, config.step_timeout, || {
            self.inner.partner.fulfill(
                &partner_id,
                redemption.id,
                &redemption.user_id,
                redemption.points,
            )
        })
        .await;

        match fulfillment {
            Ok(result) => {
                let event = RedemptionEvent::completed(redemption, result.partner_ref.clone())
                    .to_outbox_entry(config)?;
                let completed = self
                    .advance_to(
                        Transition::of(redemption, RedemptionStatus::Completed)
                            .with_partner_ref(result.partner_ref)
                            .with_event(event),
                    )
                    .await?;

                metrics::counter!("redemptions_completed_total").increment(1);
                tracing::info!(
                    partner_ref = completed.partner_ref.as_deref().unwrap_or_default(),
                    "redemption completed"
                );
                Ok(completed)
            }
            Err(e) => {
                self.begin_compensation(redemption, format!("fulfillment failed: {e}"))
                    .await
            }
        }
    }

    /// Reverses the points reservation and fails the redemption.
    ///
    /// If the reversal exhausts its retries the redemption is still failed,
    /// flagged for manual reconciliation.
    #[tracing::instrument(skip(self, redemption), fields(redemption_id = %redemption.id))]
    async fn compensate(&self, redemption: &Redemption) -> Result<Redemption> {
        tracing::info!(step = STEP_REVERSE_POINTS, "compensation started");
        let config = &self.inner.config;
        let reason = redemption
            .failure_reason
            .clone()
            .unwrap_or_else(|| "redemption failed".to_string());

        let reversal = with_retry(
            STEP_REVERSE_POINTS,
            &config.compensation_retry,
            config.step_timeout,
            || self.inner.ledger.reverse(&redemption.user_id, redemption.id),
        )
        .await;

        match reversal {
            Ok(()) => {
                tracing::info!(step = STEP_REVERSE_POINTS, "points reversed");
                self.fail(redemption, reason).await
            }
            Err(e) => {
                metrics::counter!("redemption_reconciliation_required_total").increment(1);
                tracing::error!(
                    user_id = %redemption.user_id,
                    points = redemption.points,
                    error = %e,
                    "points reversal exhausted retries, balance requires manual reconciliation"
                );
                let message = format!(
                    "{reason}; points reversal failed ({e}), balance requires manual reconciliation"
                );
                self.finish_failed(redemption, message, true).await
            }
        }
    }

    async fn begin_compensation(&self, redemption: &Redemption, reason: String) -> Result<Redemption> {
        tracing::warn!(
            redemption_id = %redemption.id,
            from = %redemption.status,
            reason = %reason,
            "saga step failed, compensating"
        );
        self.advance_to(
            Transition::of(redemption, RedemptionStatus::Reversing).with_failure_reason(reason),
        )
        .await
    }

    async fn fail(&self, redemption: &Redemption, message: String) -> Result<Redemption> {
        self.finish_failed(redemption, message, false).await
    }

    async fn finish_failed(
        &self,
        redemption: &Redemption,
        message: String,
        requires_reconciliation: bool,
    ) -> Result<Redemption> {
        let event = RedemptionEvent::failed(redemption, message.clone(), requires_reconciliation)
            .to_outbox_entry(&self.inner.config)?;
        let mut transition = Transition::of(redemption, RedemptionStatus::Failed)
            .with_error(message.clone())
            .with_event(event);
        if requires_reconciliation {
            transition = transition.needing_reconciliation();
        }

        let failed = self.advance_to(transition).await?;
        metrics::counter!("redemptions_failed_total").increment(1);
        tracing::warn!(redemption_id = %failed.id, error = %message, "redemption failed");
        Ok(failed)
    }

    async fn advance_to(&self, transition: Transition) -> Result<Redemption> {
        let (from, to) = (transition.from, transition.to);
        let next = self.inner.store.transition(transition).await?;
        tracing::info!(redemption_id = %next.id, %from, %to, version = next.version, "redemption status changed");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::services::{
        BenefitInfo, InMemoryBalanceLedger, InMemoryBenefitCatalog, InMemoryPartnerGateway,
    };
    use common::PartnerId;
    use redemption_store::{InMemoryRedemptionStore, OutboxStore, RedemptionRepository};

    type TestCoordinator = RedemptionCoordinator<
        InMemoryRedemptionStore,
        InMemoryBenefitCatalog,
        InMemoryBalanceLedger,
        InMemoryPartnerGateway,
    >;

    fn setup() -> (
        TestCoordinator,
        InMemoryRedemptionStore,
        InMemoryBenefitCatalog,
        InMemoryBalanceLedger,
        InMemoryPartnerGateway,
    ) {
        let store = InMemoryRedemptionStore::new();
        let catalog = InMemoryBenefitCatalog::new();
        let ledger = InMemoryBalanceLedger::new();
        let partner = InMemoryPartnerGateway::new();

        catalog.insert(BenefitInfo::new("coffee", "Free coffee", 500, "cafe"));
        ledger.credit(&UserId::new("alice"), 1000);

        let config = SagaConfig::default()
            .with_step_retry(RetryPolicy::immediate(3))
            .with_compensation_retry(RetryPolicy::immediate(3));
        let coordinator = RedemptionCoordinator::new(
            store.clone(),
            catalog.clone(),
            ledger.clone(),
            partner.clone(),
            config,
        );

        (coordinator, store, catalog, ledger, partner)
    }

    #[tokio::test]
    async fn test_happy_path() {
        let (coordinator, _, _, ledger, partner) = setup();

        let accepted = coordinator
            .accept(RedemptionRequest::new("alice", "coffee", 500, "k1"))
            .await
            .unwrap();
        assert_eq!(accepted.status, RedemptionStatus::Requested);
        assert!(!accepted.replayed);

        let redemption = coordinator.drive(accepted.redemption_id).await.unwrap();
        assert_eq!(redemption.status, RedemptionStatus::Completed);
        assert_eq!(redemption.partner_ref.as_deref(), Some("CAFE-000001"));
        assert_eq!(redemption.partner_id, Some(PartnerId::new("cafe")));
        assert!(redemption.completed_at.is_some());
        assert_eq!(ledger.balance(&UserId::new("alice")), 500);
        assert_eq!(partner.fulfillment_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_requests_persist_nothing() {
        let (coordinator, store, _, _, _) = setup();

        let cases = [
            RedemptionRequest::new("", "coffee", 500, "k1"),
            RedemptionRequest::new("alice", "", 500, "k1"),
            RedemptionRequest::new("alice", "coffee", 0, "k1"),
            RedemptionRequest::new("alice", "coffee", -5, "k1"),
            RedemptionRequest::new("alice", "coffee", 500, "  "),
            RedemptionRequest::new("alice", "coffee", 500, "k".repeat(256)),
        ];
        for request in cases {
            let result = coordinator.accept(request).await;
            assert!(matches!(result, Err(SagaError::InvalidRequest(_))));
        }
        assert_eq!(store.redemption_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_benefit_fails_without_reservation() {
        let (coordinator, _, _, ledger, _) = setup();

        let accepted = coordinator
            .accept(RedemptionRequest::new("alice", "missing", 500, "k1"))
            .await
            .unwrap();
        let redemption = coordinator.drive(accepted.redemption_id).await.unwrap();

        assert_eq!(redemption.status, RedemptionStatus::Failed);
        assert!(redemption.error_message.unwrap().contains("not found"));
        assert_eq!(ledger.reserve_calls(), 0);
    }

    #[tokio::test]
    async fn test_inactive_benefit_fails() {
        let (coordinator, _, catalog, ledger, _) = setup();
        catalog.deactivate(&BenefitId::new("coffee"));

        let accepted = coordinator
            .accept(RedemptionRequest::new("alice", "coffee", 500, "k1"))
            .await
            .unwrap();
        let redemption = coordinator.drive(accepted.redemption_id).await.unwrap();

        assert_eq!(redemption.status, RedemptionStatus::Failed);
        assert!(redemption.error_message.unwrap().contains("not active"));
        assert_eq!(ledger.reserve_calls(), 0);
    }

    #[tokio::test]
    async fn test_points_must_match_benefit_cost() {
        let (coordinator, _, _, ledger, _) = setup();

        let accepted = coordinator
            .accept(RedemptionRequest::new("alice", "coffee", 400, "k1"))
            .await
            .unwrap();
        let redemption = coordinator.drive(accepted.redemption_id).await.unwrap();

        assert_eq!(redemption.status, RedemptionStatus::Failed);
        assert!(redemption.error_message.unwrap().contains("costs 500 points"));
        assert_eq!(ledger.balance(&UserId::new("alice")), 1000);
    }

    #[tokio::test]
    async fn test_transient_catalog_errors_are_retried() {
        let (coordinator, _, catalog, _, _) = setup();
        catalog.fail_next_lookups(2);

        let accepted = coordinator
            .accept(RedemptionRequest::new("alice", "coffee", 500, "k1"))
            .await
            .unwrap();
        let redemption = coordinator.drive(accepted.redemption_id).await.unwrap();

        assert_eq!(redemption.status, RedemptionStatus::Completed);
        assert_eq!(catalog.lookup_count(), 3);
    }

    #[tokio::test]
    async fn test_lost_reserve_response_is_retried_without_double_deduction() {
        let (coordinator, _, _, ledger, partner) = setup();
        ledger.lose_next_reserve_responses(1);

        let accepted = coordinator
            .accept(RedemptionRequest::new("alice", "coffee", 500, "k1"))
            .await
            .unwrap();
        let redemption = coordinator.drive(accepted.redemption_id).await.unwrap();

        assert_eq!(redemption.status, RedemptionStatus::Completed);
        assert_eq!(ledger.reserve_calls(), 2);
        assert_eq!(ledger.balance(&UserId::new("alice")), 500);
        assert_eq!(partner.fulfillment_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_reserve_outcome_is_compensated() {
        let (coordinator, _, _, ledger, partner) = setup();
        // Every attempt applies (once) but never confirms.
        ledger.lose_next_reserve_responses(3);

        let accepted = coordinator
            .accept(RedemptionRequest::new("alice", "coffee", 500, "k1"))
            .await
            .unwrap();
        let redemption = coordinator.drive(accepted.redemption_id).await.unwrap();

        assert_eq!(redemption.status, RedemptionStatus::Failed);
        assert!(
            redemption
                .error_message
                .unwrap()
                .contains("reservation outcome unknown")
        );
        assert!(!redemption.requires_reconciliation);
        assert_eq!(ledger.balance(&UserId::new("alice")), 1000);
        assert_eq!(partner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_drive_of_terminal_redemption_is_a_noop() {
        let (coordinator, store, _, ledger, _) = setup();

        let accepted = coordinator
            .accept(RedemptionRequest::new("alice", "coffee", 500, "k1"))
            .await
            .unwrap();
        let first = coordinator.drive(accepted.redemption_id).await.unwrap();
        let second = coordinator.drive(accepted.redemption_id).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.reserve_calls(), 1);
        let events = store
            .entries_for_aggregate(accepted.redemption_id.as_uuid())
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_writer_stops_on_conflict() {
        let (coordinator, store, _, ledger, _) = setup();

        let accepted = coordinator
            .accept(RedemptionRequest::new("alice", "coffee", 500, "k1"))
            .await
            .unwrap();
        let stale = store.get(accepted.redemption_id).await.unwrap().unwrap();

        // Another process advances the redemption first.
        store
            .transition(
                Transition::of(&stale, RedemptionStatus::PointsReserving)
                    .with_partner_id(PartnerId::new("cafe")),
            )
            .await
            .unwrap();

        let result = coordinator.validate_benefit(&stale).await;
        assert!(result.unwrap_err().is_concurrency_conflict());
        assert_eq!(ledger.reserve_calls(), 0);
    }

    #[tokio::test]
    async fn test_get_and_list_views() {
        let (coordinator, _, _, _, _) = setup();

        let first = coordinator
            .accept(RedemptionRequest::new("alice", "coffee", 500, "k1"))
            .await
            .unwrap();
        coordinator.drive(first.redemption_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = coordinator
            .accept(RedemptionRequest::new("alice", "coffee", 500, "k2"))
            .await
            .unwrap();

        let view = coordinator
            .get_redemption(first.redemption_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(view.status, RedemptionStatus::Completed);
        assert!(view.partner_ref.is_some());

        let listed = coordinator
            .list_redemptions(&UserId::new("alice"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.redemption_id);

        assert!(
            coordinator
                .get_redemption(RedemptionId::new())
                .await
                .unwrap()
                .is_none()
        );
    }
}
