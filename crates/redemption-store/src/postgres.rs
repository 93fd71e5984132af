use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{BenefitId, PartnerId, RedemptionId, RedemptionStatus, UserId};
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Fingerprint, IdempotencyRecord, NewOutboxEntry, NewRedemption, OutboxEntry, Redemption,
    ReserveOutcome, Result, StoreError, Transition,
    store::{IdempotencyStore, OutboxStore, RedemptionRepository},
};

const REDEMPTION_COLUMNS: &str = "id, user_id, benefit_id, partner_id, points, idempotency_key, \
     status, partner_ref, error_message, failure_reason, requires_reconciliation, version, \
     created_at, updated_at, completed_at";

const OUTBOX_COLUMNS: &str = "id, aggregate, aggregate_id, event_type, payload, topic, \
     created_at, dispatched_at, retry_count, max_retries, last_error";

/// PostgreSQL-backed redemption store.
///
/// Each write runs in one transaction: idempotency record, redemption row
/// and outbox rows commit together or not at all.
#[derive(Clone)]
pub struct PostgresRedemptionStore {
    pool: PgPool,
}

impl PostgresRedemptionStore {
    /// Creates a new PostgreSQL redemption store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_redemption(row: PgRow) -> Result<Redemption> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<RedemptionStatus>()
            .map_err(StoreError::Corrupt)?;

        Ok(Redemption {
            id: RedemptionId::from_uuid(row.try_get::<Uuid, _>("id")?),
            user_id: UserId::new(row.try_get::<String, _>("user_id")?),
            benefit_id: BenefitId::new(row.try_get::<String, _>("benefit_id")?),
            partner_id: row
                .try_get::<Option<String>, _>("partner_id")?
                .map(PartnerId::new),
            points: row.try_get("points")?,
            idempotency_key: row.try_get("idempotency_key")?,
            status,
            partner_ref: row.try_get("partner_ref")?,
            error_message: row.try_get("error_message")?,
            failure_reason: row.try_get("failure_reason")?,
            requires_reconciliation: row.try_get("requires_reconciliation")?,
            version: row.try_get("version")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }

    fn row_to_outbox_entry(row: PgRow) -> Result<OutboxEntry> {
        Ok(OutboxEntry {
            id: row.try_get("id")?,
            aggregate: row.try_get("aggregate")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            topic: row.try_get("topic")?,
            created_at: row.try_get("created_at")?,
            dispatched_at: row.try_get("dispatched_at")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            last_error: row.try_get("last_error")?,
        })
    }
}

/// Appends one outbox row on a connection that has an open transaction.
///
/// Never called on a bare pool: outbox rows only exist alongside the state
/// change they describe.
async fn append_event(
    conn: &mut PgConnection,
    entry: &NewOutboxEntry,
    now: DateTime<Utc>,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO outbox (aggregate, aggregate_id, event_type, payload, topic, created_at, max_retries)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING id
        "#,
    )
    .bind(&entry.aggregate)
    .bind(entry.aggregate_id)
    .bind(&entry.event_type)
    .bind(&entry.payload)
    .bind(&entry.topic)
    .bind(now)
    .bind(entry.max_retries)
    .fetch_one(&mut *conn)
    .await?;

    Ok(id)
}

#[async_trait]
impl IdempotencyStore for PostgresRedemptionStore {
    #[tracing::instrument(skip(self, fingerprint, redemption, events))]
    async fn reserve(
        &self,
        key: &str,
        fingerprint: &Fingerprint,
        redemption: NewRedemption,
        events: Vec<NewOutboxEntry>,
    ) -> Result<ReserveOutcome> {
        let now = Utc::now();
        let created = redemption.into_redemption(now);

        let mut tx = self.pool.begin().await?;

        // Concurrent inserts of the same key block on the primary key until
        // the first transaction finishes; the losers then insert nothing.
        let inserted = sqlx::query(
            r#"
            INSERT INTO idempotency_keys (key, redemption_id, request_fingerprint, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(created.id.as_uuid())
        .bind(fingerprint.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            let record = self.get_record(key).await?.ok_or_else(|| {
                StoreError::Corrupt(format!("idempotency key {key} vanished after conflict"))
            })?;
            return Ok(ReserveOutcome::existing(&record, fingerprint));
        }

        sqlx::query(&format!(
            "INSERT INTO redemptions ({REDEMPTION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)"
        ))
        .bind(created.id.as_uuid())
        .bind(created.user_id.as_str())
        .bind(created.benefit_id.as_str())
        .bind(created.partner_id.as_ref().map(|p| p.as_str()))
        .bind(created.points)
        .bind(&created.idempotency_key)
        .bind(created.status.as_str())
        .bind(&created.partner_ref)
        .bind(&created.error_message)
        .bind(&created.failure_reason)
        .bind(created.requires_reconciliation)
        .bind(created.version)
        .bind(created.created_at)
        .bind(created.updated_at)
        .bind(created.completed_at)
        .execute(&mut *tx)
        .await?;

        for event in &events {
            append_event(&mut tx, event, now).await?;
        }

        tx.commit().await?;
        Ok(ReserveOutcome::Created(created))
    }

    async fn get_record(&self, key: &str) -> Result<Option<IdempotencyRecord>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT key, redemption_id, request_fingerprint, created_at
            FROM idempotency_keys
            WHERE key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(IdempotencyRecord {
                key: row.try_get("key")?,
                redemption_id: RedemptionId::from_uuid(row.try_get::<Uuid, _>("redemption_id")?),
                request_fingerprint: Fingerprint::from_stored(
                    row.try_get::<String, _>("request_fingerprint")?,
                ),
                created_at: row.try_get("created_at")?,
            })),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RedemptionRepository for PostgresRedemptionStore {
    async fn get(&self, id: RedemptionId) -> Result<Option<Redemption>> {
        let row = sqlx::query(&format!(
            "SELECT {REDEMPTION_COLUMNS} FROM redemptions WHERE id = $1"
        ))
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_redemption).transpose()
    }

    async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<Redemption>> {
        let rows = sqlx::query(&format!(
            "SELECT {REDEMPTION_COLUMNS} FROM redemptions \
             WHERE user_id = $1 ORDER BY created_at DESC, id DESC"
        ))
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_redemption).collect()
    }

    async fn list_in_flight(&self) -> Result<Vec<Redemption>> {
        let rows = sqlx::query(&format!(
            "SELECT {REDEMPTION_COLUMNS} FROM redemptions \
             WHERE status NOT IN ('completed', 'failed') ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_redemption).collect()
    }

    #[tracing::instrument(
        skip(self, transition),
        fields(redemption_id = %transition.redemption_id, from = %transition.from, to = %transition.to)
    )]
    async fn transition(&self, transition: Transition) -> Result<Redemption> {
        transition.validate()?;

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {REDEMPTION_COLUMNS} FROM redemptions WHERE id = $1 FOR UPDATE"
        ))
        .bind(transition.redemption_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        let current = row
            .map(Self::row_to_redemption)
            .transpose()?
            .ok_or(StoreError::NotFound(transition.redemption_id))?;

        if current.version != transition.expected_version {
            return Err(StoreError::ConcurrencyConflict {
                redemption_id: transition.redemption_id,
                expected: transition.expected_version,
                actual: current.version,
            });
        }
        if current.status != transition.from {
            return Err(StoreError::InvalidTransition {
                redemption_id: transition.redemption_id,
                from: current.status,
                to: transition.to,
            });
        }

        let now = Utc::now();
        let next = current.apply(&transition, now);

        sqlx::query(
            r#"
            UPDATE redemptions SET
                status = $2,
                partner_id = $3,
                partner_ref = $4,
                error_message = $5,
                failure_reason = $6,
                requires_reconciliation = $7,
                version = $8,
                updated_at = $9,
                completed_at = $10
            WHERE id = $1
            "#,
        )
        .bind(next.id.as_uuid())
        .bind(next.status.as_str())
        .bind(next.partner_id.as_ref().map(|p| p.as_str()))
        .bind(&next.partner_ref)
        .bind(&next.error_message)
        .bind(&next.failure_reason)
        .bind(next.requires_reconciliation)
        .bind(next.version)
        .bind(next.updated_at)
        .bind(next.completed_at)
        .execute(&mut *tx)
        .await?;

        for event in &transition.events {
            append_event(&mut tx, event, now).await?;
        }

        tx.commit().await?;
        Ok(next)
    }
}

#[async_trait]
impl OutboxStore for PostgresRedemptionStore {
    async fn pending_entries(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox \
             WHERE dispatched_at IS NULL AND retry_count < max_retries \
             AND NOT EXISTS ( \
                 SELECT 1 FROM outbox parked \
                 WHERE parked.aggregate_id = outbox.aggregate_id \
                 AND parked.id < outbox.id \
                 AND parked.dispatched_at IS NULL \
                 AND parked.retry_count >= parked.max_retries \
             ) \
             ORDER BY id ASC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox_entry).collect()
    }

    async fn entries_for_aggregate(&self, aggregate_id: Uuid) -> Result<Vec<OutboxEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE aggregate_id = $1 ORDER BY id ASC"
        ))
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_outbox_entry).collect()
    }

    async fn mark_dispatched(&self, id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE outbox SET dispatched_at = COALESCE(dispatched_at, NOW()) WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_dispatch_failure(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE outbox SET retry_count = retry_count + 1, last_error = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
