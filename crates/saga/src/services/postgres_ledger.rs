//! PostgreSQL-backed points ledger.

use async_trait::async_trait;
use common::{RedemptionId, UserId};
use sqlx::{PgPool, Row};

use super::ServiceError;
use super::ledger::BalanceLedger;

/// Points ledger over the `point_balances` and `point_reservations` tables.
///
/// Every operation locks the user's balance row first, so operations for
/// one user are serialized while different users proceed independently.
#[derive(Clone)]
pub struct PostgresBalanceLedger {
    pool: PgPool,
}

impl PostgresBalanceLedger {
    /// Creates a ledger on an existing pool. The store's migrations create
    /// the tables.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Adds `points` to the user's balance, creating it if needed.
    pub async fn credit(&self, user_id: &UserId, points: i64) -> Result<(), ServiceError> {
        sqlx::query(
            r#"
            INSERT INTO point_balances (user_id, available_points)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE
            SET available_points = point_balances.available_points + EXCLUDED.available_points,
                updated_at = NOW()
            "#,
        )
        .bind(user_id.as_str())
        .bind(points)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    /// Returns the user's available balance (zero for unknown users).
    pub async fn balance(&self, user_id: &UserId) -> Result<i64, ServiceError> {
        let balance: Option<i64> = sqlx::query_scalar(
            "SELECT available_points FROM point_balances WHERE user_id = $1",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(balance.unwrap_or(0))
    }
}

fn unavailable(e: sqlx::Error) -> ServiceError {
    ServiceError::Transient(format!("ledger database error: {e}"))
}

#[async_trait]
impl BalanceLedger for PostgresBalanceLedger {
    #[tracing::instrument(skip(self))]
    async fn reserve(
        &self,
        user_id: &UserId,
        redemption_id: RedemptionId,
        points: i64,
    ) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let available: Option<i64> = sqlx::query_scalar(
            "SELECT available_points FROM point_balances WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable)?;

        let existing = sqlx::query(
            "SELECT reversed_at IS NOT NULL AS reversed FROM point_reservations WHERE redemption_id = $1",
        )
        .bind(redemption_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable)?;

        if let Some(row) = existing {
            let reversed: bool = row.try_get("reversed").map_err(unavailable)?;
            if reversed {
                return Err(ServiceError::Rejected(
                    "reservation was already reversed".to_string(),
                ));
            }
            return Ok(());
        }

        let available = available.unwrap_or(0);
        if available < points {
            return Err(ServiceError::InsufficientBalance {
                available,
                requested: points,
            });
        }

        sqlx::query(
            "UPDATE point_balances SET available_points = available_points - $2, updated_at = NOW() WHERE user_id = $1",
        )
        .bind(user_id.as_str())
        .bind(points)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        sqlx::query(
            "INSERT INTO point_reservations (redemption_id, user_id, points) VALUES ($1, $2, $3)",
        )
        .bind(redemption_id.as_uuid())
        .bind(user_id.as_str())
        .bind(points)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn reverse(
        &self,
        user_id: &UserId,
        redemption_id: RedemptionId,
    ) -> Result<(), ServiceError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        sqlx::query("SELECT 1 FROM point_balances WHERE user_id = $1 FOR UPDATE")
            .bind(user_id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?;

        let reservation = sqlx::query(
            r#"
            SELECT user_id, points FROM point_reservations
            WHERE redemption_id = $1 AND reversed_at IS NULL
            FOR UPDATE
            "#,
        )
        .bind(redemption_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable)?;

        let Some(row) = reservation else {
            // Never reserved: mark it reversed so a late reserve is rejected.
            let marked = sqlx::query(
                r#"
                INSERT INTO point_reservations (redemption_id, user_id, points, reversed_at)
                VALUES ($1, $2, 0, NOW())
                ON CONFLICT (redemption_id) DO NOTHING
                "#,
            )
            .bind(redemption_id.as_uuid())
            .bind(user_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

            if marked.rows_affected() == 0 {
                let reversed: Option<bool> = sqlx::query_scalar(
                    "SELECT reversed_at IS NOT NULL FROM point_reservations WHERE redemption_id = $1",
                )
                .bind(redemption_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await
                .map_err(unavailable)?;
                if reversed != Some(true) {
                    return Err(ServiceError::Transient(
                        "reservation was created concurrently".to_string(),
                    ));
                }
            }

            tx.commit().await.map_err(unavailable)?;
            return Ok(());
        };
        let owner: String = row.try_get("user_id").map_err(unavailable)?;
        let points: i64 = row.try_get("points").map_err(unavailable)?;

        sqlx::query(
            "UPDATE point_balances SET available_points = available_points + $2, updated_at = NOW() WHERE user_id = $1",
        )
        .bind(&owner)
        .bind(points)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        sqlx::query("UPDATE point_reservations SET reversed_at = NOW() WHERE redemption_id = $1")
            .bind(redemption_id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;
        Ok(())
    }
}
