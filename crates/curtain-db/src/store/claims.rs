use chrono::{DateTime, TimeDelta, Utc};
use curtain_core::AppError;
use curtain_core::traits::{Claim, ClaimStore};
use uuid::Uuid;

use super::{PgStore, db_error, interval_secs};

#[derive(sqlx::FromRow)]
struct ClaimRow {
    source_id: String,
    token: Uuid,
    claimed_at: DateTime<Utc>,
    schedule_id: Option<Uuid>,
}

impl From<ClaimRow> for Claim {
    fn from(row: ClaimRow) -> Self {
        Claim {
            source_id: row.source_id,
            token: row.token,
            claimed_at: row.claimed_at,
            schedule_id: row.schedule_id,
        }
    }
}

impl ClaimStore for PgStore {
    async fn try_claim(
        &self,
        source_id: &str,
        schedule_id: Option<Uuid>,
        now: DateTime<Utc>,
        stale_after: TimeDelta,
    ) -> Result<Option<Claim>, AppError> {
        let mut tx = self.pool().begin().await.map_err(db_error)?;

        // The conflict branch only fires for a stale holder; concurrent
        // callers serialize on the row and all but one see the fresh claim.
        let row = sqlx::query_as::<_, ClaimRow>(
            r#"
            INSERT INTO source_claims (source_id, token, claimed_at, schedule_id)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source_id) DO UPDATE
            SET token = EXCLUDED.token,
                claimed_at = EXCLUDED.claimed_at,
                schedule_id = EXCLUDED.schedule_id
            WHERE source_claims.claimed_at <= $3 - make_interval(secs => $5)
              AND NOT EXISTS (
                  SELECT 1 FROM jobs
                  WHERE jobs.claim_token = source_claims.token AND jobs.status = 'pending'
              )
            RETURNING *
            "#,
        )
        .bind(source_id)
        .bind(Uuid::new_v4())
        .bind(now)
        .bind(schedule_id)
        .bind(interval_secs(stale_after))
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        let Some(row) = row else {
            tx.rollback().await.map_err(db_error)?;
            return Ok(None);
        };

        // Drop the mirror of whichever claim this one replaced.
        sqlx::query(
            r#"
            UPDATE schedules
            SET claim_token = NULL, last_claimed_at = NULL
            WHERE source_id = $1 AND claim_token IS NOT NULL AND claim_token <> $2
            "#,
        )
        .bind(source_id)
        .bind(row.token)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if let Some(schedule_id) = schedule_id {
            sqlx::query(
                r#"UPDATE schedules SET claim_token = $2, last_claimed_at = $3 WHERE id = $1"#,
            )
            .bind(schedule_id)
            .bind(row.token)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)?;
        Ok(Some(row.into()))
    }

    async fn refresh_claim(
        &self,
        source_id: &str,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut tx = self.pool().begin().await.map_err(db_error)?;

        let refreshed = sqlx::query(
            r#"UPDATE source_claims SET claimed_at = $3 WHERE source_id = $1 AND token = $2"#,
        )
        .bind(source_id)
        .bind(token)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?
        .rows_affected()
            == 1;

        if refreshed {
            sqlx::query(r#"UPDATE schedules SET last_claimed_at = $2 WHERE claim_token = $1"#)
                .bind(token)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)?;
        Ok(refreshed)
    }

    async fn release_claim(&self, source_id: &str, token: Uuid) -> Result<bool, AppError> {
        let mut tx = self.pool().begin().await.map_err(db_error)?;

        let released =
            sqlx::query(r#"DELETE FROM source_claims WHERE source_id = $1 AND token = $2"#)
                .bind(source_id)
                .bind(token)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?
                .rows_affected()
                == 1;

        if released {
            sqlx::query(
                r#"
                UPDATE schedules
                SET claim_token = NULL, last_claimed_at = NULL
                WHERE claim_token = $1
                "#,
            )
            .bind(token)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;
        }

        tx.commit().await.map_err(db_error)?;
        Ok(released)
    }

    async fn current_claim(&self, source_id: &str) -> Result<Option<Claim>, AppError> {
        let row =
            sqlx::query_as::<_, ClaimRow>(r#"SELECT * FROM source_claims WHERE source_id = $1"#)
                .bind(source_id)
                .fetch_optional(self.pool())
                .await
                .map_err(db_error)?;

        Ok(row.map(Into::into))
    }

    async fn stale_claims(
        &self,
        now: DateTime<Utc>,
        stale_after: TimeDelta,
    ) -> Result<Vec<Claim>, AppError> {
        let rows = sqlx::query_as::<_, ClaimRow>(
            r#"
            SELECT * FROM source_claims
            WHERE claimed_at <= $1 - make_interval(secs => $2)
              AND NOT EXISTS (
                  SELECT 1 FROM jobs
                  WHERE jobs.claim_token = source_claims.token AND jobs.status = 'pending'
              )
            ORDER BY claimed_at
            "#,
        )
        .bind(now)
        .bind(interval_secs(stale_after))
        .fetch_all(self.pool())
        .await
        .map_err(db_error)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
