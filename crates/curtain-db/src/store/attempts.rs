use chrono::{DateTime, Utc};
use curtain_core::models::{AttemptResult, NewAttempt};
use curtain_core::traits::AttemptLedger;
use curtain_core::{AppError, Attempt, AttemptFilter};
use uuid::Uuid;

use super::{PgStore, db_error, parse_opt};

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: Uuid,
    source_id: String,
    schedule_id: Option<Uuid>,
    trigger: String,
    attempt_number: i32,
    claim_token: Uuid,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    change_status: Option<String>,
    visibility: Option<String>,
    fingerprint: Option<String>,
    change_metadata: Option<serde_json::Value>,
    gate_bypass: Option<String>,
    outcome: Option<String>,
    error: Option<String>,
    records: Option<serde_json::Value>,
    records_count: Option<i32>,
    asset_error: Option<String>,
}

impl TryFrom<AttemptRow> for Attempt {
    type Error = AppError;

    fn try_from(row: AttemptRow) -> Result<Self, Self::Error> {
        Ok(Attempt {
            id: row.id,
            source_id: row.source_id,
            schedule_id: row.schedule_id,
            trigger: row.trigger.parse().map_err(AppError::Database)?,
            attempt_number: row.attempt_number as u32,
            claim_token: row.claim_token,
            started_at: row.started_at,
            finished_at: row.finished_at,
            change_status: parse_opt(row.change_status)?,
            visibility: parse_opt(row.visibility)?,
            fingerprint: row.fingerprint,
            change_metadata: row.change_metadata,
            gate_bypass: parse_opt(row.gate_bypass)?,
            outcome: parse_opt(row.outcome)?,
            error: row.error,
            records: row.records,
            records_count: row.records_count.map(|n| n as u32),
            asset_error: row.asset_error,
        })
    }
}

fn into_attempts(rows: Vec<AttemptRow>) -> Result<Vec<Attempt>, AppError> {
    rows.into_iter().map(TryInto::try_into).collect()
}

impl AttemptLedger for PgStore {
    async fn begin_attempt(&self, attempt: &NewAttempt) -> Result<Uuid, AppError> {
        let (id,): (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO attempts (source_id, schedule_id, trigger, attempt_number, claim_token, started_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(&attempt.source_id)
        .bind(attempt.schedule_id)
        .bind(attempt.trigger.as_str())
        .bind(attempt.attempt_number as i32)
        .bind(attempt.claim_token)
        .bind(attempt.started_at)
        .fetch_one(self.pool())
        .await
        .map_err(db_error)?;

        Ok(id)
    }

    async fn finish_attempt(&self, id: Uuid, result: &AttemptResult) -> Result<bool, AppError> {
        let Some(outcome) = result.outcome else {
            return Err(AppError::Generic(format!(
                "attempt {id} cannot be finished without an outcome"
            )));
        };

        let updated = sqlx::query(
            r#"
            UPDATE attempts
            SET finished_at = $2,
                change_status = $3,
                visibility = $4,
                fingerprint = $5,
                change_metadata = $6,
                gate_bypass = $7,
                outcome = $8,
                error = $9,
                records = $10,
                records_count = $11,
                asset_error = $12
            WHERE id = $1 AND outcome IS NULL
            "#,
        )
        .bind(id)
        .bind(result.finished_at)
        .bind(result.change_status.map(|s| s.as_str()))
        .bind(result.visibility.map(|v| v.as_str()))
        .bind(&result.fingerprint)
        .bind(&result.change_metadata)
        .bind(result.gate_bypass.map(|b| b.as_str()))
        .bind(outcome.as_str())
        .bind(&result.error)
        .bind(&result.records)
        .bind(result.records_count.map(|n| n as i32))
        .bind(&result.asset_error)
        .execute(self.pool())
        .await
        .map_err(db_error)?
        .rows_affected();

        if updated == 1 {
            return Ok(true);
        }

        let (exists,): (bool,) =
            sqlx::query_as(r#"SELECT EXISTS (SELECT 1 FROM attempts WHERE id = $1)"#)
                .bind(id)
                .fetch_one(self.pool())
                .await
                .map_err(db_error)?;
        if exists {
            tracing::debug!(attempt_id = %id, "Attempt already terminal, result discarded");
            Ok(false)
        } else {
            Err(AppError::NotFound(format!("attempt {id}")))
        }
    }

    async fn get_attempt(&self, id: Uuid) -> Result<Option<Attempt>, AppError> {
        let row = sqlx::query_as::<_, AttemptRow>(r#"SELECT * FROM attempts WHERE id = $1"#)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_error)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn latest_for(&self, source_id: &str) -> Result<Option<Attempt>, AppError> {
        let row = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT * FROM attempts
            WHERE source_id = $1
            ORDER BY started_at DESC, seq DESC
            LIMIT 1
            "#,
        )
        .bind(source_id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_error)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn baseline_for(&self, source_id: &str) -> Result<Option<Attempt>, AppError> {
        let row = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT * FROM attempts
            WHERE source_id = $1
              AND fingerprint IS NOT NULL
              AND outcome IN ('succeeded', 'skipped')
            ORDER BY started_at DESC, seq DESC
            LIMIT 1
            "#,
        )
        .bind(source_id)
        .fetch_optional(self.pool())
        .await
        .map_err(db_error)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn recent_for(&self, source_id: &str, limit: usize) -> Result<Vec<Attempt>, AppError> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT * FROM attempts
            WHERE source_id = $1 AND outcome IS NOT NULL
            ORDER BY started_at DESC, seq DESC
            LIMIT $2
            "#,
        )
        .bind(source_id)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(db_error)?;

        into_attempts(rows)
    }

    async fn list_attempts(&self, filter: &AttemptFilter) -> Result<Vec<Attempt>, AppError> {
        let rows = sqlx::query_as::<_, AttemptRow>(
            r#"
            SELECT * FROM attempts
            WHERE ($1::varchar IS NULL OR source_id = $1)
              AND ($2::varchar IS NULL OR trigger = $2)
              AND ($3::varchar IS NULL OR outcome = $3)
              AND ($4::varchar IS NULL OR change_status = $4)
              AND ($5::timestamptz IS NULL OR started_at >= $5)
              AND ($6::timestamptz IS NULL OR started_at < $6)
            ORDER BY started_at DESC, seq DESC
            LIMIT $7
            "#,
        )
        .bind(filter.source_id.as_deref())
        .bind(filter.trigger.map(|t| t.as_str()))
        .bind(filter.outcome.map(|o| o.as_str()))
        .bind(filter.change_status.map(|c| c.as_str()))
        .bind(filter.since)
        .bind(filter.until)
        .bind(filter.limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(db_error)?;

        into_attempts(rows)
    }

    async fn abandon_attempts(
        &self,
        claim_token: Uuid,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE attempts
            SET outcome = 'failed-retryable', error = $2, finished_at = $3
            WHERE claim_token = $1 AND outcome IS NULL
            "#,
        )
        .bind(claim_token)
        .bind(detail)
        .bind(now)
        .execute(self.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }
}
