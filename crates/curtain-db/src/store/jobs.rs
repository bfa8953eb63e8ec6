use chrono::{DateTime, Utc};
use curtain_core::traits::JobQueue;
use curtain_core::{AppError, Job, JobStatus, Lane, NewJob};
use uuid::Uuid;

use super::{PgStore, db_error};

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    source_id: String,
    schedule_id: Option<Uuid>,
    trigger: String,
    attempt_number: i32,
    claim_token: Option<Uuid>,
    lane: i16,
    gate_passed: bool,
    status: String,
    run_after: DateTime<Utc>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    worker_id: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = AppError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            source_id: row.source_id,
            schedule_id: row.schedule_id,
            trigger: row.trigger.parse().map_err(AppError::Database)?,
            attempt_number: row.attempt_number as u32,
            claim_token: row.claim_token,
            lane: Lane::from_rank(row.lane),
            gate_passed: row.gate_passed,
            status: row.status.parse().unwrap_or(JobStatus::Pending),
            run_after: row.run_after,
            created_at: row.created_at,
            started_at: row.started_at,
            worker_id: row.worker_id,
        })
    }
}

/// PostgreSQL-backed job queue using `SELECT FOR UPDATE SKIP LOCKED`.
impl JobQueue for PgStore {
    async fn enqueue(&self, job: NewJob) -> Result<Job, AppError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            INSERT INTO jobs
                (source_id, schedule_id, trigger, attempt_number, claim_token, lane, gate_passed, run_after)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(&job.source_id)
        .bind(job.schedule_id)
        .bind(job.trigger.as_str())
        .bind(job.attempt_number as i32)
        .bind(job.claim_token)
        .bind(job.lane.rank())
        .bind(job.gate_passed)
        .bind(job.run_after)
        .fetch_one(self.pool())
        .await
        .map_err(db_error)?;

        row.try_into()
    }

    async fn claim_next_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, AppError> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            UPDATE jobs
            SET status = 'running', worker_id = $1, started_at = $2
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'pending' AND run_after <= $2
                ORDER BY lane, run_after, created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(db_error)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn finish_job(&self, job_id: Uuid, status: JobStatus) -> Result<(), AppError> {
        let result = sqlx::query(r#"UPDATE jobs SET status = $2 WHERE id = $1"#)
            .bind(job_id)
            .bind(status.as_str())
            .execute(self.pool())
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("job {job_id}")));
        }
        Ok(())
    }

    async fn attach_claim(&self, job_id: Uuid, claim_token: Uuid) -> Result<(), AppError> {
        let result = sqlx::query(r#"UPDATE jobs SET claim_token = $2 WHERE id = $1"#)
            .bind(job_id)
            .bind(claim_token)
            .execute(self.pool())
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("job {job_id}")));
        }
        Ok(())
    }

    async fn abandon_jobs(&self, claim_token: Uuid) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"UPDATE jobs SET status = 'abandoned' WHERE claim_token = $1 AND status = 'running'"#,
        )
        .bind(claim_token)
        .execute(self.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending', worker_id = NULL, started_at = NULL
            WHERE worker_id = $1 AND status = 'running'
            "#,
        )
        .bind(worker_id)
        .execute(self.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected())
    }

    async fn count_pending(&self) -> Result<i64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as(r#"SELECT COUNT(*) FROM jobs WHERE status = 'pending'"#)
                .fetch_one(self.pool())
                .await
                .map_err(db_error)?;

        Ok(count)
    }
}
