use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use curtain_core::schedule::DueSchedule;
use curtain_core::traits::ScheduleStore;
use curtain_core::{AppError, NewSchedule, Schedule, ScheduleSpec};
use uuid::Uuid;

use super::{PgStore, db_error, interval_secs};

#[derive(sqlx::FromRow)]
struct ScheduleRow {
    id: Uuid,
    source_id: String,
    interval: serde_json::Value,
    timezone: String,
    enabled: bool,
    next_due_at: DateTime<Utc>,
    last_run_at: Option<DateTime<Utc>>,
    last_claimed_at: Option<DateTime<Utc>>,
    claim_token: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ScheduleRow> for Schedule {
    type Error = AppError;

    fn try_from(row: ScheduleRow) -> Result<Self, Self::Error> {
        let timezone: Tz = row.timezone.parse().map_err(|e| {
            AppError::Schedule(format!(
                "schedule {}: bad time zone '{}': {e}",
                row.id, row.timezone
            ))
        })?;
        Ok(Schedule {
            id: row.id,
            source_id: row.source_id,
            spec: ScheduleSpec::new(serde_json::from_value(row.interval)?, timezone),
            enabled: row.enabled,
            next_due_at: row.next_due_at,
            last_run_at: row.last_run_at,
            last_claimed_at: row.last_claimed_at,
            claim_token: row.claim_token,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl ScheduleStore for PgStore {
    async fn create_schedule(
        &self,
        schedule: NewSchedule,
        next_due_at: DateTime<Utc>,
    ) -> Result<Schedule, AppError> {
        let row = sqlx::query_as::<_, ScheduleRow>(
            r#"
            INSERT INTO schedules (source_id, interval, timezone, enabled, next_due_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(&schedule.source_id)
        .bind(serde_json::to_value(&schedule.spec.interval)?)
        .bind(schedule.spec.timezone.name())
        .bind(schedule.enabled)
        .bind(next_due_at)
        .fetch_one(self.pool())
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => {
                AppError::NotFound(format!("source {}", schedule.source_id))
            }
            other => db_error(other),
        })?;

        row.try_into()
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, AppError> {
        let row = sqlx::query_as::<_, ScheduleRow>(r#"SELECT * FROM schedules WHERE id = $1"#)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_error)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list_schedules(&self, source_id: Option<&str>) -> Result<Vec<Schedule>, AppError> {
        let rows = sqlx::query_as::<_, ScheduleRow>(
            r#"
            SELECT * FROM schedules
            WHERE ($1::varchar IS NULL OR source_id = $1)
            ORDER BY source_id, next_due_at
            "#,
        )
        .bind(source_id)
        .fetch_all(self.pool())
        .await
        .map_err(db_error)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn set_schedule_enabled(&self, id: Uuid, enabled: bool) -> Result<(), AppError> {
        let result =
            sqlx::query(r#"UPDATE schedules SET enabled = $2, updated_at = NOW() WHERE id = $1"#)
                .bind(id)
                .bind(enabled)
                .execute(self.pool())
                .await
                .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("schedule {id}")));
        }
        Ok(())
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<bool, AppError> {
        let result = sqlx::query(r#"DELETE FROM schedules WHERE id = $1"#)
            .bind(id)
            .execute(self.pool())
            .await
            .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
        stale_after: TimeDelta,
    ) -> Result<Vec<DueSchedule>, AppError> {
        let rows = sqlx::query_as::<_, ScheduleRow>(
            r#"
            SELECT sch.* FROM schedules sch
            JOIN sources src ON src.id = sch.source_id
            WHERE sch.enabled
              AND src.enabled
              AND src.status <> 'disabled'
              AND sch.next_due_at <= $1
              AND (sch.last_claimed_at IS NULL
                   OR sch.last_claimed_at <= $1 - make_interval(secs => $2))
            ORDER BY sch.next_due_at, sch.created_at
            "#,
        )
        .bind(now)
        .bind(interval_secs(stale_after))
        .fetch_all(self.pool())
        .await
        .map_err(db_error)?;

        let schedules: Vec<Schedule> = rows
            .into_iter()
            .map(TryInto::try_into)
            .collect::<Result<_, _>>()?;
        let ids: Vec<String> = schedules.iter().map(|s| s.source_id.clone()).collect();
        let sources: HashMap<String, _> = self
            .sources_by_id(&ids)
            .await?
            .into_iter()
            .map(|source| (source.id.clone(), source))
            .collect();

        Ok(schedules
            .into_iter()
            .filter_map(|schedule| {
                let source = sources.get(&schedule.source_id)?.clone();
                Some(DueSchedule { schedule, source })
            })
            .collect())
    }

    async fn advance_schedule(
        &self,
        id: Uuid,
        expected_due: DateTime<Utc>,
        next_due_at: DateTime<Utc>,
        ran_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE schedules
            SET next_due_at = $3, last_run_at = $4, updated_at = NOW()
            WHERE id = $1 AND next_due_at = $2
            "#,
        )
        .bind(id)
        .bind(expected_due)
        .bind(next_due_at)
        .bind(ran_at)
        .execute(self.pool())
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }
}
