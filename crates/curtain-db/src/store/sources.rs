use chrono::{DateTime, Utc};
use curtain_core::traits::SourceStore;
use curtain_core::{AppError, MonitoredSource, SourceStatus};

use super::{PgStore, db_error};

#[derive(sqlx::FromRow)]
pub(crate) struct SourceRow {
    id: String,
    label: String,
    enabled: bool,
    status: String,
    fetch: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SourceRow> for MonitoredSource {
    type Error = AppError;

    fn try_from(row: SourceRow) -> Result<Self, Self::Error> {
        Ok(MonitoredSource {
            id: row.id,
            label: row.label,
            enabled: row.enabled,
            status: row.status.parse().unwrap_or(SourceStatus::Active),
            fetch: serde_json::from_value(row.fetch)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl PgStore {
    /// Fetch several sources at once, in id order.
    pub(crate) async fn sources_by_id(
        &self,
        ids: &[String],
    ) -> Result<Vec<MonitoredSource>, AppError> {
        let rows = sqlx::query_as::<_, SourceRow>(
            r#"SELECT * FROM sources WHERE id = ANY($1) ORDER BY id"#,
        )
        .bind(ids)
        .fetch_all(self.pool())
        .await
        .map_err(db_error)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

impl SourceStore for PgStore {
    async fn upsert_source(&self, source: &MonitoredSource) -> Result<MonitoredSource, AppError> {
        let row = sqlx::query_as::<_, SourceRow>(
            r#"
            INSERT INTO sources (id, label, enabled, status, fetch, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (id) DO UPDATE
            SET label = EXCLUDED.label,
                enabled = EXCLUDED.enabled,
                fetch = EXCLUDED.fetch,
                updated_at = NOW()
            RETURNING *
            "#,
        )
        .bind(&source.id)
        .bind(&source.label)
        .bind(source.enabled)
        .bind(source.status.as_str())
        .bind(serde_json::to_value(&source.fetch)?)
        .bind(source.created_at)
        .fetch_one(self.pool())
        .await
        .map_err(db_error)?;

        row.try_into()
    }

    async fn get_source(&self, id: &str) -> Result<Option<MonitoredSource>, AppError> {
        let row = sqlx::query_as::<_, SourceRow>(r#"SELECT * FROM sources WHERE id = $1"#)
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .map_err(db_error)?;

        row.map(TryInto::try_into).transpose()
    }

    async fn list_sources(&self) -> Result<Vec<MonitoredSource>, AppError> {
        let rows = sqlx::query_as::<_, SourceRow>(r#"SELECT * FROM sources ORDER BY id"#)
            .fetch_all(self.pool())
            .await
            .map_err(db_error)?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn set_source_enabled(&self, id: &str, enabled: bool) -> Result<(), AppError> {
        let result =
            sqlx::query(r#"UPDATE sources SET enabled = $2, updated_at = NOW() WHERE id = $1"#)
                .bind(id)
                .bind(enabled)
                .execute(self.pool())
                .await
                .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("source {id}")));
        }
        Ok(())
    }

    async fn set_source_status(&self, id: &str, status: SourceStatus) -> Result<(), AppError> {
        let result =
            sqlx::query(r#"UPDATE sources SET status = $2, updated_at = NOW() WHERE id = $1"#)
                .bind(id)
                .bind(status.as_str())
                .execute(self.pool())
                .await
                .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("source {id}")));
        }
        Ok(())
    }
}
