//! PostgreSQL implementation of the core store traits.
//!
//! Every conditional transition (claiming, releasing, finishing an attempt,
//! advancing a schedule) is a single guarded statement or a short
//! transaction, so concurrent dispatchers and workers stay consistent
//! without any in-process coordination.

mod attempts;
mod claims;
mod jobs;
mod schedules;
mod sources;

use chrono::TimeDelta;
use curtain_core::AppError;
use sqlx::{PgPool, Pool, Postgres};

/// Store backed by one connection pool. Cheap to clone.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool<Postgres>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub(crate) fn db_error(e: sqlx::Error) -> AppError {
    AppError::Database(e.to_string())
}

/// Bound as `make_interval(secs => $n)`.
pub(crate) fn interval_secs(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 1000.0
}

/// Parse an optional text column into one of the core enums.
pub(crate) fn parse_opt<T: std::str::FromStr<Err = String>>(
    raw: Option<String>,
) -> Result<Option<T>, AppError> {
    raw.map(|s| s.parse::<T>())
        .transpose()
        .map_err(AppError::Database)
}
