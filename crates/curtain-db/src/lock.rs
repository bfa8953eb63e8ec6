use curtain_core::{AppError, DispatchLock};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::sync::Mutex;

/// Advisory lock key shared by every dispatcher of one database.
pub const DISPATCH_LOCK_KEY: i64 = 0x4355_5254_4149_4e01;

/// Dispatcher tick lock backed by `pg_try_advisory_lock`.
///
/// Advisory locks belong to a session, so the connection that took the lock
/// is kept out of the pool until `unlock`. If the process dies, the server
/// drops the session and the lock with it.
pub struct PgDispatchLock {
    pool: PgPool,
    held: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgDispatchLock {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held: Mutex::new(None),
        }
    }
}

impl DispatchLock for PgDispatchLock {
    async fn try_lock(&self) -> Result<bool, AppError> {
        let mut held = self.held.lock().await;
        if held.is_some() {
            return Ok(false);
        }

        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;
        let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(DISPATCH_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| AppError::Database(e.to_string()))?;

        if acquired {
            *held = Some(conn);
        }
        Ok(acquired)
    }

    async fn unlock(&self) -> Result<(), AppError> {
        let Some(mut conn) = self.held.lock().await.take() else {
            return Ok(());
        };
        let unlocked = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(DISPATCH_LOCK_KEY)
            .execute(&mut *conn)
            .await;
        if let Err(e) = unlocked {
            // A pooled session would keep holding the lock; close it instead.
            drop(conn.detach());
            return Err(AppError::Database(e.to_string()));
        }
        Ok(())
    }
}
