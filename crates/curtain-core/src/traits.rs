use std::future::Future;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobStatus, NewJob};
use crate::models::{
    Attempt, AttemptFilter, AttemptResult, ChangeStatus, MonitoredSource, NewAttempt,
    SourceStatus, Visibility,
};
use crate::schedule::{DueSchedule, NewSchedule, Schedule};

// ---------------------------------------------------------------------------
// External capabilities
// ---------------------------------------------------------------------------

/// Lightweight change check result reported by a page source.
#[derive(Debug, Clone, Default)]
pub struct ChangeCheck {
    /// Status computed upstream, if the source tracks changes itself.
    pub status: Option<ChangeStatus>,
    /// Content fingerprint; compared against the ledger baseline when `status` is absent.
    pub fingerprint: Option<String>,
    pub visibility: Option<Visibility>,
    pub previous_scrape_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

/// Full content of a monitored source.
#[derive(Debug, Clone)]
pub struct PageContent {
    pub markdown: String,
    pub pages_requested: u32,
    pub pages_succeeded: u32,
    /// Per-page errors that did not fail the whole fetch.
    pub errors: Vec<String>,
}

/// Fetches change fingerprints and full content for a monitored source.
pub trait PageSource: Send + Sync + Clone {
    fn check(
        &self,
        source: &MonitoredSource,
    ) -> impl Future<Output = Result<ChangeCheck, AppError>> + Send;

    fn fetch(
        &self,
        source: &MonitoredSource,
    ) -> impl Future<Output = Result<PageContent, AppError>> + Send;
}

/// Turns raw page content into structured show records.
pub trait Extractor: Send + Sync + Clone {
    fn extract(
        &self,
        source: &MonitoredSource,
        content: &str,
    ) -> impl Future<Output = Result<Vec<serde_json::Value>, AppError>> + Send;
}

/// Optional media handling for extracted records (image mirroring etc.).
pub trait AssetStore: Send + Sync + Clone {
    fn store_assets(
        &self,
        source: &MonitoredSource,
        records: Vec<serde_json::Value>,
    ) -> impl Future<Output = Result<Vec<serde_json::Value>, AppError>> + Send;
}

/// Asset store that returns records untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullAssets;

impl AssetStore for NullAssets {
    async fn store_assets(
        &self,
        _source: &MonitoredSource,
        records: Vec<serde_json::Value>,
    ) -> Result<Vec<serde_json::Value>, AppError> {
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// Durable store
// ---------------------------------------------------------------------------

/// Monitored sources. Sources are never deleted, only disabled.
pub trait SourceStore: Send + Sync + Clone {
    /// Insert or update by id. Updating keeps the stored lifecycle status.
    fn upsert_source(
        &self,
        source: &MonitoredSource,
    ) -> impl Future<Output = Result<MonitoredSource, AppError>> + Send;

    fn get_source(
        &self,
        id: &str,
    ) -> impl Future<Output = Result<Option<MonitoredSource>, AppError>> + Send;

    fn list_sources(&self) -> impl Future<Output = Result<Vec<MonitoredSource>, AppError>> + Send;

    fn set_source_enabled(
        &self,
        id: &str,
        enabled: bool,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn set_source_status(
        &self,
        id: &str,
        status: SourceStatus,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

pub trait ScheduleStore: Send + Sync + Clone {
    fn create_schedule(
        &self,
        schedule: NewSchedule,
        next_due_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Schedule, AppError>> + Send;

    fn get_schedule(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<Schedule>, AppError>> + Send;

    fn list_schedules(
        &self,
        source_id: Option<&str>,
    ) -> impl Future<Output = Result<Vec<Schedule>, AppError>> + Send;

    fn set_schedule_enabled(
        &self,
        id: Uuid,
        enabled: bool,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    fn delete_schedule(&self, id: Uuid) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Enabled schedules of runnable sources with `next_due_at <= now` and no live claim.
    fn due_schedules(
        &self,
        now: DateTime<Utc>,
        stale_after: TimeDelta,
    ) -> impl Future<Output = Result<Vec<DueSchedule>, AppError>> + Send;

    /// Move `next_due_at` forward, only if it still equals `expected_due`.
    ///
    /// Returns false when another writer already advanced the schedule.
    fn advance_schedule(
        &self,
        id: Uuid,
        expected_due: DateTime<Utc>,
        next_due_at: DateTime<Utc>,
        ran_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;
}

/// Exclusive right to process one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub source_id: String,
    pub token: Uuid,
    pub claimed_at: DateTime<Utc>,
    pub schedule_id: Option<Uuid>,
}

/// Per-source mutual exclusion, expressed as conditional updates.
pub trait ClaimStore: Send + Sync + Clone {
    /// Claim the source if it is unclaimed or its claim is stale.
    ///
    /// A claim is stale once it is older than `stale_after`, unless a job
    /// holding it is still pending.
    ///
    /// Must be atomic: of two concurrent callers at most one gets `Some`.
    fn try_claim(
        &self,
        source_id: &str,
        schedule_id: Option<Uuid>,
        now: DateTime<Utc>,
        stale_after: TimeDelta,
    ) -> impl Future<Output = Result<Option<Claim>, AppError>> + Send;

    /// Bump `claimed_at` if the token still owns the claim.
    fn refresh_claim(
        &self,
        source_id: &str,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Release the claim if the token matches; a mismatch is a no-op returning false.
    fn release_claim(
        &self,
        source_id: &str,
        token: Uuid,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn current_claim(
        &self,
        source_id: &str,
    ) -> impl Future<Output = Result<Option<Claim>, AppError>> + Send;

    /// Stale claims, in the sense of [`ClaimStore::try_claim`].
    fn stale_claims(
        &self,
        now: DateTime<Utc>,
        stale_after: TimeDelta,
    ) -> impl Future<Output = Result<Vec<Claim>, AppError>> + Send;
}

/// Append-only record of attempts.
pub trait AttemptLedger: Send + Sync + Clone {
    /// Open a new, non-terminal attempt. Returns its id.
    fn begin_attempt(
        &self,
        attempt: &NewAttempt,
    ) -> impl Future<Output = Result<Uuid, AppError>> + Send;

    /// Write the terminal outcome. Returns false (and changes nothing) if the
    /// attempt is already terminal.
    fn finish_attempt(
        &self,
        id: Uuid,
        result: &AttemptResult,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn get_attempt(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<Attempt>, AppError>> + Send;

    fn latest_for(
        &self,
        source_id: &str,
    ) -> impl Future<Output = Result<Option<Attempt>, AppError>> + Send;

    /// Latest attempt usable as a change baseline (see [`Attempt::is_baseline`]).
    fn baseline_for(
        &self,
        source_id: &str,
    ) -> impl Future<Output = Result<Option<Attempt>, AppError>> + Send;

    /// Latest terminal attempts for a source, newest first.
    fn recent_for(
        &self,
        source_id: &str,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Attempt>, AppError>> + Send;

    fn list_attempts(
        &self,
        filter: &AttemptFilter,
    ) -> impl Future<Output = Result<Vec<Attempt>, AppError>> + Send;

    /// Close every still-running attempt opened under `claim_token` as
    /// failed-retryable with `detail`. Returns how many were closed.
    fn abandon_attempts(
        &self,
        claim_token: Uuid,
        detail: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}

/// Persistent queue of accepted submissions.
///
/// Implementations must support atomic claiming via `SELECT FOR UPDATE SKIP LOCKED`
/// or equivalent to prevent multiple workers from taking the same job.
pub trait JobQueue: Send + Sync + Clone {
    fn enqueue(&self, job: NewJob) -> impl Future<Output = Result<Job, AppError>> + Send;

    /// Take the next pending job whose `run_after <= now`: priority lane
    /// first, then arrival order.
    fn claim_next_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    fn finish_job(
        &self,
        job_id: Uuid,
        status: JobStatus,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Record the claim a delayed retry acquired when it was picked up.
    fn attach_claim(
        &self,
        job_id: Uuid,
        claim_token: Uuid,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Mark running jobs that hold `claim_token` as abandoned.
    fn abandon_jobs(&self, claim_token: Uuid) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Put a worker's running jobs back to pending (graceful shutdown).
    fn release_worker_jobs(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn count_pending(&self) -> impl Future<Output = Result<i64, AppError>> + Send;
}

/// Everything the orchestrator and dispatcher persist through.
pub trait Store: SourceStore + ScheduleStore + ClaimStore + AttemptLedger + JobQueue {}

impl<T> Store for T where T: SourceStore + ScheduleStore + ClaimStore + AttemptLedger + JobQueue {}

/// Single-writer coordination for the dispatcher tick.
pub trait DispatchLock: Send + Sync {
    /// Returns false if another dispatcher currently holds the lock.
    fn try_lock(&self) -> impl Future<Output = Result<bool, AppError>> + Send;

    fn unlock(&self) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Lock for deployments where ticks are already serialized externally
/// (e.g. a single cron entry invoking `curtain tick`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExternallySerialized;

impl DispatchLock for ExternallySerialized {
    async fn try_lock(&self) -> Result<bool, AppError> {
        Ok(true)
    }

    async fn unlock(&self) -> Result<(), AppError> {
        Ok(())
    }
}
