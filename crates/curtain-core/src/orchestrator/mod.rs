//! Task orchestrator: per-source claims, the job queue, retries and the worker pool.

pub mod retry;
pub mod worker;

use std::fmt;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{AppError, FailureClass};
use crate::job::{Job, Lane, NewJob};
use crate::models::TriggerKind;
use crate::traits::Store;

pub use retry::RetryPolicy;
pub use worker::{TracingWorkerReporter, WorkerEvent, WorkerPool, WorkerReporter};

/// Request to run one source.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub source_id: String,
    pub trigger: TriggerKind,
    pub schedule_id: Option<Uuid>,
}

impl SubmitRequest {
    /// Operator "run now". Bypasses the change gate.
    pub fn manual(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            trigger: TriggerKind::Manual,
            schedule_id: None,
        }
    }

    pub fn scheduled(source_id: impl Into<String>, schedule_id: Uuid) -> Self {
        Self {
            source_id: source_id.into(),
            trigger: TriggerKind::Scheduled,
            schedule_id: Some(schedule_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Another attempt holds the source. Retry after it completes.
    AlreadyClaimed,
    SourceDisabled,
    UnknownSource,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::AlreadyClaimed => "already-claimed",
            RejectReason::SourceDisabled => "source-disabled",
            RejectReason::UnknownSource => "unknown-source",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { job_id: Uuid, claim_token: Uuid },
    Rejected(RejectReason),
}

impl SubmitOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, SubmitOutcome::Accepted { .. })
    }
}

/// What one reaper pass cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub claims_released: u64,
    pub attempts_abandoned: u64,
    pub jobs_abandoned: u64,
}

/// Detail written to attempts closed by the reaper.
pub const CLAIM_EXPIRED: &str = "claim expired before the attempt finished";

/// Single source of truth for whether a source is being processed.
///
/// All exclusion goes through conditional updates in the store, so any
/// number of orchestrators (one per process) can share one database.
#[derive(Clone)]
pub struct Orchestrator<S: Store> {
    store: S,
    config: OrchestratorConfig,
}

impl<S: Store> Orchestrator<S> {
    pub fn new(store: S, config: OrchestratorConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn stale_after(&self) -> TimeDelta {
        self.config.stale_after()
    }

    fn lane_for(&self, trigger: TriggerKind) -> Lane {
        if trigger == TriggerKind::Manual && self.config.prioritize_manual {
            Lane::Priority
        } else {
            Lane::Normal
        }
    }

    /// Claim the source and enqueue a job holding the claim.
    ///
    /// Of any number of concurrent submissions for one source, exactly one is
    /// accepted until its claim is released.
    pub async fn submit(
        &self,
        request: SubmitRequest,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome, AppError> {
        let Some(source) = self.store.get_source(&request.source_id).await? else {
            return Ok(SubmitOutcome::Rejected(RejectReason::UnknownSource));
        };
        if !source.is_runnable() {
            return Ok(SubmitOutcome::Rejected(RejectReason::SourceDisabled));
        }

        let Some(claim) = self
            .store
            .try_claim(&source.id, request.schedule_id, now, self.stale_after())
            .await?
        else {
            tracing::debug!(source_id = %source.id, trigger = %request.trigger, "Submit rejected, source already claimed");
            return Ok(SubmitOutcome::Rejected(RejectReason::AlreadyClaimed));
        };

        let job = NewJob::new(&source.id, request.trigger, now)
            .with_schedule(request.schedule_id)
            .with_claim(claim.token)
            .with_lane(self.lane_for(request.trigger));

        match self.store.enqueue(job).await {
            Ok(job) => {
                tracing::info!(
                    source_id = %source.id,
                    job_id = %job.id,
                    trigger = %request.trigger,
                    "Submission accepted"
                );
                Ok(SubmitOutcome::Accepted {
                    job_id: job.id,
                    claim_token: claim.token,
                })
            }
            Err(e) => {
                // Do not leave the source claimed by a job that does not exist.
                if let Err(release_err) = self.store.release_claim(&source.id, claim.token).await {
                    tracing::error!(source_id = %source.id, error = %release_err, "Failed to release claim after enqueue error");
                }
                Err(e)
            }
        }
    }

    /// Queue the next attempt of a retry chain after the backoff delay.
    ///
    /// The delayed job holds no claim while it waits; it claims the source
    /// when a worker picks it up. `gate_passed` carries a passed change gate
    /// over to the retry. Returns `None` once the chain has used its attempt
    /// budget.
    pub async fn resubmit_later(
        &self,
        job: &Job,
        class: FailureClass,
        gate_passed: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, AppError> {
        if class == FailureClass::Fatal || !self.config.retry.can_retry(job.attempt_number) {
            return Ok(None);
        }
        let delay = self.config.retry.delay_for(job.attempt_number, class);
        let run_after = now + TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);

        let retry = NewJob::new(&job.source_id, job.trigger, run_after)
            .with_schedule(job.schedule_id)
            .with_lane(job.lane)
            .with_attempt_number(job.attempt_number + 1)
            .with_gate_passed(gate_passed);

        self.store.enqueue(retry).await.map(Some)
    }

    /// Token-matched release. A stale token is a no-op returning false.
    pub async fn release(&self, source_id: &str, token: Uuid) -> Result<bool, AppError> {
        self.store.release_claim(source_id, token).await
    }

    /// Force-release claims older than the staleness limit.
    ///
    /// Attempts still open under a reaped claim are closed as failed-retryable
    /// and their jobs marked abandoned, so a late finish from a hung worker
    /// can no longer change the ledger.
    pub async fn reap_stale(&self, now: DateTime<Utc>) -> Result<ReapReport, AppError> {
        let mut report = ReapReport::default();

        for claim in self.store.stale_claims(now, self.stale_after()).await? {
            report.attempts_abandoned += self
                .store
                .abandon_attempts(claim.token, CLAIM_EXPIRED, now)
                .await?;
            report.jobs_abandoned += self.store.abandon_jobs(claim.token).await?;
            if self.store.release_claim(&claim.source_id, claim.token).await? {
                report.claims_released += 1;
                tracing::warn!(
                    source_id = %claim.source_id,
                    claimed_at = %claim.claimed_at,
                    "Released stale claim"
                );
            }
        }

        Ok(report)
    }
}
