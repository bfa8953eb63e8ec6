use std::time::Instant;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AppError, FailureClass};
use crate::gate::{ChangeGate, GateAction, GateVerdict};
use crate::job::{Job, JobStatus};
use crate::models::{
    Attempt, AttemptOutcome, AttemptResult, ChangeStatus, MonitoredSource, NewAttempt,
    SourceStatus, TriggerKind,
};
use crate::orchestrator::{Orchestrator, ReapReport};
use crate::traits::{AssetStore, Extractor, PageSource, Store};

/// Events emitted by the worker pool for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    Polling {
        worker_id: &'a str,
    },
    JobClaimed {
        worker_id: &'a str,
        job: &'a Job,
    },
    /// The job's claim was lost (reaped) or, for a delayed retry, the source
    /// is held by a newer attempt.
    JobSuperseded {
        job_id: Uuid,
        source_id: &'a str,
    },
    AttemptStarted {
        attempt_id: Uuid,
        source_id: &'a str,
        trigger: TriggerKind,
        attempt_number: u32,
    },
    GateDecided {
        attempt_id: Uuid,
        verdict: &'a GateVerdict,
    },
    AttemptFinished {
        attempt_id: Uuid,
        source_id: &'a str,
        outcome: AttemptOutcome,
        error: Option<&'a str>,
    },
    RetryScheduled {
        source_id: &'a str,
        attempt_number: u32,
        run_after: DateTime<Utc>,
    },
    SourceStatusChanged {
        source_id: &'a str,
        from: SourceStatus,
        to: SourceStatus,
    },
    Reaped {
        report: ReapReport,
    },
    ShuttingDown {
        worker_id: &'a str,
        jobs_released: u64,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Polling { worker_id } => {
                tracing::trace!(%worker_id, "Polling for jobs");
            }
            WorkerEvent::JobClaimed { worker_id, job } => {
                tracing::debug!(
                    %worker_id,
                    job_id = %job.id,
                    source_id = %job.source_id,
                    attempt_number = job.attempt_number,
                    "Job claimed"
                );
            }
            WorkerEvent::JobSuperseded { job_id, source_id } => {
                tracing::info!(%job_id, %source_id, "Job superseded, source held by another attempt");
            }
            WorkerEvent::AttemptStarted {
                attempt_id,
                source_id,
                trigger,
                attempt_number,
            } => {
                tracing::info!(%attempt_id, %source_id, %trigger, attempt_number, "Attempt started");
            }
            WorkerEvent::GateDecided {
                attempt_id,
                verdict,
            } => {
                tracing::info!(
                    %attempt_id,
                    status = %verdict.status,
                    action = ?verdict.action,
                    bypass = ?verdict.bypass,
                    "Change gate decided"
                );
            }
            WorkerEvent::AttemptFinished {
                attempt_id,
                source_id,
                outcome,
                error,
            } => {
                if outcome.is_failure() {
                    tracing::warn!(%attempt_id, %source_id, %outcome, error = error.unwrap_or_default(), "Attempt failed");
                } else {
                    tracing::info!(%attempt_id, %source_id, %outcome, "Attempt finished");
                }
            }
            WorkerEvent::RetryScheduled {
                source_id,
                attempt_number,
                run_after,
            } => {
                tracing::info!(%source_id, attempt_number, %run_after, "Retry scheduled");
            }
            WorkerEvent::SourceStatusChanged { source_id, from, to } => {
                tracing::warn!(%source_id, %from, %to, "Source status changed");
            }
            WorkerEvent::Reaped { report } => {
                if report.claims_released > 0 {
                    tracing::warn!(
                        claims_released = report.claims_released,
                        attempts_abandoned = report.attempts_abandoned,
                        jobs_abandoned = report.jobs_abandoned,
                        "Reaped stale claims"
                    );
                }
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                jobs_released,
            } => {
                tracing::info!(%worker_id, %jobs_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

/// Extracted records and any asset-handling problem.
struct Processed {
    records: Vec<serde_json::Value>,
    asset_error: Option<String>,
}

/// Everything one run of the pipeline produced.
struct Execution {
    verdict: Option<GateVerdict>,
    /// `Ok(None)` when the gate stopped before the full fetch.
    processed: Result<Option<Processed>, AppError>,
}

/// What happened to one job taken from the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobReport {
    Superseded,
    /// The source was disabled or removed after the job was accepted.
    Dropped,
    Finished {
        attempt_id: Uuid,
        outcome: AttemptOutcome,
        retry_job: Option<Uuid>,
    },
    /// The reaper closed the attempt first; nothing was written.
    LostClaim { attempt_id: Uuid },
}

/// Pool of worker loops sharing one orchestrator.
///
/// The pool size is the global cap on in-flight attempts in this process;
/// per-source exclusion comes from the claims.
pub struct WorkerPool<S, P, E, A>
where
    S: Store,
    P: PageSource,
    E: Extractor,
    A: AssetStore,
{
    orchestrator: Orchestrator<S>,
    pages: P,
    extractor: E,
    assets: A,
    gate: ChangeGate,
    worker_prefix: String,
}

impl<S, P, E, A> WorkerPool<S, P, E, A>
where
    S: Store,
    P: PageSource,
    E: Extractor,
    A: AssetStore,
{
    pub fn new(orchestrator: Orchestrator<S>, pages: P, extractor: E, assets: A) -> Self {
        Self {
            orchestrator,
            pages,
            extractor,
            assets,
            gate: ChangeGate,
            worker_prefix: format!("worker-{}", &Uuid::new_v4().simple().to_string()[..8]),
        }
    }

    pub fn with_worker_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_prefix = prefix.into();
        self
    }

    pub fn orchestrator(&self) -> &Orchestrator<S> {
        &self.orchestrator
    }

    fn store(&self) -> &S {
        self.orchestrator.store()
    }

    /// Run all worker loops and the reaper until cancellation.
    pub async fn run<WR: WorkerReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) -> Result<(), AppError> {
        let worker_ids: Vec<String> = (0..self.orchestrator.config().pool_size)
            .map(|i| format!("{}-{i}", self.worker_prefix))
            .collect();

        let workers = join_all(
            worker_ids
                .iter()
                .map(|id| self.worker_loop(id, cancel_token.clone(), reporter)),
        );
        let reaper = self.reaper_loop(cancel_token.clone(), reporter);

        tokio::join!(workers, reaper);
        Ok(())
    }

    async fn worker_loop<WR: WorkerReporter>(
        &self,
        worker_id: &str,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) {
        let poll_interval = self.orchestrator.config().poll_interval;
        reporter.report(WorkerEvent::Started { worker_id });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            reporter.report(WorkerEvent::Polling { worker_id });

            match self.run_once(worker_id, Utc::now(), reporter).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    tokio::select! {
                        () = tokio::time::sleep(poll_interval) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(%worker_id, error = %e, "Worker cycle failed");
                    tokio::select! {
                        () = tokio::time::sleep(poll_interval * 2) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
            }
        }

        // Graceful shutdown: put anything still marked running back on the queue.
        let released = match self.store().release_worker_jobs(worker_id).await {
            Ok(released) => released,
            Err(e) => {
                tracing::error!(%worker_id, error = %e, "Failed to release worker jobs");
                0
            }
        };

        reporter.report(WorkerEvent::ShuttingDown {
            worker_id,
            jobs_released: released,
        });
        reporter.report(WorkerEvent::Stopped { worker_id });
    }

    async fn reaper_loop<WR: WorkerReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) {
        let interval = self.orchestrator.config().reaper_interval;
        loop {
            match self.orchestrator.reap_stale(Utc::now()).await {
                Ok(report) => reporter.report(WorkerEvent::Reaped { report }),
                Err(e) => tracing::error!(error = %e, "Reaper pass failed"),
            }
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = cancel_token.cancelled() => break,
            }
        }
    }

    /// Take at most one runnable job from the queue and process it.
    ///
    /// Returns `Ok(None)` when nothing was runnable at `now`.
    pub async fn run_once<WR: WorkerReporter>(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        reporter: &WR,
    ) -> Result<Option<JobReport>, AppError> {
        let Some(job) = self.store().claim_next_job(worker_id, now).await? else {
            return Ok(None);
        };
        reporter.report(WorkerEvent::JobClaimed {
            worker_id,
            job: &job,
        });
        self.process_job(&job, now, reporter).await.map(Some)
    }

    /// Make sure `job` owns the source claim, returning the token.
    async fn acquire_claim(&self, job: &Job, now: DateTime<Utc>) -> Result<Option<Uuid>, AppError> {
        match job.claim_token {
            Some(token) => {
                let held = self.store().refresh_claim(&job.source_id, token, now).await?;
                Ok(held.then_some(token))
            }
            None => {
                let claim = self
                    .store()
                    .try_claim(
                        &job.source_id,
                        job.schedule_id,
                        now,
                        self.orchestrator.stale_after(),
                    )
                    .await?;
                match claim {
                    Some(claim) => {
                        self.store().attach_claim(job.id, claim.token).await?;
                        Ok(Some(claim.token))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    async fn process_job<WR: WorkerReporter>(
        &self,
        job: &Job,
        now: DateTime<Utc>,
        reporter: &WR,
    ) -> Result<JobReport, AppError> {
        let Some(claim_token) = self.acquire_claim(job, now).await? else {
            reporter.report(WorkerEvent::JobSuperseded {
                job_id: job.id,
                source_id: &job.source_id,
            });
            self.store().finish_job(job.id, JobStatus::Superseded).await?;
            return Ok(JobReport::Superseded);
        };

        let source = match self.store().get_source(&job.source_id).await? {
            Some(source) if source.is_runnable() => source,
            _ => {
                tracing::info!(job_id = %job.id, source_id = %job.source_id, "Source no longer runnable, dropping job");
                self.orchestrator.release(&job.source_id, claim_token).await?;
                self.store().finish_job(job.id, JobStatus::Superseded).await?;
                return Ok(JobReport::Dropped);
            }
        };

        let attempt_id = self
            .store()
            .begin_attempt(&NewAttempt {
                source_id: source.id.clone(),
                schedule_id: job.schedule_id,
                trigger: job.trigger,
                attempt_number: job.attempt_number,
                claim_token,
                started_at: now,
            })
            .await?;
        reporter.report(WorkerEvent::AttemptStarted {
            attempt_id,
            source_id: &source.id,
            trigger: job.trigger,
            attempt_number: job.attempt_number,
        });

        let started = Instant::now();
        let execution = self.execute(attempt_id, job, &source, reporter).await;
        let finished_at = now + TimeDelta::from_std(started.elapsed()).unwrap_or(TimeDelta::zero());
        let gate_passed = job.gate_passed
            || execution
                .verdict
                .as_ref()
                .is_some_and(|v| v.action == GateAction::Proceed);

        let (result, retry_class) = self.build_result(job, execution, finished_at);
        let Some(outcome) = result.outcome else {
            return Err(AppError::Generic("attempt result without outcome".into()));
        };

        if !self.store().finish_attempt(attempt_id, &result).await? {
            // The reaper got here first and already released the claim.
            tracing::warn!(%attempt_id, source_id = %source.id, "Attempt was closed by the reaper, discarding result");
            return Ok(JobReport::LostClaim { attempt_id });
        }
        reporter.report(WorkerEvent::AttemptFinished {
            attempt_id,
            source_id: &source.id,
            outcome,
            error: result.error.as_deref(),
        });

        let mut retry_job = None;
        if let Some(class) = retry_class {
            match self
                .orchestrator
                .resubmit_later(job, class, gate_passed, finished_at)
                .await
            {
                Ok(Some(retry)) => {
                    reporter.report(WorkerEvent::RetryScheduled {
                        source_id: &source.id,
                        attempt_number: retry.attempt_number,
                        run_after: retry.run_after,
                    });
                    retry_job = Some(retry.id);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(%attempt_id, source_id = %source.id, error = %e, "Failed to schedule retry");
                }
            }
        }

        if !self.orchestrator.release(&source.id, claim_token).await? {
            tracing::warn!(%attempt_id, source_id = %source.id, "Claim was already released");
        }
        self.store().finish_job(job.id, JobStatus::Completed).await?;

        if let Err(e) = self.update_lifecycle(&source, reporter).await {
            tracing::error!(source_id = %source.id, error = %e, "Failed to update source status");
        }

        Ok(JobReport::Finished {
            attempt_id,
            outcome,
            retry_job,
        })
    }

    /// Gate, then (if allowed) fetch, extract and store assets, all within
    /// the attempt time limit.
    async fn execute<WR: WorkerReporter>(
        &self,
        attempt_id: Uuid,
        job: &Job,
        source: &MonitoredSource,
        reporter: &WR,
    ) -> Execution {
        let limit = self.orchestrator.config().max_attempt_duration;
        let deadline = tokio::time::Instant::now() + limit;
        let timed_out = || AppError::Timeout(limit.as_secs());

        let gate = self.gate.evaluate(
            job.trigger,
            job.gate_passed,
            source,
            &self.pages,
            self.store(),
        );
        let Ok(verdict) = tokio::time::timeout_at(deadline, gate).await else {
            return Execution {
                verdict: None,
                processed: Err(timed_out()),
            };
        };
        reporter.report(WorkerEvent::GateDecided {
            attempt_id,
            verdict: &verdict,
        });

        if verdict.action != GateAction::Proceed {
            return Execution {
                verdict: Some(verdict),
                processed: Ok(None),
            };
        }

        let processed = match tokio::time::timeout_at(deadline, self.process(source)).await {
            Ok(processed) => processed.map(Some),
            Err(_) => Err(timed_out()),
        };
        Execution {
            verdict: Some(verdict),
            processed,
        }
    }

    async fn process(&self, source: &MonitoredSource) -> Result<Processed, AppError> {
        let content = self.pages.fetch(source).await?;
        if content.pages_succeeded == 0 {
            return Err(AppError::Network(format!(
                "no page of {} could be fetched: {}",
                source.id,
                content.errors.join("; ")
            )));
        }
        for error in &content.errors {
            tracing::warn!(source_id = %source.id, %error, "Partial fetch failure");
        }

        let records = self.extractor.extract(source, &content.markdown).await?;

        match self.assets.store_assets(source, records.clone()).await {
            Ok(records) => Ok(Processed {
                records,
                asset_error: None,
            }),
            Err(e) => {
                tracing::warn!(source_id = %source.id, error = %e, "Asset handling failed, keeping records");
                Ok(Processed {
                    records,
                    asset_error: Some(e.to_string()),
                })
            }
        }
    }

    /// Terminal attempt record, plus the retry class if a retry is due.
    fn build_result(
        &self,
        job: &Job,
        execution: Execution,
        finished_at: DateTime<Utc>,
    ) -> (AttemptResult, Option<FailureClass>) {
        let mut result = AttemptResult {
            finished_at,
            ..AttemptResult::default()
        };

        if let Some(verdict) = execution.verdict {
            result.change_status = Some(verdict.status);
            result.visibility = verdict.visibility;
            result.fingerprint = verdict.fingerprint;
            result.gate_bypass = verdict.bypass;
            let mut metadata = verdict.metadata.unwrap_or_else(|| serde_json::json!({}));
            if let Some(previous) = verdict.previous_scrape_at {
                metadata["previous_scrape_at"] = serde_json::json!(previous);
            }
            if let Some(check_error) = verdict.check_error {
                metadata["check_error"] = serde_json::json!(check_error);
            }
            result.change_metadata = metadata
                .as_object()
                .is_some_and(|m| !m.is_empty())
                .then_some(metadata);
        }

        match execution.processed {
            Ok(None) => {
                result.outcome = Some(AttemptOutcome::Skipped);
                (result, None)
            }
            Ok(Some(processed)) => {
                result.outcome = Some(AttemptOutcome::Succeeded);
                result.records_count = Some(processed.records.len() as u32);
                result.records = Some(serde_json::Value::Array(processed.records));
                result.asset_error = processed.asset_error;
                (result, None)
            }
            Err(e) => {
                let class = e.failure_class();
                let retry = &self.orchestrator.config().retry;
                if class == FailureClass::Fatal {
                    result.outcome = Some(AttemptOutcome::FailedFatal);
                    result.error = Some(e.to_string());
                    (result, None)
                } else if retry.can_retry(job.attempt_number) {
                    result.outcome = Some(AttemptOutcome::FailedRetryable);
                    result.error = Some(e.to_string());
                    (result, Some(class))
                } else {
                    result.outcome = Some(AttemptOutcome::FailedFatal);
                    result.error = Some(format!(
                        "{e} (gave up after {} attempts)",
                        retry.max_attempts
                    ));
                    (result, None)
                }
            }
        }
    }

    /// Derive the source status from its latest attempts.
    async fn update_lifecycle<WR: WorkerReporter>(
        &self,
        source: &MonitoredSource,
        reporter: &WR,
    ) -> Result<(), AppError> {
        let config = self.orchestrator.config();
        let window = config
            .removed_threshold
            .max(config.degrade_after_fatal)
            .max(config.disable_after_fatal)
            .max(1) as usize;
        let recent = self.store().recent_for(&source.id, window).await?;

        let next = next_status(
            source.status,
            &recent,
            config.removed_threshold,
            config.degrade_after_fatal,
            config.disable_after_fatal,
        );
        if next != source.status {
            self.store().set_source_status(&source.id, next).await?;
            reporter.report(WorkerEvent::SourceStatusChanged {
                source_id: &source.id,
                from: source.status,
                to: next,
            });
        }
        Ok(())
    }
}

fn streak(recent: &[Attempt], pred: impl Fn(&Attempt) -> bool) -> u32 {
    recent.iter().take_while(|a| pred(a)).count() as u32
}

/// Lifecycle transition given the newest-first terminal attempts of a source.
///
/// A threshold of 0 turns that rule off.
fn next_status(
    current: SourceStatus,
    recent: &[Attempt],
    removed_threshold: u32,
    degrade_after_fatal: u32,
    disable_after_fatal: u32,
) -> SourceStatus {
    let removed = streak(recent, |a| a.change_status == Some(ChangeStatus::Removed));
    let fatal = streak(recent, |a| a.outcome == Some(AttemptOutcome::FailedFatal));

    if disable_after_fatal > 0 && fatal >= disable_after_fatal {
        return SourceStatus::Disabled;
    }
    if (removed_threshold > 0 && removed >= removed_threshold)
        || (degrade_after_fatal > 0 && fatal >= degrade_after_fatal)
    {
        return SourceStatus::Degraded;
    }

    let healthy = recent.first().is_some_and(|a| {
        matches!(
            a.outcome,
            Some(AttemptOutcome::Succeeded) | Some(AttemptOutcome::Skipped)
        ) && a.change_status != Some(ChangeStatus::Removed)
    });
    if current == SourceStatus::Degraded && healthy {
        SourceStatus::Active
    } else {
        current
    }
}
