//! Schedule dispatcher: turns due schedules into submissions on a fixed tick.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::DispatcherConfig;
use crate::error::AppError;
use crate::orchestrator::{Orchestrator, RejectReason, SubmitOutcome, SubmitRequest};
use crate::schedule::DueSchedule;
use crate::traits::{DispatchLock, ScheduleStore, Store};

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub enqueued: u32,
    /// Source already held by another attempt; schedule left untouched.
    pub skipped_claimed: u32,
    /// Source disabled or unknown at submit time.
    pub skipped_disabled: u32,
    /// Schedule could not be evaluated or submitted; logged and isolated.
    pub failed: u32,
    /// Another dispatcher held the lock; nothing was done.
    pub lock_contended: bool,
}

enum Dispatched {
    Enqueued,
    Rejected(RejectReason),
}

pub struct Dispatcher<S: Store, L: DispatchLock> {
    orchestrator: Orchestrator<S>,
    lock: L,
    config: DispatcherConfig,
}

impl<S: Store, L: DispatchLock> Dispatcher<S, L> {
    pub fn new(orchestrator: Orchestrator<S>, lock: L, config: DispatcherConfig) -> Self {
        Self {
            orchestrator,
            lock,
            config,
        }
    }

    /// Submit every due schedule once and advance it.
    ///
    /// Runs only while holding the dispatch lock. A failing schedule never
    /// stops the others.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport, AppError> {
        if !self.lock.try_lock().await? {
            tracing::info!("Another dispatcher holds the tick lock, skipping");
            return Ok(TickReport {
                lock_contended: true,
                ..TickReport::default()
            });
        }

        let result = self.tick_locked(now).await;

        if let Err(e) = self.lock.unlock().await {
            tracing::error!(error = %e, "Failed to release dispatch lock");
        }
        result
    }

    async fn tick_locked(&self, now: DateTime<Utc>) -> Result<TickReport, AppError> {
        let store = self.orchestrator.store();
        let due = store
            .due_schedules(now, self.orchestrator.stale_after())
            .await?;

        let mut report = TickReport::default();
        for item in &due {
            match self.dispatch_one(item, now).await {
                Ok(Dispatched::Enqueued) => report.enqueued += 1,
                Ok(Dispatched::Rejected(RejectReason::AlreadyClaimed)) => {
                    report.skipped_claimed += 1
                }
                Ok(Dispatched::Rejected(_)) => report.skipped_disabled += 1,
                Err(e) => {
                    tracing::error!(
                        schedule_id = %item.schedule.id,
                        source_id = %item.source.id,
                        error = %e,
                        "Failed to dispatch schedule"
                    );
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            due = due.len(),
            enqueued = report.enqueued,
            skipped_claimed = report.skipped_claimed,
            skipped_disabled = report.skipped_disabled,
            failed = report.failed,
            "Dispatcher tick complete"
        );
        Ok(report)
    }

    async fn dispatch_one(
        &self,
        item: &DueSchedule,
        now: DateTime<Utc>,
    ) -> Result<Dispatched, AppError> {
        let schedule = &item.schedule;
        // Evaluate before submitting so a broken spec never leaves a claimed job behind.
        let next_due = schedule.spec.advance(schedule.next_due_at, now)?;

        let outcome = self
            .orchestrator
            .submit(SubmitRequest::scheduled(&schedule.source_id, schedule.id), now)
            .await?;
        if let SubmitOutcome::Rejected(reason) = outcome {
            tracing::debug!(schedule_id = %schedule.id, %reason, "Schedule not submitted");
            return Ok(Dispatched::Rejected(reason));
        }

        let advanced = self
            .orchestrator
            .store()
            .advance_schedule(schedule.id, schedule.next_due_at, next_due, now)
            .await?;
        if advanced {
            tracing::debug!(schedule_id = %schedule.id, %next_due, "Schedule advanced");
        } else {
            tracing::warn!(schedule_id = %schedule.id, "Schedule was advanced concurrently");
        }
        Ok(Dispatched::Enqueued)
    }

    /// Tick on the configured period until cancelled.
    pub async fn run(&self, cancel_token: CancellationToken) -> Result<(), AppError> {
        tracing::info!(
            tick_secs = self.config.tick_interval.as_secs(),
            "Dispatcher started"
        );
        loop {
            if let Err(e) = self.tick(Utc::now()).await {
                tracing::error!(error = %e, "Dispatcher tick failed");
            }
            tokio::select! {
                () = tokio::time::sleep(self.config.tick_interval) => {}
                () = cancel_token.cancelled() => break,
            }
        }
        tracing::info!("Dispatcher stopped");
        Ok(())
    }
}
