//! In-process store with the same conditional semantics as the SQL store.
//!
//! Every operation runs under one mutex, which makes each call atomic the way
//! a single SQL statement is. Used by tests and single-process runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobStatus, NewJob};
use crate::models::{
    Attempt, AttemptFilter, AttemptOutcome, AttemptResult, MonitoredSource, NewAttempt,
    SourceStatus,
};
use crate::schedule::{DueSchedule, NewSchedule, Schedule};
use crate::traits::{
    AttemptLedger, Claim, ClaimStore, DispatchLock, JobQueue, ScheduleStore, SourceStore,
};

#[derive(Default)]
struct Inner {
    sources: BTreeMap<String, MonitoredSource>,
    schedules: Vec<Schedule>,
    claims: HashMap<String, Claim>,
    attempts: Vec<Attempt>,
    jobs: Vec<Job>,
}

impl Inner {
    fn schedule_mut(&mut self, id: Uuid) -> Option<&mut Schedule> {
        self.schedules.iter_mut().find(|s| s.id == id)
    }

    fn clear_mirror(&mut self, token: Uuid) {
        for schedule in self.schedules.iter_mut() {
            if schedule.claim_token == Some(token) {
                schedule.claim_token = None;
                schedule.last_claimed_at = None;
            }
        }
    }

    /// Matching attempts ordered newest first (start time, then insertion).
    fn newest_first(&self, pred: impl Fn(&Attempt) -> bool) -> Vec<Attempt> {
        let mut matching: Vec<(usize, &Attempt)> = self
            .attempts
            .iter()
            .enumerate()
            .filter(|(_, a)| pred(a))
            .collect();
        matching.sort_by(|(ia, a), (ib, b)| b.started_at.cmp(&a.started_at).then(ib.cmp(ia)));
        matching.into_iter().map(|(_, a)| a.clone()).collect()
    }

    /// A claim held by a job still waiting in the queue never goes stale;
    /// its clock starts when a worker picks the job up.
    fn claim_is_live(&self, claim: &Claim, now: DateTime<Utc>, stale_after: TimeDelta) -> bool {
        now - claim.claimed_at < stale_after
            || self
                .jobs
                .iter()
                .any(|j| j.status == JobStatus::Pending && j.claim_token == Some(claim.token))
    }
}


#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SourceStore for MemoryStore {
    async fn upsert_source(&self, source: &MonitoredSource) -> Result<MonitoredSource, AppError> {
        let mut inner = self.lock();
        let stored = match inner.sources.get(&source.id) {
            Some(existing) => MonitoredSource {
                status: existing.status,
                created_at: existing.created_at,
                updated_at: Utc::now(),
                ..source.clone()
            },
            None => source.clone(),
        };
        inner.sources.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_source(&self, id: &str) -> Result<Option<MonitoredSource>, AppError> {
        Ok(self.lock().sources.get(id).cloned())
    }

    async fn list_sources(&self) -> Result<Vec<MonitoredSource>, AppError> {
        Ok(self.lock().sources.values().cloned().collect())
    }

    async fn set_source_enabled(&self, id: &str, enabled: bool) -> Result<(), AppError> {
        let mut inner = self.lock();
        let source = inner
            .sources
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("source {id}")))?;
        source.enabled = enabled;
        source.updated_at = Utc::now();
        Ok(())
    }

    async fn set_source_status(&self, id: &str, status: SourceStatus) -> Result<(), AppError> {
        let mut inner = self.lock();
        let source = inner
            .sources
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("source {id}")))?;
        source.status = status;
        source.updated_at = Utc::now();
        Ok(())
    }
}

impl ScheduleStore for MemoryStore {
    async fn create_schedule(
        &self,
        schedule: NewSchedule,
        next_due_at: DateTime<Utc>,
    ) -> Result<Schedule, AppError> {
        let mut inner = self.lock();
        if !inner.sources.contains_key(&schedule.source_id) {
            return Err(AppError::NotFound(format!("source {}", schedule.source_id)));
        }
        let now = Utc::now();
        let created = Schedule {
            id: Uuid::new_v4(),
            source_id: schedule.source_id,
            spec: schedule.spec,
            enabled: schedule.enabled,
            next_due_at,
            last_run_at: None,
            last_claimed_at: None,
            claim_token: None,
            created_at: now,
            updated_at: now,
        };
        inner.schedules.push(created.clone());
        Ok(created)
    }

    async fn get_schedule(&self, id: Uuid) -> Result<Option<Schedule>, AppError> {
        Ok(self.lock().schedules.iter().find(|s| s.id == id).cloned())
    }

    async fn list_schedules(&self, source_id: Option<&str>) -> Result<Vec<Schedule>, AppError> {
        Ok(self
            .lock()
            .schedules
            .iter()
            .filter(|s| source_id.is_none_or(|id| s.source_id == id))
            .cloned()
            .collect())
    }

    async fn set_schedule_enabled(&self, id: Uuid, enabled: bool) -> Result<(), AppError> {
        let mut inner = self.lock();
        let schedule = inner
            .schedule_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("schedule {id}")))?;
        schedule.enabled = enabled;
        schedule.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_schedule(&self, id: Uuid) -> Result<bool, AppError> {
        let mut inner = self.lock();
        let before = inner.schedules.len();
        inner.schedules.retain(|s| s.id != id);
        Ok(inner.schedules.len() != before)
    }

    async fn due_schedules(
        &self,
        now: DateTime<Utc>,
        stale_after: TimeDelta,
    ) -> Result<Vec<DueSchedule>, AppError> {
        let inner = self.lock();
        let mut due: Vec<DueSchedule> = inner
            .schedules
            .iter()
            .filter_map(|schedule| {
                let source = inner.sources.get(&schedule.source_id)?;
                schedule
                    .is_due(source, now, stale_after)
                    .then(|| DueSchedule {
                        schedule: schedule.clone(),
                        source: source.clone(),
                    })
            })
            .collect();
        due.sort_by_key(|d| d.schedule.next_due_at);
        Ok(due)
    }

    async fn advance_schedule(
        &self,
        id: Uuid,
        expected_due: DateTime<Utc>,
        next_due_at: DateTime<Utc>,
        ran_at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut inner = self.lock();
        match inner.schedule_mut(id) {
            Some(schedule) if schedule.next_due_at == expected_due => {
                schedule.next_due_at = next_due_at;
                schedule.last_run_at = Some(ran_at);
                schedule.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

impl ClaimStore for MemoryStore {
    async fn try_claim(
        &self,
        source_id: &str,
        schedule_id: Option<Uuid>,
        now: DateTime<Utc>,
        stale_after: TimeDelta,
    ) -> Result<Option<Claim>, AppError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.claims.get(source_id) {
            if inner.claim_is_live(existing, now, stale_after) {
                return Ok(None);
            }
            let token = existing.token;
            inner.clear_mirror(token);
        }

        let claim = Claim {
            source_id: source_id.to_string(),
            token: Uuid::new_v4(),
            claimed_at: now,
            schedule_id,
        };
        inner.claims.insert(source_id.to_string(), claim.clone());
        if let Some(schedule) = schedule_id.and_then(|id| inner.schedule_mut(id)) {
            schedule.last_claimed_at = Some(now);
            schedule.claim_token = Some(claim.token);
        }
        Ok(Some(claim))
    }

    async fn refresh_claim(
        &self,
        source_id: &str,
        token: Uuid,
        now: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let mut inner = self.lock();
        let schedule_id = match inner.claims.get_mut(source_id) {
            Some(claim) if claim.token == token => {
                claim.claimed_at = now;
                claim.schedule_id
            }
            _ => return Ok(false),
        };
        if let Some(schedule) = schedule_id.and_then(|id| inner.schedule_mut(id)) {
            schedule.last_claimed_at = Some(now);
        }
        Ok(true)
    }

    async fn release_claim(&self, source_id: &str, token: Uuid) -> Result<bool, AppError> {
        let mut inner = self.lock();
        let owned = inner
            .claims
            .get(source_id)
            .is_some_and(|claim| claim.token == token);
        if owned {
            inner.claims.remove(source_id);
            inner.clear_mirror(token);
        }
        Ok(owned)
    }

    async fn current_claim(&self, source_id: &str) -> Result<Option<Claim>, AppError> {
        Ok(self.lock().claims.get(source_id).cloned())
    }

    async fn stale_claims(
        &self,
        now: DateTime<Utc>,
        stale_after: TimeDelta,
    ) -> Result<Vec<Claim>, AppError> {
        let inner = self.lock();
        Ok(inner
            .claims
            .values()
            .filter(|c| !inner.claim_is_live(c, now, stale_after))
            .cloned()
            .collect())
    }
}

impl AttemptLedger for MemoryStore {
    async fn begin_attempt(&self, attempt: &NewAttempt) -> Result<Uuid, AppError> {
        let id = Uuid::new_v4();
        self.lock().attempts.push(Attempt {
            id,
            source_id: attempt.source_id.clone(),
            schedule_id: attempt.schedule_id,
            trigger: attempt.trigger,
            attempt_number: attempt.attempt_number,
            claim_token: attempt.claim_token,
            started_at: attempt.started_at,
            finished_at: None,
            change_status: None,
            visibility: None,
            fingerprint: None,
            change_metadata: None,
            gate_bypass: None,
            outcome: None,
            error: None,
            records: None,
            records_count: None,
            asset_error: None,
        });
        Ok(id)
    }

    async fn finish_attempt(&self, id: Uuid, result: &AttemptResult) -> Result<bool, AppError> {
        if result.outcome.is_none() {
            return Err(AppError::Generic(format!(
                "attempt {id} cannot be finished without an outcome"
            )));
        }
        let mut inner = self.lock();
        let attempt = inner
            .attempts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| AppError::NotFound(format!("attempt {id}")))?;
        if attempt.is_terminal() {
            return Ok(false);
        }
        attempt.finished_at = Some(result.finished_at);
        attempt.change_status = result.change_status;
        attempt.visibility = result.visibility;
        attempt.fingerprint = result.fingerprint.clone();
        attempt.change_metadata = result.change_metadata.clone();
        attempt.gate_bypass = result.gate_bypass;
        attempt.outcome = result.outcome;
        attempt.error = result.error.clone();
        attempt.records = result.records.clone();
        attempt.records_count = result.records_count;
        attempt.asset_error = result.asset_error.clone();
        Ok(true)
    }

    async fn get_attempt(&self, id: Uuid) -> Result<Option<Attempt>, AppError> {
        Ok(self.lock().attempts.iter().find(|a| a.id == id).cloned())
    }

    async fn latest_for(&self, source_id: &str) -> Result<Option<Attempt>, AppError> {
        Ok(self
            .lock()
            .newest_first(|a| a.source_id == source_id)
            .into_iter()
            .next())
    }

    async fn baseline_for(&self, source_id: &str) -> Result<Option<Attempt>, AppError> {
        Ok(self
            .lock()
            .newest_first(|a| a.source_id == source_id && a.is_baseline())
            .into_iter()
            .next())
    }

    async fn recent_for(&self, source_id: &str, limit: usize) -> Result<Vec<Attempt>, AppError> {
        let mut recent = self
            .lock()
            .newest_first(|a| a.source_id == source_id && a.is_terminal());
        recent.truncate(limit);
        Ok(recent)
    }

    async fn list_attempts(&self, filter: &AttemptFilter) -> Result<Vec<Attempt>, AppError> {
        let mut attempts = self.lock().newest_first(|a| filter.matches(a));
        attempts.truncate(filter.limit);
        Ok(attempts)
    }

    async fn abandon_attempts(
        &self,
        claim_token: Uuid,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut inner = self.lock();
        let mut closed = 0;
        for attempt in inner
            .attempts
            .iter_mut()
            .filter(|a| a.claim_token == claim_token && !a.is_terminal())
        {
            attempt.outcome = Some(AttemptOutcome::FailedRetryable);
            attempt.error = Some(detail.to_string());
            attempt.finished_at = Some(now);
            closed += 1;
        }
        Ok(closed)
    }
}

impl JobQueue for MemoryStore {
    async fn enqueue(&self, job: NewJob) -> Result<Job, AppError> {
        let job = Job {
            id: Uuid::new_v4(),
            source_id: job.source_id,
            schedule_id: job.schedule_id,
            trigger: job.trigger,
            attempt_number: job.attempt_number,
            claim_token: job.claim_token,
            lane: job.lane,
            gate_passed: job.gate_passed,
            status: JobStatus::Pending,
            run_after: job.run_after,
            created_at: Utc::now(),
            started_at: None,
            worker_id: None,
        };
        self.lock().jobs.push(job.clone());
        Ok(job)
    }

    async fn claim_next_job(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, AppError> {
        let mut inner = self.lock();
        let next = inner
            .jobs
            .iter_mut()
            .enumerate()
            .filter(|(_, j)| j.status == JobStatus::Pending && j.run_after <= now)
            .min_by_key(|(i, j)| (j.lane.rank(), j.run_after, j.created_at, *i))
            .map(|(_, j)| j);

        Ok(next.map(|job| {
            job.status = JobStatus::Running;
            job.started_at = Some(now);
            job.worker_id = Some(worker_id.to_string());
            job.clone()
        }))
    }

    async fn finish_job(&self, job_id: Uuid, status: JobStatus) -> Result<(), AppError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))?;
        job.status = status;
        Ok(())
    }

    async fn attach_claim(&self, job_id: Uuid, claim_token: Uuid) -> Result<(), AppError> {
        let mut inner = self.lock();
        let job = inner
            .jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or_else(|| AppError::NotFound(format!("job {job_id}")))?;
        job.claim_token = Some(claim_token);
        Ok(())
    }

    async fn abandon_jobs(&self, claim_token: Uuid) -> Result<u64, AppError> {
        let mut inner = self.lock();
        let mut abandoned = 0;
        for job in inner
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Running && j.claim_token == Some(claim_token))
        {
            job.status = JobStatus::Abandoned;
            abandoned += 1;
        }
        Ok(abandoned)
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let mut inner = self.lock();
        let mut released = 0;
        for job in inner.jobs.iter_mut().filter(|j| {
            j.status == JobStatus::Running && j.worker_id.as_deref() == Some(worker_id)
        }) {
            job.status = JobStatus::Pending;
            job.started_at = None;
            job.worker_id = None;
            released += 1;
        }
        Ok(released)
    }

    async fn count_pending(&self) -> Result<i64, AppError> {
        Ok(self
            .lock()
            .jobs
            .iter()
            .filter(|j| j.status == JobStatus::Pending)
            .count() as i64)
    }
}

/// Dispatch lock for several dispatchers inside one process.
#[derive(Clone, Default)]
pub struct LocalDispatchLock {
    held: Arc<AtomicBool>,
}

impl LocalDispatchLock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DispatchLock for LocalDispatchLock {
    async fn try_lock(&self) -> Result<bool, AppError> {
        Ok(self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    async fn unlock(&self) -> Result<(), AppError> {
        self.held.store(false, Ordering::Release);
        Ok(())
    }
}
