use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::TriggerKind;

/// Status of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    /// A delayed retry found the source claimed by a newer attempt.
    Superseded,
    /// The claim expired while the job was running (worker crash or hang).
    Abandoned,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Superseded => "superseded",
            JobStatus::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Superseded | JobStatus::Abandoned
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "superseded" => Ok(JobStatus::Superseded),
            "abandoned" => Ok(JobStatus::Abandoned),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Queue lane. Priority jobs are taken before any normal job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    Priority,
    Normal,
}

impl Lane {
    /// Sort key used by the queues: lower runs first.
    pub fn rank(&self) -> i16 {
        match self {
            Lane::Priority => 0,
            Lane::Normal => 1,
        }
    }

    pub fn from_rank(rank: i16) -> Self {
        if rank <= 0 {
            Lane::Priority
        } else {
            Lane::Normal
        }
    }
}

/// An accepted submission waiting for (or running on) a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub source_id: String,
    pub schedule_id: Option<Uuid>,
    pub trigger: TriggerKind,
    pub attempt_number: u32,
    /// Held claim for first submissions; `None` for delayed retries, which
    /// claim the source when they come due.
    pub claim_token: Option<Uuid>,
    pub lane: Lane,
    /// Set on retries whose chain already passed the change gate.
    pub gate_passed: bool,
    pub status: JobStatus,
    pub run_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
}

impl Job {
    pub fn is_retry(&self) -> bool {
        self.attempt_number > 1
    }
}

/// Request to enqueue a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub source_id: String,
    pub schedule_id: Option<Uuid>,
    pub trigger: TriggerKind,
    pub attempt_number: u32,
    pub claim_token: Option<Uuid>,
    pub lane: Lane,
    pub gate_passed: bool,
    pub run_after: DateTime<Utc>,
}

impl NewJob {
    pub fn new(
        source_id: impl Into<String>,
        trigger: TriggerKind,
        run_after: DateTime<Utc>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            schedule_id: None,
            trigger,
            attempt_number: 1,
            claim_token: None,
            lane: Lane::Normal,
            gate_passed: false,
            run_after,
        }
    }

    pub fn with_schedule(mut self, schedule_id: Option<Uuid>) -> Self {
        self.schedule_id = schedule_id;
        self
    }

    pub fn with_claim(mut self, token: Uuid) -> Self {
        self.claim_token = Some(token);
        self
    }

    pub fn with_lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }

    pub fn with_attempt_number(mut self, attempt_number: u32) -> Self {
        self.attempt_number = attempt_number;
        self
    }

    pub fn with_gate_passed(mut self, gate_passed: bool) -> Self {
        self.gate_passed = gate_passed;
        self
    }
}
