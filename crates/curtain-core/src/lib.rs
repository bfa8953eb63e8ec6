pub mod config;
pub mod dispatcher;
pub mod error;
pub mod gate;
pub mod import;
pub mod job;
pub mod memory;
pub mod models;
pub mod orchestrator;
pub mod schedule;
pub mod traits;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::{Coordination, CoreConfig, DispatcherConfig, OrchestratorConfig};
pub use dispatcher::{Dispatcher, TickReport};
pub use error::{AppError, FailureClass};
pub use gate::{ChangeGate, GateAction, GateVerdict};
pub use job::{Job, JobStatus, Lane, NewJob};
pub use models::{
    Attempt, AttemptFilter, AttemptOutcome, ChangeStatus, FetchConfig, FetchStrategy,
    MonitoredSource, SourceStatus, TriggerKind, compute_hash,
};
pub use orchestrator::{
    Orchestrator, RejectReason, RetryPolicy, SubmitOutcome, SubmitRequest, TracingWorkerReporter,
    WorkerPool, WorkerReporter,
};
pub use schedule::{IntervalSpec, NewSchedule, Schedule, ScheduleSpec};
pub use traits::{
    AssetStore, DispatchLock, Extractor, ExternallySerialized, NullAssets, PageSource, Store,
};
