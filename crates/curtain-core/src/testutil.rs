//! Test utilities: mock capabilities and seeded stores.
//!
//! Handwritten mocks for dependency injection in unit tests. Mocks share
//! state through `Arc`, so a clone handed to the worker pool records calls
//! the test can assert on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::error::AppError;
use crate::memory::MemoryStore;
use crate::models::{
    Attempt, AttemptOutcome, ChangeStatus, FetchConfig, FetchStrategy, MonitoredSource,
    SourceStatus, TriggerKind,
};
use crate::orchestrator::{WorkerEvent, WorkerReporter};
use crate::traits::{AssetStore, ChangeCheck, Extractor, PageContent, PageSource, SourceStore};

pub fn sample_source(id: &str) -> MonitoredSource {
    let now = Utc::now();
    MonitoredSource {
        id: id.to_string(),
        label: id.replace('-', " "),
        enabled: true,
        status: SourceStatus::Active,
        fetch: FetchConfig {
            strategy: FetchStrategy::SingleUrl {
                url: format!("https://{id}.example/shows"),
            },
            params: serde_json::Value::Null,
            change_tracking: true,
        },
        created_at: now,
        updated_at: now,
    }
}

pub async fn seeded_store(ids: &[&str]) -> MemoryStore {
    let store = MemoryStore::new();
    for id in ids {
        store.upsert_source(&sample_source(id)).await.unwrap();
    }
    store
}

pub fn check_with_status(status: ChangeStatus) -> ChangeCheck {
    ChangeCheck {
        status: Some(status),
        fingerprint: Some(format!("fp-{status}")),
        ..ChangeCheck::default()
    }
}

pub fn terminal_attempt(outcome: AttemptOutcome, change_status: Option<ChangeStatus>) -> Attempt {
    let now = Utc::now();
    Attempt {
        id: Uuid::new_v4(),
        source_id: "palace-theatre".into(),
        schedule_id: None,
        trigger: TriggerKind::Scheduled,
        attempt_number: 1,
        claim_token: Uuid::new_v4(),
        started_at: now,
        finished_at: Some(now),
        change_status,
        visibility: None,
        fingerprint: None,
        change_metadata: None,
        gate_bypass: None,
        outcome: Some(outcome),
        error: None,
        records: None,
        records_count: None,
        asset_error: None,
    }
}

// ---------------------------------------------------------------------------
// MockPageSource
// ---------------------------------------------------------------------------

/// Page source with queued check results and a configurable fetch.
#[derive(Clone)]
pub struct MockPageSource {
    /// Each check pops the first element; when empty, `default_check` is returned.
    checks: Arc<Mutex<Vec<Result<ChangeCheck, AppError>>>>,
    default_check: ChangeCheck,
    fetch_error: Option<fn() -> AppError>,
    /// How many fetches fail before they start succeeding; `None` fails all.
    fetch_failures: Option<usize>,
    fetch_delay: Option<Duration>,
    check_calls: Arc<AtomicUsize>,
    fetch_calls: Arc<AtomicUsize>,
}

impl Default for MockPageSource {
    fn default() -> Self {
        Self {
            checks: Arc::new(Mutex::new(Vec::new())),
            default_check: check_with_status(ChangeStatus::Changed),
            fetch_error: None,
            fetch_failures: None,
            fetch_delay: None,
            check_calls: Arc::new(AtomicUsize::new(0)),
            fetch_calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockPageSource {
    pub fn with_checks(checks: Vec<Result<ChangeCheck, AppError>>) -> Self {
        Self {
            checks: Arc::new(Mutex::new(checks)),
            ..Self::default()
        }
    }

    /// Every fetch fails with a fresh error from `make`.
    pub fn always_failing_fetch(make: fn() -> AppError) -> Self {
        Self {
            fetch_error: Some(make),
            ..Self::default()
        }
    }

    /// The first `times` fetches fail with an error from `make`.
    pub fn failing_fetches(times: usize, make: fn() -> AppError) -> Self {
        Self {
            fetch_error: Some(make),
            fetch_failures: Some(times),
            ..Self::default()
        }
    }

    pub fn with_queued_checks(mut self, checks: Vec<Result<ChangeCheck, AppError>>) -> Self {
        self.checks = Arc::new(Mutex::new(checks));
        self
    }

    pub fn with_default_check(mut self, check: ChangeCheck) -> Self {
        self.default_check = check;
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = Some(delay);
        self
    }

    pub fn check_count(&self) -> usize {
        self.check_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

impl PageSource for MockPageSource {
    async fn check(&self, _source: &MonitoredSource) -> Result<ChangeCheck, AppError> {
        self.check_calls.fetch_add(1, Ordering::SeqCst);
        let mut checks = self.checks.lock().unwrap();
        if checks.is_empty() {
            Ok(self.default_check.clone())
        } else {
            checks.remove(0)
        }
    }

    async fn fetch(&self, source: &MonitoredSource) -> Result<PageContent, AppError> {
        let previous = self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(make) = self.fetch_error {
            if self.fetch_failures.is_none_or(|times| previous < times) {
                return Err(make());
            }
        }
        let pages = source.fetch.strategy.urls().len() as u32;
        Ok(PageContent {
            markdown: format!("# {}\n\nNow playing", source.label),
            pages_requested: pages,
            pages_succeeded: pages,
            errors: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Extractor that returns the same records on every call.
#[derive(Clone)]
pub struct MockExtractor {
    records: Vec<serde_json::Value>,
    /// Returned (once) instead of the records.
    error: Arc<Mutex<Option<AppError>>>,
    calls: Arc<AtomicUsize>,
}

impl MockExtractor {
    pub fn new(records: Vec<serde_json::Value>) -> Self {
        Self {
            records,
            error: Arc::new(Mutex::new(None)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_error(error: AppError) -> Self {
        Self {
            error: Arc::new(Mutex::new(Some(error))),
            ..Self::new(Vec::new())
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Extractor for MockExtractor {
    async fn extract(
        &self,
        _source: &MonitoredSource,
        _content: &str,
    ) -> Result<Vec<serde_json::Value>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(self.records.clone())
    }
}

// ---------------------------------------------------------------------------
// MockAssets
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MockAssets {
    error: Option<String>,
}

impl MockAssets {
    pub fn passthrough() -> Self {
        Self { error: None }
    }

    pub fn with_error(error: AppError) -> Self {
        Self {
            error: Some(error.to_string()),
        }
    }
}

impl AssetStore for MockAssets {
    async fn store_assets(
        &self,
        _source: &MonitoredSource,
        records: Vec<serde_json::Value>,
    ) -> Result<Vec<serde_json::Value>, AppError> {
        match &self.error {
            Some(message) => Err(AppError::Generic(message.clone())),
            None => Ok(records),
        }
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Reporter that records the kind of every event.
#[derive(Default)]
pub struct MockReporter {
    events: Mutex<Vec<&'static str>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|k| **k == kind)
            .count()
    }

    pub fn superseded(&self) -> usize {
        self.count("job_superseded")
    }

    pub fn status_changes(&self) -> usize {
        self.count("source_status_changed")
    }

    pub fn stopped(&self) -> usize {
        self.count("stopped")
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let kind = match event {
            WorkerEvent::Started { .. } => "started",
            WorkerEvent::Polling { .. } => "polling",
            WorkerEvent::JobClaimed { .. } => "job_claimed",
            WorkerEvent::JobSuperseded { .. } => "job_superseded",
            WorkerEvent::AttemptStarted { .. } => "attempt_started",
            WorkerEvent::GateDecided { .. } => "gate_decided",
            WorkerEvent::AttemptFinished { .. } => "attempt_finished",
            WorkerEvent::RetryScheduled { .. } => "retry_scheduled",
            WorkerEvent::SourceStatusChanged { .. } => "source_status_changed",
            WorkerEvent::Reaped { .. } => "reaped",
            WorkerEvent::ShuttingDown { .. } => "shutting_down",
            WorkerEvent::Stopped { .. } => "stopped",
        };
        self.events.lock().unwrap().push(kind);
    }
}
