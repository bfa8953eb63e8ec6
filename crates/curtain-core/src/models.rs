use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum persisted as text.
macro_rules! text_enum {
    ($ty:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_lowercase().as_str() {
                    $($text => Ok($ty::$variant),)+
                    _ => Err(format!("Unknown {}: {}", $label, s)),
                }
            }
        }
    };
}

/// Lifecycle status of a monitored source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    Active,
    /// Still checked every tick, but something looks wrong (page gone, fatal streak).
    Degraded,
    /// Soft-disabled; never dispatched until an operator re-enables it.
    Disabled,
}

text_enum!(SourceStatus, "source status", {
    Active => "active",
    Degraded => "degraded",
    Disabled => "disabled",
});

/// How the page source should reach a venue. Opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FetchStrategy {
    SingleUrl {
        url: String,
    },
    /// A single page that needs browser actions (clicks, scrolls) before it renders.
    SingleUrlWithActions {
        url: String,
        #[serde(default)]
        actions: Vec<serde_json::Value>,
    },
    MultiUrl {
        urls: Vec<String>,
    },
}

impl FetchStrategy {
    /// The one canonical URL whose changes represent the whole source, if any.
    pub fn canonical_url(&self) -> Option<&str> {
        match self {
            FetchStrategy::SingleUrl { url } | FetchStrategy::SingleUrlWithActions { url, .. } => {
                Some(url)
            }
            FetchStrategy::MultiUrl { .. } => None,
        }
    }

    pub fn urls(&self) -> Vec<&str> {
        match self {
            FetchStrategy::SingleUrl { url } | FetchStrategy::SingleUrlWithActions { url, .. } => {
                vec![url.as_str()]
            }
            FetchStrategy::MultiUrl { urls } => urls.iter().map(String::as_str).collect(),
        }
    }
}

/// Source-specific fetch configuration passed through to the page source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    pub strategy: FetchStrategy,
    /// Extra scrape parameters (wait times, headers, ...) forwarded verbatim.
    #[serde(default)]
    pub params: serde_json::Value,
    /// When false, every scheduled attempt goes straight to full processing.
    #[serde(default = "default_true")]
    pub change_tracking: bool,
}

fn default_true() -> bool {
    true
}

/// One scraped venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredSource {
    pub id: String,
    pub label: String,
    pub enabled: bool,
    pub status: SourceStatus,
    pub fetch: FetchConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MonitoredSource {
    /// Whether the dispatcher and orchestrator may run this source at all.
    pub fn is_runnable(&self) -> bool {
        self.enabled && self.status != SourceStatus::Disabled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Manual,
    Scheduled,
}

text_enum!(TriggerKind, "trigger kind", {
    Manual => "manual",
    Scheduled => "scheduled",
});

/// Result of the cheap change check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    New,
    Same,
    Changed,
    Removed,
    Error,
}

text_enum!(ChangeStatus, "change status", {
    New => "new",
    Same => "same",
    Changed => "changed",
    Removed => "removed",
    Error => "error",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Visible,
    Hidden,
}

text_enum!(Visibility, "visibility", {
    Visible => "visible",
    Hidden => "hidden",
});

/// Terminal outcome of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptOutcome {
    Skipped,
    Succeeded,
    FailedRetryable,
    FailedFatal,
}

text_enum!(AttemptOutcome, "attempt outcome", {
    Skipped => "skipped",
    Succeeded => "succeeded",
    FailedRetryable => "failed-retryable",
    FailedFatal => "failed-fatal",
});

impl AttemptOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::FailedRetryable | AttemptOutcome::FailedFatal
        )
    }
}

/// Why the change gate was not consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateBypass {
    ManualTrigger,
    TrackingDisabled,
    /// Multi-page strategies have no single page whose changes stand for the source.
    NoCanonicalPage,
    /// A retry of an attempt that already passed the gate.
    PassedBeforeRetry,
}

text_enum!(GateBypass, "gate bypass", {
    ManualTrigger => "manual_trigger",
    TrackingDisabled => "tracking_disabled",
    NoCanonicalPage => "no_canonical_page",
    PassedBeforeRetry => "passed_before_retry",
});

/// One record of a single execution. Immutable once `outcome` is set.
#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub id: Uuid,
    pub source_id: String,
    pub schedule_id: Option<Uuid>,
    pub trigger: TriggerKind,
    /// 1-based position within a retry chain.
    pub attempt_number: u32,
    pub claim_token: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub change_status: Option<ChangeStatus>,
    pub visibility: Option<Visibility>,
    pub fingerprint: Option<String>,
    pub change_metadata: Option<serde_json::Value>,
    pub gate_bypass: Option<GateBypass>,
    /// `None` while the attempt is still running.
    pub outcome: Option<AttemptOutcome>,
    pub error: Option<String>,
    pub records: Option<serde_json::Value>,
    pub records_count: Option<u32>,
    /// Asset handling failed but the attempt itself succeeded.
    pub asset_error: Option<String>,
}

impl Attempt {
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }

    pub fn duration(&self) -> Option<TimeDelta> {
        self.finished_at.map(|end| end - self.started_at)
    }

    /// Whether this attempt may serve as the change-detection baseline.
    pub fn is_baseline(&self) -> bool {
        self.fingerprint.is_some()
            && matches!(
                self.outcome,
                Some(AttemptOutcome::Succeeded) | Some(AttemptOutcome::Skipped)
            )
    }
}

/// DTO for opening a new attempt in the ledger.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub source_id: String,
    pub schedule_id: Option<Uuid>,
    pub trigger: TriggerKind,
    pub attempt_number: u32,
    pub claim_token: Uuid,
    pub started_at: DateTime<Utc>,
}

/// The terminal write that closes an attempt.
#[derive(Debug, Clone, Default)]
pub struct AttemptResult {
    pub finished_at: DateTime<Utc>,
    pub change_status: Option<ChangeStatus>,
    pub visibility: Option<Visibility>,
    pub fingerprint: Option<String>,
    pub change_metadata: Option<serde_json::Value>,
    pub gate_bypass: Option<GateBypass>,
    pub outcome: Option<AttemptOutcome>,
    pub error: Option<String>,
    pub records: Option<serde_json::Value>,
    pub records_count: Option<u32>,
    pub asset_error: Option<String>,
}

/// Query over the attempt ledger, newest first.
#[derive(Debug, Clone)]
pub struct AttemptFilter {
    pub source_id: Option<String>,
    pub trigger: Option<TriggerKind>,
    pub outcome: Option<AttemptOutcome>,
    pub change_status: Option<ChangeStatus>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for AttemptFilter {
    fn default() -> Self {
        Self {
            source_id: None,
            trigger: None,
            outcome: None,
            change_status: None,
            since: None,
            until: None,
            limit: 50,
        }
    }
}

impl AttemptFilter {
    pub fn matches(&self, attempt: &Attempt) -> bool {
        self.source_id
            .as_deref()
            .is_none_or(|id| attempt.source_id == id)
            && self.trigger.is_none_or(|t| attempt.trigger == t)
            && self.outcome.is_none_or(|o| attempt.outcome == Some(o))
            && self
                .change_status
                .is_none_or(|c| attempt.change_status == Some(c))
            && self.since.is_none_or(|s| attempt.started_at >= s)
            && self.until.is_none_or(|u| attempt.started_at < u)
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
