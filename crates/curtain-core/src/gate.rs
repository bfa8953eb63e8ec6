//! Change-detection gate: decides whether a source needs the expensive path.

use chrono::{DateTime, Utc};

use crate::models::{Attempt, ChangeStatus, GateBypass, MonitoredSource, TriggerKind, Visibility};
use crate::traits::{AttemptLedger, ChangeCheck, PageSource};

/// What the orchestrator does with a gate result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAction {
    /// Full fetch and extraction.
    Proceed,
    /// Content unchanged; the attempt is recorded as skipped.
    Skip,
    /// The page is gone; no fetch, counts toward the removed streak.
    Removed,
}

/// Outcome of one pass through the gate, forwarded to the attempt record.
#[derive(Debug, Clone)]
pub struct GateVerdict {
    pub status: ChangeStatus,
    pub visibility: Option<Visibility>,
    pub fingerprint: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub previous_scrape_at: Option<DateTime<Utc>>,
    pub action: GateAction,
    /// Set when the gate was not consulted at all.
    pub bypass: Option<GateBypass>,
    /// Error from the change check, when it failed open.
    pub check_error: Option<String>,
}

impl GateVerdict {
    fn bypassed(reason: GateBypass) -> Self {
        Self {
            status: ChangeStatus::Changed,
            visibility: None,
            fingerprint: None,
            metadata: None,
            previous_scrape_at: None,
            action: GateAction::Proceed,
            bypass: Some(reason),
            check_error: None,
        }
    }

    fn failed_open(error: String) -> Self {
        Self {
            status: ChangeStatus::Error,
            visibility: None,
            fingerprint: None,
            metadata: None,
            previous_scrape_at: None,
            action: GateAction::Proceed,
            bypass: None,
            check_error: Some(error),
        }
    }
}

/// Status of a check against the baseline attempt.
///
/// A status reported by the page source wins. Otherwise the check's
/// fingerprint is compared to the baseline's; with no fingerprint to compare
/// the status is `Error` (which fails open).
pub fn resolve_status(check: &ChangeCheck, baseline: Option<&Attempt>) -> ChangeStatus {
    if let Some(status) = check.status {
        return status;
    }
    match (
        check.fingerprint.as_deref(),
        baseline.and_then(|a| a.fingerprint.as_deref()),
    ) {
        (None, _) => ChangeStatus::Error,
        (Some(_), None) => ChangeStatus::New,
        (Some(current), Some(previous)) if current == previous => ChangeStatus::Same,
        (Some(_), Some(_)) => ChangeStatus::Changed,
    }
}

pub fn action_for(status: ChangeStatus) -> GateAction {
    match status {
        ChangeStatus::New | ChangeStatus::Changed | ChangeStatus::Error => GateAction::Proceed,
        ChangeStatus::Same => GateAction::Skip,
        ChangeStatus::Removed => GateAction::Removed,
    }
}

/// Stateless gate; the baseline lives in the attempt ledger.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChangeGate;

impl ChangeGate {
    /// Evaluate the gate for one attempt, honouring the bypass rules.
    ///
    /// Manual triggers always bypass. Scheduled attempts bypass when change
    /// tracking is turned off for the source or its strategy has no single
    /// canonical page. A retry whose chain already passed the gate skips a
    /// second check, since upstream change status is reported only once.
    pub async fn evaluate<P, L>(
        &self,
        trigger: TriggerKind,
        passed_before: bool,
        source: &MonitoredSource,
        pages: &P,
        ledger: &L,
    ) -> GateVerdict
    where
        P: PageSource,
        L: AttemptLedger,
    {
        if trigger == TriggerKind::Manual {
            return GateVerdict::bypassed(GateBypass::ManualTrigger);
        }
        if !source.fetch.change_tracking {
            return GateVerdict::bypassed(GateBypass::TrackingDisabled);
        }
        if source.fetch.strategy.canonical_url().is_none() {
            return GateVerdict::bypassed(GateBypass::NoCanonicalPage);
        }
        if passed_before {
            return GateVerdict::bypassed(GateBypass::PassedBeforeRetry);
        }
        self.check(source, pages, ledger).await
    }

    /// Run the cheap change check. Never fails: any error becomes
    /// `ChangeStatus::Error` with `GateAction::Proceed`.
    pub async fn check<P, L>(&self, source: &MonitoredSource, pages: &P, ledger: &L) -> GateVerdict
    where
        P: PageSource,
        L: AttemptLedger,
    {
        let check = match pages.check(source).await {
            Ok(check) => check,
            Err(e) => {
                tracing::warn!(source_id = %source.id, error = %e, "Change check failed, proceeding");
                return GateVerdict::failed_open(e.to_string());
            }
        };

        // Only needed when the page source left the comparison to us.
        let baseline = if check.status.is_none() {
            match ledger.baseline_for(&source.id).await {
                Ok(baseline) => baseline,
                Err(e) => {
                    tracing::warn!(source_id = %source.id, error = %e, "Baseline lookup failed, proceeding");
                    return GateVerdict::failed_open(e.to_string());
                }
            }
        } else {
            None
        };

        let status = resolve_status(&check, baseline.as_ref());
        let previous_scrape_at = check
            .previous_scrape_at
            .or_else(|| baseline.as_ref().map(|a| a.started_at));
        let metadata = (!check.metadata.is_null()).then_some(check.metadata);

        tracing::debug!(source_id = %source.id, %status, "Change check complete");

        GateVerdict {
            status,
            visibility: check.visibility,
            fingerprint: check.fingerprint,
            metadata,
            previous_scrape_at,
            action: action_for(status),
            bypass: None,
            check_error: None,
        }
    }
}
