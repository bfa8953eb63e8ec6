use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;
use chrono_tz::Tz;

use crate::error::AppError;
use crate::orchestrator::retry::RetryPolicy;

/// How concurrent dispatcher instances are kept from ticking at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coordination {
    /// Database advisory lock held for the duration of a tick.
    AdvisoryLock,
    /// The deployment guarantees a single tick at a time (one cron entry, one pod).
    External,
}

impl FromStr for Coordination {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "advisory-lock" | "advisory" => Ok(Coordination::AdvisoryLock),
            "external" => Ok(Coordination::External),
            _ => Err(format!("Unknown dispatch coordination: {}", s)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub tick_interval: Duration,
    pub coordination: Coordination,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30 * 60),
            coordination: Coordination::AdvisoryLock,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Maximum simultaneously running attempts in this process.
    pub pool_size: usize,
    /// Outer timeout around one attempt's external calls.
    pub max_attempt_duration: Duration,
    /// Age after which a claim may be force-released. Must exceed `max_attempt_duration`.
    pub claim_stale_after: Duration,
    pub reaper_interval: Duration,
    /// Idle sleep between queue polls.
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
    /// Put manual submissions in the priority lane.
    pub prioritize_manual: bool,
    /// Consecutive `removed` results before a source is marked degraded.
    pub removed_threshold: u32,
    /// Consecutive fatal outcomes before a source is marked degraded.
    pub degrade_after_fatal: u32,
    /// Consecutive fatal outcomes before a source is disabled; 0 never disables.
    pub disable_after_fatal: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            max_attempt_duration: Duration::from_secs(15 * 60),
            claim_stale_after: Duration::from_secs(20 * 60),
            reaper_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            prioritize_manual: true,
            removed_threshold: 3,
            degrade_after_fatal: 3,
            disable_after_fatal: 0,
        }
    }
}

impl OrchestratorConfig {
    pub fn stale_after(&self) -> TimeDelta {
        TimeDelta::from_std(self.claim_stale_after).unwrap_or(TimeDelta::MAX)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.pool_size == 0 {
            return Err(AppError::Config("pool size must be at least 1".into()));
        }
        if self.claim_stale_after <= self.max_attempt_duration {
            return Err(AppError::Config(format!(
                "claim staleness ({}s) must exceed the max attempt duration ({}s)",
                self.claim_stale_after.as_secs(),
                self.max_attempt_duration.as_secs()
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::Config("retry max attempts must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            return Err(AppError::Config(format!(
                "retry jitter must be in [0, 1), got {}",
                self.retry.jitter
            )));
        }
        Ok(())
    }
}

/// Full runtime configuration of the scheduling core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub dispatcher: DispatcherConfig,
    pub orchestrator: OrchestratorConfig,
    /// Zone operator-facing timestamps are rendered in.
    pub display_timezone: Tz,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            display_timezone: chrono_tz::America::New_York,
        }
    }
}

impl CoreConfig {
    /// Read configuration from `CURTAIN_*` environment variables.
    ///
    /// Every variable is optional and falls back to [`CoreConfig::default`].
    pub fn from_env() -> Result<Self, AppError> {
        let defaults = CoreConfig::default();
        let d = &defaults.orchestrator;

        let max_attempt_duration = secs("CURTAIN_MAX_ATTEMPT_SECS", d.max_attempt_duration)?;
        let orchestrator = OrchestratorConfig {
            pool_size: parse_env("CURTAIN_WORKERS", d.pool_size)?,
            max_attempt_duration,
            claim_stale_after: secs(
                "CURTAIN_CLAIM_STALE_SECS",
                d.claim_stale_after.max(max_attempt_duration + Duration::from_secs(60)),
            )?,
            reaper_interval: secs("CURTAIN_REAPER_INTERVAL_SECS", d.reaper_interval)?,
            poll_interval: secs("CURTAIN_POLL_INTERVAL_SECS", d.poll_interval)?,
            retry: RetryPolicy {
                max_attempts: parse_env("CURTAIN_RETRY_MAX_ATTEMPTS", d.retry.max_attempts)?,
                base_delay: secs("CURTAIN_RETRY_BASE_SECS", d.retry.base_delay)?,
                max_delay: secs("CURTAIN_RETRY_MAX_DELAY_SECS", d.retry.max_delay)?,
                jitter: parse_env("CURTAIN_RETRY_JITTER", d.retry.jitter)?,
                long_backoff_multiplier: parse_env(
                    "CURTAIN_RETRY_LONG_BACKOFF_MULTIPLIER",
                    d.retry.long_backoff_multiplier,
                )?,
            },
            prioritize_manual: parse_env("CURTAIN_PRIORITIZE_MANUAL", d.prioritize_manual)?,
            removed_threshold: parse_env("CURTAIN_REMOVED_THRESHOLD", d.removed_threshold)?,
            degrade_after_fatal: parse_env("CURTAIN_DEGRADE_AFTER_FATAL", d.degrade_after_fatal)?,
            disable_after_fatal: parse_env("CURTAIN_DISABLE_AFTER_FATAL", d.disable_after_fatal)?,
        };
        orchestrator.validate()?;

        let dispatcher = DispatcherConfig {
            tick_interval: secs(
                "CURTAIN_TICK_INTERVAL_SECS",
                defaults.dispatcher.tick_interval,
            )?,
            coordination: parse_env(
                "CURTAIN_DISPATCH_COORDINATION",
                defaults.dispatcher.coordination,
            )?,
        };
        if dispatcher.tick_interval.is_zero() {
            return Err(AppError::Config("tick interval must be positive".into()));
        }

        let display_timezone = parse_env("CURTAIN_DISPLAY_TZ", defaults.display_timezone)?;

        Ok(Self {
            dispatcher,
            orchestrator,
            display_timezone,
        })
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("Invalid {key} '{raw}': {e}"))),
    }
}

fn secs(key: &str, default: Duration) -> Result<Duration, AppError> {
    parse_env(key, default.as_secs()).map(Duration::from_secs)
}
