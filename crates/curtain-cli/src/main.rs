use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc, Weekday};
use chrono_tz::Tz;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use curtain_client::{FirecrawlPageSource, OpenAiShowExtractor};
use curtain_core::import::{import_dir, sync_sources};
use curtain_core::schedule::render_in;
use curtain_core::traits::{AttemptLedger, ScheduleStore, SourceStore};
use curtain_core::{
    AttemptFilter, AttemptOutcome, ChangeStatus, Coordination, CoreConfig, DispatchLock,
    Dispatcher, ExternallySerialized, IntervalSpec, NewSchedule, NullAssets, Orchestrator,
    ScheduleSpec, SourceStatus, SubmitOutcome, SubmitRequest, TickReport, TracingWorkerReporter,
    TriggerKind, WorkerPool,
};
use curtain_db::{Database, DatabaseConfig, PgStore};

#[derive(Parser)]
#[command(name = "curtain", version, about = "Scheduled theatre scraping with change detection")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import or update sources from a directory of `<id>.json` configs
    Import {
        /// Directory containing one JSON file per source
        dir: PathBuf,
    },

    /// Inspect and toggle monitored sources
    Sources {
        #[command(subcommand)]
        action: SourceAction,
    },

    /// Manage recurring schedules
    Schedules {
        #[command(subcommand)]
        action: ScheduleAction,
    },

    /// Queue an immediate attempt for a source, bypassing the change gate
    RunNow {
        /// Source id
        source: String,
    },

    /// Query the attempt ledger
    Attempts {
        #[arg(short, long)]
        source: Option<String>,

        /// manual | scheduled
        #[arg(long)]
        trigger: Option<TriggerKind>,

        /// skipped | succeeded | failed-retryable | failed-fatal
        #[arg(long)]
        outcome: Option<AttemptOutcome>,

        /// new | same | changed | removed | error
        #[arg(long)]
        change: Option<ChangeStatus>,

        /// Only attempts started at or after this RFC 3339 timestamp
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Only attempts started before this RFC 3339 timestamp
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Print full records as JSON instead of a summary
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Run one dispatcher tick and exit (for cron-driven deployments)
    Tick,

    /// Run the dispatcher on its tick interval until interrupted
    Dispatch,

    /// Run the worker pool and the stale-claim reaper
    Worker {
        /// Drain runnable jobs once and exit instead of polling
        #[arg(long, default_value_t = false)]
        once: bool,

        /// Prefix for worker ids (defaults to a random one)
        #[arg(long)]
        name: Option<String>,

        #[command(flatten)]
        capabilities: Capabilities,
    },
}

#[derive(Subcommand)]
enum SourceAction {
    List,
    /// Enable a source; a disabled lifecycle status is reset to active
    Enable { id: String },
    Disable { id: String },
}

#[derive(Subcommand)]
enum ScheduleAction {
    List {
        #[arg(short, long)]
        source: Option<String>,
    },
    /// Create a schedule.
    ///
    /// Intervals: `daily@02:00`, `weekly:mon@19:30`, `hourly@15`,
    /// `hourly:6@15`, or `cron:<sec min hour dom mon dow>`.
    Create {
        source: String,

        #[arg(short, long)]
        interval: String,

        /// IANA zone the interval is expressed in (defaults to the display zone)
        #[arg(short, long)]
        timezone: Option<Tz>,

        /// Create the schedule disabled
        #[arg(long, default_value_t = false)]
        disabled: bool,
    },
    Enable { id: Uuid },
    Disable { id: Uuid },
    Delete { id: Uuid },
}

#[derive(Args)]
struct Capabilities {
    #[arg(long, env = "FIRECRAWL_API_KEY", hide_env_values = true)]
    firecrawl_api_key: String,

    #[arg(long, env = "FIRECRAWL_BASE_URL", default_value = "https://api.firecrawl.dev/v1")]
    firecrawl_base_url: String,

    #[arg(long, env = "CURTAIN_LLM_API_KEY", hide_env_values = true)]
    llm_api_key: String,

    /// LLM model used for show extraction
    #[arg(long, env = "CURTAIN_LLM_MODEL", default_value = "gpt-4o-mini")]
    llm_model: String,

    /// OpenAI-compatible API base URL
    #[arg(long, env = "CURTAIN_LLM_BASE_URL", default_value = "https://api.openai.com/v1")]
    llm_base_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("curtain=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = CoreConfig::from_env().context("Invalid CURTAIN_* configuration")?;
    let db = connect_db().await?;
    let store = db.store();
    let tz = config.display_timezone;

    match cli.command {
        Commands::Import { dir } => cmd_import(&store, dir).await?,
        Commands::Sources { action } => cmd_sources(&store, action).await?,
        Commands::Schedules { action } => cmd_schedules(&store, action, tz).await?,
        Commands::RunNow { source } => {
            let orchestrator = Orchestrator::new(store, config.orchestrator);
            cmd_run_now(&orchestrator, &source).await?;
        }
        Commands::Attempts {
            source,
            trigger,
            outcome,
            change,
            since,
            until,
            limit,
            json,
        } => {
            let filter = AttemptFilter {
                source_id: source,
                trigger,
                outcome,
                change_status: change,
                since,
                until,
                limit,
            };
            cmd_attempts(&store, &filter, json, tz).await?;
        }
        Commands::Tick => cmd_dispatch(&db, store, config, true).await?,
        Commands::Dispatch => cmd_dispatch(&db, store, config, false).await?,
        Commands::Worker {
            once,
            name,
            capabilities,
        } => {
            let orchestrator = Orchestrator::new(store, config.orchestrator);
            cmd_worker(orchestrator, &capabilities, once, name).await?;
        }
    }

    Ok(())
}

/// Connect to PostgreSQL using DATABASE_URL and apply pending migrations.
async fn connect_db() -> Result<Database> {
    let config = DatabaseConfig::from_env().context("Database configuration")?;
    let db = Database::connect(&config)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to run migrations")?;
    Ok(db)
}

/// Cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl-C handler");
            return;
        }
        tracing::info!("Shutdown signal received");
        trigger.cancel();
    });
    token
}

async fn cmd_import(store: &PgStore, dir: PathBuf) -> Result<()> {
    let batch = import_dir(&dir)?;
    let stored = sync_sources(store, &batch.sources).await?;

    for source in &stored {
        println!("  imported {} ({})", source.id, source.label);
    }
    for (path, error) in &batch.rejected {
        println!("  rejected {}: {}", path.display(), error);
    }
    println!(
        "\n{} imported, {} rejected",
        stored.len(),
        batch.rejected.len()
    );
    Ok(())
}

async fn cmd_sources(store: &PgStore, action: SourceAction) -> Result<()> {
    match action {
        SourceAction::List => {
            let sources = store.list_sources().await?;
            if sources.is_empty() {
                println!("No sources. Run `curtain import <dir>` first.");
                return Ok(());
            }
            for source in sources {
                let urls = source.fetch.strategy.urls();
                println!(
                    "  {:<28} {:<8} {:<9} {} ({} page{})",
                    source.id,
                    if source.enabled { "enabled" } else { "off" },
                    source.status,
                    source.label,
                    urls.len(),
                    if urls.len() == 1 { "" } else { "s" },
                );
            }
        }
        SourceAction::Enable { id } => {
            store.set_source_enabled(&id, true).await?;
            if let Some(source) = store.get_source(&id).await?
                && source.status == SourceStatus::Disabled
            {
                store.set_source_status(&id, SourceStatus::Active).await?;
            }
            println!("Enabled {id}");
        }
        SourceAction::Disable { id } => {
            store.set_source_enabled(&id, false).await?;
            println!("Disabled {id}");
        }
    }
    Ok(())
}

async fn cmd_schedules(store: &PgStore, action: ScheduleAction, tz: Tz) -> Result<()> {
    match action {
        ScheduleAction::List { source } => {
            let schedules = store.list_schedules(source.as_deref()).await?;
            if schedules.is_empty() {
                println!("No schedules.");
                return Ok(());
            }
            for schedule in schedules {
                println!(
                    "  {} {:<24} {:<8} {} [{}] next {}{}",
                    schedule.id,
                    schedule.source_id,
                    if schedule.enabled { "enabled" } else { "off" },
                    schedule.spec.interval,
                    schedule.spec.timezone,
                    render_in(schedule.next_due_at, tz),
                    schedule
                        .last_run_at
                        .map(|ts| format!(", last {}", render_in(ts, tz)))
                        .unwrap_or_default(),
                );
            }
        }
        ScheduleAction::Create {
            source,
            interval,
            timezone,
            disabled,
        } => {
            let interval = parse_interval(&interval).map_err(anyhow::Error::msg)?;
            let spec = ScheduleSpec::new(interval, timezone.unwrap_or(tz));
            let mut new = NewSchedule::new(source, spec);
            if disabled {
                new = new.disabled();
            }
            let first_due = new.first_due(Utc::now())?;
            let schedule = store.create_schedule(new, first_due).await?;
            println!(
                "Created schedule {} ({}), first run {}",
                schedule.id,
                schedule.spec.interval,
                render_in(schedule.next_due_at, tz)
            );
        }
        ScheduleAction::Enable { id } => {
            store.set_schedule_enabled(id, true).await?;
            println!("Enabled schedule {id}");
        }
        ScheduleAction::Disable { id } => {
            store.set_schedule_enabled(id, false).await?;
            println!("Disabled schedule {id}");
        }
        ScheduleAction::Delete { id } => {
            if !store.delete_schedule(id).await? {
                bail!("No schedule with id {id}");
            }
            println!("Deleted schedule {id}");
        }
    }
    Ok(())
}

async fn cmd_run_now(orchestrator: &Orchestrator<PgStore>, source: &str) -> Result<()> {
    match orchestrator
        .submit(SubmitRequest::manual(source), Utc::now())
        .await?
    {
        SubmitOutcome::Accepted { job_id, .. } => {
            println!("Queued job {job_id} for {source}");
            Ok(())
        }
        SubmitOutcome::Rejected(reason) => bail!("Submission for {source} rejected: {reason}"),
    }
}

async fn cmd_attempts(store: &PgStore, filter: &AttemptFilter, json: bool, tz: Tz) -> Result<()> {
    let attempts = store.list_attempts(filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&attempts)?);
        return Ok(());
    }
    if attempts.is_empty() {
        println!("No attempts found.");
        return Ok(());
    }

    for attempt in &attempts {
        let outcome = attempt
            .outcome
            .map(|o| o.to_string())
            .unwrap_or_else(|| "running".into());
        let change = attempt
            .change_status
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".into());
        println!(
            "  [{:<16}] {} {:<24} {:<9} #{} change={} records={}{}",
            outcome,
            render_in(attempt.started_at, tz),
            attempt.source_id,
            attempt.trigger,
            attempt.attempt_number,
            change,
            attempt
                .records_count
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".into()),
            attempt
                .error
                .as_deref()
                .map(|e| format!(" error: {e}"))
                .unwrap_or_default(),
        );
    }
    println!("\nTotal: {} attempts", attempts.len());
    Ok(())
}

async fn cmd_dispatch(db: &Database, store: PgStore, config: CoreConfig, once: bool) -> Result<()> {
    let orchestrator = Orchestrator::new(store, config.orchestrator);
    match config.dispatcher.coordination {
        Coordination::AdvisoryLock => {
            let dispatcher = Dispatcher::new(orchestrator, db.dispatch_lock(), config.dispatcher);
            drive_dispatcher(&dispatcher, once).await
        }
        Coordination::External => {
            let dispatcher = Dispatcher::new(orchestrator, ExternallySerialized, config.dispatcher);
            drive_dispatcher(&dispatcher, once).await
        }
    }
}

async fn drive_dispatcher<L: DispatchLock>(
    dispatcher: &Dispatcher<PgStore, L>,
    once: bool,
) -> Result<()> {
    if once {
        let report = dispatcher.tick(Utc::now()).await?;
        print_tick(&report);
        return Ok(());
    }
    dispatcher.run(shutdown_token()).await?;
    Ok(())
}

fn print_tick(report: &TickReport) {
    if report.lock_contended {
        println!("Another dispatcher holds the lock; nothing done.");
        return;
    }
    println!(
        "enqueued {}, skipped {} claimed and {} disabled, {} failed",
        report.enqueued, report.skipped_claimed, report.skipped_disabled, report.failed
    );
}

async fn cmd_worker(
    orchestrator: Orchestrator<PgStore>,
    capabilities: &Capabilities,
    once: bool,
    name: Option<String>,
) -> Result<()> {
    let pages = FirecrawlPageSource::with_base_url(
        &capabilities.firecrawl_api_key,
        &capabilities.firecrawl_base_url,
    )?;
    let extractor = OpenAiShowExtractor::with_base_url(
        &capabilities.llm_api_key,
        &capabilities.llm_model,
        &capabilities.llm_base_url,
    )?;

    let mut pool = WorkerPool::new(orchestrator, pages, extractor, NullAssets);
    if let Some(name) = name {
        pool = pool.with_worker_prefix(name);
    }

    if !once {
        tracing::info!(model = %capabilities.llm_model, "Starting worker pool");
        pool.run(shutdown_token(), &TracingWorkerReporter).await?;
        return Ok(());
    }

    let reaped = pool.orchestrator().reap_stale(Utc::now()).await?;
    if reaped.claims_released > 0 {
        tracing::info!(claims = reaped.claims_released, "Released stale claims");
    }

    let worker_id = format!("once-{}", &Uuid::new_v4().simple().to_string()[..8]);
    let mut processed = 0usize;
    while pool
        .run_once(&worker_id, Utc::now(), &TracingWorkerReporter)
        .await?
        .is_some()
    {
        processed += 1;
    }
    println!("Processed {processed} jobs");
    Ok(())
}

/// Parse the compact interval syntax accepted by `schedules create`.
fn parse_interval(raw: &str) -> Result<IntervalSpec, String> {
    let raw = raw.trim();
    if let Some(expression) = raw.strip_prefix("cron:") {
        return Ok(IntervalSpec::Cron {
            expression: expression.trim().to_string(),
        });
    }

    let (kind, at) = raw
        .split_once('@')
        .ok_or_else(|| format!("expected <kind>@<time>, got '{raw}'"))?;
    let (name, arg) = match kind.split_once(':') {
        Some((name, arg)) => (name, Some(arg)),
        None => (kind, None),
    };

    match (name, arg) {
        ("daily", None) => {
            let (hour, minute) = hour_minute(at)?;
            Ok(IntervalSpec::Daily { hour, minute })
        }
        ("weekly", Some(day)) => {
            let weekday: Weekday = day
                .parse()
                .map_err(|_| format!("unknown weekday '{day}'"))?;
            let (hour, minute) = hour_minute(at)?;
            Ok(IntervalSpec::Weekly {
                weekday,
                hour,
                minute,
            })
        }
        ("hourly", every) => {
            let every = match every {
                Some(n) => n.parse().map_err(|_| format!("invalid hour step '{n}'"))?,
                None => 1,
            };
            let minute = at
                .trim_start_matches(':')
                .parse()
                .map_err(|_| format!("invalid minute '{at}'"))?;
            Ok(IntervalSpec::Hourly { every, minute })
        }
        _ => Err(format!("unknown interval '{raw}'")),
    }
}

fn hour_minute(at: &str) -> Result<(u32, u32), String> {
    let (h, m) = at
        .split_once(':')
        .ok_or_else(|| format!("expected HH:MM, got '{at}'"))?;
    let hour = h.parse().map_err(|_| format!("invalid hour '{h}'"))?;
    let minute = m.parse().map_err(|_| format!("invalid minute '{m}'"))?;
    Ok((hour, minute))
}
