//! Import of per-venue JSON configuration files.
//!
//! One file per source, named `<source-id>.json`:
//!
//! ```json
//! {
//!   "theatre_name": "Palace Theatre",
//!   "base_url": "https://palace.example/shows",
//!   "enabled": true,
//!   "scraping_strategy": { "type": "single_url_with_actions", "actions": [] },
//!   "scrape_params": { "waitFor": 2000 },
//!   "change_tracking": { "enabled": true }
//! }
//! ```

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Deserialize;
use url::Url;

use crate::error::AppError;
use crate::models::{FetchConfig, FetchStrategy, MonitoredSource, SourceStatus};
use crate::traits::SourceStore;

#[derive(Debug, Deserialize)]
struct RawSourceConfig {
    theatre_name: Option<String>,
    #[serde(default)]
    base_url: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    scraping_strategy: RawStrategy,
    #[serde(default)]
    scrape_params: serde_json::Value,
    change_tracking: Option<RawChangeTracking>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct RawStrategy {
    #[serde(rename = "type")]
    kind: Option<String>,
    url: Option<String>,
    #[serde(default)]
    urls: Vec<String>,
    #[serde(default)]
    actions: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RawChangeTracking {
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn checked_url(id: &str, raw: &str) -> Result<String, AppError> {
    Url::parse(raw)
        .map(|_| raw.to_string())
        .map_err(|e| AppError::Config(format!("{id}: invalid url '{raw}': {e}")))
}

/// Build a source from one configuration document.
pub fn parse_source_config(id: &str, json: &str) -> Result<MonitoredSource, AppError> {
    let raw: RawSourceConfig = serde_json::from_str(json)
        .map_err(|e| AppError::Config(format!("{id}: {e}")))?;

    let single_url = || {
        let url = raw
            .scraping_strategy
            .url
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(&raw.base_url);
        if url.is_empty() {
            return Err(AppError::Config(format!("{id}: a url or base_url is required")));
        }
        checked_url(id, url)
    };

    let strategy = match raw.scraping_strategy.kind.as_deref().unwrap_or("single_url") {
        "single_url" => FetchStrategy::SingleUrl { url: single_url()? },
        "single_url_with_actions" => FetchStrategy::SingleUrlWithActions {
            url: single_url()?,
            actions: raw.scraping_strategy.actions.clone(),
        },
        "multi_url" => {
            let urls = if raw.scraping_strategy.urls.is_empty() {
                vec![single_url()?]
            } else {
                raw.scraping_strategy
                    .urls
                    .iter()
                    .map(|u| checked_url(id, u))
                    .collect::<Result<_, _>>()?
            };
            FetchStrategy::MultiUrl { urls }
        }
        other => {
            return Err(AppError::Config(format!(
                "{id}: unsupported scraping strategy '{other}'"
            )));
        }
    };

    let now = Utc::now();
    Ok(MonitoredSource {
        id: id.to_string(),
        label: raw.theatre_name.unwrap_or_else(|| id.to_string()),
        enabled: raw.enabled,
        status: SourceStatus::Active,
        fetch: FetchConfig {
            strategy,
            params: raw.scrape_params,
            change_tracking: raw.change_tracking.is_none_or(|c| c.enabled),
        },
        created_at: now,
        updated_at: now,
    })
}

/// Result of reading a configuration directory.
#[derive(Debug, Default)]
pub struct ImportBatch {
    pub sources: Vec<MonitoredSource>,
    /// Files that could not be turned into a source.
    pub rejected: Vec<(PathBuf, AppError)>,
}

/// Read every `*.json` file in `dir`, in file-name order.
///
/// One bad file does not stop the rest; it is reported in `rejected`.
pub fn import_dir(dir: &Path) -> Result<ImportBatch, AppError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", dir.display())))?;

    let mut paths: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();

    let mut batch = ImportBatch::default();
    for path in paths {
        let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
            continue;
        };
        let parsed = std::fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))
            .and_then(|json| parse_source_config(&id, &json));
        match parsed {
            Ok(source) => batch.sources.push(source),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping source config");
                batch.rejected.push((path, e));
            }
        }
    }
    Ok(batch)
}

/// Upsert every source. Existing sources keep their lifecycle status, and
/// sources missing from the batch are left alone.
pub async fn sync_sources<S: SourceStore>(
    store: &S,
    sources: &[MonitoredSource],
) -> Result<Vec<MonitoredSource>, AppError> {
    let mut stored = Vec::with_capacity(sources.len());
    for source in sources {
        stored.push(store.upsert_source(source).await?);
        tracing::info!(source_id = %source.id, "Imported source");
    }
    Ok(stored)
}
