use std::time::Duration;

use chrono::{DateTime, Utc};
use curtain_core::traits::{ChangeCheck, PageContent, PageSource};
use curtain_core::{
    AppError, ChangeStatus, FetchStrategy, MonitoredSource, compute_hash, models::Visibility,
};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::http::{send_error, status_error};

const DEFAULT_BASE_URL: &str = "https://api.firecrawl.dev/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_REQUEST_DELAY: Duration = Duration::from_secs(1);
const PAGE_SEPARATOR: &str = "\n\n---\n\n";

/// Page source backed by a Firecrawl-compatible scrape API.
///
/// The change check asks for the `changeTracking` format on the canonical
/// URL; the full fetch scrapes every strategy URL as markdown.
#[derive(Clone)]
pub struct FirecrawlPageSource {
    client: Client,
    base_url: String,
    api_key: String,
    timeout_secs: u64,
    request_delay: Duration,
}

impl FirecrawlPageSource {
    pub fn new(api_key: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Result<Self, AppError> {
        Self::build(api_key, base_url, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        let request_delay = self.request_delay;
        let mut rebuilt = Self::build(&self.api_key, &self.base_url, timeout)?;
        rebuilt.request_delay = request_delay;
        Ok(rebuilt)
    }

    /// Pause between consecutive pages of a multi-page source.
    pub fn with_request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    fn build(api_key: &str, base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent("CurtainTime/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout_secs: timeout.as_secs(),
            request_delay: DEFAULT_REQUEST_DELAY,
        })
    }

    async fn scrape(&self, body: &Value) -> Result<ScrapeData, AppError> {
        let url = format!("{}/scrape", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| send_error(e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &body));
        }

        let text = response
            .text()
            .await
            .map_err(|e| send_error(e, self.timeout_secs))?;
        parse_scrape_response(&text)
    }
}

// ---- Firecrawl API types ----

#[derive(Deserialize)]
struct ScrapeResponse {
    #[serde(default)]
    success: bool,
    data: Option<ScrapeData>,
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScrapeData {
    markdown: Option<String>,
    change_tracking: Option<Value>,
}

fn parse_scrape_response(text: &str) -> Result<ScrapeData, AppError> {
    let parsed: ScrapeResponse = serde_json::from_str(text)
        .map_err(|e| AppError::MalformedResponse(format!("scrape response: {e}")))?;
    if !parsed.success {
        return Err(AppError::MalformedResponse(
            parsed
                .error
                .unwrap_or_else(|| "scrape reported failure without a message".into()),
        ));
    }
    parsed
        .data
        .ok_or_else(|| AppError::MalformedResponse("scrape response has no data".into()))
}

/// Request body for one page: the source's scrape parameters plus the
/// fields this client controls.
fn scrape_body(url: &str, params: &Value, formats: &[&str], actions: &[Value]) -> Value {
    let mut body: Map<String, Value> = params.as_object().cloned().unwrap_or_default();
    body.insert("url".into(), json!(url));
    body.insert("formats".into(), json!(formats));
    if !actions.is_empty() {
        body.insert("actions".into(), json!(actions));
    }
    Value::Object(body)
}

fn actions_of(strategy: &FetchStrategy) -> &[Value] {
    match strategy {
        FetchStrategy::SingleUrlWithActions { actions, .. } => actions,
        _ => &[],
    }
}

fn change_check_from(data: ScrapeData) -> ChangeCheck {
    let tracking = data.change_tracking.unwrap_or(Value::Null);
    let field = |name: &str| tracking.get(name).and_then(Value::as_str);

    ChangeCheck {
        status: field("changeStatus").and_then(|s| s.parse::<ChangeStatus>().ok()),
        fingerprint: data
            .markdown
            .as_deref()
            .filter(|md| !md.trim().is_empty())
            .map(compute_hash),
        visibility: field("visibility").and_then(|v| v.parse::<Visibility>().ok()),
        previous_scrape_at: field("previousScrapeAt")
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc)),
        metadata: tracking,
    }
}

/// Combine per-page markdown; multi-page output gets a heading per URL.
fn join_pages(pages: &[(String, String)]) -> String {
    match pages {
        [(_, markdown)] => markdown.clone(),
        _ => pages
            .iter()
            .map(|(url, markdown)| format!("# {url}\n\n{markdown}"))
            .collect::<Vec<_>>()
            .join(PAGE_SEPARATOR),
    }
}

impl PageSource for FirecrawlPageSource {
    async fn check(&self, source: &MonitoredSource) -> Result<ChangeCheck, AppError> {
        let url = source.fetch.strategy.canonical_url().ok_or_else(|| {
            AppError::Config(format!("{}: no canonical page to check", source.id))
        })?;
        tracing::debug!(source_id = %source.id, %url, "Checking page for changes");

        let body = scrape_body(
            url,
            &source.fetch.params,
            &["markdown", "changeTracking"],
            actions_of(&source.fetch.strategy),
        );
        let data = self.scrape(&body).await?;
        Ok(change_check_from(data))
    }

    async fn fetch(&self, source: &MonitoredSource) -> Result<PageContent, AppError> {
        let urls = source.fetch.strategy.urls();
        let actions = actions_of(&source.fetch.strategy);

        let mut pages = Vec::with_capacity(urls.len());
        let mut errors = Vec::new();
        let mut first_error = None;

        for (i, url) in urls.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.request_delay).await;
            }
            tracing::debug!(source_id = %source.id, %url, page = i + 1, "Scraping page");

            let body = scrape_body(url, &source.fetch.params, &["markdown"], actions);
            match self.scrape(&body).await {
                Ok(ScrapeData {
                    markdown: Some(markdown),
                    ..
                }) if !markdown.trim().is_empty() => pages.push((url.to_string(), markdown)),
                Ok(_) => errors.push(format!("No markdown content from {url}")),
                Err(e) => {
                    errors.push(format!("Failed to scrape {url}: {e}"));
                    first_error.get_or_insert(e);
                }
            }
        }

        // Nothing usable: surface the upstream error so it keeps its retry class.
        if pages.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        Ok(PageContent {
            markdown: join_pages(&pages),
            pages_requested: urls.len() as u32,
            pages_succeeded: pages.len() as u32,
            errors,
        })
    }
}
