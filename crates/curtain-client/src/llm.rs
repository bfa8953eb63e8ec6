use std::time::Duration;

use chrono::{NaiveDate, NaiveTime};
use curtain_core::{AppError, Extractor, MonitoredSource};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::http::{send_error, status_error};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_LLM_TIMEOUT: Duration = Duration::from_secs(180);
const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert at parsing theatre and concert venue websites to extract show information. Respond ONLY with valid JSON. Do not include explanations.";

/// OpenAI-compatible chat client that turns venue markdown into show records.
///
/// Each record is a JSON object with `title`, `date` (YYYY-MM-DD), and
/// optional `time` (HH:MM), `description`, `image_url`, `ticket_url`.
/// Items without a usable title or date are dropped.
#[derive(Clone)]
pub struct OpenAiShowExtractor {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout_secs: u64,
    system_prompt: String,
}

impl OpenAiShowExtractor {
    pub fn new(api_key: &str, model: &str) -> Result<Self, AppError> {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: &str, model: &str, base_url: &str) -> Result<Self, AppError> {
        Self::build(api_key, model, base_url, DEFAULT_LLM_TIMEOUT)
    }

    pub fn with_timeout(self, timeout: Duration) -> Result<Self, AppError> {
        let system_prompt = self.system_prompt;
        let mut rebuilt = Self::build(&self.api_key, &self.model, &self.base_url, timeout)?;
        rebuilt.system_prompt = system_prompt;
        Ok(rebuilt)
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    fn build(
        api_key: &str,
        model: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Config(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            timeout_secs: timeout.as_secs(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        })
    }
}

// ---- OpenAI API types ----

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

fn show_prompt(label: &str, markdown: &str) -> String {
    format!(
        r#"Analyze the following markdown content from {label} and extract all upcoming shows/events.

For each show, extract:
- title: the full name of the show or performance
- date: the date of the show in YYYY-MM-DD format
- time: the start time in HH:MM 24-hour format, if available
- description: a brief description, if available
- image_url: URL of the show's poster or image, if available
- ticket_url: URL to purchase tickets, if available

Rules:
1. Only include shows with clear dates (ignore "TBD" or "TBA").
2. List each performance of a multi-date show separately.
3. Respond with a JSON object of the form {{"shows": [...]}}.

Markdown content:
{markdown}"#
    )
}

/// Pull the list of show items out of the model's reply.
///
/// Accepts a bare array, an object wrapping an array under `shows`, or a
/// single show object.
fn parse_show_items(raw: &str) -> Result<Vec<Value>, AppError> {
    let value: Value = serde_json::from_str(raw.trim()).map_err(|e| {
        let preview: String = raw.chars().take(200).collect();
        AppError::Extraction(format!("LLM returned invalid JSON: {e}. Raw: {preview}"))
    })?;

    match value {
        Value::Array(items) => Ok(items),
        Value::Object(mut obj) => match obj.remove("shows") {
            Some(Value::Array(items)) => Ok(items),
            Some(other) => Err(AppError::Extraction(format!(
                "`shows` is not an array: {other}"
            ))),
            None => Ok(vec![Value::Object(obj)]),
        },
        other => Err(AppError::Extraction(format!(
            "Unexpected JSON from LLM: {other}"
        ))),
    }
}

fn trimmed<'a>(item: &'a Value, key: &str) -> Option<&'a str> {
    item.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn http_url(item: &Value, key: &str) -> Option<String> {
    trimmed(item, key)
        .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
        .map(str::to_string)
}

/// Normalize one show item, or `None` if it lacks a title or a valid date.
fn normalize_show(item: &Value) -> Option<Value> {
    let title = trimmed(item, "title")?;
    let date = NaiveDate::parse_from_str(trimmed(item, "date")?, "%Y-%m-%d").ok()?;
    let time = trimmed(item, "time").and_then(|t| NaiveTime::parse_from_str(t, "%H:%M").ok());

    let mut show = Map::new();
    show.insert("title".into(), json!(title));
    show.insert("date".into(), json!(date.format("%Y-%m-%d").to_string()));
    show.insert("time".into(), json!(time.map(|t| t.format("%H:%M").to_string())));
    show.insert("description".into(), json!(trimmed(item, "description")));
    show.insert("image_url".into(), json!(http_url(item, "image_url")));
    show.insert("ticket_url".into(), json!(http_url(item, "ticket_url")));
    Some(Value::Object(show))
}

impl Extractor for OpenAiShowExtractor {
    async fn extract(
        &self,
        source: &MonitoredSource,
        content: &str,
    ) -> Result<Vec<Value>, AppError> {
        if content.trim().is_empty() {
            return Err(AppError::Extraction(format!(
                "No content to parse for {}",
                source.label
            )));
        }

        let url = format!("{}/chat/completions", self.base_url);
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: self.system_prompt.clone(),
                },
                Message {
                    role: "user".to_string(),
                    content: show_prompt(&source.label, content),
                },
            ],
            temperature: 0.1,
            response_format: ResponseFormat {
                format_type: "json_object".to_string(),
            },
        };

        tracing::debug!(
            source_id = %source.id,
            model = %self.model,
            chars = content.len(),
            "Sending content for show extraction"
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| send_error(e, self.timeout_secs))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status.as_u16(), &body));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| {
                AppError::MalformedResponse(format!("Failed to parse LLM response: {e}"))
            })?;

        let raw = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AppError::Extraction("Empty response from LLM".into()))?;

        let items = parse_show_items(raw)?;
        let shows: Vec<Value> = items.iter().filter_map(normalize_show).collect();

        let dropped = items.len() - shows.len();
        if dropped > 0 {
            tracing::warn!(source_id = %source.id, dropped, "Dropped show items without title or date");
        }
        Ok(shows)
    }
}
