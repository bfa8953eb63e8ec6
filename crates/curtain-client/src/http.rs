//! Error classification shared by the HTTP capabilities.

use curtain_core::AppError;

/// Map a transport failure onto the retry taxonomy.
pub(crate) fn send_error(e: reqwest::Error, timeout_secs: u64) -> AppError {
    if e.is_timeout() {
        AppError::Timeout(timeout_secs)
    } else if e.is_connect() {
        AppError::Network(format!("Connection failed: {e}"))
    } else if e.is_decode() {
        AppError::MalformedResponse(e.to_string())
    } else {
        AppError::Network(e.to_string())
    }
}

/// Map a non-success HTTP status onto the retry taxonomy.
pub(crate) fn status_error(status: u16, body: &str) -> AppError {
    let message = api_message(body).unwrap_or_else(|| format!("HTTP {status}: {body}"));
    match status {
        429 => AppError::RateLimited,
        402 => AppError::QuotaExceeded(message),
        401 | 403 => AppError::Unauthorized(message),
        500..=599 => AppError::Network(message),
        _ => AppError::Generic(format!("HTTP {status}: {message}")),
    }
}

/// Pull the human-readable message out of an API error body.
///
/// Handles both `{"error": "..."}` and `{"error": {"message": "..."}}`.
pub(crate) fn api_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    error
        .as_str()
        .or_else(|| error.get("message").and_then(|m| m.as_str()))
        .map(str::to_string)
}
