use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use super::model::{
    ApiErrorEnvelope, Content, GenerateContentRequest, GenerateContentResponse, PartIn,
};
use super::{ErrorKind, GenerationError, TextGenerator};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/";

#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl fmt::Debug for GeminiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl GeminiClient {
    pub fn new(api_key: String, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(GEMINI_API_BASE)?;
        Self::with_base_url(api_key, timeout, base_url)
    }

    pub fn with_base_url(api_key: String, timeout: Duration, base_url: Url) -> anyhow::Result<Self> {
        let http = Client::builder()
            .user_agent("tg-digestbot/0.1")
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    pub fn build_request(&self, model: &str, prompt: &str) -> anyhow::Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(&format!("v1beta/models/{}:generateContent", model))?;
        let body = GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![PartIn { text: prompt }],
            }],
        };
        Ok(self
            .http
            .post(endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .build()?)
    }
}

#[async_trait]
impl TextGenerator for GeminiClient {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, GenerationError> {
        let request = self
            .build_request(model, prompt)
            .map_err(|e| GenerationError::new(ErrorKind::Other, format!("build request: {e}")))?;
        debug!(url = %request.url(), "gemini request");

        let res = self.http.execute(request).await.map_err(transport_error)?;
        let status = res.status();
        let body = res.text().await.map_err(transport_error)?;

        if !status.is_success() {
            let kind = classify(status, &body);
            warn!(%status, kind = kind.as_str(), "gemini API error");
            return Err(GenerationError::new(kind, format!("HTTP {status}: {body}")));
        }

        let payload: GenerateContentResponse = serde_json::from_str(&body).map_err(|e| {
            GenerationError::new(ErrorKind::Other, format!("invalid response JSON: {e}"))
        })?;
        extract_text(payload)
    }
}

/// Concatenate the text parts of the first candidate.
fn extract_text(payload: GenerateContentResponse) -> Result<String, GenerationError> {
    let Some(candidate) = payload.candidates.into_iter().next() else {
        return Err(GenerationError::new(ErrorKind::Other, "response has no candidates"));
    };
    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "unknown".into());
        return Err(GenerationError::new(
            ErrorKind::Other,
            format!("empty response (finish reason: {reason})"),
        ));
    }
    Ok(text)
}

fn transport_error(err: reqwest::Error) -> GenerationError {
    let kind = if err.is_timeout() || err.is_connect() {
        ErrorKind::Transient
    } else if let Some(status) = err.status() {
        classify(status, "")
    } else {
        ErrorKind::sniff(&err.to_string())
    };
    GenerationError::new(kind, err.to_string())
}

/// Map an HTTP status plus error body onto an [`ErrorKind`].
///
/// A 429 is a short-term throttle unless the body names a period quota
/// (per-day quota id, metric or message). `RESOURCE_EXHAUSTED` alone, with or
/// without the word "quota", is the per-minute case.
pub fn classify(status: StatusCode, body: &str) -> ErrorKind {
    match status.as_u16() {
        429 => {
            let period = match serde_json::from_str::<ApiErrorEnvelope>(body) {
                Ok(envelope) => names_period_quota(&envelope),
                Err(_) => mentions_period(body),
            };
            if period {
                ErrorKind::QuotaExhausted
            } else {
                ErrorKind::RateLimited
            }
        }
        503 => ErrorKind::Overloaded,
        500 | 502 | 504 => ErrorKind::Transient,
        403 if body.to_lowercase().contains("quota") => ErrorKind::QuotaExhausted,
        _ => ErrorKind::Other,
    }
}

fn names_period_quota(envelope: &ApiErrorEnvelope) -> bool {
    envelope
        .error
        .details
        .iter()
        .flat_map(|d| d.violations.iter())
        .any(|v| mentions_period(&v.quota_id) || mentions_period(&v.quota_metric))
        || mentions_period(&envelope.error.message)
}

fn mentions_period(text: &str) -> bool {
    let t = text.to_lowercase();
    ["perday", "per_day", "per day", "daily"]
        .iter()
        .any(|marker| t.contains(marker))
}
