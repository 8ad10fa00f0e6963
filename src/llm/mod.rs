//! Quota-aware access to the text generation API.
//!
//! [`TextGenerator`] performs exactly one request and reports failures with a
//! machine-readable [`ErrorKind`]. [`RateLimitedClient`] is the only place that
//! turns those kinds into retry decisions; every stage above it sees a single
//! `call` that either yields text or a [`CallError`].
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, instrument, warn};

pub mod gemini;
pub mod model;

pub use gemini::GeminiClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Short-term throttle (requests or tokens per minute).
    RateLimited,
    /// Period cap (e.g. requests per day). Never retried.
    QuotaExhausted,
    /// Provider capacity problem.
    Overloaded,
    /// 5xx-class or network failure.
    Transient,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::QuotaExhausted => "quota_exhausted",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Transient => "transient",
            ErrorKind::Other => "other",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited | ErrorKind::Overloaded | ErrorKind::Transient
        )
    }

    /// Classify from error text alone. Only for failures that carry no HTTP
    /// status.
    pub fn sniff(message: &str) -> Self {
        let m = message.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| m.contains(n));

        if has(&[
            "429",
            "too many requests",
            "rate limit",
            "resource exhausted",
            "resource has been exhausted",
            "resource_exhausted",
        ]) {
            if has(&["per day", "perday", "per_day", "daily"]) {
                return ErrorKind::QuotaExhausted;
            }
            return ErrorKind::RateLimited;
        }
        if has(&["503", "service unavailable", "overloaded"]) {
            return ErrorKind::Overloaded;
        }
        if has(&[
            "500",
            "502",
            "504",
            "internal server error",
            "bad gateway",
            "gateway timeout",
            "timed out",
            "connection reset",
            "connection refused",
        ]) {
            return ErrorKind::Transient;
        }
        if has(&["quota"]) {
            return ErrorKind::QuotaExhausted;
        }
        ErrorKind::Other
    }
}

/// Failure of a single generation request.
#[derive(Debug, Clone, Error)]
#[error("{} error: {message}", .kind.as_str())]
pub struct GenerationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl GenerationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Outcome of a retried call that did not produce text.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("generation quota exhausted for the current period: {0}")]
    QuotaExhausted(#[source] GenerationError),
    #[error("max retries exceeded after {attempts} attempts: {last}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        last: GenerationError,
    },
    #[error("generation request failed: {0}")]
    Fatal(#[source] GenerationError),
    #[error("generation cancelled")]
    Cancelled,
}

impl CallError {
    pub fn is_quota_exhausted(&self) -> bool {
        matches!(self, CallError::QuotaExhausted(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CallError::Cancelled)
    }
}

/// Find a [`CallError`] anywhere in an error chain.
pub fn find_call_error(err: &anyhow::Error) -> Option<&CallError> {
    err.chain().find_map(|e| e.downcast_ref::<CallError>())
}

/// One raw request to a generation model.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, model: &str, prompt: &str) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub rate_limit_wait: Duration,
    pub overloaded_wait: Duration,
    pub transient_base: Duration,
    pub transient_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            rate_limit_wait: Duration::from_secs(60),
            overloaded_wait: Duration::from_secs(5 * 60),
            transient_base: Duration::from_secs(12),
            transient_cap: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Wait before the attempt following failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, kind: ErrorKind, attempt: u32) -> Duration {
        match kind {
            ErrorKind::RateLimited => self.rate_limit_wait,
            ErrorKind::Overloaded => self.overloaded_wait,
            _ => {
                let shift = attempt.saturating_sub(1).min(16);
                self.transient_base
                    .saturating_mul(1u32 << shift)
                    .min(self.transient_cap)
            }
        }
    }
}

/// Retry/backoff wrapper around a [`TextGenerator`].
#[derive(Clone)]
pub struct RateLimitedClient {
    inner: Arc<dyn TextGenerator>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl RateLimitedClient {
    pub fn new(inner: Arc<dyn TextGenerator>, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            inner,
            policy,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[instrument(skip(self, prompt), fields(prompt_chars = prompt.len()))]
    pub async fn call(&self, model: &str, prompt: &str) -> Result<String, CallError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return Err(CallError::Cancelled),
                res = self.inner.generate(model, prompt) => res,
            };

            let err = match result {
                Ok(text) => return Ok(text),
                Err(err) => err,
            };

            if err.kind == ErrorKind::QuotaExhausted {
                error!(attempt, error = %err, "generation quota exhausted; not retrying");
                return Err(CallError::QuotaExhausted(err));
            }
            if !err.kind.is_retryable() {
                return Err(CallError::Fatal(err));
            }

            if attempt >= self.policy.max_attempts {
                error!(attempt, error = %err, "generation retries exhausted");
                return Err(CallError::MaxRetriesExceeded {
                    attempts: attempt,
                    last: err,
                });
            }

            let delay = self.policy.delay_for(err.kind, attempt);
            warn!(
                attempt,
                max = self.policy.max_attempts,
                kind = err.kind.as_str(),
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "generation failed; backing off"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(CallError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
