//! Generation-backed stages: categorize, rank, summarize.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::llm::CallError;
use crate::model::{Article, CategorizedArticle, DigestEntry};

pub mod categorize;
pub mod rank;
pub mod summarize;

pub use categorize::GeminiCategorizer;
pub use rank::GeminiRanker;
pub use summarize::GeminiSummarizer;

#[async_trait]
pub trait Categorizer: Send + Sync {
    /// Output follows input order. Articles flagged as duplicates are absent.
    async fn categorize(&self, articles: &[Article]) -> Result<Vec<CategorizedArticle>>;
}

#[async_trait]
pub trait Ranker: Send + Sync {
    async fn rank(&self, categorized: Vec<CategorizedArticle>) -> Result<Vec<CategorizedArticle>>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, ranked: &[CategorizedArticle]) -> Result<Vec<DigestEntry>>;
}

/// Effective batch size: everything in one request when it fits.
pub fn batch_size_for(len: usize, configured: usize) -> usize {
    if configured == 0 || len <= configured {
        len.max(1)
    } else {
        configured
    }
}

/// Pull the first JSON array out of a model reply that may be wrapped in a
/// markdown fence or surrounded by prose.
pub fn extract_json_array(text: &str) -> Option<&str> {
    let body = strip_fence(text).unwrap_or(text);
    let start = body.find('[')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in body[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(body[start..=start + offset].trim());
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_fence(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let rest = &text[open + 3..];
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let close = rest.find("```")?;
    let inner = rest[..close].trim();
    (!inner.is_empty()).then_some(inner)
}

/// Parse a model reply as a JSON array of `T`, tolerating wrapping noise.
pub fn parse_json_array<T: DeserializeOwned>(text: &str) -> Result<Vec<T>> {
    if let Ok(items) = serde_json::from_str(text.trim()) {
        return Ok(items);
    }
    let cleaned = extract_json_array(text)
        .ok_or_else(|| anyhow!("no JSON array in response: {}", preview(text)))?;
    serde_json::from_str(cleaned)
        .with_context(|| format!("invalid JSON array in response: {}", preview(cleaned)))
}

fn preview(text: &str) -> String {
    const MAX: usize = 200;
    let mut out: String = text.chars().take(MAX).collect();
    if text.chars().count() > MAX {
        out.push_str("...");
    }
    out
}

/// Spaces consecutive requests of one stage at least `min_delay` apart.
#[derive(Debug)]
pub struct RequestPacer {
    label: &'static str,
    min_delay: Duration,
    last: Option<Instant>,
    cancel: CancellationToken,
}

impl RequestPacer {
    pub fn new(label: &'static str, min_delay: Duration, cancel: CancellationToken) -> Self {
        Self {
            label,
            min_delay,
            last: None,
            cancel,
        }
    }

    /// Wait out the remaining gap since the previous request finished. Never
    /// waits before the first request.
    pub async fn ready(&mut self) -> Result<(), CallError> {
        if self.cancel.is_cancelled() {
            return Err(CallError::Cancelled);
        }
        let Some(last) = self.last else {
            return Ok(());
        };
        let elapsed = last.elapsed();
        if elapsed >= self.min_delay {
            return Ok(());
        }
        let wait = self.min_delay - elapsed;
        info!(stage = self.label, wait_ms = wait.as_millis() as u64, "pacing generation requests");
        tokio::select! {
            _ = self.cancel.cancelled() => Err(CallError::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    pub fn finished(&mut self) {
        self.last = Some(Instant::now());
    }
}
