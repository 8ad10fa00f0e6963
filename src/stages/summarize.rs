use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument};

use super::{batch_size_for, parse_json_array, RequestPacer, Summarizer};
use crate::config::Gemini;
use crate::llm::RateLimitedClient;
use crate::model::{CategorizedArticle, DigestEntry};

pub struct GeminiSummarizer {
    client: RateLimitedClient,
    model: String,
    batch_size: usize,
    delay: Duration,
}

#[derive(Serialize)]
struct PromptArticle<'a> {
    id: &'a str,
    title: &'a str,
    content: &'a str,
}

#[derive(Deserialize, Debug)]
struct SummaryRecord {
    id: String,
    #[serde(default)]
    summary: Option<String>,
}

impl GeminiSummarizer {
    pub fn new(client: RateLimitedClient, model: impl Into<String>, batch_size: usize, delay: Duration) -> Self {
        Self {
            client,
            model: model.into(),
            batch_size,
            delay,
        }
    }

    pub fn from_config(client: RateLimitedClient, gemini: &Gemini) -> Self {
        Self::new(
            client,
            gemini.model_summary.clone(),
            gemini.batch_size_summary,
            Duration::from_secs(gemini.summary_delay_secs),
        )
    }

    fn build_prompt(input_json: &str) -> String {
        format!(
            r#"You are a news editor writing short digests.
You will receive a JSON list of articles, each with an "id", a "title" and the full "content", usually in Vietnamese and sometimes in English.
Write a 1-2 sentence summary of each article in a neutral, informative tone. No clickbait, no opinions, no facts that are not in the text.
Return ONLY a raw JSON array, no commentary:
[{{"id": "<id>", "summary": "<summary>"}}, ...]

Input:
{input_json}"#
        )
    }

    #[instrument(skip_all, fields(batch_len = batch.len()))]
    async fn summarize_batch(&self, batch: &[CategorizedArticle]) -> Result<Vec<DigestEntry>> {
        let input: Vec<PromptArticle<'_>> = batch
            .iter()
            .map(|c| PromptArticle {
                id: &c.article.id,
                title: &c.article.title,
                content: &c.article.content,
            })
            .collect();
        let input_json = serde_json::to_string(&input).context("serialize summary input")?;
        let reply = self
            .client
            .call(&self.model, &Self::build_prompt(&input_json))
            .await?;
        let records: Vec<SummaryRecord> = parse_json_array(&reply)?;

        let mut summaries: HashMap<String, String> = HashMap::with_capacity(records.len());
        for record in records {
            let text = record.summary.unwrap_or_default().trim().to_string();
            if !text.is_empty() {
                summaries.entry(record.id).or_insert(text);
            }
        }

        Ok(batch
            .iter()
            .map(|c| {
                let summary = summaries.remove(&c.article.id).unwrap_or_else(|| {
                    debug!(id = %c.article.id, "no summary returned; using title");
                    c.article.title.clone()
                });
                DigestEntry {
                    id: c.article.id.clone(),
                    category: c.category.clone(),
                    title: c.article.title.clone(),
                    url: c.article.url.clone(),
                    summary,
                    source: c.article.source.clone(),
                    published_at: c.article.published_at,
                }
            })
            .collect())
    }
}

#[async_trait]
impl Summarizer for GeminiSummarizer {
    #[instrument(skip_all, fields(articles = ranked.len()))]
    async fn summarize(&self, ranked: &[CategorizedArticle]) -> Result<Vec<DigestEntry>> {
        if ranked.is_empty() {
            return Ok(Vec::new());
        }
        let size = batch_size_for(ranked.len(), self.batch_size);
        let total_batches = ranked.len().div_ceil(size);
        info!(articles = ranked.len(), batches = total_batches, batch_size = size, "summarizing");

        let mut pacer = RequestPacer::new("summarize", self.delay, self.client.cancel_token().clone());
        let mut out = Vec::with_capacity(ranked.len());
        for (i, batch) in ranked.chunks(size).enumerate() {
            pacer.ready().await?;
            let entries = self
                .summarize_batch(batch)
                .await
                .with_context(|| format!("summarize batch {}/{}", i + 1, total_batches))?;
            pacer.finished();
            out.extend(entries);
        }
        info!(entries = out.len(), "summarization done");
        Ok(out)
    }
}
