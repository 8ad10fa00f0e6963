use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::{batch_size_for, parse_json_array, Categorizer, RequestPacer};
use crate::config::{Gemini, Pipeline};
use crate::llm::RateLimitedClient;
use crate::model::{Article, CategorizedArticle, DEFAULT_CATEGORY};

pub struct GeminiCategorizer {
    client: RateLimitedClient,
    model: String,
    categories: Vec<String>,
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
struct CategoryRecord {
    id: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    duplicate_of: Option<String>,
}

impl GeminiCategorizer {
    pub fn new(
        client: RateLimitedClient,
        model: impl Into<String>,
        categories: Vec<String>,
        batch_size: usize,
        delay: Duration,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            categories,
            batch_size,
            delay,
        }
    }

    pub fn from_config(client: RateLimitedClient, gemini: &Gemini, pipeline: &Pipeline) -> Self {
        Self::new(
            client,
            gemini.model_categorization.clone(),
            pipeline.category_set(),
            gemini.batch_size_categorization,
            Duration::from_secs(gemini.categorization_delay_secs),
        )
    }

    /// Configured spelling of `raw`, or the default category.
    fn canonical_category(&self, raw: Option<&str>) -> String {
        let raw = raw.map(str::trim).unwrap_or_default().to_lowercase();
        self.categories
            .iter()
            .find(|c| c.trim().to_lowercase() == raw)
            .cloned()
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string())
    }

    fn build_prompt(&self, input_json: &str) -> String {
        let categories = self
            .categories
            .iter()
            .map(|c| format!("\"{c}\""))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            r#"You classify news articles into a fixed set of categories and remove duplicates.
You will receive a JSON list of articles. Each has a unique "id", a "title" and a "content" body, usually in Vietnamese and sometimes in English.

Tasks:
1. Find articles that report the same story. Keep the most complete one and mark every other copy as a duplicate of it.
2. Give every kept article exactly one category from this list: {categories}.

Use "{default}" for articles that fit no topical category but may still be interesting.

Return ONLY a raw JSON array, no markdown and no commentary. One record per input id:
- kept article: {{"id": "<id>", "category": "<one category from the list>"}}
- duplicate: {{"id": "<id>", "duplicate_of": "<id of the kept article>"}}

Input:
{input_json}"#,
            default = DEFAULT_CATEGORY,
        )
    }

    #[instrument(skip_all, fields(batch_len = batch.len()))]
    async fn categorize_batch(&self, batch: &[Article]) -> Result<Vec<CategorizedArticle>> {
        let input: Vec<PromptArticle<'_>> = batch
            .iter()
            .map(|a| PromptArticle {
                id: &a.id,
                title: &a.title,
                content: &a.content,
            })
            .collect();
        let input_json = serde_json::to_string(&input).context("serialize categorization input")?;
        let reply = self
            .client
            .call(&self.model, &self.build_prompt(&input_json))
            .await?;
        let records: Vec<CategoryRecord> = parse_json_array(&reply)?;
        Ok(self.apply_records(batch, records))
    }

    fn apply_records(&self, batch: &[Article], records: Vec<CategoryRecord>) -> Vec<CategorizedArticle> {
        let mut by_id: HashMap<String, CategoryRecord> = HashMap::with_capacity(records.len());
        for record in records {
            by_id.entry(record.id.clone()).or_insert(record);
        }

        let mut out = Vec::with_capacity(batch.len());
        for article in batch {
            let Some(record) = by_id.get(&article.id) else {
                debug!(id = %article.id, "no category returned; using default");
                out.push(CategorizedArticle::new(article.clone(), DEFAULT_CATEGORY));
                continue;
            };
            if let Some(kept) = record.duplicate_of.as_deref().map(str::trim) {
                let kept_in_batch = kept != article.id && batch.iter().any(|a| a.id == kept);
                if kept_in_batch {
                    debug!(id = %article.id, duplicate_of = kept, "dropping duplicate");
                    continue;
                }
                if !kept.is_empty() {
                    warn!(id = %article.id, duplicate_of = kept, "duplicate_of points outside the batch; keeping article");
                }
            }
            let category = self.canonical_category(record.category.as_deref());
            out.push(CategorizedArticle::new(article.clone(), category));
        }
        out
    }
}

#[async_trait]
impl Categorizer for GeminiCategorizer {
    #[instrument(skip_all, fields(articles = articles.len()))]
    async fn categorize(&self, articles: &[Article]) -> Result<Vec<CategorizedArticle>> {
        if articles.is_empty() {
            return Ok(Vec::new());
        }
        let size = batch_size_for(articles.len(), self.batch_size);
        let total_batches = articles.len().div_ceil(size);
        info!(articles = articles.len(), batches = total_batches, batch_size = size, "categorizing");

        let mut pacer = RequestPacer::new("categorize", self.delay, self.client.cancel_token().clone());
        let mut out = Vec::with_capacity(articles.len());
        for (i, batch) in articles.chunks(size).enumerate() {
            pacer.ready().await?;
            let results = self
                .categorize_batch(batch)
                .await
                .with_context(|| format!("categorize batch {}/{}", i + 1, total_batches))?;
            pacer.finished();
            out.extend(results);
        }

        let mut distribution: BTreeMap<&str, usize> = BTreeMap::new();
        for c in &out {
            *distribution.entry(c.category.as_str()).or_default() += 1;
        }
        info!(kept = out.len(), dropped = articles.len() - out.len(), ?distribution, "categorization done");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ErrorKind, GenerationError};
    use crate::stages::test_support::{article, client, ScriptedGenerator};

    fn categorizer(gen: std::sync::Arc<ScriptedGenerator>, batch_size: usize) -> GeminiCategorizer {
        GeminiCategorizer::new(
            client(gen),
            "model-cat",
            vec!["Economy".into(), "Technology".into(), DEFAULT_CATEGORY.into()],
            batch_size,
            Duration::ZERO,
        )
    }

    fn ids(out: &[CategorizedArticle]) -> Vec<&str> {
        out.iter().map(|c| c.article.id.as_str()).collect()
    }

    #[tokio::test]
    async fn omitted_ids_fall_back_to_default_category() {
        let gen = ScriptedGenerator::with(vec![Ok(r#"[{"id":"b","category":"economy"}]"#.into())]);
        let input = vec![article("a"), article("b"), article("c")];
        let out = categorizer(gen, 15).categorize(&input).await.unwrap();

        assert_eq!(ids(&out), vec!["a", "b", "c"]);
        assert_eq!(out[0].category, DEFAULT_CATEGORY);
        assert_eq!(out[1].category, "Economy");
        assert_eq!(out[2].category, DEFAULT_CATEGORY);
        assert!(out.iter().all(|c| c.relevance_score == 0.0));
    }

    #[tokio::test]
    async fn explicit_duplicates_are_dropped() {
        let gen = ScriptedGenerator::with(vec![Ok(r#"```json
[{"id":"a","category":"Technology"},{"id":"b","duplicate_of":"a"},{"id":"c","category":"Sports"}]
```"#
            .into())]);
        let input = vec![article("a"), article("b"), article("c")];
        let out = categorizer(gen, 15).categorize(&input).await.unwrap();

        assert_eq!(ids(&out), vec!["a", "c"]);
        assert_eq!(out[0].category, "Technology");
        // Unknown category is coerced.
        assert_eq!(out[1].category, DEFAULT_CATEGORY);
    }

    #[tokio::test]
    async fn dangling_duplicate_signal_keeps_article() {
        let gen = ScriptedGenerator::with(vec![Ok(
            r#"[{"id":"a","duplicate_of":"zzz"},{"id":"b","duplicate_of":"b"}]"#.into(),
        )]);
        let out = categorizer(gen, 15)
            .categorize(&[article("a"), article("b")])
            .await
            .unwrap();
        assert_eq!(ids(&out), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn batches_by_configured_size_in_order() {
        let gen = ScriptedGenerator::with(vec![
            Ok(r#"[{"id":"a","category":"Economy"},{"id":"b","category":"Economy"}]"#.into()),
            Ok(r#"[{"id":"c","category":"Technology"}]"#.into()),
        ]);
        let input = vec![article("a"), article("b"), article("c")];
        let out = categorizer(gen.clone(), 2).categorize(&input).await.unwrap();

        assert_eq!(ids(&out), vec!["a", "b", "c"]);
        let prompts = gen.prompts();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0].0, "model-cat");
        assert!(prompts[0].1.contains("\"id\":\"a\"") && !prompts[0].1.contains("\"id\":\"c\""));
        assert!(prompts[1].1.contains("\"id\":\"c\""));
    }

    #[tokio::test]
    async fn quota_exhaustion_aborts_the_stage() {
        let gen = ScriptedGenerator::with(vec![Err(GenerationError::new(
            ErrorKind::QuotaExhausted,
            "per day",
        ))]);
        let err = categorizer(gen.clone(), 1)
            .categorize(&[article("a"), article("b")])
            .await
            .unwrap_err();
        assert!(crate::llm::find_call_error(&err).is_some_and(|e| e.is_quota_exhausted()));
        assert_eq!(gen.prompts().len(), 1);
    }

    #[tokio::test]
    async fn unparseable_reply_is_an_error() {
        let gen = ScriptedGenerator::with(vec![Ok("I cannot help with that".into())]);
        assert!(categorizer(gen, 15).categorize(&[article("a")]).await.is_err());
    }

    #[tokio::test]
    async fn empty_input_makes_no_requests() {
        let gen = ScriptedGenerator::with(vec![]);
        let out = categorizer(gen.clone(), 15).categorize(&[]).await.unwrap();
        assert!(out.is_empty());
        assert!(gen.prompts().is_empty());
    }
}
