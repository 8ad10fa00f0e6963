use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument, warn};

use super::{parse_json_array, Ranker, RequestPacer};
use crate::config::{Gemini, Pipeline};
use crate::llm::{find_call_error, RateLimitedClient};
use crate::model::CategorizedArticle;

/// Score given to articles the model did not rate.
const MISSING_SCORE: f64 = 5.0;

pub struct GeminiRanker {
    client: RateLimitedClient,
    model: String,
    max_per_category: usize,
    min_relevance_score: f64,
    delay: Duration,
}

#[derive(Serialize)]
struct PromptArticle<'a> {
    id: &'a str,
    category: &'a str,
    title: &'a str,
    content: &'a str,
    published_at: String,
    source: &'a str,
}

#[derive(Deserialize, Debug)]
struct ScoreRecord {
    id: String,
    #[serde(default)]
    relevance_score: Option<f64>,
}

impl GeminiRanker {
    pub fn new(
        client: RateLimitedClient,
        model: impl Into<String>,
        max_per_category: usize,
        min_relevance_score: f64,
        delay: Duration,
    ) -> Self {
        Self {
            client,
            model: model.into(),
            max_per_category,
            min_relevance_score,
            delay,
        }
    }

    pub fn from_config(client: RateLimitedClient, gemini: &Gemini, pipeline: &Pipeline) -> Self {
        Self::new(
            client,
            gemini.model_ranking.clone(),
            pipeline.max_articles_per_category,
            pipeline.min_relevance_score,
            Duration::from_secs(gemini.ranking_delay_secs),
        )
    }

    fn build_prompt(input_json: &str) -> String {
        format!(
            r#"You are an experienced news editor rating how relevant and important each article is.
You will receive a JSON list of articles from one category, each with an "id", "title", full "content", "published_at" and "source". Texts are usually in Vietnamese and sometimes in English.
Rate every article from 0 to 10, where 10 is a highly important and timely story and 0 is irrelevant.
Consider the significance of the event, topicality, public interest and novelty.
Return ONLY a raw JSON array, no commentary:
[{{"id": "<id>", "relevance_score": <number 0-10>}}, ...]

Input:
{input_json}"#
        )
    }

    #[instrument(skip_all, fields(category = %category, articles = articles.len()))]
    async fn score_category(
        &self,
        category: &str,
        articles: &[CategorizedArticle],
    ) -> Result<Vec<CategorizedArticle>> {
        let input: Vec<PromptArticle<'_>> = articles
            .iter()
            .map(|c| PromptArticle {
                id: &c.article.id,
                category,
                title: &c.article.title,
                content: &c.article.content,
                published_at: c.article.published_at.to_rfc3339(),
                source: &c.article.source,
            })
            .collect();
        let input_json = serde_json::to_string(&input).context("serialize ranking input")?;
        let reply = self
            .client
            .call(&self.model, &Self::build_prompt(&input_json))
            .await?;
        let records: Vec<ScoreRecord> = parse_json_array(&reply)?;

        let mut scores: HashMap<String, f64> = HashMap::with_capacity(records.len());
        for record in records {
            if let Some(score) = record.relevance_score.filter(|s| s.is_finite()) {
                scores.entry(record.id).or_insert(score.clamp(0.0, 10.0));
            }
        }
        Ok(articles
            .iter()
            .map(|c| {
                let mut scored = c.clone();
                scored.relevance_score = scores.get(&c.article.id).copied().unwrap_or(MISSING_SCORE);
                scored
            })
            .collect())
    }
}

/// Group by category, keeping first-appearance order of categories and of
/// articles within them.
fn group_by_category(categorized: Vec<CategorizedArticle>) -> Vec<(String, Vec<CategorizedArticle>)> {
    let mut groups: Vec<(String, Vec<CategorizedArticle>)> = Vec::new();
    for item in categorized {
        match groups.iter_mut().find(|(c, _)| *c == item.category) {
            Some((_, members)) => members.push(item),
            None => groups.push((item.category.clone(), vec![item])),
        }
    }
    groups
}

#[async_trait]
impl Ranker for GeminiRanker {
    #[instrument(skip_all, fields(articles = categorized.len()))]
    async fn rank(&self, categorized: Vec<CategorizedArticle>) -> Result<Vec<CategorizedArticle>> {
        if categorized.is_empty() {
            return Ok(Vec::new());
        }
        let groups = group_by_category(categorized);
        let total = groups.len();
        let mut pacer = RequestPacer::new("rank", self.delay, self.client.cancel_token().clone());
        let mut out = Vec::new();

        for (i, (category, members)) in groups.into_iter().enumerate() {
            pacer.ready().await?;
            info!(category = %category, articles = members.len(), "ranking category {}/{}", i + 1, total);
            let result = self.score_category(&category, &members).await;
            pacer.finished();

            let mut selected = match result {
                Ok(mut scored) => {
                    scored.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
                    scored.truncate(self.max_per_category);
                    scored.retain(|c| c.relevance_score >= self.min_relevance_score);
                    scored
                }
                Err(err) => {
                    if find_call_error(&err).is_some_and(|e| e.is_quota_exhausted() || e.is_cancelled()) {
                        return Err(err).with_context(|| format!("rank category {category}"));
                    }
                    warn!(category = %category, error = %format!("{err:#}"), "ranking failed; keeping input order");
                    members
                }
            };
            selected.truncate(self.max_per_category);
            info!(category = %category, selected = selected.len(), "category ranked");
            out.extend(selected);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ErrorKind, GenerationError};
    use crate::stages::test_support::{article, client, ScriptedGenerator};
    use std::sync::Arc;

    fn ranker(gen: Arc<ScriptedGenerator>, max: usize, min_score: f64) -> GeminiRanker {
        GeminiRanker::new(client(gen), "model-rank", max, min_score, Duration::ZERO)
    }

    fn item(id: &str, category: &str) -> CategorizedArticle {
        CategorizedArticle::new(article(id), category)
    }

    fn ids(out: &[CategorizedArticle]) -> Vec<&str> {
        out.iter().map(|c| c.article.id.as_str()).collect()
    }

    #[tokio::test]
    async fn sorts_clamps_and_truncates_per_category() {
        let gen = ScriptedGenerator::with(vec![
            Ok(r#"[{"id":"a","relevance_score":3},{"id":"b","relevance_score":42},{"id":"c","relevance_score":7}]"#.into()),
            Ok(r#"[{"id":"d","relevance_score":-1}]"#.into()),
        ]);
        let input = vec![item("a", "Tech"), item("d", "Economy"), item("b", "Tech"), item("c", "Tech")];
        let out = ranker(gen.clone(), 2, 0.0).rank(input).await.unwrap();

        assert_eq!(ids(&out), vec!["b", "c", "d"]);
        assert_eq!(out[0].relevance_score, 10.0);
        assert_eq!(out[1].relevance_score, 7.0);
        assert_eq!(out[2].relevance_score, 0.0);
        // One request per category, in first-appearance order.
        let prompts = gen.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0].1.contains("\"category\":\"Tech\""));
        assert!(prompts[1].1.contains("\"category\":\"Economy\""));
    }

    #[tokio::test]
    async fn missing_scores_default_to_midpoint_and_ties_keep_order() {
        let gen = ScriptedGenerator::with(vec![Ok(r#"[{"id":"b","relevance_score":5}]"#.into())]);
        let input = vec![item("a", "Tech"), item("b", "Tech"), item("c", "Tech")];
        let out = ranker(gen, 5, 0.0).rank(input).await.unwrap();
        assert_eq!(ids(&out), vec!["a", "b", "c"]);
        assert!(out.iter().all(|c| c.relevance_score == MISSING_SCORE));
    }

    #[tokio::test]
    async fn failed_category_falls_back_to_input_order() {
        let gen = ScriptedGenerator::with(vec![Err(GenerationError::new(ErrorKind::Other, "bad request"))]);
        let input = vec![item("a", "Tech"), item("b", "Tech"), item("c", "Tech")];
        let out = ranker(gen, 5, 6.0).rank(input.clone()).await.unwrap();
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn fallback_still_applies_category_cap() {
        let gen = ScriptedGenerator::with(vec![Ok("not json".into())]);
        let input = vec![item("a", "Tech"), item("b", "Tech"), item("c", "Tech")];
        let out = ranker(gen, 2, 0.0).rank(input).await.unwrap();
        assert_eq!(ids(&out), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn threshold_can_empty_the_result() {
        let gen = ScriptedGenerator::with(vec![Ok(
            r#"[{"id":"a","relevance_score":2},{"id":"b","relevance_score":3.5}]"#.into(),
        )]);
        let out = ranker(gen, 5, 4.0)
            .rank(vec![item("a", "Tech"), item("b", "Tech")])
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn quota_exhaustion_is_not_swallowed() {
        let gen = ScriptedGenerator::with(vec![Err(GenerationError::new(ErrorKind::QuotaExhausted, "daily"))]);
        let err = ranker(gen, 5, 0.0).rank(vec![item("a", "Tech")]).await.unwrap_err();
        assert!(find_call_error(&err).is_some_and(|e| e.is_quota_exhausted()));
    }
}
