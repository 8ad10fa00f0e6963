//! Keep/drop rules applied to freshly collected articles.
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;

use crate::config::Pipeline;
use crate::model::{Article, State};

#[derive(Debug, Clone)]
pub struct Filter {
    recency_max_hours: u32,
    min_content_length: usize,
}

impl Filter {
    pub fn new(recency_max_hours: u32, min_content_length: usize) -> Self {
        Self {
            recency_max_hours,
            min_content_length,
        }
    }

    pub fn from_config(cfg: &Pipeline) -> Self {
        Self::new(cfg.recency_max_hours, cfg.min_content_length)
    }

    /// Drop stale, future-dated, too-short, in-batch duplicate and
    /// already-delivered articles. Input order is preserved.
    pub fn apply(&self, articles: &[Article], state: &State, now: DateTime<Utc>) -> Vec<Article> {
        let sent: HashSet<&str> = state.sent_articles.iter().map(|a| a.id.as_str()).collect();
        let cutoff = now - Duration::hours(i64::from(self.recency_max_hours));
        let mut seen = HashSet::new();

        articles
            .iter()
            .filter(|article| {
                if article.published_at < cutoff || article.published_at > now {
                    return false;
                }
                if article.content.trim().chars().count() < self.min_content_length {
                    return false;
                }
                let key = canonical_key(article);
                if seen.contains(&key) || sent.contains(article.id.as_str()) {
                    return false;
                }
                // Only kept articles claim their key.
                seen.insert(key);
                true
            })
            .cloned()
            .collect()
    }
}

/// Lowercased, trimmed URL; the title stands in when the URL is empty.
pub fn canonical_key(article: &Article) -> String {
    let url = article.url.trim();
    if url.is_empty() {
        article.title.trim().to_lowercase()
    } else {
        url.to_lowercase()
    }
}
