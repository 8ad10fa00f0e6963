use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fallback category for articles the generator could not (or did not) place.
pub const DEFAULT_CATEGORY: &str = "Other / Misc";

/// Ceiling for the sent-article ledger. Oldest insertions are evicted first.
pub const MAX_SENT_HISTORY: usize = 500;

/// An article as collected from a feed. Never mutated after collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Article {
    pub id: String,
    pub source: String,
    pub title: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
    pub language: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategorizedArticle {
    pub article: Article,
    pub category: String,
    /// 0..=10, zero until the ranking stage scores it.
    #[serde(default)]
    pub relevance_score: f64,
}

impl CategorizedArticle {
    pub fn new(article: Article, category: impl Into<String>) -> Self {
        Self {
            article,
            category: category.into(),
            relevance_score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DigestEntry {
    pub id: String,
    pub category: String,
    pub title: String,
    pub url: String,
    pub summary: String,
    pub source: String,
    pub published_at: DateTime<Utc>,
}

/// Persisted cross-run state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct State {
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sent_articles: Vec<SentArticle>,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
    #[serde(default)]
    pub telegram: TelegramCursor,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SentArticle {
    pub id: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    pub name: String,
    pub chat_id: String,
    pub updated_at: DateTime<Utc>,
}

/// Watermark for incremental `getUpdates` polling.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TelegramCursor {
    #[serde(default)]
    pub last_update_id: i64,
}

/// A fully built batch of outbound messages waiting for a send phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Digest {
    pub messages: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub article_ids: Vec<String>,
}
