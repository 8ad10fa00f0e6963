//! RSS collection.
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::{Feed, Site};
use crate::model::Article;
use crate::pipeline::SourceCollector;

const USER_AGENT: &str = "Mozilla/5.0 (compatible; tg-digestbot/0.1)";
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_ENTRIES_PER_FEED: usize = 100;
const DEFAULT_LANGUAGE: &str = "vi";

/// A `&` followed by a well-formed entity reference, or a bare `&`.
static AMPERSAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"&(#[0-9]+;|#x[0-9a-fA-F]+;|[a-zA-Z][a-zA-Z0-9]*;)?").expect("valid entity regex")
});

pub struct RssCollector {
    sites: Vec<Site>,
    http: Client,
    cancel: CancellationToken,
}

impl RssCollector {
    pub fn new(sites: Vec<Site>, cancel: CancellationToken) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(FETCH_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { sites, http, cancel })
    }

    #[instrument(skip_all, fields(site = %site.id, url = %feed.url))]
    async fn fetch_feed(&self, site: &Site, feed: &Feed) -> Result<Vec<Article>> {
        let res = self.http.get(&feed.url).send().await.context("request failed")?;
        let status = res.status();
        if status.as_u16() >= 400 {
            bail!("unexpected status {status}");
        }
        let body = res.bytes().await.context("failed to read body")?;
        parse_feed(site, feed, &body, Utc::now())
    }
}

#[async_trait]
impl SourceCollector for RssCollector {
    /// Feed failures are logged and skipped; whatever succeeded is returned.
    #[instrument(skip_all, fields(sites = self.sites.len()))]
    async fn collect(&self) -> Result<Vec<Article>> {
        let mut out = Vec::new();
        for site in &self.sites {
            for feed in site.feeds() {
                let result = tokio::select! {
                    _ = self.cancel.cancelled() => bail!("collection cancelled"),
                    r = self.fetch_feed(site, &feed) => r,
                };
                match result {
                    Ok(articles) => {
                        info!(site = %site.id, url = %feed.url, count = articles.len(), "feed collected");
                        out.extend(articles);
                    }
                    Err(err) => {
                        warn!(site = %site.id, url = %feed.url, error = %format!("{err:#}"), "feed failed; skipping");
                    }
                }
            }
        }
        info!(total = out.len(), "collection finished");
        Ok(out)
    }
}

/// Escape every `&` that does not start a well-formed entity reference.
pub fn repair_entities(xml: &str) -> Cow<'_, str> {
    AMPERSAND.replace_all(xml, |caps: &Captures<'_>| match caps.get(1) {
        Some(entity) => format!("&{}", entity.as_str()),
        None => "&amp;".to_string(),
    })
}

/// Stable for the same site, URL and publication second.
pub fn article_id(site_id: &str, url: &str, published_at: DateTime<Utc>) -> String {
    let digest = Sha256::digest(url.as_bytes());
    format!("{}-{}-{}", site_id, &hex::encode(digest)[..16], published_at.timestamp())
}

pub fn parse_feed(site: &Site, feed: &Feed, body: &[u8], now: DateTime<Utc>) -> Result<Vec<Article>> {
    let text = String::from_utf8_lossy(body);
    let repaired = repair_entities(&text);
    let parsed = feed_rs::parser::parse(repaired.as_bytes()).context("failed to parse feed")?;

    let language = site
        .language
        .clone()
        .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());

    let mut articles = Vec::new();
    for (rank, entry) in parsed.entries.into_iter().take(MAX_ENTRIES_PER_FEED).enumerate() {
        let title = entry
            .title
            .as_ref()
            .map(|t| t.content.trim().to_string())
            .unwrap_or_default();
        let url = entry
            .links
            .first()
            .map(|l| l.href.trim().to_string())
            .unwrap_or_default();
        if title.is_empty() || url.is_empty() {
            continue;
        }

        let content = entry
            .content
            .as_ref()
            .and_then(|c| c.body.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| {
                entry
                    .summary
                    .as_ref()
                    .map(|s| s.content.trim())
                    .filter(|s| !s.is_empty())
            })
            .unwrap_or(title.as_str())
            .to_string();

        let published_at = entry.published.or(entry.updated).unwrap_or_else(|| {
            warn!(url = %url, "entry has no usable date; using current time");
            now
        });

        let mut metadata = BTreeMap::new();
        metadata.insert("rss_rank".to_string(), rank.to_string());
        metadata.insert("site_name".to_string(), site.name.clone());
        if let Some(category) = feed.category.as_deref().filter(|c| !c.trim().is_empty()) {
            metadata.insert("rss_category".to_string(), category.to_string());
        }

        articles.push(Article {
            id: article_id(&site.id, &url, published_at),
            source: site.id.clone(),
            title,
            url,
            published_at,
            language: language.clone(),
            content,
            metadata,
        });
    }
    Ok(articles)
}
