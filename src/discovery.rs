//! Feed discovery: find category feeds linked from a site's main feeds.
//!
//! Starting from each configured feed URL, the page is fetched and scanned
//! for anything that looks like another feed: `<link rel="alternate">`
//! tags, feed-ish hrefs, anchors that mention RSS, bare feed URLs in text,
//! and `<link>` elements of RSS documents. Only pages that are real feed
//! documents are followed further, at most [`MAX_FOLLOW_PER_PAGE`] new URLs
//! each, so HTML listing pages cannot send the crawl in circles.
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{redirect, Client, Url};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::config::{Feed, Site};

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REDIRECTS: usize = 5;
/// New URLs followed from one feed document.
pub const MAX_FOLLOW_PER_PAGE: usize = 3;
/// Characters inspected when sniffing the page type.
const PREVIEW_CHARS: usize = 1000;
const FEED_MARKERS: [&str; 5] = ["/rss", "/feed", ".rss", ".xml", "/atom"];

static LINK_ALTERNATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<link\b[^>]*type=["']application/(?:rss|atom)\+xml["'][^>]*>"#)
        .expect("valid link regex")
});
static HREF_ATTR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\bhref=["']([^"']+)["']"#).expect("valid href regex"));
static HREF_FEEDISH: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\bhref=["']([^"']*(?:rss|feed|\.xml)[^"']*)["']"#).expect("valid href regex")
});
static ANCHOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<a\b([^>]*)>(.*?)</a>").expect("valid anchor regex"));
static TITLE_MENTIONS_RSS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)\btitle=["'][^"']*rss[^"']*["']"#).expect("valid title regex")
});
static BARE_FEED_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)https?://[^\s<>"']+/(?:rss|feed|category/[^/\s<>"']+/rss|rss/[^/\s<>"']+|feed/[^/\s<>"']+)[^\s<>"']*"#,
    )
    .expect("valid url regex")
});
static XML_LINK_TEXT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<link\b[^>/]*>(.*?)</link>").expect("valid xml link regex"));
static XML_FEED_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)https?://[^\s<>"']+(?:rss|feed|\.rss|\.xml)"#).expect("valid url regex")
});

/// Trim whitespace and trailing slashes so equal feeds compare equal.
pub fn normalize_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

pub fn looks_like_feed(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    FEED_MARKERS.iter().any(|m| lower.contains(m))
}

fn resolve(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }
    base.join(href).ok().map(|u| u.to_string())
}

/// What a fetched page turned out to be. A body can look like both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageKind {
    pub xml: bool,
    pub html: bool,
}

impl PageKind {
    pub fn sniff(content_type: &str, body: &str) -> Self {
        let content_type = content_type.to_ascii_lowercase();
        let preview = match body.char_indices().nth(PREVIEW_CHARS) {
            Some((end, _)) => &body[..end],
            None => body,
        };
        let lower = preview.to_ascii_lowercase();
        Self {
            xml: content_type.contains("xml") || body.starts_with("<?xml") || preview.contains("<rss"),
            html: content_type.contains("html") || lower.contains("<html") || lower.contains("<!doctype"),
        }
    }

    /// A real feed document, safe to crawl further.
    pub fn is_feed_document(&self) -> bool {
        self.xml && !self.html
    }
}

/// Feed-like URLs referenced by an HTML page, resolved against `page_url`.
/// The page itself is never reported.
pub fn extract_from_html(html: &str, page_url: &str) -> BTreeSet<String> {
    let Ok(base) = Url::parse(page_url) else {
        return BTreeSet::new();
    };
    let mut hrefs: Vec<&str> = Vec::new();

    for tag in LINK_ALTERNATE.find_iter(html) {
        if let Some(c) = HREF_ATTR.captures(tag.as_str()) {
            hrefs.push(c.get(1).map_or("", |m| m.as_str()));
        }
    }
    for c in HREF_FEEDISH.captures_iter(html) {
        hrefs.push(c.get(1).map_or("", |m| m.as_str()));
    }
    for c in ANCHOR.captures_iter(html) {
        let attrs = c.get(1).map_or("", |m| m.as_str());
        let text = c.get(2).map_or("", |m| m.as_str());
        if TITLE_MENTIONS_RSS.is_match(attrs) || text.to_ascii_lowercase().contains("rss") {
            if let Some(h) = HREF_ATTR.captures(attrs).and_then(|h| h.get(1)) {
                hrefs.push(h.as_str());
            }
        }
    }

    let own = normalize_url(page_url);
    let mut found: BTreeSet<String> = hrefs
        .into_iter()
        .filter_map(|href| resolve(&base, href))
        .filter(|url| looks_like_feed(url))
        .map(|url| normalize_url(&url))
        .filter(|url| *url != own)
        .collect();

    for m in BARE_FEED_URL.find_iter(html) {
        let url = m.as_str().trim_end_matches(['.', ',', ';', ':', ')', '!', '?', '"', '\'']);
        let url = normalize_url(url);
        if looks_like_feed(&url) && url != own {
            found.insert(url);
        }
    }
    found
}

/// Feed-like URLs inside an RSS document: `<link>` element text and
/// absolute URLs ending in a feed suffix.
pub fn extract_from_xml(xml: &str, page_url: &str) -> BTreeSet<String> {
    let Ok(base) = Url::parse(page_url) else {
        return BTreeSet::new();
    };
    let mut found = BTreeSet::new();
    for c in XML_LINK_TEXT.captures_iter(xml) {
        let text = c.get(1).map_or("", |m| m.as_str()).trim();
        let text = text
            .strip_prefix("<![CDATA[")
            .and_then(|t| t.strip_suffix("]]>"))
            .unwrap_or(text);
        if let Some(url) = resolve(&base, text) {
            if looks_like_feed(&url) {
                found.insert(normalize_url(&url));
            }
        }
    }
    for m in XML_FEED_URL.find_iter(xml) {
        found.insert(normalize_url(m.as_str()));
    }
    found
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Address after redirects; relative links resolve against it.
    pub url: String,
    pub content_type: String,
    pub body: String,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Page>;
}

pub struct HttpFetcher {
    http: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(FETCH_TIMEOUT)
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Page> {
        let res = self.http.get(url).send().await.context("request failed")?;
        let status = res.status();
        if status.as_u16() == 403 {
            bail!("forbidden (403); the site may be blocking automated requests");
        }
        if status.as_u16() >= 400 {
            bail!("unexpected status {status}");
        }
        let final_url = res.url().to_string();
        if final_url != url {
            debug!(from = url, to = %final_url, "followed redirect");
        }
        let content_type = res
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = res.text().await.context("failed to read body")?;
        Ok(Page {
            url: final_url,
            content_type,
            body,
        })
    }
}

pub struct FeedDiscoverer {
    fetcher: Arc<dyn PageFetcher>,
    max_depth: usize,
}

impl FeedDiscoverer {
    /// `max_depth` counts pages along one path; 1 fetches only the start.
    pub fn new(fetcher: Arc<dyn PageFetcher>, max_depth: usize) -> Self {
        Self { fetcher, max_depth }
    }

    /// Feeds reachable from `start`, excluding `start` itself.
    #[instrument(skip(self))]
    pub async fn discover(&self, start: &str) -> BTreeSet<String> {
        let start = normalize_url(start);
        let mut visited: HashSet<String> = HashSet::new();
        let mut found: BTreeSet<String> = BTreeSet::new();
        let mut queue: Vec<(String, usize)> = vec![(start.clone(), self.max_depth)];

        while let Some((url, depth)) = queue.pop() {
            if depth == 0 || !visited.insert(url.clone()) {
                continue;
            }
            let page = match self.fetcher.fetch(&url).await {
                Ok(page) => page,
                Err(err) => {
                    warn!(url = %url, error = %format!("{err:#}"), "fetch failed; skipping");
                    continue;
                }
            };
            let kind = PageKind::sniff(&page.content_type, &page.body);
            let mut here = BTreeSet::new();
            if kind.is_feed_document() {
                here.extend(extract_from_xml(&page.body, &page.url));
            }
            // Some sites answer feed URLs with an HTML listing page.
            here.extend(extract_from_html(&page.body, &page.url));
            debug!(url = %url, found = here.len(), "page scanned");

            if depth > 1 && kind.is_feed_document() {
                let next: Vec<String> = here
                    .iter()
                    .filter(|u| !visited.contains(*u))
                    .take(MAX_FOLLOW_PER_PAGE)
                    .cloned()
                    .collect();
                queue.extend(next.into_iter().map(|u| (u, depth - 1)));
            }
            found.extend(here);
        }
        found.remove(&start);
        found
    }

    /// The site with its discovered feeds merged in, or `None` when the
    /// site has no feed to start from.
    pub async fn discover_site(&self, site: &Site) -> Option<Site> {
        let feeds = site.feeds();
        if feeds.is_empty() {
            warn!(site = %site.id, "site has no feeds; skipping");
            return None;
        }
        let mut discovered = BTreeSet::new();
        for feed in &feeds {
            discovered.extend(self.discover(&feed.url).await);
        }
        let merged = merge_feeds(site, &discovered);
        info!(
            site = %site.id,
            configured = feeds.len(),
            total = merged.rss_feeds.len(),
            "feeds discovered"
        );
        Some(merged)
    }
}

/// Configured feeds first (categories kept), then discovered ones in
/// sorted order. The legacy `rss` field is folded into `rss_feeds`.
pub fn merge_feeds(site: &Site, discovered: &BTreeSet<String>) -> Site {
    let mut seen: HashSet<String> = HashSet::new();
    let mut feeds: Vec<Feed> = Vec::new();
    for feed in site.feeds() {
        let url = normalize_url(&feed.url);
        if seen.insert(url.clone()) {
            feeds.push(Feed { url, ..feed });
        }
    }
    for url in discovered {
        if seen.insert(url.clone()) {
            feeds.push(Feed {
                url: url.clone(),
                category: None,
            });
        }
    }
    Site {
        rss: None,
        rss_feeds: feeds,
        ..site.clone()
    }
}

/// Just the `sites` section; any other keys of a full config are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SiteList {
    #[serde(default)]
    pub sites: Vec<Site>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const SECTION_PAGE: &str = r##"<!DOCTYPE html>
<html><head>
<link rel="alternate" type="application/rss+xml" title="Home" href="/rss/home.rss">
</head><body>
<ul>
  <li><a href="/rss/the-gioi.rss">World</a></li>
  <li><a href="https://example.vn/rss/kinh-doanh.rss">Business</a></li>
  <li><a href="/tin-tuc" title="RSS news">News</a></li>
  <li><a href="#top">RSS</a></li>
  <li><a href="/about">About</a></li>
</ul>
<p>Also see https://other.vn/feed/sport, for sport.</p>
</body></html>"##;

    #[test]
    fn normalizes_and_recognizes_feed_urls() {
        assert_eq!(normalize_url("  https://a.vn/rss/ "), "https://a.vn/rss");
        assert!(looks_like_feed("https://a.vn/RSS/home.rss"));
        assert!(looks_like_feed("https://a.vn/atom"));
        assert!(looks_like_feed("https://a.vn/sitemap.xml"));
        assert!(!looks_like_feed("https://a.vn/about"));
    }

    #[test]
    fn html_extraction_collects_every_kind_of_reference() {
        let found = extract_from_html(SECTION_PAGE, "https://example.vn/rss");
        let expected: BTreeSet<String> = [
            "https://example.vn/rss/home.rss",
            "https://example.vn/rss/the-gioi.rss",
            "https://example.vn/rss/kinh-doanh.rss",
            "https://other.vn/feed/sport",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn html_extraction_never_reports_the_page_itself() {
        let html = r#"<a href="https://example.vn/rss/">RSS</a> https://example.vn/rss"#;
        assert!(extract_from_html(html, "https://example.vn/rss").is_empty());
    }

    #[test]
    fn xml_extraction_reads_link_elements_and_cdata() {
        let xml = r#"<?xml version="1.0"?><rss><channel>
<link>https://example.vn/rss/home.rss</link>
<item><link><![CDATA[https://example.vn/world/feed]]></link></item>
<item><link>https://example.vn/article-1.html</link></item>
<description>more at https://example.vn/tech.xml</description>
</channel></rss>"#;
        let found = extract_from_xml(xml, "https://example.vn/rss");
        let expected: BTreeSet<String> = [
            "https://example.vn/rss/home.rss",
            "https://example.vn/world/feed",
            "https://example.vn/tech.xml",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn page_kind_sniffs_headers_and_body() {
        let rss = PageKind::sniff("application/rss+xml; charset=utf-8", "<rss></rss>");
        assert!(rss.is_feed_document());
        let bare = PageKind::sniff("", "<?xml version=\"1.0\"?><rss/>");
        assert!(bare.is_feed_document());
        let listing = PageKind::sniff("text/xml", "<!DOCTYPE html><html></html>");
        assert!(listing.xml && listing.html);
        assert!(!listing.is_feed_document());
    }

    #[derive(Default)]
    struct MapFetcher {
        pages: HashMap<String, Page>,
        fetched: Mutex<Vec<String>>,
    }

    impl MapFetcher {
        fn page(mut self, url: &str, content_type: &str, body: &str) -> Self {
            self.pages.insert(
                url.to_string(),
                Page {
                    url: url.to_string(),
                    content_type: content_type.to_string(),
                    body: body.to_string(),
                },
            );
            self
        }

        fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageFetcher for MapFetcher {
        async fn fetch(&self, url: &str) -> Result<Page> {
            self.fetched.lock().unwrap().push(url.to_string());
            match self.pages.get(url) {
                Some(page) => Ok(page.clone()),
                None => bail!("unexpected status 404 Not Found"),
            }
        }
    }

    fn rss_linking(links: &[&str]) -> String {
        let links: String = links.iter().map(|l| format!("<link>{l}</link>")).collect();
        format!("<?xml version=\"1.0\"?><rss><channel>{links}</channel></rss>")
    }

    #[tokio::test]
    async fn depth_one_fetches_only_the_start_page() {
        let fetcher = Arc::new(MapFetcher::default().page(
            "https://a.vn/rss",
            "text/html",
            SECTION_PAGE,
        ));
        let found = FeedDiscoverer::new(fetcher.clone(), 1)
            .discover("https://a.vn/rss/")
            .await;
        assert_eq!(fetcher.fetched(), vec!["https://a.vn/rss"]);
        assert!(found.contains("https://a.vn/rss/home.rss"));
        assert!(!found.contains("https://a.vn/rss"));
    }

    #[tokio::test]
    async fn feed_documents_are_followed_with_a_per_page_limit() {
        let start = rss_linking(&[
            "https://a.vn/rss/1.rss",
            "https://a.vn/rss/2.rss",
            "https://a.vn/rss/3.rss",
            "https://a.vn/rss/4.rss",
        ]);
        let child = rss_linking(&["https://a.vn/rss/deep.rss", "https://a.vn/rss"]);
        let fetcher = Arc::new(
            MapFetcher::default()
                .page("https://a.vn/rss", "application/rss+xml", &start)
                .page("https://a.vn/rss/1.rss", "application/rss+xml", &child),
        );
        let found = FeedDiscoverer::new(fetcher.clone(), 2)
            .discover("https://a.vn/rss")
            .await;

        // Start plus three children; missing children are skipped.
        assert_eq!(fetcher.fetched().len(), 1 + MAX_FOLLOW_PER_PAGE);
        assert!(found.contains("https://a.vn/rss/4.rss"));
        assert!(found.contains("https://a.vn/rss/deep.rss"));
        assert!(!found.contains("https://a.vn/rss"));
    }

    #[tokio::test]
    async fn html_pages_are_not_followed() {
        let fetcher = Arc::new(MapFetcher::default().page(
            "https://a.vn/rss",
            "text/html",
            SECTION_PAGE,
        ));
        FeedDiscoverer::new(fetcher.clone(), 3)
            .discover("https://a.vn/rss")
            .await;
        assert_eq!(fetcher.fetched().len(), 1);
    }

    #[tokio::test]
    async fn sites_without_feeds_are_skipped() {
        let site = Site {
            id: "x".into(),
            name: "X".into(),
            url: "https://x.vn".into(),
            rss: None,
            rss_feeds: Vec::new(),
            language: None,
        };
        let discoverer = FeedDiscoverer::new(Arc::new(MapFetcher::default()), 1);
        assert!(discoverer.discover_site(&site).await.is_none());
    }

    #[test]
    fn merge_keeps_configured_feeds_first() {
        let site = Site {
            id: "vnx".into(),
            name: "VnExpress".into(),
            url: "https://vnexpress.net".into(),
            rss: None,
            rss_feeds: vec![Feed {
                url: "https://vnexpress.net/rss/tin-moi-nhat.rss/".into(),
                category: Some("Top stories".into()),
            }],
            language: Some("vi".into()),
        };
        let discovered: BTreeSet<String> = [
            "https://vnexpress.net/rss/the-gioi.rss",
            "https://vnexpress.net/rss/tin-moi-nhat.rss",
            "https://vnexpress.net/rss/kinh-doanh.rss",
        ]
        .into_iter()
        .map(String::from)
        .collect();

        let merged = merge_feeds(&site, &discovered);
        let urls: Vec<&str> = merged.rss_feeds.iter().map(|f| f.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://vnexpress.net/rss/tin-moi-nhat.rss",
                "https://vnexpress.net/rss/kinh-doanh.rss",
                "https://vnexpress.net/rss/the-gioi.rss",
            ]
        );
        assert_eq!(merged.rss_feeds[0].category.as_deref(), Some("Top stories"));
        assert_eq!(merged.rss_feeds[1].category, None);
        assert_eq!(merged.language.as_deref(), Some("vi"));
    }

    #[test]
    fn legacy_rss_field_is_folded_into_feeds() {
        let site = Site {
            id: "tn".into(),
            name: "Thanh Nien".into(),
            url: "https://thanhnien.vn".into(),
            rss: Some("https://thanhnien.vn/rss/home.rss".into()),
            rss_feeds: Vec::new(),
            language: None,
        };
        let merged = merge_feeds(&site, &BTreeSet::new());
        assert_eq!(merged.rss, None);
        assert_eq!(merged.rss_feeds.len(), 1);
        let yaml = serde_yaml::to_string(&SiteList { sites: vec![merged] }).unwrap();
        assert!(!yaml.contains("rss:"));
        assert!(!yaml.contains("language"));
    }

    #[test]
    fn site_list_reads_a_full_config() {
        let yaml = r#"
app:
  state_dir: ./state
telegram:
  bot_token: ""
sites:
  - id: vnx
    name: VnExpress
    url: https://vnexpress.net
    rss: https://vnexpress.net/rss/tin-moi-nhat.rss
"#;
        let list: SiteList = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(list.sites.len(), 1);
        assert_eq!(list.sites[0].feeds()[0].url, "https://vnexpress.net/rss/tin-moi-nhat.rss");
    }
}
