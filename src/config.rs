//! Configuration loader and validator for the digest bot.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::model::DEFAULT_CATEGORY;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub app: App,
    pub telegram: Telegram,
    #[serde(default)]
    pub gemini: Gemini,
    #[serde(default)]
    pub pipeline: Pipeline,
    #[serde(default)]
    pub sites: Vec<Site>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    /// Directory holding `state.json` and `digest.json`.
    pub state_dir: String,
}

/// Telegram bot settings. The token may come from `TELEGRAM_BOT_TOKEN` instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    #[serde(default)]
    pub bot_token: String,
    /// Register every chat that messages the bot as a recipient.
    #[serde(default)]
    pub auto_subscribe: bool,
}

/// Gemini models, batch sizes and request pacing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Gemini {
    pub api_key: String,
    pub model_categorization: String,
    pub model_ranking: String,
    pub model_summary: String,
    pub batch_size_categorization: usize,
    pub batch_size_summary: usize,
    pub categorization_delay_secs: u64,
    pub ranking_delay_secs: u64,
    pub summary_delay_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for Gemini {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model_categorization: "gemini-2.5-flash".into(),
            model_ranking: "gemini-2.5-flash".into(),
            model_summary: "gemini-2.5-flash".into(),
            batch_size_categorization: 15,
            batch_size_summary: 5,
            categorization_delay_secs: 30,
            ranking_delay_secs: 12,
            summary_delay_secs: 12,
            request_timeout_secs: 120,
        }
    }
}

/// Pipeline thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Pipeline {
    pub categories: Vec<String>,
    pub recency_max_hours: u32,
    pub min_content_length: usize,
    pub max_articles_per_category: usize,
    /// 0 disables the cap.
    pub max_total_messages: usize,
    /// 0 disables the pre-generation volume ceiling.
    pub max_articles_before_generation: usize,
    pub min_relevance_score: f64,
    pub stage_cooldown_secs: u64,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self {
            categories: vec![
                "Top stories".into(),
                "Economy".into(),
                "Society".into(),
                "Technology & Science".into(),
                "Travel".into(),
                DEFAULT_CATEGORY.into(),
            ],
            recency_max_hours: 48,
            min_content_length: 100,
            max_articles_per_category: 5,
            max_total_messages: 0,
            max_articles_before_generation: 60,
            min_relevance_score: 0.0,
            stage_cooldown_secs: 60,
        }
    }
}

impl Pipeline {
    /// Configured categories with the fallback category appended when missing.
    pub fn category_set(&self) -> Vec<String> {
        let mut set: Vec<String> = self
            .categories
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if !set.iter().any(|c| c.eq_ignore_ascii_case(DEFAULT_CATEGORY)) {
            set.push(DEFAULT_CATEGORY.to_string());
        }
        set
    }

    pub fn stage_cooldown(&self) -> Duration {
        Duration::from_secs(self.stage_cooldown_secs)
    }
}

/// One news site with one or more feeds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Site {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub url: String,
    /// Legacy single feed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rss: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rss_feeds: Vec<Feed>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Feed {
    pub url: String,
    /// Category hint attached to every article of this feed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

impl Site {
    /// Feeds to poll, preferring `rss_feeds` over the legacy `rss` field.
    pub fn feeds(&self) -> Vec<Feed> {
        if !self.rss_feeds.is_empty() {
            return self.rss_feeds.clone();
        }
        match self.rss.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => vec![Feed {
                url: url.to_string(),
                category: None,
            }],
            _ => Vec::new(),
        }
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.state_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.state_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.state_dir)
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(&self.app.state_dir)
    }

    /// Overlay secrets from the environment onto values read from YAML.
    pub fn apply_env(&mut self) {
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            if !token.trim().is_empty() {
                self.telegram.bot_token = token;
            }
        }
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if !key.trim().is_empty() {
                self.gemini.api_key = key;
            }
        }
    }
}

/// Load configuration from a YAML file, overlay env secrets and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    cfg.apply_env();
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.state_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.state_dir must be non-empty"));
    }
    if cfg.telegram.bot_token.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "telegram.bot_token (or TELEGRAM_BOT_TOKEN) must be non-empty",
        ));
    }

    let p = &cfg.pipeline;
    if p.recency_max_hours == 0 {
        return Err(ConfigError::Invalid("pipeline.recency_max_hours must be > 0"));
    }
    if p.max_articles_per_category == 0 {
        return Err(ConfigError::Invalid(
            "pipeline.max_articles_per_category must be > 0",
        ));
    }
    if !(0.0..=10.0).contains(&p.min_relevance_score) {
        return Err(ConfigError::Invalid(
            "pipeline.min_relevance_score must be within 0..=10",
        ));
    }

    let g = &cfg.gemini;
    if g.batch_size_categorization == 0 {
        return Err(ConfigError::Invalid(
            "gemini.batch_size_categorization must be > 0",
        ));
    }
    if g.batch_size_summary == 0 {
        return Err(ConfigError::Invalid("gemini.batch_size_summary must be > 0"));
    }
    if g.model_categorization.trim().is_empty()
        || g.model_ranking.trim().is_empty()
        || g.model_summary.trim().is_empty()
    {
        return Err(ConfigError::Invalid("gemini model names must be non-empty"));
    }

    for site in &cfg.sites {
        if site.id.trim().is_empty() {
            return Err(ConfigError::Invalid("sites[].id must be non-empty"));
        }
        if site.rss_feeds.iter().any(|f| f.url.trim().is_empty()) {
            return Err(ConfigError::Invalid("sites[].rss_feeds[].url must be non-empty"));
        }
    }

    Ok(())
}

/// Returns an example YAML configuration.
pub fn example() -> &'static str {
    r#"app:
  state_dir: "./state"

telegram:
  bot_token: "YOUR_TELEGRAM_BOT_TOKEN"
  auto_subscribe: true

gemini:
  model_categorization: "gemini-2.5-flash"
  model_ranking: "gemini-2.5-flash"
  model_summary: "gemini-2.5-flash"
  batch_size_categorization: 15
  batch_size_summary: 5
  categorization_delay_secs: 30
  ranking_delay_secs: 12
  summary_delay_secs: 12

pipeline:
  categories:
    - "Top stories"
    - "Economy"
    - "Society"
    - "Technology & Science"
    - "Travel"
    - "Other / Misc"
  recency_max_hours: 48
  min_content_length: 100
  max_articles_per_category: 5
  max_total_messages: 0
  max_articles_before_generation: 60
  min_relevance_score: 0
  stage_cooldown_secs: 60

sites:
  - id: "vnexpress"
    name: "VnExpress"
    url: "https://vnexpress.net"
    language: "vi"
    rss_feeds:
      - url: "https://vnexpress.net/rss/kinh-doanh.rss"
        category: "Economy"
      - url: "https://vnexpress.net/rss/the-gioi.rss"
  - id: "tuoitre"
    name: "Tuoi Tre"
    url: "https://tuoitre.vn"
    rss: "https://tuoitre.vn/rss/tin-moi-nhat.rss"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.sites.len(), 2);
        assert_eq!(cfg.pipeline.recency_max_hours, 48);
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let yaml = "app:\n  state_dir: ./s\ntelegram:\n  bot_token: t\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.gemini.batch_size_categorization, 15);
        assert_eq!(cfg.pipeline.max_articles_per_category, 5);
        assert!(cfg.sites.is_empty());
    }

    #[test]
    fn invalid_bot_token() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.telegram.bot_token = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("telegram.bot_token")),
            _ => panic!("wrong error"),
        }
    }

    #[test]
    fn invalid_pipeline_values() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.pipeline.recency_max_hours = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.pipeline.max_articles_per_category = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.pipeline.min_relevance_score = 11.0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.gemini.batch_size_summary = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn category_set_always_contains_default() {
        let mut p = Pipeline::default();
        p.categories = vec!["Economy".into(), "  ".into()];
        assert_eq!(p.category_set(), vec!["Economy".to_string(), DEFAULT_CATEGORY.to_string()]);
    }

    #[test]
    fn site_feeds_prefers_list_over_legacy() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        let feeds = cfg.sites[0].feeds();
        assert_eq!(feeds.len(), 2);
        assert_eq!(feeds[0].category.as_deref(), Some("Economy"));
        let legacy = cfg.sites[1].feeds();
        assert_eq!(legacy.len(), 1);
        assert!(legacy[0].category.is_none());
    }

    #[test]
    fn ensure_dirs_creates_state_dir() {
        let td = tempdir().unwrap();
        let state_path = td.path().join("state");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.state_dir = state_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(state_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert!(cfg.telegram.auto_subscribe);
    }
}
