//! Run orchestration: collect, filter, generate, format, deliver, persist.
//!
//! State is written only when a run reaches a successful or terminal end.
//! Any stage error leaves the previous `state.json` untouched, so the
//! sent-article ledger and the update cursor never move past work that did
//! not complete.
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::filter::Filter;
use crate::formatter::Formatter;
use crate::llm::{find_call_error, CallError};
use crate::model::{Article, Digest, Recipient, SentArticle, State, MAX_SENT_HISTORY};
use crate::stages::{Categorizer, Ranker, Summarizer};
use crate::store::StateStore;

/// Sent instead of a digest when nothing survives ranking.
pub const NO_RELEVANT_NEWS_MESSAGE: &str =
    "Not enough relevant news for a digest today. See you tomorrow.";

pub const TEST_MESSAGE: &str = "*Test message*\n\nThis chat is subscribed to the daily digest. \
The full digest is delivered automatically once a day.";

#[async_trait]
pub trait SourceCollector: Send + Sync {
    /// Per-feed failures are skipped, never fatal.
    async fn collect(&self) -> Result<Vec<Article>>;
}

#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, recipients: &[Recipient], messages: &[String]) -> Result<()>;
}

#[async_trait]
pub trait RecipientResolver: Send + Sync {
    /// May add recipients to `state` and advance its update cursor.
    async fn resolve(&self, state: &mut State) -> Result<Vec<Recipient>>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct GenerationStages {
    pub categorizer: Arc<dyn Categorizer>,
    pub ranker: Arc<dyn Ranker>,
    pub summarizer: Arc<dyn Summarizer>,
}

/// Whether the run may call the generation API at all.
pub enum Generation {
    Enabled(GenerationStages),
    /// Stop after filtering and report what would have been processed.
    Skipped,
}

pub struct PipelineDeps {
    pub collector: Arc<dyn SourceCollector>,
    pub filter: Filter,
    pub formatter: Arc<dyn Formatter>,
    pub sender: Arc<dyn Sender>,
    pub recipients: Option<Arc<dyn RecipientResolver>>,
    pub store: Arc<dyn StateStore>,
    pub clock: Arc<dyn Clock>,
    pub generation: Generation,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Proceed (without delivering) when there are no recipients.
    pub force_dispatch: bool,
    /// 0 disables the ceiling.
    pub max_articles_before_generation: usize,
    pub stage_cooldown: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            force_dispatch: false,
            max_articles_before_generation: 60,
            stage_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Build and deliver in one go.
    Full,
    /// Build a digest and persist it for a later `Send`.
    Build,
    /// Deliver a persisted digest, building one first if none exists.
    Send,
    TestMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Delivered { messages: usize, articles: usize },
    DigestBuilt { messages: usize, articles: usize },
    DigestSent { messages: usize, articles: usize },
    NoRelevantNews { persisted_digest: bool },
    EmptyDigest,
    DryRun { collected: usize, selected: usize },
    TestMessageSent { recipients: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    LoadState,
    Recipients,
    Collect,
    Categorize,
    Rank,
    Summarize,
    Format,
    Dispatch,
    SaveState,
    LoadDigest,
    SaveDigest,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::LoadState => "load state",
            Stage::Recipients => "resolve recipients",
            Stage::Collect => "collect",
            Stage::Categorize => "categorize",
            Stage::Rank => "rank",
            Stage::Summarize => "summarize",
            Stage::Format => "format",
            Stage::Dispatch => "dispatch",
            Stage::SaveState => "save state",
            Stage::LoadDigest => "load digest",
            Stage::SaveDigest => "save digest",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} stage failed")]
    Stage {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },
    #[error("no recipients registered; ask users to message the bot or enable force dispatch")]
    NoRecipients,
    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    /// The generation API's period quota ran out. Retrying before the
    /// quota resets is pointless.
    pub fn is_quota_exhausted(&self) -> bool {
        match self {
            PipelineError::Stage { source, .. } => {
                find_call_error(source).is_some_and(CallError::is_quota_exhausted)
            }
            _ => false,
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

/// Record `ids` as sent at `now`, evicting the oldest insertions beyond
/// [`MAX_SENT_HISTORY`], and stamp `last_run`. Ids already present are not
/// added again.
pub fn update_state(prev: &State, ids: &[String], now: DateTime<Utc>) -> State {
    let mut next = prev.clone();
    let mut seen: HashSet<String> = next.sent_articles.iter().map(|a| a.id.clone()).collect();
    for id in ids {
        if seen.insert(id.clone()) {
            next.sent_articles.push(SentArticle {
                id: id.clone(),
                sent_at: now,
            });
        }
    }
    if next.sent_articles.len() > MAX_SENT_HISTORY {
        let excess = next.sent_articles.len() - MAX_SENT_HISTORY;
        next.sent_articles.drain(..excess);
    }
    next.last_run = Some(now);
    next
}

/// Keep the newest `max` articles when over the ceiling.
fn limit_volume(mut articles: Vec<Article>, max: usize) -> Vec<Article> {
    if max == 0 || articles.len() <= max {
        return articles;
    }
    info!(before = articles.len(), max, "too many articles for generation; keeping the newest");
    articles.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    articles.truncate(max);
    articles
}

fn log_selection(collected: &[Article], selected: &[Article]) {
    let mut per_source: BTreeMap<&str, usize> = BTreeMap::new();
    for a in selected {
        *per_source.entry(a.source.as_str()).or_default() += 1;
    }
    info!(collected = collected.len(), selected = selected.len(), ?per_source, "articles selected for generation");
}

pub struct Pipeline {
    deps: PipelineDeps,
    options: PipelineOptions,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(deps: PipelineDeps, options: PipelineOptions, cancel: CancellationToken) -> Self {
        Self {
            deps,
            options,
            cancel,
        }
    }

    /// Wrap a collaborator error with its stage, unless the run was cancelled.
    fn fail(&self, stage: Stage) -> impl FnOnce(anyhow::Error) -> PipelineError + '_ {
        move |source| {
            let cancelled = self.cancel.is_cancelled()
                || find_call_error(&source).is_some_and(CallError::is_cancelled);
            if cancelled {
                PipelineError::Cancelled
            } else {
                PipelineError::Stage { stage, source }
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn run(&self, mode: RunMode) -> Result<RunOutcome, PipelineError> {
        let mut state = self.deps.store.load().await.map_err(self.fail(Stage::LoadState))?;
        let recipients = self.resolve_recipients(&mut state).await?;
        info!(recipients = recipients.len(), "state loaded");

        match mode {
            RunMode::TestMessage => self.send_test_message(&recipients).await,
            RunMode::Send => self.send_digest(state, recipients).await,
            RunMode::Full | RunMode::Build => self.generate(mode, state, recipients).await,
        }
    }

    async fn resolve_recipients(&self, state: &mut State) -> Result<Vec<Recipient>, PipelineError> {
        match &self.deps.recipients {
            Some(resolver) => resolver.resolve(state).await.map_err(self.fail(Stage::Recipients)),
            None => Ok(state
                .recipients
                .iter()
                .filter(|r| !r.chat_id.trim().is_empty())
                .cloned()
                .collect()),
        }
    }

    fn require_recipients(&self, recipients: &[Recipient]) -> Result<(), PipelineError> {
        if recipients.is_empty() && !self.options.force_dispatch {
            return Err(PipelineError::NoRecipients);
        }
        Ok(())
    }

    /// Deliver unless there is nobody to deliver to under force dispatch.
    async fn dispatch(&self, recipients: &[Recipient], messages: &[String]) -> Result<(), PipelineError> {
        if messages.is_empty() {
            return Ok(());
        }
        self.require_recipients(recipients)?;
        if recipients.is_empty() {
            warn!(messages = messages.len(), "no recipients; skipping delivery (force dispatch)");
            return Ok(());
        }
        self.deps
            .sender
            .send(recipients, messages)
            .await
            .map_err(self.fail(Stage::Dispatch))?;
        info!(messages = messages.len(), recipients = recipients.len(), "digest delivered");
        Ok(())
    }

    async fn save_state(&self, state: &State) -> Result<(), PipelineError> {
        self.deps.store.save(state).await.map_err(self.fail(Stage::SaveState))
    }

    async fn cooldown(&self) -> Result<(), PipelineError> {
        let wait = self.options.stage_cooldown;
        if wait.is_zero() {
            return Ok(());
        }
        info!(wait_secs = wait.as_secs(), "cooling down between generation stages");
        tokio::select! {
            _ = self.cancel.cancelled() => Err(PipelineError::Cancelled),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    async fn send_test_message(&self, recipients: &[Recipient]) -> Result<RunOutcome, PipelineError> {
        if recipients.is_empty() {
            return Err(PipelineError::NoRecipients);
        }
        self.deps
            .sender
            .send(recipients, &[TEST_MESSAGE.to_string()])
            .await
            .map_err(self.fail(Stage::Dispatch))?;
        info!(recipients = recipients.len(), "test message sent");
        Ok(RunOutcome::TestMessageSent {
            recipients: recipients.len(),
        })
    }

    async fn send_digest(&self, state: State, recipients: Vec<Recipient>) -> Result<RunOutcome, PipelineError> {
        let digest = self
            .deps
            .store
            .load_digest()
            .await
            .map_err(self.fail(Stage::LoadDigest))?;
        let Some(digest) = digest else {
            info!("no persisted digest; building and sending in this run");
            return self.generate(RunMode::Full, state, recipients).await;
        };
        info!(
            created_at = %digest.created_at,
            messages = digest.messages.len(),
            articles = digest.article_ids.len(),
            "persisted digest loaded"
        );

        if digest.messages.is_empty() {
            if let Err(err) = self.deps.store.delete_digest().await {
                warn!(error = %format!("{err:#}"), "failed to delete empty digest");
            }
            return Ok(RunOutcome::EmptyDigest);
        }

        self.dispatch(&recipients, &digest.messages).await?;
        let next = update_state(&state, &digest.article_ids, self.deps.clock.now());
        self.save_state(&next).await?;
        // Only after delivery and the state write.
        if let Err(err) = self.deps.store.delete_digest().await {
            warn!(error = %format!("{err:#}"), "failed to delete sent digest");
        }
        Ok(RunOutcome::DigestSent {
            messages: digest.messages.len(),
            articles: digest.article_ids.len(),
        })
    }

    async fn generate(
        &self,
        mode: RunMode,
        state: State,
        recipients: Vec<Recipient>,
    ) -> Result<RunOutcome, PipelineError> {
        // Fail before spending generation quota on a digest nobody gets.
        if mode == RunMode::Full {
            self.require_recipients(&recipients)?;
        }

        let collected = self
            .deps
            .collector
            .collect()
            .await
            .map_err(self.fail(Stage::Collect))?;
        let filtered = self.deps.filter.apply(&collected, &state, self.deps.clock.now());
        info!(collected = collected.len(), kept = filtered.len(), "filtered");
        let selected = limit_volume(filtered, self.options.max_articles_before_generation);
        log_selection(&collected, &selected);

        let stages = match &self.deps.generation {
            Generation::Enabled(stages) => stages,
            Generation::Skipped => {
                info!("generation skipped; stopping before any API call");
                return Ok(RunOutcome::DryRun {
                    collected: collected.len(),
                    selected: selected.len(),
                });
            }
        };

        let categorized = stages
            .categorizer
            .categorize(&selected)
            .await
            .map_err(self.fail(Stage::Categorize))?;
        info!(categorized = categorized.len(), "categorized");

        let ranked = if categorized.is_empty() {
            Vec::new()
        } else {
            self.cooldown().await?;
            stages
                .ranker
                .rank(categorized)
                .await
                .map_err(self.fail(Stage::Rank))?
        };
        info!(ranked = ranked.len(), "ranked");
        if ranked.is_empty() {
            return self.no_relevant_news(mode, &state, &recipients).await;
        }

        self.cooldown().await?;
        let entries = stages
            .summarizer
            .summarize(&ranked)
            .await
            .map_err(self.fail(Stage::Summarize))?;
        let formatted = self
            .deps
            .formatter
            .build_messages(&entries, self.deps.clock.now().date_naive())
            .map_err(self.fail(Stage::Format))?;
        info!(
            entries = entries.len(),
            messages = formatted.messages.len(),
            "digest formatted"
        );

        if mode == RunMode::Build {
            let digest = Digest {
                messages: formatted.messages,
                created_at: self.deps.clock.now(),
                article_ids: formatted.article_ids,
            };
            self.deps
                .store
                .save_digest(&digest)
                .await
                .map_err(self.fail(Stage::SaveDigest))?;
            info!(messages = digest.messages.len(), articles = digest.article_ids.len(), "digest saved for later delivery");
            return Ok(RunOutcome::DigestBuilt {
                messages: digest.messages.len(),
                articles: digest.article_ids.len(),
            });
        }

        self.dispatch(&recipients, &formatted.messages).await?;
        let next = update_state(&state, &formatted.article_ids, self.deps.clock.now());
        self.save_state(&next).await?;
        Ok(RunOutcome::Delivered {
            messages: formatted.messages.len(),
            articles: formatted.article_ids.len(),
        })
    }

    /// Terminal path: a single service message instead of a digest. The
    /// sent-article ledger is left alone.
    async fn no_relevant_news(
        &self,
        mode: RunMode,
        state: &State,
        recipients: &[Recipient],
    ) -> Result<RunOutcome, PipelineError> {
        info!("no relevant articles after ranking");
        let messages = vec![NO_RELEVANT_NEWS_MESSAGE.to_string()];

        if mode == RunMode::Build {
            let digest = Digest {
                messages,
                created_at: self.deps.clock.now(),
                article_ids: Vec::new(),
            };
            self.deps
                .store
                .save_digest(&digest)
                .await
                .map_err(self.fail(Stage::SaveDigest))?;
            return Ok(RunOutcome::NoRelevantNews {
                persisted_digest: true,
            });
        }

        self.dispatch(recipients, &messages).await?;
        let next = update_state(state, &[], self.deps.clock.now());
        self.save_state(&next).await?;
        Ok(RunOutcome::NoRelevantNews {
            persisted_digest: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn ids(range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|i| format!("id-{i}")).collect()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 6, 0, 0).unwrap()
    }

    #[test]
    fn update_state_is_idempotent() {
        let batch = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let once = update_state(&State::default(), &batch, t0());
        let twice = update_state(&once, &batch, t0() + ChronoDuration::minutes(1));
        let ledger: Vec<&str> = twice.sent_articles.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ledger, vec!["a", "b"]);
        // First sighting keeps its timestamp.
        assert_eq!(twice.sent_articles[0].sent_at, t0());
        assert_eq!(twice.last_run, Some(t0() + ChronoDuration::minutes(1)));
    }

    #[test]
    fn update_state_evicts_oldest_insertions() {
        let full = update_state(&State::default(), &ids(0..MAX_SENT_HISTORY), t0());
        assert_eq!(full.sent_articles.len(), MAX_SENT_HISTORY);

        let next = update_state(&full, &ids(MAX_SENT_HISTORY..MAX_SENT_HISTORY + 3), t0());
        assert_eq!(next.sent_articles.len(), MAX_SENT_HISTORY);
        assert_eq!(next.sent_articles[0].id, "id-3");
        assert_eq!(next.sent_articles.last().unwrap().id, format!("id-{}", MAX_SENT_HISTORY + 2));
    }

    #[test]
    fn update_state_with_no_ids_only_stamps_last_run() {
        let prev = update_state(&State::default(), &ids(0..2), t0());
        let next = update_state(&prev, &[], t0() + ChronoDuration::hours(24));
        assert_eq!(next.sent_articles, prev.sent_articles);
        assert_eq!(next.last_run, Some(t0() + ChronoDuration::hours(24)));
    }

    #[test]
    fn limit_volume_keeps_newest() {
        let mk = |id: &str, hours: i64| Article {
            id: id.into(),
            source: "s".into(),
            title: id.into(),
            url: format!("https://e.com/{id}"),
            published_at: t0() - ChronoDuration::hours(hours),
            language: "vi".into(),
            content: String::new(),
            metadata: Default::default(),
        };
        let input = vec![mk("old", 10), mk("new", 1), mk("mid", 5)];
        let out = limit_volume(input.clone(), 2);
        let kept: Vec<&str> = out.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(kept, vec!["new", "mid"]);
        assert_eq!(limit_volume(input.clone(), 0), input);
        assert_eq!(limit_volume(input.clone(), 3), input);
    }

    #[test]
    fn quota_exhaustion_is_visible_through_stage_errors() {
        use crate::llm::{ErrorKind, GenerationError};
        let source = anyhow::Error::new(CallError::QuotaExhausted(GenerationError::new(
            ErrorKind::QuotaExhausted,
            "per day",
        )))
        .context("categorize batch 1/1");
        let err = PipelineError::Stage {
            stage: Stage::Categorize,
            source,
        };
        assert!(err.is_quota_exhausted());
        assert_eq!(err.stage(), Some(Stage::Categorize));
        assert_eq!(err.to_string(), "categorize stage failed");
        assert!(!PipelineError::NoRecipients.is_quota_exhausted());
    }
}
