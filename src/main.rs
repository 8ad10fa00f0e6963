use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tg_digestbot::config::{self, Config};
use tg_digestbot::filter::Filter;
use tg_digestbot::formatter::MarkdownFormatter;
use tg_digestbot::llm::gemini::GeminiClient;
use tg_digestbot::llm::{RateLimitedClient, RetryPolicy};
use tg_digestbot::pipeline::{
    Generation, GenerationStages, Pipeline, PipelineDeps, PipelineError, PipelineOptions,
    RunMode, SystemClock,
};
use tg_digestbot::sources::RssCollector;
use tg_digestbot::stages::categorize::GeminiCategorizer;
use tg_digestbot::stages::rank::GeminiRanker;
use tg_digestbot::stages::summarize::GeminiSummarizer;
use tg_digestbot::store::FileStore;
use tg_digestbot::telegram::{RecipientManager, TelegramSender, TeloxideApi};

#[derive(Debug, Parser)]
#[command(author, version, about = "Collect news feeds and deliver a daily digest to Telegram")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Build the digest and store it for a later --send run
    #[arg(long, env = "BUILD_MODE", conflicts_with = "send")]
    build: bool,

    /// Deliver the stored digest (builds one first if none exists)
    #[arg(long, env = "SEND_MODE")]
    send: bool,

    /// Stop after filtering without calling the generation API
    #[arg(long, env = "SKIP_GEMINI")]
    skip_generation: bool,

    /// Run even when no recipients are registered
    #[arg(long, env = "FORCE_DISPATCH")]
    force_dispatch: bool,

    /// Send a short test message to all recipients and exit
    #[arg(long, env = "SEND_TEST_MESSAGE", conflicts_with_all = ["build", "send"])]
    test_message: bool,

    /// Print an example configuration and exit
    #[arg(long)]
    print_example_config: bool,
}

impl Args {
    fn mode(&self) -> RunMode {
        if self.test_message {
            RunMode::TestMessage
        } else if self.build {
            RunMode::Build
        } else if self.send {
            RunMode::Send
        } else {
            RunMode::Full
        }
    }
}

fn generation(cfg: &Config, skip: bool, cancel: &CancellationToken) -> Result<Generation> {
    if skip {
        return Ok(Generation::Skipped);
    }
    if cfg.gemini.api_key.trim().is_empty() {
        bail!("gemini.api_key (or GEMINI_API_KEY) must be set unless generation is skipped");
    }
    let gemini = GeminiClient::new(
        cfg.gemini.api_key.clone(),
        Duration::from_secs(cfg.gemini.request_timeout_secs),
    )?;
    let client = RateLimitedClient::new(Arc::new(gemini), RetryPolicy::default(), cancel.clone());
    Ok(Generation::Enabled(GenerationStages {
        categorizer: Arc::new(GeminiCategorizer::from_config(client.clone(), &cfg.gemini, &cfg.pipeline)),
        ranker: Arc::new(GeminiRanker::from_config(client.clone(), &cfg.gemini, &cfg.pipeline)),
        summarizer: Arc::new(GeminiSummarizer::from_config(client, &cfg.gemini)),
    }))
}

async fn run(args: Args, cancel: CancellationToken) -> Result<()> {
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let mode = args.mode();
    info!(?mode, sites = cfg.sites.len(), state_dir = %cfg.app.state_dir, "starting run");

    let telegram = Arc::new(TeloxideApi::new(cfg.telegram.bot_token.clone()));
    let deps = PipelineDeps {
        collector: Arc::new(RssCollector::new(cfg.sites.clone(), cancel.clone())?),
        filter: Filter::from_config(&cfg.pipeline),
        formatter: Arc::new(MarkdownFormatter::from_config(&cfg.pipeline)),
        sender: Arc::new(TelegramSender::new(telegram.clone(), cancel.clone())),
        recipients: Some(Arc::new(RecipientManager::new(telegram, cfg.telegram.auto_subscribe))),
        store: Arc::new(FileStore::new(cfg.state_dir())),
        clock: Arc::new(SystemClock),
        generation: generation(&cfg, args.skip_generation, &cancel)?,
    };
    let options = PipelineOptions {
        force_dispatch: args.force_dispatch,
        max_articles_before_generation: cfg.pipeline.max_articles_before_generation,
        stage_cooldown: cfg.pipeline.stage_cooldown(),
    };

    let outcome = Pipeline::new(deps, options, cancel).run(mode).await?;
    info!(?outcome, "run finished");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if args.print_example_config {
        print!("{}", config::example());
        return ExitCode::SUCCESS;
    }

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping");
            on_signal.cancel();
        }
    });

    match run(args, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<PipelineError>() {
                Some(p) if p.is_quota_exhausted() => {
                    error!(error = %format!("{err:#}"), "generation quota exhausted; try again after the quota resets");
                }
                Some(PipelineError::Cancelled) => warn!("run cancelled; state left unchanged"),
                _ => error!(error = %format!("{err:#}"), "run failed"),
            }
            ExitCode::FAILURE
        }
    }
}
