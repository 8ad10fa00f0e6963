use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use tg_digestbot::discovery::{FeedDiscoverer, HttpFetcher, SiteList};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Find category feeds linked from each site's configured feeds and write an extended site list"
)]
struct Args {
    /// YAML file with a `sites` list (a full bot config works)
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Where to write the extended site list
    #[arg(long, default_value = "found_feeds.yaml")]
    output: PathBuf,

    /// Pages to follow along one path from a configured feed
    #[arg(long, default_value = "1")]
    depth: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("failed to read {}", args.config.display()))?;
    let input: SiteList = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse {}", args.config.display()))?;
    info!(sites = input.sites.len(), depth = args.depth, "discovering feeds");

    let discoverer = FeedDiscoverer::new(Arc::new(HttpFetcher::new()?), args.depth.max(1));
    let mut output = SiteList::default();
    for site in &input.sites {
        if let Some(extended) = discoverer.discover_site(site).await {
            output.sites.push(extended);
        }
    }
    output.sites.sort_by(|a, b| a.id.cmp(&b.id));

    let total: usize = output.sites.iter().map(|s| s.rss_feeds.len()).sum();
    let yaml = serde_yaml::to_string(&output).context("failed to serialize site list")?;
    let header = format!(
        "# Feeds found by discover_feeds from {}\n# Review before copying into the bot config.\n\n",
        args.config.display()
    );
    std::fs::write(&args.output, header + &yaml)
        .with_context(|| format!("failed to write {}", args.output.display()))?;
    info!(sites = output.sites.len(), feeds = total, output = %args.output.display(), "site list written");
    Ok(())
}
