//! ThreatFlow - Main Entry Point

use std::sync::Arc;
use threatflow::alerts::LogAlertSink;
use threatflow::analysis::OllamaSummarizer;
use threatflow::fetcher::FeedFetcher;
use threatflow::scheduler::PipelineScheduler;
use threatflow::store::{MemoryStore, ThreatStore};
use threatflow::PipelineConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("ThreatFlow v{}", env!("CARGO_PKG_VERSION"));

    // Load config
    let config_path =
        std::env::var("CONFIG_PATH").unwrap_or_else(|_| "/etc/threatflow/pipeline.json".into());

    let config = PipelineConfig::load(&config_path).unwrap_or_else(|_| {
        tracing::warn!("Config not found, using defaults");
        PipelineConfig::default()
    });

    let store: Arc<dyn ThreatStore> = Arc::new(MemoryStore::new());
    let summarizer = Arc::new(OllamaSummarizer::new(&config));
    if summarizer.is_available().await {
        tracing::info!(model = %config.ollama_model, "analysis backend reachable");
    } else {
        tracing::warn!("analysis backend unreachable, heuristic fallback in effect");
    }

    let scheduler = PipelineScheduler::new(
        &config,
        Arc::new(FeedFetcher::new(&config)),
        store.clone(),
        summarizer,
        Arc::new(LogAlertSink),
    );

    scheduler.start().await;
    tracing::info!(feeds = config.feeds.len(), "pipeline running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    scheduler.shutdown().await;

    let counts = store.counts().await?;
    tracing::info!(
        threats = counts.threats,
        iocs = counts.iocs,
        analyses = counts.analyses,
        pending = counts.pending,
        "final pipeline counts"
    );

    Ok(())
}
