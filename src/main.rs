use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use cve_poster::config::{Config, RunMode};
use cve_poster::generation::OpenAiGenerator;
use cve_poster::{
    BotPipeline, CandidateSelector, Collector, DedupChecker, GenerationPipeline, HttpSink,
    LogSink, NvdClient, PostSink, Publisher, Scheduler, Store,
};

#[derive(Parser, Debug)]
#[command(name = "cve-poster", about = "Posts short technical threads about interesting CVEs")]
struct Cli {
    /// Override RUN_MODE from the environment.
    #[arg(long, value_enum)]
    mode: Option<RunMode>,

    /// Run one generation cycle and exit instead of starting the timers.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(mode) = cli.mode {
        config.mode = mode;
    }
    info!(mode = ?config.mode, "Starting cve-poster");

    let store = Arc::new(Store::connect(&config.database_url).await?);
    let scheduler = Arc::new(Scheduler::load(store.clone(), config.posting.clone()).await?);

    let feed = Arc::new(NvdClient::new(
        config.nvd_api_url.clone(),
        config.nvd_request_delay_secs,
        30,
    )?);
    let collector = Collector::new(feed, store.clone(), config.collect.clone());

    let selector = CandidateSelector::new(config.selector.clone());
    let dedup = DedupChecker::new(config.dedup.overlap_threshold);

    let generation = GenerationPipeline::new(
        Arc::new(OpenAiGenerator::new(&config.generation)?),
        config.generation.clone(),
    );

    // The mode flag is read exactly once here; a cycle can never straddle a
    // test/live switch.
    let sink: Arc<dyn PostSink> = match config.mode {
        RunMode::Live => Arc::new(HttpSink::new(&config.publish)?),
        RunMode::Test => Arc::new(LogSink),
    };
    let publisher = Publisher::new(
        sink,
        store.clone(),
        scheduler.clone(),
        config.mode,
        config.posting.count_test_posts,
        &config.publish,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pipeline = Arc::new(BotPipeline::new(
        store,
        scheduler,
        collector,
        selector,
        dedup,
        generation,
        publisher,
        config.dedup.window_size,
        shutdown_rx,
    ));

    if cli.once {
        let report = pipeline.run_collection_cycle().await;
        info!(?report, "Collection cycle finished");
        let report = pipeline.run_generation_cycle().await;
        info!(?report, "Generation cycle finished");
        return Ok(());
    }

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
            return;
        }
        info!("Shutdown requested");
        let _ = shutdown_tx.send(true);
    });

    pipeline
        .run(
            Duration::from_secs(config.collect.cadence_secs),
            Duration::from_secs(config.generation_interval_secs),
        )
        .await;

    Ok(())
}
