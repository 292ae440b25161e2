use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use outbox::{PgStore, Relay, RelayConfig, RearmScope, Transport, WebhookTransport};

use engine::{evaluation_worker, WorkerConfig};

/// Streaming price-alert daemon: replays a tick feed through partitioned
/// evaluation workers and relays fired alerts out of the transactional
/// outbox to a webhook.
#[derive(Debug, Parser)]
#[command(name = "tickfire", version)]
struct Args {
    /// Postgres connection string holding rules and the outbox.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
    /// Webhook endpoint alert notifications are POSTed to.
    #[arg(long, env = "WEBHOOK_URL")]
    webhook_url: url::Url,
    /// Newline-delimited JSON file of market ticks to replay.
    #[arg(long, env = "TICK_FILE")]
    tick_file: std::path::PathBuf,
    /// Feed partitions; ticks for one symbol always share a partition.
    #[arg(long, default_value = "4")]
    partitions: u32,
    /// Evaluation workers. Each owns partitions congruent to its index.
    #[arg(long, default_value = "2")]
    workers: u32,
    /// Outbox relay workers.
    #[arg(long, default_value = "2")]
    relays: u32,
    /// Delivery attempts before an outbox record is parked as FAILED.
    #[arg(long, default_value = "5")]
    max_attempts: u32,
    /// Relay poll interval in milliseconds when the outbox is empty.
    #[arg(long, default_value = "1000")]
    poll_interval_ms: u64,
    /// Outbox claim visibility timeout in seconds.
    #[arg(long, default_value = "30")]
    visibility_secs: u64,
    /// Seconds between armed-index snapshot refreshes.
    #[arg(long, default_value = "30")]
    refresh_interval_secs: u64,
    /// Seconds between sweeps returning FIRED rules to ARMED.
    #[arg(long, default_value = "86400")]
    rearm_interval_secs: u64,
    /// Webhook request timeout in seconds.
    #[arg(long, default_value = "10")]
    webhook_timeout_secs: u64,
    /// Maximum Postgres connections in the pool.
    #[arg(long, default_value = "8")]
    max_connections: u32,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    let result = runtime.block_on(run(args));

    // Non-blocking tasks (idle relays between polls) shouldn't hold up exit.
    runtime.shutdown_timeout(Duration::from_secs(5));
    result
}

async fn run(args: Args) -> anyhow::Result<()> {
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(args.max_connections)
        .connect(&args.database_url)
        .await
        .context("connecting to postgres")?;
    let store = Arc::new(PgStore::new(pool));

    let log = Arc::new(feed::MemLog::new(args.partitions));
    let loaded = feed::load_jsonl(&args.tick_file, &log)
        .await
        .with_context(|| format!("loading ticks from {}", args.tick_file.display()))?;
    tracing::info!(
        ticks = loaded,
        partitions = args.partitions,
        workers = args.workers,
        relays = args.relays,
        "starting tickfire",
    );

    let transport: Arc<dyn Transport> = Arc::new(WebhookTransport::new(
        args.webhook_url.clone(),
        Duration::from_secs(args.webhook_timeout_secs),
    )?);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut tasks = tokio::task::JoinSet::new();

    let worker_config = WorkerConfig {
        workers: args.workers,
        refresh_interval: Duration::from_secs(args.refresh_interval_secs),
        ..WorkerConfig::default()
    };
    for worker in 0..args.workers {
        tasks.spawn(evaluation_worker(
            worker,
            worker_config.clone(),
            log.clone(),
            store.clone(),
            shutdown_rx.clone(),
        ));
    }

    let relay_config = RelayConfig {
        max_attempts: args.max_attempts,
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        visibility: Duration::from_secs(args.visibility_secs),
        ..RelayConfig::default()
    };
    for _ in 0..args.relays {
        let relay = Relay::new(store.clone(), transport.clone(), relay_config.clone());
        let mut rx = shutdown_rx.clone();
        tasks.spawn(async move {
            relay.run(async move { _ = rx.changed().await }).await;
            Ok(())
        });
    }

    {
        let store = store.clone();
        let mut rx = shutdown_rx.clone();
        let interval = Duration::from_secs(args.rearm_interval_secs);
        tasks.spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {
                        match store.rearm(RearmScope::All).await {
                            Ok(rearmed) if !rearmed.is_empty() => {
                                tracing::info!(rules = rearmed.len(), "re-armed fired rules");
                            }
                            Ok(_) => {}
                            Err(err) => tracing::error!(error = %err, "re-arm sweep failed"),
                        }
                    }
                    _ = rx.changed() => return Ok(()),
                }
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    tracing::info!("shutdown signal received, draining");
    shutdown_tx.send(true).ok();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::error!(error = format!("{err:#}"), "task failed"),
            Err(err) => tracing::error!(error = %err, "task panicked"),
        }
    }
    Ok(())
}
