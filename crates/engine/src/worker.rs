use std::sync::Arc;
use std::time::Duration;

use evaluator::{Engine, FireStore};
use feed::{partition_for, TickLog};
use models::Symbol;

/// Consumer group under which evaluation workers commit feed offsets.
pub const CONSUMER_GROUP: &str = "evaluator";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Total evaluation workers; each owns the partitions congruent to its
    /// index modulo this count.
    pub workers: u32,
    /// Ticks read per partition per poll.
    pub read_batch: u32,
    /// Page size for warm-up and index refresh.
    pub warmup_batch: u32,
    /// Sleep when every owned partition is caught up.
    pub idle_wait: Duration,
    /// How often to rebuild the armed index from a store snapshot, picking
    /// up rules created or re-armed since the last build.
    pub refresh_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            read_batch: 256,
            warmup_batch: 500,
            idle_wait: Duration::from_millis(50),
            refresh_interval: Duration::from_secs(30),
        }
    }
}

/// Run one evaluation worker until `shutdown` flips true.
///
/// The worker owns a static slice of the partition space, warms an index of
/// armed rules for the symbols routed to those partitions, and then polls
/// each owned partition in turn. Offsets commit only after every tick in
/// the batch has been durably evaluated; a store failure leaves the offset
/// behind so the ticks replay, and the transactional fire path makes that
/// replay idempotent.
pub async fn evaluation_worker<L, S>(
    worker: u32,
    config: WorkerConfig,
    log: Arc<L>,
    store: Arc<S>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    L: TickLog,
    S: FireStore,
{
    let partitions = log.partitions();
    let owned: Vec<u32> = (0..partitions)
        .filter(|p| p % config.workers == worker)
        .collect();
    let workers = config.workers;
    let owns = move |symbol: &Symbol| partition_for(symbol, partitions) % workers == worker;

    let mut engine = Engine::new(store);
    // Warm up, retrying transient store errors rather than dying before
    // serving any ticks.
    loop {
        match engine.refresh_index(config.warmup_batch, &owns).await {
            Ok(()) => break,
            Err(err) => {
                tracing::warn!(worker, error = %err, "warm-up failed, retrying");
                if *shutdown.borrow() {
                    return Ok(());
                }
                tokio::time::sleep(config.idle_wait).await;
            }
        }
    }
    tracing::info!(
        worker,
        partitions = owned.len(),
        rules = engine.index().armed_rules(),
        "evaluation worker warmed up",
    );

    let mut offsets = Vec::with_capacity(owned.len());
    for &partition in &owned {
        offsets.push(log.committed(CONSUMER_GROUP, partition).await?);
    }

    let mut last_refresh = tokio::time::Instant::now();
    while !*shutdown.borrow() {
        if last_refresh.elapsed() >= config.refresh_interval {
            // A failed refresh keeps the current index; the worker retries
            // at the next interval instead of dying on a transient error.
            if let Err(err) = engine.refresh_index(config.warmup_batch, &owns).await {
                tracing::warn!(worker, error = %err, "index refresh failed, keeping current index");
            }
            last_refresh = tokio::time::Instant::now();
        }

        let mut idle = true;
        for (slot, &partition) in owned.iter().enumerate() {
            let from = offsets[slot];
            let batch = match log.read(partition, from, config.read_batch).await {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::warn!(worker, partition, error = %err, "feed read failed, will retry");
                    tokio::time::sleep(config.idle_wait).await;
                    continue;
                }
            };
            if batch.is_empty() {
                continue;
            }
            idle = false;

            let mut next = from;
            let mut stalled = false;
            for sequenced in &batch {
                match engine.on_tick(&sequenced.tick).await {
                    Ok(_) => next = sequenced.offset + 1,
                    Err(err) => {
                        // Commit only the prefix; this tick replays after
                        // the pause.
                        tracing::warn!(
                            worker,
                            partition,
                            offset = sequenced.offset,
                            error = %err,
                            "tick evaluation failed, will replay",
                        );
                        stalled = true;
                        break;
                    }
                }
            }
            if next > from {
                match log.commit(CONSUMER_GROUP, partition, next).await {
                    Ok(()) => offsets[slot] = next,
                    Err(err) => {
                        // The batch replays from the old offset next round;
                        // the transactional fire path absorbs it.
                        tracing::warn!(worker, partition, error = %err, "offset commit failed, ticks will replay");
                        stalled = true;
                    }
                }
            }
            if stalled {
                tokio::time::sleep(config.idle_wait).await;
            }
        }

        if idle {
            tokio::select! {
                () = tokio::time::sleep(config.idle_wait) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    tracing::info!(worker, "evaluation worker stopped");
    Ok(())
}
