use std::sync::Arc;
use std::time::Duration;

use futures::future::FutureExt;
use metrics::counter;
use models::OutboxRecord;

use crate::store::RelayStore;
use crate::transport::Transport;

/// Tuning for a relay worker.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum records claimed per poll.
    pub batch_limit: u32,
    /// Sleep between polls that find no due records.
    pub poll_interval: Duration,
    /// How long a claim shields a record from other workers.
    pub visibility: Duration,
    /// Attempts before a record is parked as FAILED.
    pub max_attempts: u32,
    /// First retry delay; doubles per attempt up to `backoff_cap`.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_limit: 16,
            poll_interval: Duration::from_secs(1),
            visibility: Duration::from_secs(30),
            max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }
}

/// An outbox relay worker: claims due PENDING records and delivers each over
/// the transport, retrying transient failures with capped exponential backoff.
///
/// Delivery is at-least-once. If the process dies between a successful
/// delivery and `mark_sent`, the record is re-delivered once its claim
/// expires; receivers deduplicate on the idempotency key.
pub struct Relay<S> {
    store: Arc<S>,
    transport: Arc<dyn Transport>,
    config: RelayConfig,
}

impl<S: RelayStore> Relay<S> {
    pub fn new(store: Arc<S>, transport: Arc<dyn Transport>, config: RelayConfig) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    /// Run until `shutdown` resolves. Records claimed but not yet attempted
    /// at shutdown have their claims released rather than waiting out the
    /// visibility timeout.
    pub async fn run(self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            let batch = tokio::select! {
                () = &mut shutdown => break,
                claimed = self.store.claim_batch(self.config.batch_limit, self.config.visibility) => {
                    match claimed {
                        Ok(batch) => batch,
                        Err(err) => {
                            tracing::error!(error = ?err, "failed to claim outbox batch");
                            Vec::new()
                        }
                    }
                }
            };

            if batch.is_empty() {
                let pause = jittered(self.config.poll_interval);
                tokio::select! {
                    () = tokio::time::sleep(pause) => continue,
                    () = &mut shutdown => break,
                }
            }

            let mut records = batch.into_iter();
            let mut stopping = false;
            for record in records.by_ref() {
                self.deliver_one(record).await;

                if (&mut shutdown).now_or_never().is_some() {
                    stopping = true;
                    break;
                }
            }
            if stopping {
                for record in records {
                    if let Err(err) = self.store.release_claim(&record.id).await {
                        tracing::warn!(record_id = %record.id, error = ?err, "failed to release claim at shutdown");
                    }
                }
                break;
            }
        }

        tracing::info!("outbox relay stopped");
    }

    async fn deliver_one(&self, record: OutboxRecord) {
        match self.transport.deliver(&record.payload).await {
            Ok(()) => {
                if let Err(err) = self.store.mark_sent(&record.id).await {
                    // The claim will expire and the record be re-delivered;
                    // receivers dedup on the idempotency key.
                    tracing::error!(record_id = %record.id, error = ?err, "delivered but failed to mark SENT");
                    return;
                }
                counter!("tickfire_outbox_sent_total").increment(1);
                tracing::info!(
                    record_id = %record.id,
                    idempotency_key = %record.idempotency_key,
                    attempt = record.attempt_count + 1,
                    "notification delivered",
                );
            }
            Err(err) => {
                let attempts = record.attempt_count.saturating_add(1);
                if attempts >= self.config.max_attempts as i32 {
                    counter!("tickfire_outbox_failed_total").increment(1);
                    tracing::error!(
                        record_id = %record.id,
                        attempts,
                        error = format!("{err:#}"),
                        "delivery failed terminally, parking record",
                    );
                    if let Err(err) = self.store.mark_failed(&record.id, &format!("{err:#}")).await
                    {
                        tracing::error!(record_id = %record.id, error = ?err, "failed to mark FAILED");
                    }
                } else {
                    let delay = backoff(&self.config, attempts as u32);
                    counter!("tickfire_outbox_retried_total").increment(1);
                    tracing::warn!(
                        record_id = %record.id,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = format!("{err:#}"),
                        "delivery failed, scheduling retry",
                    );
                    if let Err(err) = self
                        .store
                        .retry_later(&record.id, attempts, &format!("{err:#}"), delay)
                        .await
                    {
                        tracing::error!(record_id = %record.id, error = ?err, "failed to schedule retry");
                    }
                }
            }
        }
    }
}

// base * 2^(attempt-1), capped, with +/- 10% jitter so retries from a burst
// of failures don't land on the same instant.
fn backoff(config: &RelayConfig, attempt: u32) -> Duration {
    let exp = config
        .backoff_base
        .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
    jittered(exp.min(config.backoff_cap))
}

fn jittered(d: Duration) -> Duration {
    d.mul_f64(0.9 + rand::random::<f64>() * 0.2)
}
