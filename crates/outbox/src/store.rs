use std::time::Duration;

use evaluator::StoreError;
use models::{Id, OutboxRecord};

/// Which FIRED rules a re-arm sweep should return to ARMED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RearmScope {
    /// Every FIRED rule (the scheduled daily sweep).
    All,
    /// A single rule, re-armed on demand by its owner.
    Rule(Id),
}

/// Storage operations used by relay workers to drain the outbox.
///
/// `claim_batch` must hand each due PENDING record to at most one caller at a
/// time; a claim expires after `visibility` so that records held by a crashed
/// worker become claimable again. Terminal transitions (`mark_sent`,
/// `mark_failed`) must be no-ops on records that already left PENDING.
#[async_trait::async_trait]
pub trait RelayStore: Send + Sync + 'static {
    /// Claim up to `limit` due PENDING records, oldest first, marking each
    /// invisible to other workers until `visibility` elapses.
    async fn claim_batch(
        &self,
        limit: u32,
        visibility: Duration,
    ) -> Result<Vec<OutboxRecord>, StoreError>;

    /// Record a successful delivery.
    async fn mark_sent(&self, id: &Id) -> Result<(), StoreError>;

    /// Schedule another attempt after `delay`, releasing the claim.
    async fn retry_later(
        &self,
        id: &Id,
        attempt_count: i32,
        error: &str,
        delay: Duration,
    ) -> Result<(), StoreError>;

    /// Park the record as FAILED for operator inspection.
    async fn mark_failed(&self, id: &Id, error: &str) -> Result<(), StoreError>;

    /// Drop the claim without recording an attempt, as on worker shutdown.
    async fn release_claim(&self, id: &Id) -> Result<(), StoreError>;
}
