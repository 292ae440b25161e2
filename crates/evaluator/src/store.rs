use models::{AlertRule, AlertTrigger, Id};

/// Errors surfaced by a rule/outbox store. All are retryable from the
/// engine's perspective; logical conflicts are not errors (see
/// [`FireOutcome::AlreadyHandled`]).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error")]
    Backend(#[source] anyhow::Error),
    #[error("store operation timed out")]
    Timeout,
}

impl StoreError {
    pub fn backend(err: impl Into<anyhow::Error>) -> Self {
        Self::Backend(err.into())
    }
}

/// Result of attempting a rule's fire transition.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    /// The rule transitioned `Armed → Fired` and an outbox record was
    /// written, atomically.
    Recorded,
    /// The conditional update matched nothing: the rule already fired, was
    /// disabled, or re-armed into a newer generation. A no-op success,
    /// expected under races, retries, and tick replays.
    AlreadyHandled,
}

/// The transactional write seam the evaluation engine fires through.
///
/// `record_fire` must perform the rule-state transition and the outbox
/// insert as one atomic operation: no observer may ever see one without
/// the other.
#[async_trait::async_trait]
pub trait FireStore: Send + Sync + 'static {
    async fn record_fire(&self, trigger: &AlertTrigger) -> Result<FireOutcome, StoreError>;

    /// One keyset page of `ARMED` rules, ordered by rule id, for index
    /// rebuilds. Fired and disabled rules are excluded at the query, which
    /// is what makes tick replay after a restart safe.
    async fn armed_page(&self, after: Option<Id>, limit: u32)
        -> Result<Vec<AlertRule>, StoreError>;
}
