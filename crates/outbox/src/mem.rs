use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use evaluator::{FireOutcome, FireStore, StoreError};
use models::{AlertRule, AlertTrigger, Id, IdempotencyKey, OutboxRecord, OutboxStatus, RuleState};

use crate::store::{RearmScope, RelayStore};

/// In-memory store with the same transition semantics as [`crate::PgStore`].
///
/// One mutex guards all state, so `record_fire`'s rule update and outbox
/// insert are atomic just as they are inside a Postgres transaction. Used by
/// tests and by local runs without a database.
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    rules: BTreeMap<Id, AlertRule>,
    outbox: BTreeMap<Id, OutboxRecord>,
    // When non-zero, the next record_fire calls fail with a backend error.
    fail_record_fires: u32,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_rule(&self, rule: AlertRule) {
        let mut inner = self.lock();
        inner.rules.insert(rule.id, rule);
    }

    pub fn rule(&self, id: &Id) -> Option<AlertRule> {
        self.lock().rules.get(id).cloned()
    }

    /// All outbox records in creation order.
    pub fn records(&self) -> Vec<OutboxRecord> {
        self.lock().outbox.values().cloned().collect()
    }

    pub fn record_by_key(&self, key: &IdempotencyKey) -> Option<OutboxRecord> {
        self.lock()
            .outbox
            .values()
            .find(|r| &r.idempotency_key == key)
            .cloned()
    }

    /// Inject `n` backend failures into upcoming `record_fire` calls.
    pub fn fail_next_record_fires(&self, n: u32) {
        self.lock().fail_record_fires = n;
    }

    /// Counterpart of [`crate::PgStore::rearm`].
    pub async fn rearm(&self, scope: RearmScope) -> Result<Vec<AlertRule>, StoreError> {
        let mut inner = self.lock();
        let mut rearmed = Vec::new();
        for rule in inner.rules.values_mut() {
            if rule.state != RuleState::Fired {
                continue;
            }
            if let RearmScope::Rule(id) = scope {
                if rule.id != id {
                    continue;
                }
            }
            rule.state = RuleState::Armed;
            rule.generation += 1;
            rearmed.push(rule.clone());
        }
        Ok(rearmed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait::async_trait]
impl FireStore for MemStore {
    async fn record_fire(&self, trigger: &AlertTrigger) -> Result<FireOutcome, StoreError> {
        let mut inner = self.lock();

        if inner.fail_record_fires > 0 {
            inner.fail_record_fires -= 1;
            return Err(StoreError::backend(anyhow::anyhow!(
                "injected record_fire failure"
            )));
        }

        let Some(rule) = inner.rules.get_mut(&trigger.rule_id) else {
            return Ok(FireOutcome::AlreadyHandled);
        };
        if rule.state != RuleState::Armed || rule.generation != trigger.generation {
            return Ok(FireOutcome::AlreadyHandled);
        }
        rule.state = RuleState::Fired;

        // Unique idempotency_key, ON CONFLICT DO NOTHING.
        if inner
            .outbox
            .values()
            .all(|r| r.idempotency_key != trigger.idempotency_key)
        {
            let payload = serde_json::to_value(trigger).map_err(StoreError::backend)?;
            let now = Utc::now();
            let id = Id::generate();
            inner.outbox.insert(
                id,
                OutboxRecord {
                    id,
                    idempotency_key: trigger.idempotency_key.clone(),
                    payload,
                    status: OutboxStatus::Pending,
                    attempt_count: 0,
                    next_attempt_at: now,
                    claimed_until: None,
                    last_error: None,
                    created_at: now,
                },
            );
        }
        Ok(FireOutcome::Recorded)
    }

    async fn armed_page(
        &self,
        after: Option<Id>,
        limit: u32,
    ) -> Result<Vec<AlertRule>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .rules
            .values()
            .filter(|r| r.state == RuleState::Armed)
            .filter(|r| after.map_or(true, |a| r.id > a))
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl RelayStore for MemStore {
    async fn claim_batch(
        &self,
        limit: u32,
        visibility: Duration,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let mut inner = self.lock();
        let now = Utc::now();
        let until = now
            + chrono::Duration::from_std(visibility)
                .map_err(|err| StoreError::backend(anyhow::anyhow!("visibility: {err}")))?;

        let mut claimed = Vec::new();
        // Id order matches creation order for generated ids.
        for record in inner.outbox.values_mut() {
            if claimed.len() == limit as usize {
                break;
            }
            let due = record.status == OutboxStatus::Pending
                && record.next_attempt_at <= now
                && record.claimed_until.map_or(true, |c| c < now);
            if due {
                record.claimed_until = Some(until);
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_sent(&self, id: &Id) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(record) = inner.outbox.get_mut(id) {
            if record.status == OutboxStatus::Pending {
                record.status = OutboxStatus::Sent;
                record.claimed_until = None;
                record.last_error = None;
            }
        }
        Ok(())
    }

    async fn retry_later(
        &self,
        id: &Id,
        attempt_count: i32,
        error: &str,
        delay: Duration,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(record) = inner.outbox.get_mut(id) {
            if record.status == OutboxStatus::Pending {
                record.attempt_count = attempt_count;
                record.next_attempt_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .map_err(|err| StoreError::backend(anyhow::anyhow!("delay: {err}")))?;
                record.claimed_until = None;
                record.last_error = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, id: &Id, error: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(record) = inner.outbox.get_mut(id) {
            if record.status == OutboxStatus::Pending {
                record.status = OutboxStatus::Failed;
                record.claimed_until = None;
                record.last_error = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn release_claim(&self, id: &Id) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if let Some(record) = inner.outbox.get_mut(id) {
            if record.status == OutboxStatus::Pending {
                record.claimed_until = None;
            }
        }
        Ok(())
    }
}
