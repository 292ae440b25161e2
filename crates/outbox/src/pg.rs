use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use evaluator::{FireOutcome, FireStore, StoreError};
use models::{AlertRule, AlertTrigger, Direction, Id, OutboxRecord, OutboxStatus, RuleState};
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;

use crate::store::{RearmScope, RelayStore};

// Session-scoped advisory lock key for the re-arm sweep. Only one node runs
// the sweep at a time; the others skip their tick.
const REARM_LOCK_KEY: i64 = 0x7469_636b_6669_7265;

/// Postgres-backed rule and outbox storage.
///
/// All state transitions are conditional UPDATEs keyed on the current state,
/// so concurrent writers race safely: the loser's statement matches zero rows
/// and the caller observes `AlreadyHandled` (or a no-op).
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Return FIRED rules in `scope` to ARMED, bumping each generation.
    ///
    /// Guarded by a transaction-scoped advisory lock so overlapping sweeps
    /// from multiple nodes don't both run; the loser returns an empty batch.
    pub async fn rearm(&self, scope: RearmScope) -> Result<Vec<AlertRule>, StoreError> {
        let mut txn = self.pool.begin().await.map_err(store_err)?;

        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_xact_lock($1)")
            .bind(REARM_LOCK_KEY)
            .fetch_one(&mut *txn)
            .await
            .map_err(store_err)?;
        if !locked {
            tracing::debug!("re-arm sweep already running elsewhere, skipping");
            return Ok(Vec::new());
        }

        let rows: Vec<RuleRow> = match scope {
            RearmScope::All => {
                sqlx::query_as(
                    "UPDATE rules SET state = 'ARMED', generation = generation + 1, updated_at = NOW()
                     WHERE state = 'FIRED'
                     RETURNING id, owner_id, symbol, direction, threshold, state, generation, note",
                )
                .fetch_all(&mut *txn)
                .await
            }
            RearmScope::Rule(id) => {
                sqlx::query_as(
                    "UPDATE rules SET state = 'ARMED', generation = generation + 1, updated_at = NOW()
                     WHERE state = 'FIRED' AND id = $1
                     RETURNING id, owner_id, symbol, direction, threshold, state, generation, note",
                )
                .bind(id.to_string())
                .fetch_all(&mut *txn)
                .await
            }
        }
        .map_err(store_err)?;

        txn.commit().await.map_err(store_err)?;

        rows.into_iter().map(RuleRow::into_rule).collect()
    }
}

#[async_trait::async_trait]
impl FireStore for PgStore {
    async fn record_fire(&self, trigger: &AlertTrigger) -> Result<FireOutcome, StoreError> {
        let mut txn = self.pool.begin().await.map_err(store_err)?;

        let updated = sqlx::query(
            "UPDATE rules SET state = 'FIRED', last_seen_price = $3, updated_at = NOW()
             WHERE id = $1 AND state = 'ARMED' AND generation = $2",
        )
        .bind(trigger.rule_id.to_string())
        .bind(trigger.generation)
        .bind(trigger.trigger_price)
        .execute(&mut *txn)
        .await
        .map_err(store_err)?;

        if updated.rows_affected() == 0 {
            // Another worker won the race for this generation, or the rule
            // was disabled under us. Either way there is nothing to record.
            txn.rollback().await.map_err(store_err)?;
            return Ok(FireOutcome::AlreadyHandled);
        }

        let payload = serde_json::to_value(trigger)
            .context("serializing alert trigger")
            .map_err(StoreError::backend)?;

        sqlx::query(
            "INSERT INTO outbox (id, idempotency_key, payload, status, attempt_count, next_attempt_at, created_at)
             VALUES ($1, $2, $3, 'PENDING', 0, NOW(), NOW())
             ON CONFLICT (idempotency_key) DO NOTHING",
        )
        .bind(Id::generate().to_string())
        .bind(trigger.idempotency_key.as_str())
        .bind(payload)
        .execute(&mut *txn)
        .await
        .map_err(store_err)?;

        txn.commit().await.map_err(store_err)?;
        Ok(FireOutcome::Recorded)
    }

    async fn armed_page(
        &self,
        after: Option<Id>,
        limit: u32,
    ) -> Result<Vec<AlertRule>, StoreError> {
        let rows: Vec<RuleRow> = sqlx::query_as(
            "SELECT id, owner_id, symbol, direction, threshold, state, generation, note
             FROM rules
             WHERE state = 'ARMED' AND ($1::TEXT IS NULL OR id > $1)
             ORDER BY id
             LIMIT $2",
        )
        .bind(after.map(|id| id.to_string()))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.into_iter().map(RuleRow::into_rule).collect()
    }
}

#[async_trait::async_trait]
impl RelayStore for PgStore {
    async fn claim_batch(
        &self,
        limit: u32,
        visibility: Duration,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        // SKIP LOCKED keeps concurrent relay workers from serializing on the
        // same head-of-queue rows.
        let rows: Vec<OutboxRow> = sqlx::query_as(
            "WITH picked AS (
                SELECT id FROM outbox
                WHERE status = 'PENDING'
                  AND next_attempt_at <= NOW()
                  AND (claimed_until IS NULL OR claimed_until < NOW())
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox SET claimed_until = NOW() + make_interval(secs => $2)
            WHERE id IN (SELECT id FROM picked)
            RETURNING id, idempotency_key, payload, status, attempt_count,
                      next_attempt_at, claimed_until, last_error, created_at",
        )
        .bind(i64::from(limit))
        .bind(visibility.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        // UPDATE .. RETURNING does not preserve the CTE's ordering.
        let mut records = rows
            .into_iter()
            .map(OutboxRow::into_record)
            .collect::<Result<Vec<_>, _>>()?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn mark_sent(&self, id: &Id) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox SET status = 'SENT', claimed_until = NULL, last_error = NULL
             WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn retry_later(
        &self,
        id: &Id,
        attempt_count: i32,
        error: &str,
        delay: Duration,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox
             SET attempt_count = $2,
                 next_attempt_at = NOW() + make_interval(secs => $3),
                 claimed_until = NULL,
                 last_error = $4
             WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(id.to_string())
        .bind(attempt_count)
        .bind(delay.as_secs_f64())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn mark_failed(&self, id: &Id, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE outbox SET status = 'FAILED', claimed_until = NULL, last_error = $2
             WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(id.to_string())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn release_claim(&self, id: &Id) -> Result<(), StoreError> {
        sqlx::query("UPDATE outbox SET claimed_until = NULL WHERE id = $1 AND status = 'PENDING'")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct RuleRow {
    id: String,
    owner_id: String,
    symbol: String,
    direction: String,
    threshold: Decimal,
    state: String,
    generation: i64,
    note: Option<String>,
}

impl RuleRow {
    fn into_rule(self) -> Result<AlertRule, StoreError> {
        Ok(AlertRule {
            id: self.id.parse::<Id>().map_err(StoreError::backend)?,
            owner_id: self.owner_id.parse::<Id>().map_err(StoreError::backend)?,
            symbol: models::Symbol::new(&self.symbol),
            direction: self
                .direction
                .parse::<Direction>()
                .map_err(StoreError::backend)?,
            threshold: self.threshold,
            state: self.state.parse::<RuleState>().map_err(StoreError::backend)?,
            generation: self.generation,
            note: self.note,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: String,
    idempotency_key: String,
    payload: serde_json::Value,
    status: String,
    attempt_count: i32,
    next_attempt_at: DateTime<Utc>,
    claimed_until: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
}

impl OutboxRow {
    fn into_record(self) -> Result<OutboxRecord, StoreError> {
        Ok(OutboxRecord {
            id: self.id.parse::<Id>().map_err(StoreError::backend)?,
            idempotency_key: models::IdempotencyKey::from(self.idempotency_key),
            payload: self.payload,
            status: self
                .status
                .parse::<OutboxStatus>()
                .map_err(StoreError::backend)?,
            attempt_count: self.attempt_count,
            next_attempt_at: self.next_attempt_at,
            claimed_until: self.claimed_until,
            last_error: self.last_error,
            created_at: self.created_at,
        })
    }
}

fn store_err(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut => StoreError::Timeout,
        err => StoreError::Backend(err.into()),
    }
}
