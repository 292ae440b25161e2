use crate::{Direction, Id, IdempotencyKey, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// The immutable record of a threshold crossing, produced by the
/// evaluation engine and carried end-to-end as the outbox payload. At most
/// one logical occurrence exists per (rule id, generation).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AlertTrigger {
    pub trigger_id: Id,
    pub rule_id: Id,
    pub generation: i64,
    pub owner_id: Id,
    pub symbol: Symbol,
    pub direction: Direction,
    pub threshold: Decimal,
    pub trigger_price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub tick_timestamp: DateTime<Utc>,
    pub triggered_at: DateTime<Utc>,
    pub idempotency_key: IdempotencyKey,
}
