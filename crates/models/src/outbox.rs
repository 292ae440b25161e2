use crate::{Id, IdempotencyKey};
use chrono::{DateTime, Utc};

/// Delivery state of an outbox record. `Pending` records are claimed and
/// retried by the relay; `Sent` and `Failed` are terminal, and `Failed`
/// records remain visible for operator attention rather than being deleted.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OutboxStatus::Pending)
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = crate::ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(OutboxStatus::Pending),
            "SENT" => Ok(OutboxStatus::Sent),
            "FAILED" => Ok(OutboxStatus::Failed),
            other => Err(crate::ParseEnumError::new("outbox status", other)),
        }
    }
}

/// A durable intent-to-notify, written in the same transaction as the
/// rule's `Armed → Fired` transition and drained asynchronously by the
/// relay.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OutboxRecord {
    pub id: Id,
    pub idempotency_key: IdempotencyKey,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempt_count: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}
