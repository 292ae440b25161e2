mod id;
mod key;
mod outbox;
mod rule;
mod tick;
mod trigger;

pub use id::{Id, IdGenerator, ParseIdError};
pub use key::IdempotencyKey;
pub use outbox::{OutboxRecord, OutboxStatus};
pub use rule::{AlertRule, Direction, RuleChange, RuleChangeKind, RuleState};
pub use tick::{Symbol, Tick};
pub use trigger::AlertTrigger;

#[derive(Debug, thiserror::Error)]
#[error("unrecognized {kind} value: '{value}'")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
