use crate::{Id, ParseEnumError, Symbol};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Which side of the threshold a rule watches.
///
/// `Above` and `Below` fire on an edge-triggered crossing into the
/// threshold; `Cross` fires when consecutive prices strictly straddle it,
/// in either direction.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Above,
    Below,
    Cross,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Above => "ABOVE",
            Direction::Below => "BELOW",
            Direction::Cross => "CROSS",
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ABOVE" => Ok(Direction::Above),
            "BELOW" => Ok(Direction::Below),
            "CROSS" => Ok(Direction::Cross),
            other => Err(ParseEnumError::new("direction", other)),
        }
    }
}

/// Lifecycle state of an alert rule.
///
/// `Armed → Fired` happens at most once per arming generation; re-arming
/// increments the generation and returns the rule to `Armed`. `Disabled`
/// rules are never evaluated.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleState {
    Armed,
    Fired,
    Disabled,
}

impl RuleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleState::Armed => "ARMED",
            RuleState::Fired => "FIRED",
            RuleState::Disabled => "DISABLED",
        }
    }
}

impl std::str::FromStr for RuleState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ARMED" => Ok(RuleState::Armed),
            "FIRED" => Ok(RuleState::Fired),
            "DISABLED" => Ok(RuleState::Disabled),
            other => Err(ParseEnumError::new("rule state", other)),
        }
    }
}

/// A user-defined threshold rule, owned by the rule store. The evaluation
/// engine holds a read-through copy of the armed subset, keyed by symbol.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AlertRule {
    pub id: Id,
    pub owner_id: Id,
    pub symbol: Symbol,
    pub direction: Direction,
    pub threshold: Decimal,
    pub state: RuleState,
    pub generation: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleChangeKind {
    Created,
    Updated,
    Disabled,
    Rearmed,
}

/// A rule lifecycle event from the change feed, applied incrementally to a
/// worker's armed index between snapshot refreshes.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RuleChange {
    pub kind: RuleChangeKind,
    pub rule_id: Id,
    pub owner_id: Id,
    pub symbol: Symbol,
    pub direction: Direction,
    pub threshold: Decimal,
    pub generation: i64,
    pub timestamp: DateTime<Utc>,
}

impl RuleChange {
    /// The armed-rule view of this change, for index insertion.
    pub fn as_rule(&self) -> AlertRule {
        AlertRule {
            id: self.rule_id,
            owner_id: self.owner_id,
            symbol: self.symbol.clone(),
            direction: self.direction,
            threshold: self.threshold,
            state: RuleState::Armed,
            generation: self.generation,
            note: None,
        }
    }
}
