use crate::Id;

/// Deterministic identifier which downstream consumers use to collapse
/// duplicate deliveries of the same logical trigger. Derived from the
/// (rule id, generation) pair, so a re-armed rule opens a fresh scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn derive(rule_id: &Id, generation: i64) -> Self {
        let digest = xxhash_rust::xxh3::xxh3_128(format!("{rule_id}:{generation}").as_bytes());
        Self(format!("{digest:032x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for IdempotencyKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}
