use models::{AlertRule, Direction, Id, RuleChange, RuleChangeKind, Symbol};
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

/// An armed rule as fired by the index. Carries everything needed to build
/// an `AlertTrigger` without consulting the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Firing {
    pub rule_id: Id,
    pub owner_id: Id,
    pub direction: Direction,
    pub threshold: Decimal,
    pub generation: i64,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
struct Entry {
    rule_id: Id,
    owner_id: Id,
    generation: i64,
    note: Option<String>,
    // Tick count of this symbol at the moment the entry was armed. An entry
    // equal to the current count has observed no tick yet and fires on
    // first observation past its threshold.
    armed_seq: u64,
}

/// Per-symbol armed-rule index: thresholds held in ordered maps so a tick
/// evaluates with a range scan rather than a full walk. Owned by exactly
/// one worker and mutated through `&mut` — no interior locking.
///
/// Above/Below firing is edge-triggered: the price must arrive at the
/// threshold from the other side (or the entry must be freshly armed).
/// Entries are not removed at evaluation time; the engine confirms them
/// out once the transactional fire succeeds.
#[derive(Debug, Default)]
pub struct SymbolIndex {
    above: BTreeMap<Decimal, Vec<Entry>>,
    below: BTreeMap<Decimal, Vec<Entry>>,
    cross: BTreeMap<Decimal, Vec<Entry>>,
    by_rule: HashMap<Id, (Direction, Decimal)>,
    last_price: Option<Decimal>,
    ticks_seen: u64,
}

impl SymbolIndex {
    /// Arm a rule. Idempotent: an existing entry for the same rule id is
    /// replaced (warm-up and the change feed may both deliver it).
    pub fn add(&mut self, rule: &AlertRule) {
        self.remove(&rule.id);

        let entry = Entry {
            rule_id: rule.id,
            owner_id: rule.owner_id,
            generation: rule.generation,
            note: rule.note.clone(),
            armed_seq: self.ticks_seen,
        };
        self.by_rule.insert(rule.id, (rule.direction, rule.threshold));
        self.map_for(rule.direction)
            .entry(rule.threshold)
            .or_default()
            .push(entry);
    }

    /// Disarm a rule. Returns false if it was not armed here.
    pub fn remove(&mut self, rule_id: &Id) -> bool {
        let Some((direction, threshold)) = self.by_rule.remove(rule_id) else {
            return false;
        };
        let map = self.map_for(direction);
        if let Some(entries) = map.get_mut(&threshold) {
            entries.retain(|e| e.rule_id != *rule_id);
            if entries.is_empty() {
                map.remove(&threshold);
            }
        }
        true
    }

    /// Restore first-observation semantics for an armed rule whose fire
    /// could not be recorded: the next tick past its threshold fires it
    /// again regardless of the edge condition.
    pub fn rearm(&mut self, rule_id: &Id) -> bool {
        let Some((direction, threshold)) = self.by_rule.get(rule_id).copied() else {
            return false;
        };
        let ticks_seen = self.ticks_seen;
        self.map_for(direction)
            .get_mut(&threshold)
            .and_then(|entries| entries.iter_mut().find(|e| e.rule_id == *rule_id))
            .map(|e| e.armed_seq = ticks_seen)
            .is_some()
    }

    /// Evaluate a new price against this symbol's armed rules, returning
    /// the rules which fire. Updates the last-seen price regardless of
    /// firing; does not remove fired entries.
    pub fn evaluate(&mut self, price: Decimal) -> Vec<Firing> {
        let mut fired = Vec::new();

        // ABOVE: price reached the threshold from below, or first observation.
        for (&threshold, entries) in self.above.range(..=price) {
            for e in entries {
                if e.armed_seq == self.ticks_seen
                    || self.last_price.map_or(true, |lp| lp < threshold)
                {
                    fired.push(firing(e, Direction::Above, threshold));
                }
            }
        }

        // BELOW: symmetric.
        for (&threshold, entries) in self.below.range(price..) {
            for e in entries {
                if e.armed_seq == self.ticks_seen
                    || self.last_price.map_or(true, |lp| lp > threshold)
                {
                    fired.push(firing(e, Direction::Below, threshold));
                }
            }
        }

        // CROSS: consecutive prices strictly straddle the threshold, in
        // either direction; equality with either bound does not fire.
        if let Some(prev) = self.last_price {
            if prev != price {
                let (lo, hi) = if prev < price { (prev, price) } else { (price, prev) };
                for (&threshold, entries) in
                    self.cross.range((Bound::Excluded(lo), Bound::Excluded(hi)))
                {
                    for e in entries {
                        fired.push(firing(e, Direction::Cross, threshold));
                    }
                }
            }
        }

        self.last_price = Some(price);
        self.ticks_seen += 1;
        fired
    }

    pub fn last_price(&self) -> Option<Decimal> {
        self.last_price
    }

    pub fn len(&self) -> usize {
        self.by_rule.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_rule.is_empty()
    }

    fn map_for(&mut self, direction: Direction) -> &mut BTreeMap<Decimal, Vec<Entry>> {
        match direction {
            Direction::Above => &mut self.above,
            Direction::Below => &mut self.below,
            Direction::Cross => &mut self.cross,
        }
    }
}

fn firing(e: &Entry, direction: Direction, threshold: Decimal) -> Firing {
    Firing {
        rule_id: e.rule_id,
        owner_id: e.owner_id,
        direction,
        threshold,
        generation: e.generation,
        note: e.note.clone(),
    }
}

/// A worker's view of the armed rule set: symbol → SymbolIndex. Rebuilt
/// from a store snapshot on startup and refreshed by snapshot replacement;
/// change-feed events are applied incrementally in between.
#[derive(Debug, Default)]
pub struct RuleIndex {
    indices: HashMap<Symbol, SymbolIndex>,
}

impl RuleIndex {
    pub fn from_rules<'a>(rules: impl IntoIterator<Item = &'a AlertRule>) -> Self {
        let mut index = Self::default();
        for rule in rules {
            index.upsert(rule);
        }
        index
    }

    pub fn get_mut(&mut self, symbol: &Symbol) -> Option<&mut SymbolIndex> {
        self.indices.get_mut(symbol)
    }

    pub fn upsert(&mut self, rule: &AlertRule) {
        self.indices
            .entry(rule.symbol.clone())
            .or_default()
            .add(rule);
    }

    pub fn remove(&mut self, symbol: &Symbol, rule_id: &Id) -> bool {
        match self.indices.get_mut(symbol) {
            Some(index) => index.remove(rule_id),
            None => false,
        }
    }

    /// Drop a fired (or elsewhere-handled) rule from the armed set.
    pub fn confirm_fired(&mut self, symbol: &Symbol, rule_id: &Id) -> bool {
        self.remove(symbol, rule_id)
    }

    pub fn rearm(&mut self, symbol: &Symbol, rule_id: &Id) -> bool {
        match self.indices.get_mut(symbol) {
            Some(index) => index.rearm(rule_id),
            None => false,
        }
    }

    /// Apply one change-feed event. Idempotent: creation and update both
    /// replace any existing entry, so replays are harmless.
    pub fn apply_change(&mut self, change: &RuleChange) {
        match change.kind {
            RuleChangeKind::Created | RuleChangeKind::Updated | RuleChangeKind::Rearmed => {
                self.upsert(&change.as_rule());
            }
            RuleChangeKind::Disabled => {
                self.remove(&change.symbol, &change.rule_id);
            }
        }
    }

    pub fn armed_rules(&self) -> usize {
        self.indices.values().map(SymbolIndex::len).sum()
    }

    pub fn symbols(&self) -> usize {
        self.indices.values().filter(|i| !i.is_empty()).count()
    }
}
