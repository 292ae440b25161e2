use crate::{FireOutcome, FireStore, RuleIndex, StoreError};
use metrics::counter;
use models::{AlertTrigger, IdGenerator, IdempotencyKey, RuleChange, Symbol, Tick};

/// Drives tick evaluation for one worker's slice of the symbol space.
///
/// Holds the worker-owned armed index and the transactional write seam.
/// Firing is a two-step: the index nominates candidates, and only a
/// successful (or already-handled) `record_fire` confirms them out of the
/// armed set. A store failure leaves the rule armed and re-fireable on the
/// next qualifying tick.
pub struct Engine<S> {
    store: std::sync::Arc<S>,
    index: RuleIndex,
    ids: IdGenerator,
}

impl<S: FireStore> Engine<S> {
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self {
            store,
            index: RuleIndex::default(),
            ids: IdGenerator::new(),
        }
    }

    /// Rebuild the armed index from a store snapshot, replacing the current
    /// index wholesale. `owns` scopes the rebuild to this worker's symbols.
    pub async fn refresh_index(
        &mut self,
        batch: u32,
        owns: impl Fn(&Symbol) -> bool,
    ) -> Result<(), StoreError> {
        self.index = rebuild_index(&*self.store, batch, owns).await?;
        Ok(())
    }

    pub fn apply_change(&mut self, change: &RuleChange) {
        self.index.apply_change(change);
    }

    pub fn index(&self) -> &RuleIndex {
        &self.index
    }

    /// Evaluate one tick. Returns the number of fires recorded.
    ///
    /// A symbol with no armed rules returns without allocating. On a store
    /// error the current and remaining candidates are re-armed for retry
    /// and the error propagates, so the caller must not commit the tick's
    /// offset.
    pub async fn on_tick(&mut self, tick: &Tick) -> Result<u32, StoreError> {
        counter!("tickfire_ticks_processed_total").increment(1);

        let firings = match self.index.get_mut(&tick.symbol) {
            Some(index) => index.evaluate(tick.price),
            None => return Ok(0),
        };

        let mut recorded = 0;
        for (pos, firing) in firings.iter().enumerate() {
            let trigger = AlertTrigger {
                trigger_id: self.ids.next(),
                rule_id: firing.rule_id,
                generation: firing.generation,
                owner_id: firing.owner_id,
                symbol: tick.symbol.clone(),
                direction: firing.direction,
                threshold: firing.threshold,
                trigger_price: tick.price,
                note: firing.note.clone(),
                tick_timestamp: tick.timestamp,
                triggered_at: chrono::Utc::now(),
                idempotency_key: IdempotencyKey::derive(&firing.rule_id, firing.generation),
            };

            match self.store.record_fire(&trigger).await {
                Ok(FireOutcome::Recorded) => {
                    self.index.confirm_fired(&tick.symbol, &firing.rule_id);
                    recorded += 1;
                    counter!("tickfire_alerts_fired_total").increment(1);
                    tracing::info!(
                        rule_id = %firing.rule_id,
                        generation = firing.generation,
                        symbol = %tick.symbol,
                        threshold = %firing.threshold,
                        price = %tick.price,
                        "alert fired"
                    );
                }
                Ok(FireOutcome::AlreadyHandled) => {
                    // Fired, disabled, or re-armed elsewhere. Expected under
                    // races and replays; drop it from the armed set.
                    self.index.confirm_fired(&tick.symbol, &firing.rule_id);
                    tracing::debug!(
                        rule_id = %firing.rule_id,
                        generation = firing.generation,
                        "fire already handled, dropping from index"
                    );
                }
                Err(err) => {
                    for f in &firings[pos..] {
                        self.index.rearm(&tick.symbol, &f.rule_id);
                    }
                    counter!("tickfire_fire_errors_total").increment(1);
                    tracing::warn!(
                        rule_id = %firing.rule_id,
                        error = %err,
                        "failed to record fire, rule stays armed"
                    );
                    return Err(err);
                }
            }
        }
        Ok(recorded)
    }
}

/// Page the entire `ARMED` rule set out of the store and build a fresh
/// index from the subset this worker owns. A snapshot replacement, never
/// an incremental merge.
pub async fn rebuild_index<S: FireStore + ?Sized>(
    store: &S,
    batch: u32,
    owns: impl Fn(&Symbol) -> bool,
) -> Result<RuleIndex, StoreError> {
    let mut index = RuleIndex::default();
    let mut after = None;

    loop {
        let page = store.armed_page(after, batch).await?;
        let Some(last) = page.last() else { break };
        after = Some(last.id);
        let full = page.len() == batch as usize;

        for rule in &page {
            if owns(&rule.symbol) {
                index.upsert(rule);
            }
        }
        if !full {
            break;
        }
    }

    tracing::info!(
        rules = index.armed_rules(),
        symbols = index.symbols(),
        "rebuilt armed-rule index"
    );
    Ok(index)
}
