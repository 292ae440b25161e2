use std::sync::Arc;

use chrono::{TimeZone, Utc};
use evaluator::{rebuild_index, Engine};
use models::{AlertRule, Direction, Id, RuleChange, RuleChangeKind, RuleState, Symbol, Tick};
use outbox::MemStore;
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

fn rule(symbol: &str, direction: Direction, threshold: Decimal) -> AlertRule {
    AlertRule {
        id: Id::generate(),
        owner_id: Id::generate(),
        symbol: Symbol::new(symbol),
        direction,
        threshold,
        state: RuleState::Armed,
        generation: 1,
        note: Some("test rule".to_string()),
    }
}

fn tick(symbol: &str, price: Decimal) -> Tick {
    Tick {
        symbol: Symbol::new(symbol),
        price,
        bid: None,
        ask: None,
        volume: 100,
        timestamp: Utc.with_ymd_and_hms(2026, 8, 28, 14, 30, 0).unwrap(),
        sequence: 0,
    }
}

async fn engine_with(store: &Arc<MemStore>, rules: &[AlertRule]) -> Engine<MemStore> {
    for rule in rules {
        store.seed_rule(rule.clone());
    }
    let mut engine = Engine::new(store.clone());
    engine.refresh_index(100, |_| true).await.unwrap();
    engine
}

#[tokio::test]
async fn crossing_fires_exactly_once_per_generation() {
    let store = Arc::new(MemStore::new());
    let rule = rule("AAPL", Direction::Above, dec!(150.00));
    let mut engine = engine_with(&store, &[rule.clone()]).await;

    // Approach from below, cross, keep trading above.
    for (price, expect) in [
        (dec!(149.50), 0),
        (dec!(149.90), 0),
        (dec!(150.10), 1),
        (dec!(150.05), 0),
        (dec!(151.00), 0),
    ] {
        assert_eq!(engine.on_tick(&tick("AAPL", price)).await.unwrap(), expect);
    }

    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].payload["trigger_price"], "150.10");
    assert_eq!(store.rule(&rule.id).unwrap().state, RuleState::Fired);
}

#[tokio::test]
async fn replay_after_restart_does_not_duplicate() {
    let store = Arc::new(MemStore::new());
    let rule = rule("AAPL", Direction::Above, dec!(150.00));
    let mut engine = engine_with(&store, &[rule.clone()]).await;

    let feed = [dec!(149.50), dec!(150.10), dec!(150.20)];
    for price in feed {
        engine.on_tick(&tick("AAPL", price)).await.unwrap();
    }
    assert_eq!(store.records().len(), 1);

    // A restarted worker rebuilds from the store and replays the feed. The
    // rule is FIRED, so the warm-up excludes it and nothing fires again.
    let mut replayed = Engine::new(store.clone());
    replayed.refresh_index(100, |_| true).await.unwrap();
    assert_eq!(replayed.index().armed_rules(), 0);
    for price in feed {
        assert_eq!(replayed.on_tick(&tick("AAPL", price)).await.unwrap(), 0);
    }
    assert_eq!(store.records().len(), 1);
}

#[tokio::test]
async fn race_loser_drops_the_rule_without_a_record() {
    let store = Arc::new(MemStore::new());
    let rule = rule("AAPL", Direction::Above, dec!(150.00));
    let mut winner = engine_with(&store, &[rule.clone()]).await;
    let mut loser = Engine::new(store.clone());
    loser.refresh_index(100, |_| true).await.unwrap();

    // Both engines index the rule; the first to record wins.
    assert_eq!(winner.on_tick(&tick("AAPL", dec!(150.10))).await.unwrap(), 1);
    assert_eq!(loser.on_tick(&tick("AAPL", dec!(150.10))).await.unwrap(), 0);

    assert_eq!(store.records().len(), 1);
    assert_eq!(loser.index().armed_rules(), 0);
}

#[tokio::test]
async fn store_failure_leaves_the_rule_armed_for_retry() {
    let store = Arc::new(MemStore::new());
    let rule = rule("AAPL", Direction::Above, dec!(150.00));
    let mut engine = engine_with(&store, &[rule.clone()]).await;

    store.fail_next_record_fires(1);
    assert!(engine.on_tick(&tick("AAPL", dec!(150.10))).await.is_err());
    assert!(store.records().is_empty());
    assert_eq!(store.rule(&rule.id).unwrap().state, RuleState::Armed);

    // The next qualifying tick retries even though the price never dipped
    // back below the threshold.
    assert_eq!(engine.on_tick(&tick("AAPL", dec!(150.20))).await.unwrap(), 1);
    assert_eq!(store.records().len(), 1);
}

#[tokio::test]
async fn mid_batch_failure_rearms_the_remaining_candidates() {
    let store = Arc::new(MemStore::new());
    let rules = [
        rule("AAPL", Direction::Above, dec!(150.00)),
        rule("AAPL", Direction::Above, dec!(150.50)),
        rule("AAPL", Direction::Above, dec!(151.00)),
    ];
    let mut engine = engine_with(&store, &rules).await;

    // The first record_fire fails, so all three candidates stay armed and
    // the tick's offset must not be committed.
    store.fail_next_record_fires(1);
    assert!(engine.on_tick(&tick("AAPL", dec!(152.00))).await.is_err());
    assert_eq!(store.records().len(), 0);
    assert_eq!(engine.index().armed_rules(), 3);

    // Retry fires all three.
    assert_eq!(engine.on_tick(&tick("AAPL", dec!(152.10))).await.unwrap(), 3);
    assert_eq!(store.records().len(), 3);
}

#[tokio::test]
async fn change_feed_arms_and_disarms_between_refreshes() {
    let store = Arc::new(MemStore::new());
    let mut engine = engine_with(&store, &[]).await;

    // A rule created after warm-up arrives over the change feed and must
    // be live without waiting for the next snapshot refresh.
    let created = rule("AAPL", Direction::Above, dec!(150.00));
    store.seed_rule(created.clone());
    engine.apply_change(&RuleChange {
        kind: RuleChangeKind::Created,
        rule_id: created.id,
        owner_id: created.owner_id,
        symbol: created.symbol.clone(),
        direction: created.direction,
        threshold: created.threshold,
        generation: created.generation,
        timestamp: Utc::now(),
    });
    assert_eq!(engine.index().armed_rules(), 1);

    engine.on_tick(&tick("AAPL", dec!(149.00))).await.unwrap();
    assert_eq!(engine.on_tick(&tick("AAPL", dec!(150.10))).await.unwrap(), 1);

    // Disabling over the feed removes the (re-armed) rule before it can
    // fire again.
    let rearmed = store.rearm(outbox::RearmScope::Rule(created.id)).await.unwrap();
    engine.apply_change(&RuleChange {
        kind: RuleChangeKind::Rearmed,
        generation: rearmed[0].generation,
        rule_id: created.id,
        owner_id: created.owner_id,
        symbol: created.symbol.clone(),
        direction: created.direction,
        threshold: created.threshold,
        timestamp: Utc::now(),
    });
    engine.apply_change(&RuleChange {
        kind: RuleChangeKind::Disabled,
        rule_id: created.id,
        owner_id: created.owner_id,
        symbol: created.symbol.clone(),
        direction: created.direction,
        threshold: created.threshold,
        generation: rearmed[0].generation,
        timestamp: Utc::now(),
    });
    assert_eq!(engine.index().armed_rules(), 0);
    engine.on_tick(&tick("AAPL", dec!(149.00))).await.unwrap();
    assert_eq!(engine.on_tick(&tick("AAPL", dec!(151.00))).await.unwrap(), 0);
    assert_eq!(store.records().len(), 1);
}

#[tokio::test]
async fn rebuild_scopes_to_owned_symbols() {
    let store = Arc::new(MemStore::new());
    store.seed_rule(rule("AAPL", Direction::Above, dec!(150.00)));
    store.seed_rule(rule("MSFT", Direction::Below, dec!(400.00)));

    let aapl = Symbol::new("AAPL");
    let index = rebuild_index(&*store, 1, |s| *s == aapl).await.unwrap();
    assert_eq!(index.armed_rules(), 1);
    assert_eq!(index.symbols(), 1);
}
