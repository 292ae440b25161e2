use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use engine::{evaluation_worker, WorkerConfig, CONSUMER_GROUP};
use feed::{MemLog, TickLog};
use models::{AlertRule, Direction, Id, OutboxStatus, RuleState, Symbol, Tick};
use outbox::{MemStore, Relay, RelayConfig, Transport};
use pretty_assertions::assert_eq;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

struct CountingTransport {
    counts: Mutex<HashMap<String, u32>>,
}

impl CountingTransport {
    fn new() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
        }
    }

    fn counts(&self) -> HashMap<String, u32> {
        self.counts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Transport for CountingTransport {
    async fn deliver(&self, payload: &serde_json::Value) -> anyhow::Result<()> {
        let key = payload["idempotency_key"].as_str().unwrap().to_string();
        *self.counts.lock().unwrap().entry(key).or_insert(0) += 1;
        Ok(())
    }
}

fn rule(symbol: &str, direction: Direction, threshold: Decimal) -> AlertRule {
    AlertRule {
        id: Id::generate(),
        owner_id: Id::generate(),
        symbol: Symbol::new(symbol),
        direction,
        threshold,
        state: RuleState::Armed,
        generation: 1,
        note: None,
    }
}

fn tick(symbol: &str, price: Decimal, sequence: i64) -> Tick {
    Tick {
        symbol: Symbol::new(symbol),
        price,
        bid: None,
        ask: None,
        volume: 100,
        timestamp: Utc.with_ymd_and_hms(2026, 8, 28, 14, 30, 0).unwrap()
            + chrono::Duration::seconds(sequence),
        sequence,
    }
}

fn fast_worker(workers: u32) -> WorkerConfig {
    WorkerConfig {
        workers,
        idle_wait: Duration::from_millis(2),
        ..WorkerConfig::default()
    }
}

async fn wait_for(condition: impl Fn() -> bool, what: &str) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn feed_to_webhook_delivers_exactly_one_notification() {
    let store = Arc::new(MemStore::new());
    let rule = rule("AAPL", Direction::Above, dec!(150.00));
    store.seed_rule(rule.clone());

    let log = Arc::new(MemLog::new(4));
    let prices = [dec!(149.50), dec!(149.90), dec!(150.10), dec!(150.05)];
    let mut partition = 0;
    for (i, price) in prices.into_iter().enumerate() {
        (partition, _) = log.append(tick("AAPL", price, i as i64));
    }

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let worker = tokio::spawn(evaluation_worker(
        0,
        fast_worker(1),
        log.clone(),
        store.clone(),
        stop_rx.clone(),
    ));

    let transport = Arc::new(CountingTransport::new());
    let relay_config = RelayConfig {
        poll_interval: Duration::from_millis(2),
        ..RelayConfig::default()
    };
    let relay_store = store.clone();
    let relay_transport = transport.clone();
    let mut relay_rx = stop_rx.clone();
    let relay = tokio::spawn(async move {
        Relay::new(relay_store, relay_transport, relay_config)
            .run(async move { _ = relay_rx.changed().await })
            .await;
    });

    {
        let store = store.clone();
        wait_for(
            move || {
                let records = store.records();
                records.len() == 1 && records[0].status == OutboxStatus::Sent
            },
            "the alert to be delivered",
        )
        .await;
    }
    wait_for_commit(&log, partition, 4).await;

    stop_tx.send(true).unwrap();
    worker.await.unwrap().unwrap();
    relay.await.unwrap();

    let counts = transport.counts();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts.values().sum::<u32>(), 1);
    assert_eq!(store.rule(&rule.id).unwrap().state, RuleState::Fired);
}

async fn wait_for_commit(log: &MemLog, partition: u32, want: i64) {
    for _ in 0..500 {
        if log.committed(CONSUMER_GROUP, partition).await.unwrap() == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("offset for partition {partition} never reached {want}");
}

#[tokio::test]
async fn partitioned_workers_split_the_symbol_space() {
    let store = Arc::new(MemStore::new());
    let symbols = ["AAPL", "MSFT", "TSLA", "NVDA", "AMZN", "GOOG"];
    let mut rules = Vec::new();
    for symbol in symbols {
        let r = rule(symbol, Direction::Above, dec!(100.00));
        store.seed_rule(r.clone());
        rules.push(r);
    }

    let log = Arc::new(MemLog::new(4));
    for symbol in symbols {
        log.append(tick(symbol, dec!(99.00), 0));
        log.append(tick(symbol, dec!(101.00), 1));
    }

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let mut workers = Vec::new();
    for worker in 0..2 {
        workers.push(tokio::spawn(evaluation_worker(
            worker,
            fast_worker(2),
            log.clone(),
            store.clone(),
            stop_rx.clone(),
        )));
    }

    {
        let store = store.clone();
        wait_for(
            move || store.records().len() == symbols.len(),
            "every rule to fire",
        )
        .await;
    }
    stop_tx.send(true).unwrap();
    for worker in workers {
        worker.await.unwrap().unwrap();
    }

    // One record per rule, every rule FIRED.
    let mut keys: Vec<_> = store
        .records()
        .iter()
        .map(|r| r.idempotency_key.clone())
        .collect();
    keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    keys.dedup();
    assert_eq!(keys.len(), symbols.len());
    for r in &rules {
        assert_eq!(store.rule(&r.id).unwrap().state, RuleState::Fired);
    }
}

/// Delegates to a `MemStore` but fails exactly one `armed_page` call,
/// selected by its ordinal, to model a transient store outage during an
/// index refresh.
struct OutageStore {
    inner: Arc<MemStore>,
    fail_on_call: u32,
    calls: std::sync::atomic::AtomicU32,
}

impl OutageStore {
    fn new(inner: Arc<MemStore>, fail_on_call: u32) -> Self {
        Self {
            inner,
            fail_on_call,
            calls: std::sync::atomic::AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl evaluator::FireStore for OutageStore {
    async fn record_fire(
        &self,
        trigger: &models::AlertTrigger,
    ) -> Result<evaluator::FireOutcome, evaluator::StoreError> {
        self.inner.record_fire(trigger).await
    }

    async fn armed_page(
        &self,
        after: Option<Id>,
        limit: u32,
    ) -> Result<Vec<AlertRule>, evaluator::StoreError> {
        let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        if call == self.fail_on_call {
            return Err(evaluator::StoreError::backend(anyhow::anyhow!(
                "transient store outage"
            )));
        }
        self.inner.armed_page(after, limit).await
    }
}

#[tokio::test]
async fn transient_refresh_failure_does_not_kill_the_worker() {
    let mem = Arc::new(MemStore::new());
    let rule = rule("AAPL", Direction::Above, dec!(150.00));
    mem.seed_rule(rule.clone());

    // Call 1 is the warm-up; call 2, the first periodic refresh, fails.
    let store = Arc::new(OutageStore::new(mem.clone(), 2));
    let log = Arc::new(MemLog::new(1));

    let config = WorkerConfig {
        workers: 1,
        idle_wait: Duration::from_millis(2),
        refresh_interval: Duration::from_millis(10),
        ..WorkerConfig::default()
    };
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let worker = tokio::spawn(evaluation_worker(
        0,
        config,
        log.clone(),
        store.clone(),
        stop_rx,
    ));

    // Wait until the failing refresh has definitely happened.
    {
        let store = store.clone();
        wait_for(move || store.calls() >= 3, "refreshes past the outage").await;
    }
    assert!(!worker.is_finished(), "worker must survive a failed refresh");

    // The worker still evaluates ticks appended after the outage.
    log.append(tick("AAPL", dec!(149.50), 0));
    log.append(tick("AAPL", dec!(150.10), 1));
    {
        let mem = mem.clone();
        wait_for(move || mem.records().len() == 1, "the post-outage fire").await;
    }

    stop_tx.send(true).unwrap();
    worker.await.unwrap().unwrap();
    assert_eq!(mem.rule(&rule.id).unwrap().state, RuleState::Fired);
}

#[tokio::test]
async fn replaying_the_feed_from_scratch_fires_nothing_new() {
    let store = Arc::new(MemStore::new());
    store.seed_rule(rule("AAPL", Direction::Above, dec!(150.00)));

    let ticks = [
        tick("AAPL", dec!(149.50), 0),
        tick("AAPL", dec!(150.10), 1),
        tick("AAPL", dec!(150.20), 2),
    ];

    let first = Arc::new(MemLog::new(1));
    for t in &ticks {
        first.append(t.clone());
    }
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let worker = tokio::spawn(evaluation_worker(
        0,
        fast_worker(1),
        first.clone(),
        store.clone(),
        stop_rx,
    ));
    {
        let store = store.clone();
        wait_for(move || store.records().len() == 1, "the first fire").await;
    }
    stop_tx.send(true).unwrap();
    worker.await.unwrap().unwrap();

    // Crash-and-replay: a fresh log with zeroed offsets and a fresh worker.
    // The rule is FIRED in the store, so warm-up skips it and the replay is
    // a no-op.
    let second = Arc::new(MemLog::new(1));
    for t in &ticks {
        second.append(t.clone());
    }
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let worker = tokio::spawn(evaluation_worker(
        0,
        fast_worker(1),
        second.clone(),
        store.clone(),
        stop_rx,
    ));
    wait_for_commit(&second, 0, 3).await;
    stop_tx.send(true).unwrap();
    worker.await.unwrap().unwrap();

    assert_eq!(store.records().len(), 1);
}
