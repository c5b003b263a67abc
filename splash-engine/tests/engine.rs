use async_trait::async_trait;
use parking_lot::Mutex;
use splash_engine::{
    EngineConfig, FeedSource, RecordId, Snapshot, SplashEngine, SplashError, SplashStatus, Tier,
    notify::BroadcastNotifier, persistence::InMemoryRepository,
};
use std::{collections::VecDeque, sync::Arc, time::Duration};

/// Replays scripted poll results, then reports an empty market.
#[derive(Debug, Default)]
struct ScriptedFeed {
    ticks: Mutex<VecDeque<Result<Vec<Snapshot>, SplashError>>>,
}

impl ScriptedFeed {
    fn new(ticks: impl IntoIterator<Item = Result<Vec<Snapshot>, SplashError>>) -> Self {
        Self {
            ticks: Mutex::new(ticks.into_iter().collect()),
        }
    }
}

#[async_trait]
impl FeedSource for ScriptedFeed {
    async fn poll_tickers(&self) -> Result<Vec<Snapshot>, SplashError> {
        self.ticks.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

fn market(prices: &[(&str, f64)]) -> Result<Vec<Snapshot>, SplashError> {
    Ok(prices
        .iter()
        .map(|(symbol, price)| Snapshot::new((*symbol).into(), *price, *price, 250_000.0))
        .collect())
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test(start_paused = true)]
async fn test_poll_once_skips_failed_ticks() {
    init_logging();
    let repository = Arc::new(InMemoryRepository::new());
    let notifier = BroadcastNotifier::new(16);
    let mut events = notifier.subscribe();

    let engine = SplashEngine::new(
        EngineConfig::default(),
        ScriptedFeed::new([
            market(&[("SOL_USDT", 150.0), ("ETH_USDT", 3_000.0)]),
            Err(SplashError::Feed("HTTP 503".to_string())),
            market(&[("SOL_USDT", 155.0), ("ETH_USDT", 3_010.0)]),
        ]),
        repository.clone(),
        Arc::new(notifier.clone()),
    );

    assert_eq!(engine.poll_once().await, 2);
    assert_eq!(engine.poll_once().await, 0);
    assert_eq!(engine.controller().store().len(), 2);

    assert_eq!(engine.poll_once().await, 2);

    // SOL moved 3.3%, ETH 0.3%
    let event = events.recv().await.unwrap();
    assert_eq!(event.symbol, "SOL_USDT");
    assert_eq!(event.status, SplashStatus::Active);
    assert_eq!(event.level, 3);
    assert!(events.try_recv().is_err());
    assert_eq!(repository.records().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_run_until_shutdown_cancels_trackers() {
    init_logging();
    let repository = Arc::new(InMemoryRepository::new());
    let notifier = BroadcastNotifier::new(16);

    let engine = SplashEngine::new(
        EngineConfig::default(),
        ScriptedFeed::new([
            market(&[("DOGE_USDT", 0.1)]),
            market(&[("DOGE_USDT", 0.106)]),
        ]),
        repository.clone(),
        Arc::new(notifier),
    );

    engine.run(tokio::time::sleep(Duration::from_secs(2))).await;

    assert_eq!(repository.records().len(), 1);
    assert_eq!(engine.controller().supervisor().active(), 0);

    // Cancelled, not resolved
    let record = repository.record(RecordId(1)).unwrap();
    assert_eq!(record.trigger_level, 5);
    assert!(!record.is_resolved());
}

#[tokio::test(start_paused = true)]
async fn test_tiers_replaced_through_engine_handle() {
    init_logging();
    let notifier = BroadcastNotifier::new(16);
    let mut events = notifier.subscribe();

    let engine = SplashEngine::new(
        EngineConfig::default(),
        ScriptedFeed::new([
            market(&[("ARB_USDT", 1.0)]),
            market(&[("ARB_USDT", 1.015)]),
        ]),
        Arc::new(InMemoryRepository::new()),
        Arc::new(notifier.clone()),
    );

    engine.poll_once().await;
    engine.tiers().replace(vec![
        Tier::new(1.0, Duration::from_secs(120)).with_forced_pin(true),
    ]);
    engine.poll_once().await;

    let event = events.recv().await.unwrap();
    assert_eq!(event.level, 1);
    assert_eq!(event.window, Duration::from_secs(120));
    assert!(event.pinned);
}
