use crate::{
    config::{EngineConfig, TierSet},
    controller::TriggerController,
    feed::FeedSource,
    notify::Notifier,
    persistence::SplashRepository,
    store::StateStore,
};
use futures::future::join_all;
use std::{future::Future, sync::Arc};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Main polling loop: pulls snapshots from a [`FeedSource`] on a fixed cadence and drives the
/// [`TriggerController`] with them.
#[derive(Debug)]
pub struct SplashEngine<Feed> {
    config: Arc<EngineConfig>,
    feed: Feed,
    controller: Arc<TriggerController>,
}

impl<Feed> SplashEngine<Feed>
where
    Feed: FeedSource,
{
    pub fn new(
        config: EngineConfig,
        feed: Feed,
        repository: Arc<dyn SplashRepository>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let tiers = Arc::new(TierSet::new(config.tiers.clone()));
        let config = Arc::new(config);
        let controller = TriggerController::new(
            Arc::clone(&config),
            tiers,
            Arc::new(StateStore::new()),
            repository,
            notifier,
        );

        Self {
            config,
            feed,
            controller: Arc::new(controller),
        }
    }

    /// Handle for replacing the tier set at runtime.
    pub fn tiers(&self) -> Arc<TierSet> {
        Arc::clone(self.controller.tiers())
    }

    pub fn controller(&self) -> &Arc<TriggerController> {
        &self.controller
    }

    /// Poll the feed once and process every snapshot.
    ///
    /// Symbols are processed concurrently, a slow persistence call only delays its own symbol.
    /// Returns the number of snapshots processed, a feed error skips the tick.
    pub async fn poll_once(&self) -> usize {
        let now = Instant::now();
        let snapshots = match self.feed.poll_tickers().await {
            Ok(snapshots) => snapshots,
            Err(error) if error.is_transient() => {
                warn!(%error, "feed poll failed, skipping tick");
                return 0;
            }
            Err(error) => {
                error!(%error, "feed poll failed with a non-transient error, skipping tick");
                return 0;
            }
        };

        let count = snapshots.len();
        join_all(
            snapshots
                .into_iter()
                .map(|snapshot| self.controller.on_snapshot(snapshot, now)),
        )
        .await;

        debug!(snapshots = count, "feed tick processed");
        count
    }

    /// Run until `shutdown` resolves, then cancel every live return tracker.
    pub async fn run<Shutdown>(&self, shutdown: Shutdown)
    where
        Shutdown: Future<Output = ()>,
    {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            tiers = self.controller.tiers().snapshot().len(),
            "Splash engine: Online"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.poll_once().await;
                }
                _ = &mut shutdown => {
                    info!("Splash engine: shutdown requested");
                    break;
                }
            }
        }

        self.controller.shutdown().await;
        info!("Splash engine: Offline");
    }
}
