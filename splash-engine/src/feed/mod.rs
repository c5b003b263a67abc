use crate::{error::SplashError, model::Snapshot};
use async_trait::async_trait;

/// MEXC contract ticker REST feed.
pub mod mexc;

/// Supplies one [`Snapshot`] per symbol each time it is polled.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn poll_tickers(&self) -> Result<Vec<Snapshot>, SplashError>;
}
