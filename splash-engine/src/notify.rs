use crate::model::SplashEvent;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Receives splash status events for display.
pub trait Notifier: Send + Sync {
    fn emit(&self, event: SplashEvent);
}

/// Fans events out to every subscriber of a [`broadcast`] channel.
///
/// Slow subscribers lag and skip events, the engine never blocks on them.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    tx: broadcast::Sender<SplashEvent>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SplashEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Notifier for BroadcastNotifier {
    fn emit(&self, event: SplashEvent) {
        // Ignore errors if no receivers
        if let Ok(count) = self.tx.send(event) {
            debug!("splash event sent to {} receivers", count);
        }
    }
}

/// Writes every event to the log.
#[derive(Debug, Copy, Clone, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn emit(&self, event: SplashEvent) {
        info!(
            symbol = %event.symbol,
            record_id = %event.record_id,
            direction = %event.direction,
            level = event.level,
            probability = event.probability,
            status = %event.status,
            "SPLASH {} {} {}% @ {:.6} (ref {:.6})",
            event.status,
            event.symbol,
            event.level,
            event.last_price,
            event.ref_last,
        );
    }
}
