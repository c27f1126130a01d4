//! Single-slot coalescing wake-up channel for the scheduler loop.
//!
//! A ping with a tick already pending is dropped. The loop re-reads the
//! registry after every tick, so collapsing pings loses nothing.

use std::sync::Arc;

use tokio::sync::Notify;

/// Edge-triggered wake-up signal. Cloning shares the slot.
#[derive(Debug, Clone, Default)]
pub struct Ticker {
    slot: Arc<Notify>,
}

impl Ticker {
    /// Create a ticker with an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the slot, or do nothing if a tick is already pending.
    pub fn ping(&self) {
        self.slot.notify_one();
    }

    /// Wait for the next tick and empty the slot.
    pub async fn tick(&self) {
        self.slot.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pings_coalesce() {
        let ticker = Ticker::new();
        ticker.ping();
        ticker.ping();
        ticker.ping();
        ticker.tick().await;
        let second = tokio::time::timeout(Duration::from_millis(30), ticker.tick()).await;
        assert!(second.is_err(), "pending pings collapse into one tick");
    }

    #[tokio::test]
    async fn ping_wakes_waiter() {
        let ticker = Ticker::new();
        let waiter = ticker.clone();
        let handle = tokio::spawn(async move { waiter.tick().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        ticker.ping();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("tick should arrive")
            .expect("waiter task");
    }
}
