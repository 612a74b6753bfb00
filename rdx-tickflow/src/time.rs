//! The wall-clock tick source used when the engine drives itself.
//!
//! Hosts with their own frame loop never need this: they call
//! `TickflowEngine::tick` with their frame delta instead.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, trace};

/// A single tick of the `SystemClock`.
#[derive(Debug, Clone)]
pub struct TickEvent {
    /// Number of ticks emitted so far, starting at 1.
    pub tick_count: u64,
    /// Time elapsed since the previous tick.
    pub delta: Duration,
    pub timestamp: Instant,
}

/// A ticker that broadcasts a `TickEvent` at a fixed period.
pub struct SystemClock {
    period: Duration,
    tick_sender: broadcast::Sender<Arc<TickEvent>>,
}

impl SystemClock {
    pub fn new(period: Duration, tick_sender: broadcast::Sender<Arc<TickEvent>>) -> Self {
        Self {
            period,
            tick_sender,
        }
    }

    /// Emits ticks until a shutdown signal is received.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last = Instant::now();
        let mut tick_count = 0;
        debug!(period = ?self.period, "SystemClock started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => break,
                now = ticker.tick() => {
                    tick_count += 1;
                    let delta = now.saturating_duration_since(last);
                    last = now;
                    trace!(tick_count, ?delta, "tick");
                    self.tick_sender
                        .send(Arc::new(TickEvent { tick_count, delta, timestamp: now }))
                        .ok();
                }
            }
        }
        debug!(tick_count, "SystemClock stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clock_emits_numbered_ticks_until_shutdown() {
        let (tick_tx, mut tick_rx) = broadcast::channel(16);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let clock = SystemClock::new(Duration::from_millis(5), tick_tx);
        let handle = tokio::spawn(clock.run(shutdown_rx));

        let mut counts = Vec::new();
        for _ in 0..3 {
            let tick = tokio::time::timeout(Duration::from_secs(2), tick_rx.recv())
                .await
                .expect("tick in time")
                .expect("clock alive");
            counts.push(tick.tick_count);
        }
        assert_eq!(counts, vec![1, 2, 3]);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("clock stops")
            .unwrap();
    }
}
