use crate::services::rate_limit_service::SenderRateLimiter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::Instrument;

/// Drops idle sender windows so the limiter's map tracks only active senders.
#[derive(Debug)]
pub struct RateLimitSweepWorker {
    limiter: Arc<SenderRateLimiter>,
    interval_secs: u64,
}

impl RateLimitSweepWorker {
    #[must_use]
    pub fn new(limiter: Arc<SenderRateLimiter>, interval_secs: u64) -> Self {
        Self { limiter, interval_secs: interval_secs.max(1) }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs));

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    async {
                        let swept = self.limiter.sweep();
                        tracing::debug!(swept, remaining = self.limiter.tracked_senders(), "Swept sender windows");
                    }
                    .instrument(tracing::debug_span!("rate_limit_sweep_iteration"))
                    .await;
                }
                _ = shutdown.changed() => {}
            }
        }

        tracing::info!("Rate limit sweep loop shutting down...");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn test_worker_sweeps_and_stops_on_shutdown() {
        let limiter = Arc::new(SenderRateLimiter::new(5, Duration::from_secs(1)));
        limiter.check(Uuid::new_v4()).unwrap();
        assert_eq!(limiter.tracked_senders(), 1);

        let (tx, rx) = watch::channel(false);
        let worker = RateLimitSweepWorker::new(Arc::clone(&limiter), 2);
        let handle = tokio::spawn(worker.run(rx));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(limiter.tracked_senders(), 0);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
