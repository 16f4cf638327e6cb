use crate::services::dispatch::SessionHub;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::Instrument;

/// Reclaims per-user event channels whose sessions have all gone away.
#[derive(Debug)]
pub struct HubGcWorker {
    hub: Arc<dyn SessionHub>,
    interval_secs: u64,
}

impl HubGcWorker {
    #[must_use]
    pub fn new(hub: Arc<dyn SessionHub>, interval_secs: u64) -> Self {
        Self { hub, interval_secs: interval_secs.max(1) }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs));
        tracing::info!("Hub GC worker started");

        while !*shutdown.borrow() {
            tokio::select! {
                _ = interval.tick() => {
                    async {
                        let reclaimed = self.hub.collect_garbage();
                        if reclaimed > 0 {
                            tracing::debug!(reclaimed, "Reclaimed idle event channels");
                        }
                    }
                    .instrument(tracing::debug_span!("hub_gc_iteration"))
                    .await;
                }
                _ = shutdown.changed() => {}
            }
        }

        tracing::info!("Hub GC worker shutting down...");
    }
}
