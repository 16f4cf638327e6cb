pub mod hub_gc;
pub mod rate_limit_sweep;

pub use hub_gc::HubGcWorker;
pub use rate_limit_sweep::RateLimitSweepWorker;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Background maintenance loops, built by `AppBuilder` and started by the binary.
#[derive(Debug)]
pub struct Workers {
    pub hub_gc: HubGcWorker,
    pub rate_limit_sweep: RateLimitSweepWorker,
}

impl Workers {
    #[must_use]
    pub fn spawn_all(self, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(self.hub_gc.run(shutdown_rx.clone()).instrument(tracing::info_span!("hub_gc_worker"))),
            tokio::spawn(
                self.rate_limit_sweep.run(shutdown_rx).instrument(tracing::info_span!("rate_limit_sweep_worker")),
            ),
        ]
    }
}
