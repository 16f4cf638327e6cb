use crate::domain::event::ServerEvent;
use dashmap::DashMap;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, UpDownCounter},
};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

pub type EventReceiver = broadcast::Receiver<Arc<ServerEvent>>;

/// Per-identity fan-out point for live sessions. Every session of a user
/// subscribes to the same logical channel.
pub trait SessionHub: Send + Sync + std::fmt::Debug {
    fn subscribe(&self, user_id: Uuid) -> EventReceiver;

    /// Hands `event` to every live session of `user_id` and returns how many there
    /// were. Offline users are skipped silently.
    fn publish(&self, user_id: Uuid, event: Arc<ServerEvent>) -> usize;

    /// Drops channels nobody listens to anymore, returning how many were reclaimed.
    fn collect_garbage(&self) -> u64;
}

#[derive(Clone, Debug)]
struct Metrics {
    published_total: Counter<u64>,
    unrouted_total: Counter<u64>,
    active_channels: UpDownCounter<i64>,
    gc_duration_seconds: Histogram<f64>,
    gc_reclaimed_total: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter(crate::telemetry::METER_NAME);
        Self {
            published_total: meter
                .u64_counter("babel_hub_published_total")
                .with_description("Events handed to at least one live session")
                .build(),
            unrouted_total: meter
                .u64_counter("babel_hub_unrouted_total")
                .with_description("Events for users with no live session")
                .build(),
            active_channels: meter
                .i64_up_down_counter("babel_hub_active_channels")
                .with_description("Number of per-user event channels")
                .build(),
            gc_duration_seconds: meter
                .f64_histogram("babel_hub_gc_duration_seconds")
                .with_description("Time taken to perform a single GC iteration")
                .build(),
            gc_reclaimed_total: meter
                .u64_counter("babel_hub_gc_reclaimed_total")
                .with_description("Total number of stale channels reclaimed by GC")
                .build(),
        }
    }
}

/// In-process hub. A shared pub/sub backbone would implement the same trait to
/// span several nodes.
#[derive(Debug)]
pub struct LocalSessionHub {
    channels: DashMap<Uuid, broadcast::Sender<Arc<ServerEvent>>>,
    user_channel_capacity: usize,
    metrics: Metrics,
}

impl LocalSessionHub {
    #[must_use]
    pub fn new(user_channel_capacity: usize) -> Self {
        Self { channels: DashMap::new(), user_channel_capacity: user_channel_capacity.max(1), metrics: Metrics::new() }
    }

    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl SessionHub for LocalSessionHub {
    fn subscribe(&self, user_id: Uuid) -> EventReceiver {
        self.channels
            .entry(user_id)
            .or_insert_with(|| {
                self.metrics.active_channels.add(1, &[]);
                let (tx, _rx) = broadcast::channel(self.user_channel_capacity);
                tx
            })
            .subscribe()
    }

    fn publish(&self, user_id: Uuid, event: Arc<ServerEvent>) -> usize {
        let delivered = self.channels.get(&user_id).map_or(0, |tx| tx.send(event).unwrap_or(0));
        if delivered == 0 {
            self.metrics.unrouted_total.add(1, &[]);
        } else {
            self.metrics.published_total.add(1, &[]);
        }
        delivered
    }

    fn collect_garbage(&self) -> u64 {
        let start = std::time::Instant::now();
        let mut reclaimed = 0;

        self.channels.retain(|_, sender| {
            let active = sender.receiver_count() > 0;
            if !active {
                self.metrics.active_channels.add(-1, &[]);
                reclaimed += 1;
            }
            active
        });

        self.metrics.gc_duration_seconds.record(start.elapsed().as_secs_f64(), &[]);
        if reclaimed > 0 {
            self.metrics.gc_reclaimed_total.add(reclaimed, &[]);
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_every_session() {
        let hub = LocalSessionHub::new(8);
        let user = Uuid::new_v4();
        let mut first = hub.subscribe(user);
        let mut second = hub.subscribe(user);

        assert_eq!(hub.publish(user, Arc::new(ServerEvent::Pong)), 2);
        assert_eq!(*first.recv().await.unwrap(), ServerEvent::Pong);
        assert_eq!(*second.recv().await.unwrap(), ServerEvent::Pong);
    }

    #[test]
    fn test_publish_to_offline_user_is_silent() {
        let hub = LocalSessionHub::new(8);
        assert_eq!(hub.publish(Uuid::new_v4(), Arc::new(ServerEvent::Pong)), 0);
    }

    #[test]
    fn test_gc_reclaims_abandoned_channels() {
        let hub = LocalSessionHub::new(8);
        let kept = hub.subscribe(Uuid::new_v4());
        drop(hub.subscribe(Uuid::new_v4()));

        assert_eq!(hub.collect_garbage(), 1);
        assert_eq!(hub.channel_count(), 1);
        drop(kept);
    }

    #[tokio::test]
    async fn test_slow_session_observes_lag() {
        let hub = LocalSessionHub::new(2);
        let user = Uuid::new_v4();
        let mut rx = hub.subscribe(user);

        for _ in 0..3 {
            hub.publish(user, Arc::new(ServerEvent::Pong));
        }

        // The session turns this into a resync_required frame.
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Lagged(1))));
        assert_eq!(*rx.recv().await.unwrap(), ServerEvent::Pong);
    }
}
