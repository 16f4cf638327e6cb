use crate::adapters::repository::MessageStore;
use crate::adapters::storage::ObjectStorage;
use crate::config::HealthConfig;
use opentelemetry::{KeyValue, global, metrics::Gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Clone, Debug)]
pub struct Metrics {
    pub status: Gauge<i64>,
}

impl Metrics {
    #[must_use]
    pub(crate) fn new() -> Self {
        let meter = global::meter(crate::telemetry::METER_NAME);
        Self {
            status: meter
                .i64_gauge("babel_health_status")
                .with_description("Status of health checks (1 for ok, 0 for error)")
                .build(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug)]
pub struct HealthService {
    store: Arc<dyn MessageStore>,
    storage: Option<Arc<dyn ObjectStorage>>,
    config: HealthConfig,
    metrics: Metrics,
}

impl HealthService {
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, storage: Option<Arc<dyn ObjectStorage>>, config: HealthConfig) -> Self {
        Self { store, storage, config, metrics: Metrics::new() }
    }

    fn record(&self, component: &'static str, ok: bool) {
        self.metrics.status.record(i64::from(ok), &[KeyValue::new("component", component)]);
    }

    /// Checks message store connectivity.
    ///
    /// # Errors
    /// Returns a string describing the failure if the store is unreachable.
    pub async fn check_db(&self) -> Result<(), String> {
        let db_timeout = Duration::from_millis(self.config.db_timeout_ms);

        let result = match timeout(db_timeout, self.store.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("Database connection failed: {e}")),
            Err(_) => Err("Database connection timed out".to_string()),
        };
        self.record("database", result.is_ok());
        result
    }

    /// Checks object storage connectivity. Passes trivially when no storage is configured.
    ///
    /// # Errors
    /// Returns a string describing the failure if storage is unreachable.
    pub async fn check_storage(&self) -> Result<(), String> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        let storage_timeout = Duration::from_millis(self.config.storage_timeout_ms);

        let result = match timeout(storage_timeout, storage.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(format!("Storage connection failed: {e}")),
            Err(_) => Err("Storage connection timed out".to_string()),
        };
        self.record("storage", result.is_ok());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{MemoryMessageStore, MemoryObjectStorage};

    #[tokio::test]
    async fn test_memory_backends_are_healthy() {
        let service = HealthService::new(
            Arc::new(MemoryMessageStore::new()),
            Some(Arc::new(MemoryObjectStorage::new())),
            HealthConfig::default(),
        );
        assert!(service.check_db().await.is_ok());
        assert!(service.check_storage().await.is_ok());
    }
}
