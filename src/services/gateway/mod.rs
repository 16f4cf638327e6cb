pub(crate) mod ack_batcher;
pub(crate) mod frame_processor;
pub(crate) mod session;

use crate::config::WsConfig;
use crate::services::dispatch::SessionHub;
use crate::services::gateway::session::Session;
use crate::services::message_service::MessageService;
use crate::services::sync_service::SyncService;
use axum::extract::ws::WebSocket;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram, UpDownCounter},
};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub(crate) struct Metrics {
    pub(crate) ack_batch_size: Histogram<u64>,
    pub(crate) frames_total: Counter<u64>,
    pub(crate) inbound_rejected_total: Counter<u64>,
    pub(crate) lagged_total: Counter<u64>,
    pub(crate) active_connections: UpDownCounter<i64>,
    pub(crate) ack_queue_dropped_total: Counter<u64>,
}

impl Metrics {
    #[must_use]
    pub(crate) fn new() -> Self {
        let meter = global::meter(crate::telemetry::METER_NAME);
        Self {
            ack_batch_size: meter
                .u64_histogram("babel_websocket_ack_batch_size")
                .with_description("Size of ACK batches processed")
                .build(),
            frames_total: meter
                .u64_counter("babel_websocket_frames_total")
                .with_description("Inbound client frames by type")
                .build(),
            inbound_rejected_total: meter
                .u64_counter("babel_websocket_inbound_rejected_total")
                .with_description("Client frames rejected because the session queue was full")
                .build(),
            lagged_total: meter
                .u64_counter("babel_websocket_lagged_total")
                .with_description("Sessions told to resync after falling behind")
                .build(),
            active_connections: meter
                .i64_up_down_counter("babel_websocket_active_connections")
                .with_description("Number of active WebSocket connections")
                .build(),
            ack_queue_dropped_total: meter
                .u64_counter("babel_websocket_ack_queue_dropped_total")
                .with_description("Total ACKs dropped due to full buffer")
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
pub struct GatewayService {
    message_service: MessageService,
    sync_service: SyncService,
    hub: Arc<dyn SessionHub>,
    config: WsConfig,
    metrics: Metrics,
}

impl GatewayService {
    #[must_use]
    pub fn new(
        message_service: MessageService,
        sync_service: SyncService,
        hub: Arc<dyn SessionHub>,
        config: WsConfig,
    ) -> Self {
        Self { message_service, sync_service, hub, config, metrics: Metrics::new() }
    }

    pub async fn handle_socket(
        &self,
        socket: WebSocket,
        user_id: Uuid,
        request_id: String,
        shutdown_rx: tokio::sync::watch::Receiver<bool>,
    ) {
        let session = Session {
            user_id,
            request_id,
            socket,
            message_service: self.message_service.clone(),
            sync_service: self.sync_service.clone(),
            hub: Arc::clone(&self.hub),
            metrics: self.metrics.clone(),
            config: self.config.clone(),
            shutdown_rx,
        };

        session.run().await;
    }
}
