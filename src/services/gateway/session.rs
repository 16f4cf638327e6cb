use crate::config::WsConfig;
use crate::domain::event::{ClientFrame, ServerEvent};
use crate::error::AppError;
use crate::services::dispatch::SessionHub;
use crate::services::gateway::{Metrics, ack_batcher::AckBatcher, frame_processor::FrameProcessor};
use crate::services::message_service::MessageService;
use crate::services::sync_service::SyncService;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket, close_code};
use futures::{SinkExt, StreamExt};
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

pub struct Session {
    pub user_id: Uuid,
    pub request_id: String,
    pub socket: WebSocket,
    pub message_service: MessageService,
    pub sync_service: SyncService,
    pub hub: Arc<dyn SessionHub>,
    pub metrics: Metrics,
    pub config: WsConfig,
    pub shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

fn encode(event: &ServerEvent) -> Option<WsMessage> {
    match serde_json::to_string(event) {
        Ok(text) => Some(WsMessage::Text(text.into())),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode server event");
            None
        }
    }
}

const fn frame_label(frame: &ClientFrame) -> &'static str {
    match frame {
        ClientFrame::Send(_) => "send",
        ClientFrame::Sync { .. } => "sync",
        ClientFrame::Edit(_) => "edit",
        ClientFrame::Delete { .. } => "delete",
        ClientFrame::Read { .. } => "read",
        ClientFrame::Ack { .. } => "ack",
        ClientFrame::Ping => "ping",
    }
}

impl Session {
    #[tracing::instrument(
        name = "websocket_session",
        skip(self),
        fields(
            user_id = %self.user_id,
            request_id = %self.request_id,
            otel.kind = "server",
            ws.session_id = %Uuid::new_v4()
        )
    )]
    pub(crate) async fn run(self) {
        let Self { user_id, socket, message_service, sync_service, hub, metrics, config, mut shutdown_rx, .. } = self;

        metrics.active_connections.add(1, &[]);
        tracing::info!("WebSocket connected");

        // Subscribe before reading any frame so nothing published after the
        // client's first sync slips between the two.
        let mut hub_rx = hub.subscribe(user_id);
        let (mut ws_sink, mut ws_stream) = socket.split();

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Arc<ServerEvent>>(config.outbound_buffer_size.max(1));

        let ack_batcher = AckBatcher::new(
            user_id,
            message_service.clone(),
            metrics.clone(),
            config.ack_buffer_size,
            config.ack_batch_size,
            config.ack_flush_interval_ms,
        );

        let processor =
            FrameProcessor::new(user_id, message_service, sync_service, outbound_tx, config.inbound_queue_size);

        loop {
            if *shutdown_rx.borrow() {
                tracing::info!("Shutdown signal received, closing WebSocket");
                let _ = ws_sink
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: "Server shutting down".into(),
                    })))
                    .await;
                break;
            }

            // Replies produced inside the loop are written after the select so
            // the sink is never borrowed by two branches.
            let mut reply: Option<Arc<ServerEvent>> = None;

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {}

                msg = ws_stream.next() => {
                    match msg {
                        Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                            Ok(frame) => {
                                metrics.frames_total.add(1, &[KeyValue::new("type", frame_label(&frame))]);
                                match frame {
                                    ClientFrame::Ping => reply = Some(Arc::new(ServerEvent::Pong)),
                                    ClientFrame::Ack { message_ids } => ack_batcher.push(message_ids),
                                    other => {
                                        if let Err(rejected) = processor.submit(other) {
                                            metrics.inbound_rejected_total.add(1, &[]);
                                            tracing::warn!("Inbound queue full, rejecting frame");
                                            let client_message_id = match &rejected {
                                                ClientFrame::Send(payload) => payload.client_message_id,
                                                _ => None,
                                            };
                                            let err = AppError::Unavailable("session busy".to_string());
                                            reply = Some(Arc::new(ServerEvent::from_error(&err, client_message_id)));
                                        }
                                    }
                                }
                            }
                            Err(e) => {
                                tracing::debug!(error = %e, "Malformed client frame");
                                let err = AppError::BadRequest(format!("malformed frame: {e}"));
                                reply = Some(Arc::new(ServerEvent::from_error(&err, None)));
                            }
                        },
                        Some(Ok(WsMessage::Binary(_))) => {
                            let err = AppError::BadRequest("binary frames are not supported".to_string());
                            reply = Some(Arc::new(ServerEvent::from_error(&err, None)));
                        }
                        Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {
                            tracing::debug!("Received transport heartbeat");
                        }
                        Some(Ok(WsMessage::Close(_)) | Err(_)) | None => break,
                    }
                }

                msg = outbound_rx.recv() => {
                    match msg {
                        Some(event) => reply = Some(event),
                        None => break,
                    }
                }

                result = hub_rx.recv() => {
                    match result {
                        Ok(event) => reply = Some(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Some live events are gone for good; the client has to
                            // fill the gap through resync.
                            tracing::warn!(skipped, "Session lagged behind its event channel");
                            metrics.lagged_total.add(1, &[]);
                            reply = Some(Arc::new(ServerEvent::ResyncRequired));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }

            if let Some(event) = reply
                && let Some(frame) = encode(&event)
                && ws_sink.send(frame).await.is_err()
            {
                break;
            }
        }

        let _ = ws_sink.close().await;

        // Frames and acks already received are still applied.
        drop(outbound_rx);
        processor.finish(Duration::from_millis(config.drain_timeout_ms)).await;
        let _ = ack_batcher.finish().await;

        metrics.active_connections.add(-1, &[]);
        tracing::info!("WebSocket disconnected");
    }
}
