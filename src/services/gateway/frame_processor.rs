use crate::domain::event::{ClientFrame, ServerEvent};
use crate::services::message_service::MessageService;
use crate::services::sync_service::SyncService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

/// Runs the request-style frames of one session (send, sync, edit, delete, read)
/// off the socket loop, one at a time and in arrival order. Successful writes
/// reach the client through the hub like any other event; only replies meant
/// for this session alone (sync results, errors) go back on `outbound`.
///
/// Frames already queued when the socket goes away still run; their replies
/// are dropped.
pub struct FrameProcessor {
    tx: mpsc::Sender<ClientFrame>,
    handle: JoinHandle<()>,
}

impl FrameProcessor {
    pub fn new(
        user_id: Uuid,
        message_service: MessageService,
        sync_service: SyncService,
        outbound: mpsc::Sender<Arc<ServerEvent>>,
        queue_size: usize,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<ClientFrame>(queue_size.max(1));

        let handle = tokio::spawn(
            async move {
                while let Some(frame) = rx.recv().await {
                    if let Some(reply) = Self::handle(user_id, &message_service, &sync_service, frame).await
                        && outbound.send(Arc::new(reply)).await.is_err()
                    {
                        tracing::debug!("Session gone, reply dropped");
                    }
                }
            }
            .instrument(tracing::info_span!("frame_processor", "user.id" = %user_id)),
        );

        Self { tx, handle }
    }

    /// Queues a frame, handing it back if the session already has too much in flight.
    pub fn submit(&self, frame: ClientFrame) -> Result<(), ClientFrame> {
        self.tx.try_send(frame).map_err(|e| e.into_inner())
    }

    /// Closes the queue and waits for queued frames to finish, up to `timeout`.
    /// Whatever is still running after that is aborted.
    pub async fn finish(self, timeout: Duration) {
        let Self { tx, mut handle } = self;
        drop(tx);
        if tokio::time::timeout(timeout, &mut handle).await.is_err() {
            tracing::warn!("Frame processor did not drain in time, aborting");
            handle.abort();
        }
    }

    async fn handle(
        user_id: Uuid,
        message_service: &MessageService,
        sync_service: &SyncService,
        frame: ClientFrame,
    ) -> Option<ServerEvent> {
        match frame {
            ClientFrame::Send(payload) => {
                let client_message_id = payload.client_message_id;
                let result = match payload.into_outbound() {
                    Ok(outbound) => message_service.send(user_id, outbound).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                result.err().map(|e| ServerEvent::from_error(&e, client_message_id))
            }
            ClientFrame::Sync { last_seen_id } => Some(match sync_service.sync(user_id, last_seen_id).await {
                Ok(batch) => ServerEvent::SyncResult(batch),
                Err(e) => ServerEvent::from_error(&e, None),
            }),
            ClientFrame::Edit(edit) => {
                message_service.edit(user_id, edit).await.err().map(|e| ServerEvent::from_error(&e, None))
            }
            ClientFrame::Delete { message_id } => {
                message_service.delete(user_id, message_id).await.err().map(|e| ServerEvent::from_error(&e, None))
            }
            ClientFrame::Read { message_id } => {
                message_service.mark_read(user_id, message_id).await.err().map(|e| ServerEvent::from_error(&e, None))
            }
            // Handled inline by the session loop.
            ClientFrame::Ack { .. } | ClientFrame::Ping => None,
        }
    }
}
