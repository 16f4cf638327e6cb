use crate::client::supervisor::{ConnectError, Connector, Transport};
use crate::domain::event::{ClientFrame, ServerEvent};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Opens gateway sessions over `tokio-tungstenite`. Events from every session it
/// opens go to one broadcast channel, so subscribers survive reconnects.
#[derive(Debug, Clone)]
pub struct WsConnector {
    gateway_url: String,
    events: broadcast::Sender<Arc<ServerEvent>>,
    outbound_buffer: usize,
}

impl WsConnector {
    /// `gateway_url` is the full `ws://.../v1/gateway` address.
    #[must_use]
    pub fn new(gateway_url: impl Into<String>, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self { gateway_url: gateway_url.into(), events, outbound_buffer: 32 }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ServerEvent>> {
        self.events.subscribe()
    }
}

#[async_trait]
impl Connector for WsConnector {
    type Transport = WsTransport;

    async fn connect(&self, token: &str) -> Result<WsTransport, ConnectError> {
        let url = format!("{}?token={token}", self.gateway_url);
        let (stream, _) = match tokio_tungstenite::connect_async(url).await {
            Ok(ok) => ok,
            Err(WsError::Http(response)) if response.status().as_u16() == 401 => {
                return Err(ConnectError::Unauthorized);
            }
            Err(e) => return Err(ConnectError::Transport(e.to_string())),
        };

        let connected = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientFrame>(self.outbound_buffer);
        let events = self.events.clone();

        let task_connected = Arc::clone(&connected);
        let task_cancel = cancel.clone();
        tokio::spawn(
            async move {
                let (mut sink, mut stream) = stream.split();
                loop {
                    tokio::select! {
                        () = task_cancel.cancelled() => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            break;
                        }
                        frame = outbound_rx.recv() => {
                            let Some(frame) = frame else { break };
                            match serde_json::to_string(&frame) {
                                Ok(text) => {
                                    if sink.send(WsMessage::Text(text.into())).await.is_err() {
                                        break;
                                    }
                                }
                                Err(e) => tracing::error!(error = %e, "Failed to encode client frame"),
                            }
                        }
                        msg = stream.next() => match msg {
                            Some(Ok(WsMessage::Text(text))) => match serde_json::from_str::<ServerEvent>(text.as_str()) {
                                Ok(event) => {
                                    let _ = events.send(Arc::new(event));
                                }
                                Err(e) => tracing::warn!(error = %e, "Unparseable server event"),
                            },
                            Some(Ok(WsMessage::Close(_)) | Err(_)) | None => break,
                            Some(Ok(_)) => {}
                        },
                    }
                }
                task_connected.store(false, Ordering::SeqCst);
                tracing::debug!("Gateway transport closed");
            }
            .instrument(tracing::debug_span!("gateway_transport")),
        );

        Ok(WsTransport { connected, cancel, outbound: outbound_tx })
    }
}

#[derive(Debug)]
pub struct WsTransport {
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    outbound: mpsc::Sender<ClientFrame>,
}

impl WsTransport {
    /// Queues a frame for the server.
    ///
    /// # Errors
    /// Returns `ConnectError::Transport` once the socket has gone away.
    pub async fn send(&self, frame: ClientFrame) -> Result<(), ConnectError> {
        self.outbound.send(frame).await.map_err(|_| ConnectError::Transport("connection closed".to_string()))
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    async fn close(&self) {
        self.cancel.cancel();
        self.connected.store(false, Ordering::SeqCst);
    }
}
