#![allow(dead_code)]

use async_trait::async_trait;
use babel_server::AppBuilder;
use babel_server::adapters::memory::MemoryDirectory;
use babel_server::api::{self, MgmtState};
use babel_server::config::Config;
use babel_server::domain::auth::Claims;
use babel_server::domain::event::{ClientFrame, ServerEvent};
use babel_server::services::enrichment::EnrichmentService;
use babel_server::services::enrichment::provider::{TranslateError, TranslationOutput, Translator};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

pub const JWT_SECRET: &str = "test_secret";

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

static INIT: Once = Once::new();

pub fn setup_tracing() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "warn".into())
            .add_directive("babel_server=debug".parse().unwrap())
            .add_directive("hyper=warn".parse().unwrap())
            .add_directive("tungstenite=warn".parse().unwrap());

        tracing_subscriber::fmt().with_env_filter(filter).init();
    });
}

/// Translates by tagging the text with the target language.
#[derive(Debug, Default)]
pub struct TaggingTranslator;

#[async_trait]
impl Translator for TaggingTranslator {
    async fn translate(
        &self,
        text: &str,
        source: Option<&str>,
        target: &str,
    ) -> Result<TranslationOutput, TranslateError> {
        Ok(TranslationOutput { text: format!("[{target}] {text}"), source_language: source.unwrap_or("en").to_string() })
    }
}

pub struct TestApp {
    pub http_url: String,
    pub ws_url: String,
    pub mgmt_url: String,
    pub client: reqwest::Client,
    pub directory: Arc<MemoryDirectory>,
    pub enrichment: EnrichmentService,
    shutdown_tx: watch::Sender<bool>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(&[]).await
    }

    /// Boots the app on ephemeral ports with in-memory stores. `overrides`
    /// replace default flags, e.g. `("--send-limit", "2")`.
    pub async fn spawn_with(overrides: &[(&str, &str)]) -> Self {
        setup_tracing();

        let mut flags: Vec<(&str, &str)> = vec![
            ("--jwt-secret", JWT_SECRET),
            ("--host", "127.0.0.1"),
            ("--per-second", "10000"),
            ("--burst", "10000"),
            ("--send-limit", "1000"),
            ("--send-window-ms", "1000"),
        ];
        for &(flag, value) in overrides {
            match flags.iter_mut().find(|(f, _)| *f == flag) {
                Some(entry) => entry.1 = value,
                None => flags.push((flag, value)),
            }
        }
        let argv = std::iter::once("babel-server").chain(flags.iter().flat_map(|&(f, v)| [f, v]));
        let config = Config::try_parse_from(argv).expect("test config should parse");

        let directory = Arc::new(MemoryDirectory::new());
        let app = AppBuilder::new(config.clone())
            .with_directory(directory.clone())
            .with_translator(Arc::new(TaggingTranslator))
            .build()
            .expect("app should build");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let enrichment = app.enrichment.clone();
        let router = api::app_router(config, app.services, shutdown_rx.clone());
        let mgmt = api::mgmt_router(MgmtState { health_service: app.health_service });
        let _workers = app.workers.spawn_all(shutdown_rx.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut api_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move {
                    let _ = api_rx.wait_for(|&s| s).await;
                })
                .await
                .unwrap();
        });

        let mgmt_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mgmt_addr = mgmt_listener.local_addr().unwrap();
        let mut mgmt_rx = shutdown_rx;
        tokio::spawn(async move {
            axum::serve(mgmt_listener, mgmt.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move {
                    let _ = mgmt_rx.wait_for(|&s| s).await;
                })
                .await
                .unwrap();
        });

        Self {
            http_url: format!("http://{addr}"),
            ws_url: format!("ws://{addr}/v1/gateway"),
            mgmt_url: format!("http://{mgmt_addr}"),
            client: reqwest::Client::new(),
            directory,
            enrichment,
            shutdown_tx,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn token(user_id: Uuid) -> String {
        Claims::new(user_id, 3600).encode(JWT_SECRET).unwrap()
    }

    pub async fn post(&self, user_id: Uuid, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(format!("{}{path}", self.http_url))
            .bearer_auth(Self::token(user_id))
            .json(body)
            .send()
            .await
            .unwrap()
    }

    pub async fn get(&self, user_id: Uuid, path: &str) -> reqwest::Response {
        self.client.get(format!("{}{path}", self.http_url)).bearer_auth(Self::token(user_id)).send().await.unwrap()
    }

    /// Sends a text message over REST and returns the stored message.
    pub async fn send_text(&self, sender: Uuid, receiver: Uuid, content: &str) -> Value {
        let res = self
            .post(sender, "/v1/messages", &serde_json::json!({ "receiver_id": receiver, "content": content }))
            .await;
        assert_eq!(res.status(), 201, "send should succeed");
        res.json().await.unwrap()
    }

    /// Opens a gateway session and waits until it is subscribed to live events.
    pub async fn connect(&self, user_id: Uuid) -> WsStream {
        let url = format!("{}?token={}", self.ws_url, Self::token(user_id));
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.expect("gateway handshake");
        ping(&mut socket).await;
        socket
    }
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub async fn send_frame(ws: &mut WsStream, frame: &ClientFrame) {
    ws.send(WsMessage::Text(serde_json::to_string(frame).unwrap().into())).await.unwrap();
}

/// Next server event, skipping transport-level frames.
pub async fn next_event(ws: &mut WsStream) -> ServerEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(text.as_str()).unwrap(),
                Some(Ok(_)) => {}
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for server event")
}

/// Waits for the first event matching `pred`, discarding others.
pub async fn wait_for_event(ws: &mut WsStream, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
    loop {
        let event = next_event(ws).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Round-trips a ping so every frame sent before it has been read by the server.
pub async fn ping(ws: &mut WsStream) {
    send_frame(ws, &ClientFrame::Ping).await;
    wait_for_event(ws, |e| matches!(e, ServerEvent::Pong)).await;
}
