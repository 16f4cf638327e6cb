mod common;

use babel_server::client::supervisor::{self, SupervisorConfig};
use babel_server::client::{ClientMessage, ConnectionState, ReconcileOptions, WsConnector, merge};
use babel_server::domain::event::{ClientFrame, SendPayload, ServerEvent};
use babel_server::domain::message::MessageKind;
use common::TestApp;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

fn config() -> SupervisorConfig {
    SupervisorConfig {
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        max_retries: 3,
        handshake_timeout: Duration::from_secs(2),
        probe_interval: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn test_optimistic_send_is_reconciled() {
    let app = TestApp::spawn().await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let connector = WsConnector::new(app.ws_url.clone(), 64);
    let mut events = connector.subscribe();
    let handle = supervisor::spawn(connector, config(), Some(TestApp::token(alice)));

    let mut states = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();
    let transport = handle.transport().unwrap();

    let optimistic = ClientMessage::optimistic(alice, Some(bob), MessageKind::Text, "hi bob", OffsetDateTime::now_utc());
    let mut local = vec![optimistic.clone()];

    // The session subscribes asynchronously after the upgrade; a ping round-trip confirms it.
    transport.send(ClientFrame::Ping).await.unwrap();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        if matches!(*event, ServerEvent::Pong) {
            break;
        }
    }

    transport
        .send(ClientFrame::Send(SendPayload {
            client_message_id: Some(optimistic.id),
            receiver_id: Some(bob),
            content: "hi bob".into(),
            ..Default::default()
        }))
        .await
        .unwrap();

    let confirmed = loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap();
        if let ServerEvent::MessageCreated { message } = &*event {
            break message.clone();
        }
    };

    local = merge(&local, &[ClientMessage::from(confirmed.clone())], ReconcileOptions::default());
    assert_eq!(local.len(), 1);
    assert_eq!(local[0].id, confirmed.id);
    assert!(!local[0].temporary);
    assert_eq!(local[0].local_timestamp, optimistic.local_timestamp);

    handle.shutdown().await;
}

#[tokio::test]
async fn test_rejected_token_is_terminal() {
    let app = TestApp::spawn().await;
    let connector = WsConnector::new(app.ws_url.clone(), 8);
    let handle = supervisor::spawn(connector, config(), Some("garbage".to_string()));

    let mut states = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == ConnectionState::AuthError))
        .await
        .unwrap()
        .unwrap();
    assert!(handle.transport().is_none());

    handle.set_token(Some(TestApp::token(Uuid::new_v4())));
    handle.reconnect();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == ConnectionState::Connected))
        .await
        .unwrap()
        .unwrap();

    handle.shutdown().await;
}
