mod common;

use common::TestApp;
use futures::StreamExt;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, frame::coding::CloseCode};
use uuid::Uuid;

#[tokio::test]
async fn test_shutdown_closes_sessions_with_going_away() {
    let app = TestApp::spawn().await;
    let mut ws = app.connect(Uuid::new_v4()).await;

    app.shutdown();

    let close = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Close(frame))) => return frame,
                Some(Ok(_)) => {}
                other => panic!("socket ended without close frame: {other:?}"),
            }
        }
    })
    .await
    .expect("no close frame before timeout");

    assert_eq!(close.unwrap().code, CloseCode::Away);
}
