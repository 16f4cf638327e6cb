mod common;

use babel_server::domain::event::{ClientFrame, SendPayload, ServerEvent};
use common::{TestApp, send_frame, wait_for_event};
use serde_json::{Value, json};
use uuid::Uuid;

#[tokio::test]
async fn test_sender_limit_rejects_over_budget_sends() {
    let app = TestApp::spawn_with(&[("--send-limit", "2"), ("--send-window-ms", "60000")]).await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    let first = app.send_text(alice, bob, "one").await;
    app.send_text(alice, bob, "two").await;

    let res = app.post(alice, "/v1/messages", &json!({ "receiver_id": bob, "content": "three" })).await;
    assert_eq!(res.status(), 429);
    let retry_after: u64 = res.headers().get("retry-after").unwrap().to_str().unwrap().parse().unwrap();
    assert!(retry_after >= 1);
    let body: Value = res.json().await.unwrap();
    assert!(body["retry_after_secs"].as_u64().unwrap() >= 1);
    assert_eq!(body["limit"], 2);

    let conversation_id = first["conversation_id"].as_str().unwrap();
    let history: Vec<Value> =
        app.get(bob, &format!("/v1/conversations/{conversation_id}/messages")).await.json().await.unwrap();
    assert_eq!(history.len(), 2, "rejected send must not be stored");

    // Budgets are per sender.
    app.send_text(bob, alice, "unaffected").await;
}

#[tokio::test]
async fn test_gateway_rate_limit_frame_is_correlated() {
    let app = TestApp::spawn_with(&[("--send-limit", "2"), ("--send-window-ms", "60000")]).await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();
    let mut ws = app.connect(alice).await;

    let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    for id in &ids {
        let frame = ClientFrame::Send(SendPayload {
            client_message_id: Some(*id),
            receiver_id: Some(bob),
            content: "burst".into(),
            ..Default::default()
        });
        send_frame(&mut ws, &frame).await;
    }

    let event = wait_for_event(&mut ws, |e| matches!(e, ServerEvent::RateLimited { .. })).await;
    let ServerEvent::RateLimited { retry_after_secs, limit, client_message_id } = event else { unreachable!() };
    assert!(retry_after_secs >= 1);
    assert_eq!(limit, 2);
    assert_eq!(client_message_id, Some(ids[2]));
}
